//! Persistent at-least-once task queue in the relational store.
//!
//! Claims use an optimistic compare-and-set (`UPDATE … WHERE status =
//! 'pending'`) so concurrent workers never double-lease a row. A crashed
//! worker's lease expires after 30 s and the reaper returns the task to
//! pending — that is where at-least-once lives.

mod error;
pub mod worker;

pub use error::{QueueError, Result};
pub use worker::{TaskHandler, TaskOutcome, TaskWorker};

use chrono::{Duration, NaiveDateTime, Utc};
use rasil_store::{Database, Value};
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;
pub const LEASE_TTL_SECS: i64 = 30;
/// How many CAS rounds a single fetch attempt tries before reporting empty.
const CLAIM_ROUNDS: usize = 4;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub attempts: i64,
    pub max_attempts: i64,
}

/// Insert a task, runnable immediately.
pub async fn enqueue(
    db: &Database,
    task_type: &str,
    payload: &serde_json::Value,
) -> Result<i64> {
    let id = db
        .insert_returning_id(
            "INSERT INTO task_queue (task_type, payload, status, attempts, max_attempts, next_attempt_at)
             VALUES (?, ?, 'pending', 0, ?, ?)",
            &[
                task_type.into(),
                serde_json::to_string(payload)
                    .map_err(QueueError::Payload)?
                    .into(),
                DEFAULT_MAX_ATTEMPTS.into(),
                Value::Timestamp(Utc::now().naive_utc()),
            ],
        )
        .await?;
    debug!(task_id = id, task_type, "task enqueued");
    Ok(id)
}

/// Atomically claim the oldest runnable task for `worker_id`, or None when
/// the queue is empty.
pub async fn fetch_next(db: &Database, worker_id: &str) -> Result<Option<Task>> {
    let now = Utc::now().naive_utc();

    for _ in 0..CLAIM_ROUNDS {
        let candidate = db
            .fetch_one(
                "SELECT id FROM task_queue
                 WHERE status = 'pending' AND next_attempt_at <= ?
                 ORDER BY id LIMIT 1",
                &[Value::Timestamp(now)],
            )
            .await?;
        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let id = candidate.i64("id")?;

        // CAS claim: only wins if the row is still pending.
        let claimed = db
            .execute(
                "UPDATE task_queue SET
                     status = 'leased', leased_by = ?, lease_expires_at = ?,
                     attempts = attempts + 1
                 WHERE id = ? AND status = 'pending'",
                &[
                    worker_id.into(),
                    Value::Timestamp(now + Duration::seconds(LEASE_TTL_SECS)),
                    id.into(),
                ],
            )
            .await?;
        if claimed == 0 {
            // Another worker won the race; try the next candidate.
            continue;
        }

        let row = db
            .fetch_one(
                "SELECT id, task_type, payload, attempts, max_attempts FROM task_queue WHERE id = ?",
                &[id.into()],
            )
            .await?
            .ok_or_else(|| QueueError::Missing(id))?;
        return Ok(Some(Task {
            id: row.i64("id")?,
            task_type: row.text("task_type")?,
            payload: serde_json::from_str(&row.text("payload")?).map_err(QueueError::Payload)?,
            attempts: row.i64("attempts")?,
            max_attempts: row.i64("max_attempts")?,
        }));
    }
    Ok(None)
}

pub async fn complete(db: &Database, id: i64) -> Result<()> {
    db.execute(
        "UPDATE task_queue SET status = 'done', completed_at = ? WHERE id = ?",
        &[Value::Timestamp(Utc::now().naive_utc()), id.into()],
    )
    .await?;
    Ok(())
}

/// Record a failure: re-enqueue with exponential backoff while attempts
/// remain, else park the row as failed.
pub async fn fail(db: &Database, task: &Task, error: &str) -> Result<()> {
    if task.attempts < task.max_attempts {
        let delay = Duration::seconds(1i64 << task.attempts.min(16));
        db.execute(
            "UPDATE task_queue SET status = 'pending', next_attempt_at = ?, last_error = ?
             WHERE id = ?",
            &[
                Value::Timestamp(Utc::now().naive_utc() + delay),
                error.into(),
                task.id.into(),
            ],
        )
        .await?;
        debug!(task_id = task.id, attempts = task.attempts, "task re-queued with backoff");
    } else {
        db.execute(
            "UPDATE task_queue SET status = 'failed', last_error = ? WHERE id = ?",
            &[error.into(), task.id.into()],
        )
        .await?;
        warn!(task_id = task.id, error, "task failed terminally");
    }
    Ok(())
}

/// Return expired leases to pending; called periodically by the worker.
pub async fn reap_expired_leases(db: &Database) -> Result<u64> {
    let n = db
        .execute(
            "UPDATE task_queue SET status = 'pending', leased_by = NULL, lease_expires_at = NULL
             WHERE status = 'leased' AND lease_expires_at < ?",
            &[Value::Timestamp(Utc::now().naive_utc())],
        )
        .await?;
    if n > 0 {
        warn!(count = n, "expired task leases returned to pending");
    }
    Ok(n)
}

/// Test/diagnostic helper: status + attempt counters for a task.
pub async fn task_status(db: &Database, id: i64) -> Result<Option<(String, i64)>> {
    let row = db
        .fetch_one(
            "SELECT status, attempts FROM task_queue WHERE id = ?",
            &[id.into()],
        )
        .await?;
    Ok(match row {
        Some(row) => Some((row.text("status")?, row.i64("attempts")?)),
        None => None,
    })
}

#[doc(hidden)]
pub async fn force_expire_lease(db: &Database, id: i64, at: NaiveDateTime) -> Result<()> {
    db.execute(
        "UPDATE task_queue SET lease_expires_at = ? WHERE id = ?",
        &[Value::Timestamp(at), id.into()],
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasil_store::schema::init_schema;

    async fn db() -> Database {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        db
    }

    #[tokio::test]
    async fn fetch_claims_each_task_once() {
        let db = db().await;
        let id = enqueue(&db, "analyze_message", &serde_json::json!({"message_id": 1}))
            .await
            .unwrap();

        let task = fetch_next(&db, "w1").await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.attempts, 1);

        // Leased — a second worker sees an empty queue.
        assert!(fetch_next(&db, "w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn crashed_worker_lease_is_redelivered_then_done_once() {
        let db = db().await;
        let id = enqueue(&db, "analyze_message", &serde_json::json!({"message_id": 7}))
            .await
            .unwrap();

        // Worker claims and "crashes" (never completes).
        let task = fetch_next(&db, "w1").await.unwrap().unwrap();
        force_expire_lease(&db, task.id, Utc::now().naive_utc() - Duration::seconds(1))
            .await
            .unwrap();

        // Reaper returns it; the next poll re-delivers the same task.
        assert_eq!(reap_expired_leases(&db).await.unwrap(), 1);
        let redelivered = fetch_next(&db, "w2").await.unwrap().unwrap();
        assert_eq!(redelivered.id, id);
        assert_eq!(redelivered.attempts, 2);

        complete(&db, id).await.unwrap();
        let (status, _) = task_status(&db, id).await.unwrap().unwrap();
        assert_eq!(status, "done");
        assert!(fetch_next(&db, "w3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failures_back_off_then_park_as_failed() {
        let db = db().await;
        let id = enqueue(&db, "send_message", &serde_json::json!({"outbox_id": 3}))
            .await
            .unwrap();

        // Attempts 1 and 2 re-queue with a future next_attempt_at.
        for _ in 0..2 {
            // Make any backoff from the previous round runnable again.
            db.execute(
                "UPDATE task_queue SET next_attempt_at = ? WHERE id = ?",
                &[Value::Timestamp(Utc::now().naive_utc()), id.into()],
            )
            .await
            .unwrap();
            let task = fetch_next(&db, "w").await.unwrap().unwrap();
            fail(&db, &task, "timeout").await.unwrap();
            let (status, _) = task_status(&db, id).await.unwrap().unwrap();
            assert_eq!(status, "pending");
        }

        // Backoff pushed next_attempt_at into the future — not yet runnable.
        assert!(fetch_next(&db, "w").await.unwrap().is_none());

        // Third failure exhausts max_attempts.
        db.execute(
            "UPDATE task_queue SET next_attempt_at = ? WHERE id = ?",
            &[Value::Timestamp(Utc::now().naive_utc()), id.into()],
        )
        .await
        .unwrap();
        let task = fetch_next(&db, "w").await.unwrap().unwrap();
        assert_eq!(task.attempts, 3);
        fail(&db, &task, "timeout").await.unwrap();
        let (status, _) = task_status(&db, id).await.unwrap().unwrap();
        assert_eq!(status, "failed");
    }
}
