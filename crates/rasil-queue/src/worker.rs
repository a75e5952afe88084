//! The worker loop: fetch → dispatch by task_type → complete or fail.
//! Runs until the shutdown watch flips, sleeping 1 s when the queue is
//! empty.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rasil_store::Database;
use tokio::sync::watch;
use tracing::{error, info};

use crate::{complete, fail, fetch_next, reap_expired_leases, Task};

const IDLE_SLEEP: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum TaskOutcome {
    Done,
    /// The failure is recorded and the queue decides between backoff and
    /// terminal failed based on remaining attempts.
    Failed(String),
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> TaskOutcome;
}

pub struct TaskWorker {
    db: Database,
    handler: Arc<dyn TaskHandler>,
    worker_id: String,
}

impl TaskWorker {
    pub fn new(db: Database, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            db,
            handler,
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "task worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = reap_expired_leases(&self.db).await {
                error!(error = %e, "lease reaper failed");
            }

            match fetch_next(&self.db, &self.worker_id).await {
                Ok(Some(task)) => self.dispatch(task).await,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_SLEEP) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "task fetch failed");
                    tokio::time::sleep(IDLE_SLEEP).await;
                }
            }
        }
        info!(worker_id = %self.worker_id, "task worker stopped");
    }

    async fn dispatch(&self, task: Task) {
        let outcome = self.handler.handle(&task).await;
        let result = match outcome {
            TaskOutcome::Done => complete(&self.db, task.id).await,
            TaskOutcome::Failed(reason) => fail(&self.db, &task, &reason).await,
        };
        if let Err(e) = result {
            error!(task_id = task.id, error = %e, "failed to record task outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{enqueue, task_status};
    use rasil_store::schema::init_schema;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        calls: AtomicU32,
        fail_first: bool,
    }

    #[async_trait]
    impl TaskHandler for Counting {
        async fn handle(&self, _task: &Task) -> TaskOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                TaskOutcome::Failed("first try fails".into())
            } else {
                TaskOutcome::Done
            }
        }
    }

    #[tokio::test]
    async fn worker_drains_queue_and_stops_on_shutdown() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let id = enqueue(&db, "t", &serde_json::json!({})).await.unwrap();

        let handler = Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail_first: false,
        });
        let (tx, rx) = watch::channel(false);
        let worker = TaskWorker::new(db.clone(), handler.clone());
        let join = tokio::spawn(worker.run(rx));

        // Give the worker a moment to claim and finish the task.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some((status, _)) = task_status(&db, id).await.unwrap() {
                if status == "done" {
                    break;
                }
            }
        }

        tx.send(true).unwrap();
        join.await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let (status, _) = task_status(&db, id).await.unwrap().unwrap();
        assert_eq!(status, "done");
    }
}
