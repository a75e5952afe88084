//! Operator notifications and push-token bookkeeping for the background
//! workers.

use chrono::NaiveDateTime;
use rasil_core::types::LicenseId;

use crate::backend::Database;
use crate::error::Result;
use crate::value::Value;

pub async fn create_notification(
    db: &Database,
    license_id: LicenseId,
    title: &str,
    body: &str,
    priority: &str,
) -> Result<i64> {
    db.insert_returning_id(
        "INSERT INTO notifications (license_key_id, title, body, priority)
         VALUES (?, ?, ?, ?)",
        &[
            license_id.into(),
            title.into(),
            body.into(),
            priority.into(),
        ],
    )
    .await
}

pub async fn unread_notification_count(db: &Database, license_id: LicenseId) -> Result<i64> {
    let row = db
        .fetch_one(
            "SELECT COUNT(*) AS n FROM notifications
             WHERE license_key_id = ? AND is_read = ?",
            &[license_id.into(), false.into()],
        )
        .await?;
    Ok(row.map(|r| r.i64("n")).transpose()?.unwrap_or(0))
}

pub async fn register_push_token(
    db: &Database,
    license_id: LicenseId,
    token: &str,
    platform: &str,
) -> Result<()> {
    let updated = db
        .execute(
            "UPDATE push_tokens SET last_active_at = ?, license_key_id = ?, platform = ?
             WHERE token = ?",
            &[db.now(), license_id.into(), platform.into(), token.into()],
        )
        .await?;
    if updated == 0 {
        db.execute(
            "INSERT INTO push_tokens (license_key_id, token, platform, last_active_at)
             VALUES (?, ?, ?, ?)",
            &[license_id.into(), token.into(), platform.into(), db.now()],
        )
        .await?;
    }
    Ok(())
}

/// Drop tokens that have not been seen since the cutoff. Returns the number
/// purged.
pub async fn purge_stale_push_tokens(db: &Database, cutoff: NaiveDateTime) -> Result<u64> {
    db.execute(
        "DELETE FROM push_tokens WHERE last_active_at < ? OR last_active_at IS NULL",
        &[Value::Timestamp(cutoff)],
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::init_schema;

    async fn db() -> Database {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        db
    }

    #[tokio::test]
    async fn notification_counts_unread_only() {
        let db = db().await;
        create_notification(&db, 1, "تذكير", "ينتهي اشتراكك بعد 3 أيام", "high")
            .await
            .unwrap();
        assert_eq!(unread_notification_count(&db, 1).await.unwrap(), 1);
        assert_eq!(unread_notification_count(&db, 2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_tokens_are_purged_fresh_survive() {
        let db = db().await;
        register_push_token(&db, 1, "fresh-token", "android").await.unwrap();
        db.execute(
            "INSERT INTO push_tokens (license_key_id, token, platform, last_active_at)
             VALUES (?, ?, ?, ?)",
            &[
                1i64.into(),
                "stale-token".into(),
                "ios".into(),
                Value::Timestamp(chrono::Utc::now().naive_utc() - chrono::Duration::days(60)),
            ],
        )
        .await
        .unwrap();

        let cutoff = chrono::Utc::now().naive_utc() - chrono::Duration::days(30);
        let purged = purge_stale_push_tokens(&db, cutoff).await.unwrap();
        assert_eq!(purged, 1);
    }
}
