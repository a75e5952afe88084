//! Outbox repository: pending → approved → sent | failed, with the
//! platform's delivery projection tracked separately.

use chrono::NaiveDateTime;
use rasil_core::types::{Attachment, Channel, DeliveryStatus, LicenseId, OutboxStatus};

use crate::backend::Database;
use crate::error::{Result, StoreError};
use crate::inbox::AliasSet;
use crate::value::{Row, Value};

#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub id: i64,
    pub license_id: LicenseId,
    pub inbox_message_id: Option<i64>,
    pub channel: Channel,
    pub recipient_id: Option<String>,
    pub recipient_email: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub status: OutboxStatus,
    pub delivery_status: Option<DeliveryStatus>,
    pub platform_message_id: Option<String>,
    pub original_body: Option<String>,
    pub edit_count: i64,
    pub error_message: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub approved_at: Option<NaiveDateTime>,
    pub sent_at: Option<NaiveDateTime>,
    pub deleted_at: Option<NaiveDateTime>,
}

impl OutboxMessage {
    pub fn effective_at(&self) -> Option<NaiveDateTime> {
        self.sent_at.or(self.created_at)
    }
}

#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub license_id: LicenseId,
    pub inbox_message_id: Option<i64>,
    pub channel: Channel,
    pub recipient_id: Option<String>,
    pub recipient_email: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

const SELECT_COLS: &str = "id, license_key_id, inbox_message_id, channel, recipient_id,
     recipient_email, subject, body, attachments, status, delivery_status,
     platform_message_id, original_body, edit_count, error_message,
     created_at, approved_at, sent_at, deleted_at";

fn map_row(row: &Row) -> Result<OutboxMessage> {
    let attachments = match row.opt_text("attachments")? {
        Some(json) if !json.is_empty() => serde_json::from_str(&json).unwrap_or_default(),
        _ => Vec::new(),
    };
    Ok(OutboxMessage {
        id: row.i64("id")?,
        license_id: row.i64("license_key_id")?,
        inbox_message_id: row.opt_i64("inbox_message_id")?,
        channel: row.text("channel")?.parse().map_err(StoreError::Config)?,
        recipient_id: row.opt_text("recipient_id")?,
        recipient_email: row.opt_text("recipient_email")?,
        subject: row.opt_text("subject")?,
        body: row.text("body")?,
        attachments,
        status: row.text("status")?.parse().map_err(StoreError::Config)?,
        delivery_status: row
            .opt_text("delivery_status")?
            .map(|s| s.parse().map_err(StoreError::Config))
            .transpose()?,
        platform_message_id: row.opt_text("platform_message_id")?,
        original_body: row.opt_text("original_body")?,
        edit_count: row.opt_i64("edit_count")?.unwrap_or(0),
        error_message: row.opt_text("error_message")?,
        created_at: row.opt_timestamp("created_at")?,
        approved_at: row.opt_timestamp("approved_at")?,
        sent_at: row.opt_timestamp("sent_at")?,
        deleted_at: row.opt_timestamp("deleted_at")?,
    })
}

pub async fn create_outbox_message(db: &Database, new: &NewOutboxMessage) -> Result<i64> {
    let attachments_json = if new.attachments.is_empty() {
        Value::Null
    } else {
        Value::Text(serde_json::to_string(&new.attachments)?)
    };
    db.insert_returning_id(
        "INSERT INTO outbox_messages
             (license_key_id, inbox_message_id, channel, recipient_id, recipient_email,
              subject, body, attachments, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending')",
        &[
            new.license_id.into(),
            new.inbox_message_id.into(),
            new.channel.as_str().into(),
            new.recipient_id.clone().into(),
            new.recipient_email.clone().into(),
            new.subject.clone().into(),
            new.body.as_str().into(),
            attachments_json,
        ],
    )
    .await
}

pub async fn get_outbox_message(
    db: &Database,
    id: i64,
    license_id: LicenseId,
) -> Result<Option<OutboxMessage>> {
    let row = db
        .fetch_one(
            &format!(
                "SELECT {SELECT_COLS} FROM outbox_messages WHERE id = ? AND license_key_id = ?"
            ),
            &[id.into(), license_id.into()],
        )
        .await?;
    row.as_ref().map(map_row).transpose()
}

pub async fn approve_outbox_message(
    db: &Database,
    id: i64,
    edited_body: Option<&str>,
) -> Result<()> {
    match edited_body {
        Some(body) => {
            db.execute(
                "UPDATE outbox_messages SET status = 'approved', approved_at = ?, body = ?
                 WHERE id = ?",
                &[db.now(), body.into(), id.into()],
            )
            .await?;
        }
        None => {
            db.execute(
                "UPDATE outbox_messages SET status = 'approved', approved_at = ? WHERE id = ?",
                &[db.now(), id.into()],
            )
            .await?;
        }
    }
    Ok(())
}

pub async fn mark_outbox_sent(db: &Database, id: i64) -> Result<()> {
    db.execute(
        "UPDATE outbox_messages SET status = 'sent', sent_at = ? WHERE id = ?",
        &[db.now(), id.into()],
    )
    .await?;
    Ok(())
}

pub async fn mark_outbox_failed(db: &Database, id: i64, error: &str) -> Result<()> {
    db.execute(
        "UPDATE outbox_messages SET status = 'failed', failed_at = ?, error_message = ?
         WHERE id = ?",
        &[db.now(), error.into(), id.into()],
    )
    .await?;
    Ok(())
}

/// Record the transport's own id for a sent message; the delivery reconciler
/// correlates receipts through it.
pub async fn save_platform_message_id(
    db: &Database,
    outbox_id: i64,
    platform_message_id: &str,
) -> Result<()> {
    db.execute(
        "UPDATE outbox_messages SET platform_message_id = ?, delivery_status = 'sent'
         WHERE id = ?",
        &[platform_message_id.into(), outbox_id.into()],
    )
    .await?;
    Ok(())
}

pub async fn find_by_platform_id(
    db: &Database,
    platform_message_id: &str,
) -> Result<Option<OutboxMessage>> {
    let row = db
        .fetch_one(
            &format!("SELECT {SELECT_COLS} FROM outbox_messages WHERE platform_message_id = ?"),
            &[platform_message_id.into()],
        )
        .await?;
    row.as_ref().map(map_row).transpose()
}

pub async fn set_delivery_status(db: &Database, id: i64, status: DeliveryStatus) -> Result<()> {
    db.execute(
        "UPDATE outbox_messages SET delivery_status = ? WHERE id = ?",
        &[status.as_str().into(), id.into()],
    )
    .await?;
    Ok(())
}

/// First edit keeps the original body; every edit bumps the counter.
pub async fn apply_edit(db: &Database, id: i64, new_body: &str) -> Result<()> {
    db.execute(
        "UPDATE outbox_messages SET
             original_body = CASE WHEN original_body IS NULL THEN body ELSE original_body END,
             body = ?, edit_count = edit_count + 1, edited_at = ?
         WHERE id = ?",
        &[new_body.into(), db.now(), id.into()],
    )
    .await?;
    Ok(())
}

pub async fn soft_delete_outbox(db: &Database, id: i64, license_id: LicenseId) -> Result<bool> {
    let n = db
        .execute(
            "UPDATE outbox_messages SET deleted_at = ? WHERE id = ? AND license_key_id = ?",
            &[db.now(), id.into(), license_id.into()],
        )
        .await?;
    Ok(n > 0)
}

pub async fn soft_delete_for_aliases(
    db: &Database,
    license_id: LicenseId,
    aliases: &AliasSet,
) -> Result<u64> {
    let mut params: Vec<Value> = vec![db.now(), license_id.into()];
    let cond = aliases.outbox_condition(&mut params);
    db.execute(
        &format!(
            "UPDATE outbox_messages SET deleted_at = ?
             WHERE license_key_id = ? AND {cond} AND deleted_at IS NULL"
        ),
        &params,
    )
    .await
}

/// Telegram rows still awaiting a read receipt: sent/delivered, platform id
/// present, created in the last 24 h.
pub async fn telegram_receipt_candidates(
    db: &Database,
    license_id: LicenseId,
    cutoff: NaiveDateTime,
) -> Result<Vec<OutboxMessage>> {
    let rows = db
        .fetch_all(
            &format!(
                "SELECT {SELECT_COLS} FROM outbox_messages
                 WHERE license_key_id = ? AND channel = 'telegram'
                   AND delivery_status IN ('sent', 'delivered')
                   AND platform_message_id IS NOT NULL
                   AND created_at > ?"
            ),
            &[license_id.into(), Value::Timestamp(cutoff)],
        )
        .await?;
    rows.iter().map(map_row).collect()
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

    fn new_msg(license_id: i64) -> NewOutboxMessage {
        NewOutboxMessage {
            license_id,
            inbox_message_id: None,
            channel: Channel::Whatsapp,
            recipient_id: Some("966501234567".into()),
            recipient_email: None,
            subject: None,
            body: "رد تجريبي".into(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn lifecycle_pending_approved_sent() {
        let db = db().await;
        let id = create_outbox_message(&db, &new_msg(1)).await.unwrap();

        let msg = get_outbox_message(&db, id, 1).await.unwrap().unwrap();
        assert_eq!(msg.status, OutboxStatus::Pending);

        approve_outbox_message(&db, id, Some("نص معدل")).await.unwrap();
        let msg = get_outbox_message(&db, id, 1).await.unwrap().unwrap();
        assert_eq!(msg.status, OutboxStatus::Approved);
        assert_eq!(msg.body, "نص معدل");
        assert!(msg.approved_at.is_some());

        mark_outbox_sent(&db, id).await.unwrap();
        let msg = get_outbox_message(&db, id, 1).await.unwrap().unwrap();
        assert_eq!(msg.status, OutboxStatus::Sent);
        assert!(msg.sent_at.is_some());
    }

    #[tokio::test]
    async fn platform_id_lookup_round_trips() {
        let db = db().await;
        let id = create_outbox_message(&db, &new_msg(1)).await.unwrap();
        save_platform_message_id(&db, id, "wamid.S").await.unwrap();

        let found = find_by_platform_id(&db, "wamid.S").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.delivery_status, Some(DeliveryStatus::Sent));
        assert!(find_by_platform_id(&db, "wamid.other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_edit_preserves_original_body() {
        let db = db().await;
        let id = create_outbox_message(&db, &new_msg(1)).await.unwrap();

        apply_edit(&db, id, "edit one").await.unwrap();
        apply_edit(&db, id, "edit two").await.unwrap();

        let msg = get_outbox_message(&db, id, 1).await.unwrap().unwrap();
        assert_eq!(msg.body, "edit two");
        assert_eq!(msg.original_body.as_deref(), Some("رد تجريبي"));
        assert_eq!(msg.edit_count, 2);
    }

    #[tokio::test]
    async fn receipt_candidates_filter_by_channel_and_status() {
        let db = db().await;
        let mut tg = new_msg(1);
        tg.channel = Channel::Telegram;
        let id = create_outbox_message(&db, &tg).await.unwrap();
        save_platform_message_id(&db, id, "12345:678").await.unwrap();

        // WhatsApp row must not appear.
        let wa = create_outbox_message(&db, &new_msg(1)).await.unwrap();
        save_platform_message_id(&db, wa, "wamid.S").await.unwrap();

        let cutoff = chrono::Utc::now().naive_utc() - chrono::Duration::hours(24);
        let rows = telegram_receipt_candidates(&db, 1, cutoff).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
    }
}
