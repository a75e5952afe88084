//! `recompute` — the single entry point that rebuilds one denormalized
//! conversation row from inbox+outbox truth. Idempotent and safe to race:
//! it is a pure recomputation, so the last writer lands identical or
//! fresher data.

use chrono::NaiveDateTime;
use rasil_core::types::{Attachment, LicenseId};
use rasil_store::inbox::AliasSet;
use rasil_store::{Database, Result, Row, Value};
use tracing::debug;

use crate::alias::resolve_alias_set;
use crate::preview::preview_text;

#[derive(Debug, Clone)]
pub struct Conversation {
    pub license_id: LicenseId,
    pub sender_contact: String,
    pub sender_name: Option<String>,
    pub channel: Option<String>,
    pub last_message_id: Option<i64>,
    pub last_message_body: String,
    pub last_message_ai_summary: Option<String>,
    pub last_message_at: Option<NaiveDateTime>,
    pub status: Option<String>,
    pub unread_count: i64,
    pub message_count: i64,
}

struct LastMessage {
    id: i64,
    body: String,
    attachments: Vec<Attachment>,
    ai_summary: Option<String>,
    status: Option<String>,
    effective_at: NaiveDateTime,
    sender_name: Option<String>,
    channel: Option<String>,
}

/// Rebuild the conversation row for (license, sender_contact). Returns the
/// fresh snapshot so callers can broadcast it; `None` when the conversation
/// has no visible messages and no cached row either.
pub async fn recompute(
    db: &Database,
    license_id: LicenseId,
    sender_contact: &str,
    sender_name: Option<&str>,
    channel: Option<&str>,
) -> Result<Option<Conversation>> {
    let aliases = resolve_alias_set(db, license_id, sender_contact).await?;

    let unread_count = count_unread(db, license_id, &aliases).await?;
    let message_count = count_messages(db, license_id, &aliases).await?;
    let last = last_message(db, license_id, &aliases).await?;

    let Some(last) = last else {
        // No visible message at all: keep the row (the list needs it until
        // the conversation is explicitly deleted) but zero the counts.
        let n = db
            .execute(
                "UPDATE conversations SET unread_count = 0, message_count = 0, updated_at = ?
                 WHERE license_key_id = ? AND sender_contact = ?",
                &[db.now(), license_id.into(), sender_contact.into()],
            )
            .await?;
        debug!(license_id, sender_contact, zeroed = n > 0, "conversation has no visible messages");
        return Ok(None);
    };

    let body_preview = preview_text(&last.body, &last.attachments);
    let resolved_name = sender_name
        .map(String::from)
        .or(last.sender_name.clone());
    let resolved_channel = channel.map(String::from).or(last.channel.clone());

    let updated = db
        .execute(
            "UPDATE conversations SET
                 sender_name = ?, channel = ?, last_message_id = ?, last_message_body = ?,
                 last_message_ai_summary = ?, last_message_at = ?, status = ?,
                 unread_count = ?, message_count = ?, updated_at = ?
             WHERE license_key_id = ? AND sender_contact = ?",
            &[
                resolved_name.clone().into(),
                resolved_channel.clone().into(),
                last.id.into(),
                body_preview.as_str().into(),
                last.ai_summary.clone().into(),
                Value::Timestamp(last.effective_at),
                last.status.clone().into(),
                unread_count.into(),
                message_count.into(),
                db.now(),
                license_id.into(),
                sender_contact.into(),
            ],
        )
        .await?;

    if updated == 0 {
        db.execute(
            "INSERT INTO conversations
                 (license_key_id, sender_contact, sender_name, channel, last_message_id,
                  last_message_body, last_message_ai_summary, last_message_at, status,
                  unread_count, message_count, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            &[
                license_id.into(),
                sender_contact.into(),
                resolved_name.clone().into(),
                resolved_channel.clone().into(),
                last.id.into(),
                body_preview.as_str().into(),
                last.ai_summary.clone().into(),
                Value::Timestamp(last.effective_at),
                last.status.clone().into(),
                unread_count.into(),
                message_count.into(),
                db.now(),
            ],
        )
        .await?;
    }

    Ok(Some(Conversation {
        license_id,
        sender_contact: sender_contact.to_string(),
        sender_name: resolved_name,
        channel: resolved_channel,
        last_message_id: Some(last.id),
        last_message_body: body_preview,
        last_message_ai_summary: last.ai_summary,
        last_message_at: Some(last.effective_at),
        status: last.status,
        unread_count,
        message_count,
    }))
}

/// Hard-delete the cached row; used when a conversation is deleted as a
/// whole (the message soft-deletes happen in the store layer).
pub async fn delete_conversation_row(
    db: &Database,
    license_id: LicenseId,
    sender_contact: &str,
) -> Result<bool> {
    let n = db
        .execute(
            "DELETE FROM conversations WHERE license_key_id = ? AND sender_contact = ?",
            &[license_id.into(), sender_contact.into()],
        )
        .await?;
    Ok(n > 0)
}

async fn count_unread(db: &Database, license_id: LicenseId, aliases: &AliasSet) -> Result<i64> {
    let mut params: Vec<Value> = vec![license_id.into()];
    let cond = aliases.sql_condition(&mut params);
    params.push(false.into());
    let row = db
        .fetch_one(
            &format!(
                "SELECT COUNT(*) AS n FROM inbox_messages
                 WHERE license_key_id = ? AND {cond}
                   AND status = 'analyzed' AND deleted_at IS NULL AND is_read = ?"
            ),
            &params,
        )
        .await?;
    Ok(row.map(|r| r.i64("n")).transpose()?.unwrap_or(0))
}

async fn count_messages(db: &Database, license_id: LicenseId, aliases: &AliasSet) -> Result<i64> {
    let mut inbox_params: Vec<Value> = vec![license_id.into()];
    let inbox_cond = aliases.sql_condition(&mut inbox_params);
    let inbox_row = db
        .fetch_one(
            &format!(
                "SELECT COUNT(*) AS n FROM inbox_messages
                 WHERE license_key_id = ? AND {inbox_cond}
                   AND status != 'pending' AND deleted_at IS NULL"
            ),
            &inbox_params,
        )
        .await?;
    let inbox_n = inbox_row.map(|r| r.i64("n")).transpose()?.unwrap_or(0);

    let mut outbox_params: Vec<Value> = vec![license_id.into()];
    let outbox_cond = aliases.outbox_condition(&mut outbox_params);
    let outbox_row = db
        .fetch_one(
            &format!(
                "SELECT COUNT(*) AS n FROM outbox_messages
                 WHERE license_key_id = ? AND {outbox_cond} AND deleted_at IS NULL"
            ),
            &outbox_params,
        )
        .await?;
    let outbox_n = outbox_row.map(|r| r.i64("n")).transpose()?.unwrap_or(0);

    Ok(inbox_n + outbox_n)
}

async fn last_message(
    db: &Database,
    license_id: LicenseId,
    aliases: &AliasSet,
) -> Result<Option<LastMessage>> {
    let mut inbox_params: Vec<Value> = vec![license_id.into()];
    let inbox_cond = aliases.sql_condition(&mut inbox_params);
    let inbox_row = db
        .fetch_one(
            &format!(
                "SELECT id, body, attachments, ai_summary, status, sender_name, channel,
                        COALESCE(received_at, created_at) AS effective_at
                 FROM inbox_messages
                 WHERE license_key_id = ? AND {inbox_cond}
                   AND status != 'pending' AND deleted_at IS NULL
                 ORDER BY effective_at DESC, id DESC LIMIT 1"
            ),
            &inbox_params,
        )
        .await?;

    let mut outbox_params: Vec<Value> = vec![license_id.into()];
    let outbox_cond = aliases.outbox_condition(&mut outbox_params);
    let outbox_row = db
        .fetch_one(
            &format!(
                "SELECT id, body, attachments, status, channel,
                        COALESCE(sent_at, created_at) AS effective_at
                 FROM outbox_messages
                 WHERE license_key_id = ? AND {outbox_cond} AND deleted_at IS NULL
                 ORDER BY effective_at DESC, id DESC LIMIT 1"
            ),
            &outbox_params,
        )
        .await?;

    let inbox_last = inbox_row.map(|r| row_to_last(&r, true)).transpose()?;
    let outbox_last = outbox_row.map(|r| row_to_last(&r, false)).transpose()?;

    Ok(match (inbox_last, outbox_last) {
        (Some(i), Some(o)) => Some(if o.effective_at > i.effective_at { o } else { i }),
        (Some(i), None) => Some(i),
        (None, Some(o)) => Some(o),
        (None, None) => None,
    })
}

fn row_to_last(row: &Row, is_inbox: bool) -> Result<LastMessage> {
    let attachments = match row.opt_text("attachments")? {
        Some(json) if !json.is_empty() => serde_json::from_str(&json).unwrap_or_default(),
        _ => Vec::new(),
    };
    Ok(LastMessage {
        id: row.i64("id")?,
        body: row.text("body")?,
        attachments,
        ai_summary: if is_inbox {
            row.opt_text("ai_summary")?
        } else {
            None
        },
        status: row.opt_text("status")?,
        effective_at: row.timestamp("effective_at")?,
        sender_name: if is_inbox {
            row.opt_text("sender_name")?
        } else {
            None
        },
        channel: row.opt_text("channel")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasil_core::types::{Channel, InboxStatus, NormalizedMessage};
    use rasil_store::inbox::{save_inbox_message, soft_delete_message, update_inbox_status};
    use rasil_store::outbox::{create_outbox_message, mark_outbox_sent, NewOutboxMessage};
    use rasil_store::schema::init_schema;

    async fn db() -> Database {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        db
    }

    fn inbound(id: &str, body: &str) -> NormalizedMessage {
        NormalizedMessage {
            channel: Channel::Whatsapp,
            channel_message_id: Some(id.into()),
            sender_id: Some("966501234567".into()),
            sender_contact: Some("966501234567".into()),
            sender_name: Some("عميل".into()),
            subject: None,
            body: body.into(),
            received_at: Some(chrono::Utc::now().naive_utc()),
            attachments: Vec::new(),
            reply_to_platform_id: None,
            is_group: false,
            is_channel: false,
        }
    }

    fn outbound(body: &str) -> NewOutboxMessage {
        NewOutboxMessage {
            license_id: 1,
            inbox_message_id: None,
            channel: Channel::Whatsapp,
            recipient_id: Some("966501234567".into()),
            recipient_email: Some("966501234567".into()),
            subject: None,
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn pending_messages_are_invisible_to_the_conversation() {
        let db = db().await;
        save_inbox_message(&db, 1, &inbound("m1", "مرحباً")).await.unwrap();

        let convo = recompute(&db, 1, "966501234567", None, None).await.unwrap();
        assert!(convo.is_none(), "a pending-only conversation has no row");
    }

    #[tokio::test]
    async fn counts_match_truth_after_analysis_and_reply() {
        let db = db().await;
        let a = save_inbox_message(&db, 1, &inbound("m1", "مرحباً")).await.unwrap();
        update_inbox_status(&db, a, InboxStatus::Analyzed).await.unwrap();

        let convo = recompute(&db, 1, "966501234567", Some("عميل"), Some("whatsapp"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(convo.unread_count, 1);
        assert_eq!(convo.message_count, 1);
        assert_eq!(convo.last_message_body, "مرحباً");

        // An outbound reply raises message_count and becomes the last message.
        let o = create_outbox_message(&db, &outbound("أهلاً بك")).await.unwrap();
        mark_outbox_sent(&db, o).await.unwrap();

        let convo = recompute(&db, 1, "966501234567", None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(convo.message_count, 2);
        assert_eq!(convo.last_message_body, "أهلاً بك");
        assert_eq!(convo.unread_count, 1, "outbound does not consume unread");
    }

    #[tokio::test]
    async fn soft_deleted_rows_leave_the_counts() {
        let db = db().await;
        let a = save_inbox_message(&db, 1, &inbound("m1", "أولى")).await.unwrap();
        let b = save_inbox_message(&db, 1, &inbound("m2", "ثانية")).await.unwrap();
        update_inbox_status(&db, a, InboxStatus::Analyzed).await.unwrap();
        update_inbox_status(&db, b, InboxStatus::Analyzed).await.unwrap();

        soft_delete_message(&db, b, 1).await.unwrap();
        let convo = recompute(&db, 1, "966501234567", None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(convo.message_count, 1);
        assert_eq!(convo.last_message_body, "أولى");
    }

    #[tokio::test]
    async fn recompute_is_idempotent() {
        let db = db().await;
        let a = save_inbox_message(&db, 1, &inbound("m1", "مرحباً")).await.unwrap();
        update_inbox_status(&db, a, InboxStatus::Analyzed).await.unwrap();

        let first = recompute(&db, 1, "966501234567", None, None).await.unwrap().unwrap();
        let second = recompute(&db, 1, "966501234567", None, None).await.unwrap().unwrap();
        assert_eq!(first.message_count, second.message_count);
        assert_eq!(first.unread_count, second.unread_count);
        assert_eq!(first.last_message_body, second.last_message_body);

        let row = db
            .fetch_one(
                "SELECT COUNT(*) AS n FROM conversations WHERE license_key_id = ?",
                &[1i64.into()],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.i64("n").unwrap(), 1, "upsert must not duplicate rows");
    }
}
