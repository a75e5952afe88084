//! Inbox repository. One row per inbound message; `pending` rows are
//! invisible to list queries until analysis lands.

use chrono::NaiveDateTime;
use rasil_core::types::{Attachment, Channel, InboxStatus, LicenseId, NormalizedMessage};

use crate::backend::Database;
use crate::error::{Result, StoreError};
use crate::value::{Row, Value};

#[derive(Debug, Clone)]
pub struct InboxMessage {
    pub id: i64,
    pub license_id: LicenseId,
    pub channel: Channel,
    pub channel_message_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub sender_contact: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub received_at: Option<NaiveDateTime>,
    pub created_at: Option<NaiveDateTime>,
    pub status: InboxStatus,
    pub is_read: bool,
    pub intent: Option<String>,
    pub urgency: Option<String>,
    pub sentiment: Option<String>,
    pub language: Option<String>,
    pub dialect: Option<String>,
    pub ai_summary: Option<String>,
    pub ai_draft_response: Option<String>,
    pub media_skipped: bool,
    pub deleted_at: Option<NaiveDateTime>,
}

impl InboxMessage {
    /// The instant a message sorts by in conversation views.
    pub fn effective_at(&self) -> Option<NaiveDateTime> {
        self.received_at.or(self.created_at)
    }
}

/// Equivalent identifiers for one logical sender. Built by the conversation
/// engine; consumed by every alias-scoped query below.
#[derive(Debug, Clone, Default)]
pub struct AliasSet {
    pub contacts: Vec<String>,
    pub sender_ids: Vec<String>,
}

impl AliasSet {
    pub fn single(contact: &str) -> Self {
        Self {
            contacts: vec![contact.to_string()],
            sender_ids: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty() && self.sender_ids.is_empty()
    }

    /// Render `(contact IN (…) OR sender_id IN (…))` with `?` placeholders,
    /// appending the bound values to `params`.
    pub fn sql_condition(&self, params: &mut Vec<Value>) -> String {
        let mut parts = Vec::new();
        if !self.contacts.is_empty() {
            let marks = vec!["?"; self.contacts.len()].join(", ");
            parts.push(format!("sender_contact IN ({})", marks));
            params.extend(self.contacts.iter().map(|c| Value::from(c.as_str())));
        }
        if !self.sender_ids.is_empty() {
            let marks = vec!["?"; self.sender_ids.len()].join(", ");
            parts.push(format!("sender_id IN ({})", marks));
            params.extend(self.sender_ids.iter().map(|c| Value::from(c.as_str())));
        }
        if parts.is_empty() {
            // Never matches; keeps callers' WHERE clauses well-formed.
            "1 = 0".to_string()
        } else {
            format!("({})", parts.join(" OR "))
        }
    }

    /// Same condition against outbox columns (recipient_email / recipient_id).
    pub fn outbox_condition(&self, params: &mut Vec<Value>) -> String {
        let mut parts = Vec::new();
        if !self.contacts.is_empty() {
            let marks = vec!["?"; self.contacts.len()].join(", ");
            parts.push(format!("recipient_email IN ({})", marks));
            params.extend(self.contacts.iter().map(|c| Value::from(c.as_str())));
        }
        if !self.sender_ids.is_empty() {
            let marks = vec!["?"; self.sender_ids.len()].join(", ");
            parts.push(format!("recipient_id IN ({})", marks));
            params.extend(self.sender_ids.iter().map(|c| Value::from(c.as_str())));
        }
        if parts.is_empty() {
            "1 = 0".to_string()
        } else {
            format!("({})", parts.join(" OR "))
        }
    }
}

/// Attachments above this cap are a permanent payload error at save time.
const MEDIA_SKIP_BYTES: u64 = 20 * 1024 * 1024;

const SELECT_COLS: &str = "id, license_key_id, channel, channel_message_id, sender_id, sender_name,
     sender_contact, subject, body, attachments, received_at, created_at, status, is_read,
     intent, urgency, sentiment, language, dialect, ai_summary, ai_draft_response,
     media_skipped, deleted_at";

fn map_row(row: &Row) -> Result<InboxMessage> {
    let attachments = match row.opt_text("attachments")? {
        Some(json) if !json.is_empty() => serde_json::from_str(&json).unwrap_or_default(),
        _ => Vec::new(),
    };
    Ok(InboxMessage {
        id: row.i64("id")?,
        license_id: row.i64("license_key_id")?,
        channel: row
            .text("channel")?
            .parse()
            .map_err(StoreError::Config)?,
        channel_message_id: row.opt_text("channel_message_id")?,
        sender_id: row.opt_text("sender_id")?,
        sender_name: row.opt_text("sender_name")?,
        sender_contact: row.opt_text("sender_contact")?,
        subject: row.opt_text("subject")?,
        body: row.text("body")?,
        attachments,
        received_at: row.opt_timestamp("received_at")?,
        created_at: row.opt_timestamp("created_at")?,
        status: row.text("status")?.parse().map_err(StoreError::Config)?,
        is_read: row.bool("is_read")?,
        intent: row.opt_text("intent")?,
        urgency: row.opt_text("urgency")?,
        sentiment: row.opt_text("sentiment")?,
        language: row.opt_text("language")?,
        dialect: row.opt_text("dialect")?,
        ai_summary: row.opt_text("ai_summary")?,
        ai_draft_response: row.opt_text("ai_draft_response")?,
        media_skipped: row.bool("media_skipped")?,
        deleted_at: row.opt_timestamp("deleted_at")?,
    })
}

/// Persist one normalized inbound message. Propagates the unique-index
/// violation on (license, channel, channel_message_id) — ingest callers
/// swallow it as "already ingested".
pub async fn save_inbox_message(
    db: &Database,
    license_id: LicenseId,
    msg: &NormalizedMessage,
) -> Result<i64> {
    let mut sender_contact = msg.sender_contact.clone();

    // Canonical identity: if this sender_id already maps to a stored contact,
    // reuse it so conversation threading survives username/phone variations.
    if let Some(sender_id) = &msg.sender_id {
        let row = db
            .fetch_one(
                "SELECT sender_contact FROM inbox_messages
                 WHERE license_key_id = ? AND sender_id = ?
                   AND sender_contact IS NOT NULL AND sender_contact != ''
                 LIMIT 1",
                &[license_id.into(), sender_id.as_str().into()],
            )
            .await?;
        if let Some(row) = row {
            if let Some(canonical) = row.opt_text("sender_contact")? {
                if sender_contact.as_deref() != Some(canonical.as_str()) {
                    sender_contact = Some(canonical);
                }
            }
        }
    }

    let received = msg
        .received_at
        .unwrap_or_else(|| chrono::Utc::now().naive_utc());
    let attachments_json = if msg.attachments.is_empty() {
        Value::Null
    } else {
        Value::Text(serde_json::to_string(&msg.attachments)?)
    };

    // Media past the download cap is a permanent payload error: the row is
    // still saved, with a placeholder body and the skip marker. No retry.
    let media_skipped = msg
        .attachments
        .iter()
        .any(|a| a.size > MEDIA_SKIP_BYTES && a.base64.is_none() && a.path.is_none());
    let body: &str = if media_skipped && msg.body.trim().is_empty() {
        rasil_core::types::OVERSIZED_MEDIA_BODY
    } else {
        &msg.body
    };

    db.insert_returning_id(
        "INSERT INTO inbox_messages
             (license_key_id, channel, channel_message_id, sender_id, sender_name,
              sender_contact, subject, body, received_at, attachments,
              reply_to_platform_id, media_skipped, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        &[
            license_id.into(),
            msg.channel.as_str().into(),
            msg.channel_message_id.clone().into(),
            msg.sender_id.clone().into(),
            msg.sender_name.clone().into(),
            sender_contact.into(),
            msg.subject.clone().into(),
            body.into(),
            Value::Timestamp(received),
            attachments_json,
            msg.reply_to_platform_id.clone().into(),
            media_skipped.into(),
            InboxStatus::Pending.as_str().into(),
        ],
    )
    .await
}

pub async fn get_inbox_message(
    db: &Database,
    id: i64,
    license_id: LicenseId,
) -> Result<Option<InboxMessage>> {
    let row = db
        .fetch_one(
            &format!(
                "SELECT {SELECT_COLS} FROM inbox_messages WHERE id = ? AND license_key_id = ?"
            ),
            &[id.into(), license_id.into()],
        )
        .await?;
    row.as_ref().map(map_row).transpose()
}

/// Inbox listing for the UI. Excludes pending and soft-deleted rows.
pub async fn list_inbox(
    db: &Database,
    license_id: LicenseId,
    status: Option<InboxStatus>,
    channel: Option<Channel>,
    limit: i64,
    offset: i64,
) -> Result<Vec<InboxMessage>> {
    let mut sql = format!(
        "SELECT {SELECT_COLS} FROM inbox_messages
         WHERE license_key_id = ? AND status != 'pending' AND deleted_at IS NULL"
    );
    let mut params: Vec<Value> = vec![license_id.into()];
    if let Some(status) = status {
        sql.push_str(" AND status = ?");
        params.push(status.as_str().into());
    }
    if let Some(channel) = channel {
        sql.push_str(" AND channel = ?");
        params.push(channel.as_str().into());
    }
    sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
    params.push(limit.into());
    params.push(offset.into());

    let rows = db.fetch_all(&sql, &params).await?;
    rows.iter().map(map_row).collect()
}

pub async fn count_inbox(
    db: &Database,
    license_id: LicenseId,
    status: Option<InboxStatus>,
    channel: Option<Channel>,
) -> Result<i64> {
    let mut sql = "SELECT COUNT(*) AS n FROM inbox_messages
                   WHERE license_key_id = ? AND status != 'pending' AND deleted_at IS NULL"
        .to_string();
    let mut params: Vec<Value> = vec![license_id.into()];
    if let Some(status) = status {
        sql.push_str(" AND status = ?");
        params.push(status.as_str().into());
    }
    if let Some(channel) = channel {
        sql.push_str(" AND channel = ?");
        params.push(channel.as_str().into());
    }
    let row = db.fetch_one(&sql, &params).await?;
    row.map(|r| r.i64("n")).transpose().map(|n| n.unwrap_or(0))
}

pub async fn update_inbox_status(db: &Database, id: i64, status: InboxStatus) -> Result<()> {
    db.execute(
        "UPDATE inbox_messages SET status = ? WHERE id = ?",
        &[status.as_str().into(), id.into()],
    )
    .await?;
    Ok(())
}

/// Analysis fields to persist in one guarded write.
#[derive(Debug, Clone)]
pub struct AnalysisUpdate {
    pub intent: String,
    pub urgency: String,
    pub sentiment: String,
    pub language: Option<String>,
    pub dialect: Option<String>,
    pub summary: String,
    pub draft_response: String,
}

/// Idempotent analysis write. Guarded by `status IN (pending, NULL)` so a
/// replayed webhook can never overwrite a later operator decision. Returns
/// whether the row was actually updated.
pub async fn update_inbox_analysis(
    db: &Database,
    id: i64,
    update: &AnalysisUpdate,
) -> Result<bool> {
    let n = db
        .execute(
            "UPDATE inbox_messages SET
                 intent = ?, urgency = ?, sentiment = ?,
                 language = ?, dialect = ?,
                 ai_summary = ?, ai_draft_response = ?,
                 status = 'analyzed', processed_at = ?
             WHERE id = ? AND (status IS NULL OR status = 'pending')",
            &[
                update.intent.as_str().into(),
                update.urgency.as_str().into(),
                update.sentiment.as_str().into(),
                update.language.clone().into(),
                update.dialect.clone().into(),
                update.summary.as_str().into(),
                update.draft_response.as_str().into(),
                db.now(),
                id.into(),
            ],
        )
        .await?;
    Ok(n > 0)
}

/// Terminal write for burst-merged and duplicate rows; unlike the analysis
/// write it also sets a non-analyzed status.
pub async fn mark_inbox_terminal(
    db: &Database,
    id: i64,
    status: InboxStatus,
    intent: &str,
    summary: &str,
) -> Result<()> {
    db.execute(
        "UPDATE inbox_messages SET
             intent = ?, urgency = 'low', sentiment = 'neutral',
             ai_summary = ?, ai_draft_response = '', status = ?, processed_at = ?
         WHERE id = ?",
        &[
            intent.into(),
            summary.into(),
            status.as_str().into(),
            db.now(),
            id.into(),
        ],
    )
    .await?;
    Ok(())
}

/// Recently-seen platform ids, newest first — fed to adapters as exclude_ids.
pub async fn recent_channel_message_ids(
    db: &Database,
    license_id: LicenseId,
    channel: Channel,
    limit: i64,
) -> Result<Vec<String>> {
    let rows = db
        .fetch_all(
            "SELECT channel_message_id FROM inbox_messages
             WHERE license_key_id = ? AND channel = ? AND channel_message_id IS NOT NULL
             ORDER BY id DESC LIMIT ?",
            &[license_id.into(), channel.as_str().into(), limit.into()],
        )
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        if let Some(id) = row.opt_text("channel_message_id")? {
            out.push(id);
        }
    }
    Ok(out)
}

pub async fn exists_channel_message(
    db: &Database,
    license_id: LicenseId,
    channel: Channel,
    channel_message_id: &str,
) -> Result<bool> {
    let row = db
        .fetch_one(
            "SELECT id FROM inbox_messages
             WHERE license_key_id = ? AND channel = ? AND channel_message_id = ?",
            &[
                license_id.into(),
                channel.as_str().into(),
                channel_message_id.into(),
            ],
        )
        .await?;
    Ok(row.is_some())
}

pub async fn mark_message_read(db: &Database, id: i64, license_id: LicenseId) -> Result<()> {
    db.execute(
        "UPDATE inbox_messages SET is_read = ? WHERE id = ? AND license_key_id = ?",
        &[true.into(), id.into(), license_id.into()],
    )
    .await?;
    Ok(())
}

pub async fn mark_chat_read(
    db: &Database,
    license_id: LicenseId,
    aliases: &AliasSet,
) -> Result<u64> {
    let mut params: Vec<Value> = vec![true.into(), license_id.into()];
    let cond = aliases.sql_condition(&mut params);
    db.execute(
        &format!(
            "UPDATE inbox_messages SET is_read = ?
             WHERE license_key_id = ? AND {cond} AND deleted_at IS NULL"
        ),
        &params,
    )
    .await
}

/// Mark every analyzed row of the alias set approved (the "chat handled"
/// operation used by approve and ignore flows).
pub async fn approve_chat_messages(
    db: &Database,
    license_id: LicenseId,
    aliases: &AliasSet,
) -> Result<u64> {
    let mut params: Vec<Value> = vec![license_id.into()];
    let cond = aliases.sql_condition(&mut params);
    db.execute(
        &format!(
            "UPDATE inbox_messages SET status = 'approved'
             WHERE license_key_id = ? AND {cond} AND status = 'analyzed' AND deleted_at IS NULL"
        ),
        &params,
    )
    .await
}

pub async fn soft_delete_message(db: &Database, id: i64, license_id: LicenseId) -> Result<bool> {
    let n = db
        .execute(
            "UPDATE inbox_messages SET deleted_at = ? WHERE id = ? AND license_key_id = ?",
            &[db.now(), id.into(), license_id.into()],
        )
        .await?;
    Ok(n > 0)
}

pub async fn soft_delete_chat(
    db: &Database,
    license_id: LicenseId,
    aliases: &AliasSet,
) -> Result<u64> {
    let mut params: Vec<Value> = vec![db.now(), license_id.into()];
    let cond = aliases.sql_condition(&mut params);
    db.execute(
        &format!(
            "UPDATE inbox_messages SET deleted_at = ?
             WHERE license_key_id = ? AND {cond} AND deleted_at IS NULL"
        ),
        &params,
    )
    .await
}

/// Messages whose draft is still the analysis placeholder (or missing),
/// created in the last 24 h — candidates for the scheduler's retry pass.
pub async fn placeholder_messages(
    db: &Database,
    license_id: LicenseId,
    placeholder: &str,
    cutoff: NaiveDateTime,
    limit: i64,
) -> Result<Vec<InboxMessage>> {
    let rows = db
        .fetch_all(
            &format!(
                "SELECT {SELECT_COLS} FROM inbox_messages
                 WHERE license_key_id = ?
                   AND (ai_draft_response = ? OR ai_draft_response IS NULL OR ai_draft_response = '')
                   AND created_at > ?
                   AND deleted_at IS NULL
                 ORDER BY created_at DESC LIMIT ?"
            ),
            &[
                license_id.into(),
                placeholder.into(),
                Value::Timestamp(cutoff),
                limit.into(),
            ],
        )
        .await?;
    rows.iter().map(map_row).collect()
}

/// Startup/on-demand repair: promote analyzed rows to approved when a later
/// message from the same sender was already handled.
pub async fn repair_stale_statuses(db: &Database, license_id: LicenseId) -> Result<u64> {
    db.execute(
        "UPDATE inbox_messages SET status = 'approved'
         WHERE license_key_id = ? AND status = 'analyzed' AND deleted_at IS NULL
           AND EXISTS (
               SELECT 1 FROM inbox_messages later
               WHERE later.license_key_id = inbox_messages.license_key_id
                 AND later.sender_contact = inbox_messages.sender_contact
                 AND later.id > inbox_messages.id
                 AND later.status IN ('approved', 'sent', 'auto_replied')
           )",
        &[license_id.into()],
    )
    .await
}
