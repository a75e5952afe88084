//! Conversation reads: the denormalized list, the merged inbox+outbox
//! timeline with cursor pagination, and the short history feed the AI
//! orchestrator consumes.

use chrono::NaiveDateTime;
use rasil_core::types::LicenseId;
use rasil_store::inbox::{AliasSet, InboxMessage};
use rasil_store::outbox::OutboxMessage;
use rasil_store::{Database, Result, Row, Value};

use crate::cursor::Cursor;
use crate::engine::Conversation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Older,
    Newer,
}

impl Direction {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("newer") {
            Direction::Newer
        } else {
            Direction::Older
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChatEntry {
    Incoming(InboxMessage),
    Outgoing(OutboxMessage),
}

impl ChatEntry {
    pub fn effective_at(&self) -> Option<NaiveDateTime> {
        match self {
            ChatEntry::Incoming(m) => m.effective_at(),
            ChatEntry::Outgoing(m) => m.effective_at(),
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            ChatEntry::Incoming(m) => m.id,
            ChatEntry::Outgoing(m) => m.id,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            ChatEntry::Incoming(m) => &m.body,
            ChatEntry::Outgoing(m) => &m.body,
        }
    }

    pub fn is_incoming(&self) -> bool {
        matches!(self, ChatEntry::Incoming(_))
    }
}

#[derive(Debug)]
pub struct Page {
    /// Older pages run newest→oldest; newer pages run oldest→newest.
    pub entries: Vec<ChatEntry>,
    pub next_cursor: Option<String>,
}

/// The inbox list endpoint reads this denormalized table only — no joins.
pub async fn list_conversations(
    db: &Database,
    license_id: LicenseId,
    limit: i64,
    offset: i64,
) -> Result<Vec<Conversation>> {
    let rows = db
        .fetch_all(
            "SELECT license_key_id, sender_contact, sender_name, channel, last_message_id,
                    last_message_body, last_message_ai_summary, last_message_at, status,
                    unread_count, message_count
             FROM conversations
             WHERE license_key_id = ?
             ORDER BY last_message_at DESC
             LIMIT ? OFFSET ?",
            &[license_id.into(), limit.into(), offset.into()],
        )
        .await?;
    rows.iter().map(map_conversation).collect()
}

pub async fn conversations_updated_since(
    db: &Database,
    license_id: LicenseId,
    since: NaiveDateTime,
) -> Result<Vec<Conversation>> {
    let rows = db
        .fetch_all(
            "SELECT license_key_id, sender_contact, sender_name, channel, last_message_id,
                    last_message_body, last_message_ai_summary, last_message_at, status,
                    unread_count, message_count
             FROM conversations
             WHERE license_key_id = ? AND updated_at > ?
             ORDER BY last_message_at DESC",
            &[license_id.into(), Value::Timestamp(since)],
        )
        .await?;
    rows.iter().map(map_conversation).collect()
}

fn map_conversation(row: &Row) -> Result<Conversation> {
    Ok(Conversation {
        license_id: row.i64("license_key_id")?,
        sender_contact: row.text("sender_contact")?,
        sender_name: row.opt_text("sender_name")?,
        channel: row.opt_text("channel")?,
        last_message_id: row.opt_i64("last_message_id")?,
        last_message_body: row.opt_text("last_message_body")?.unwrap_or_default(),
        last_message_ai_summary: row.opt_text("last_message_ai_summary")?,
        last_message_at: row.opt_timestamp("last_message_at")?,
        status: row.opt_text("status")?,
        unread_count: row.opt_i64("unread_count")?.unwrap_or(0),
        message_count: row.opt_i64("message_count")?.unwrap_or(0),
    })
}

/// One page of the merged timeline, strictly ordered by (effective_ts, id).
pub async fn conversation_page(
    db: &Database,
    license_id: LicenseId,
    aliases: &AliasSet,
    cursor: Option<Cursor>,
    limit: i64,
    direction: Direction,
) -> Result<Page> {
    let inbox = fetch_inbox_side(db, license_id, aliases, cursor, limit, direction).await?;
    let outbox = fetch_outbox_side(db, license_id, aliases, cursor, limit, direction).await?;

    let mut entries: Vec<ChatEntry> = inbox
        .into_iter()
        .map(ChatEntry::Incoming)
        .chain(outbox.into_iter().map(ChatEntry::Outgoing))
        .collect();

    entries.sort_by(|a, b| {
        let key_a = (a.effective_at(), a.id());
        let key_b = (b.effective_at(), b.id());
        match direction {
            Direction::Older => key_b.cmp(&key_a),
            Direction::Newer => key_a.cmp(&key_b),
        }
    });
    entries.truncate(limit as usize);

    let next_cursor = if entries.len() as i64 == limit {
        entries
            .last()
            .and_then(|e| e.effective_at().map(|ts| Cursor::new(ts, e.id()).encode()))
    } else {
        None
    };

    Ok(Page {
        entries,
        next_cursor,
    })
}

/// Last `limit` exchanges formatted as `User:`/`Agent:` lines, oldest first —
/// the context block handed to the analyzer.
pub async fn chat_history_lines(
    db: &Database,
    license_id: LicenseId,
    aliases: &AliasSet,
    limit: i64,
) -> Result<Vec<String>> {
    let page = conversation_page(db, license_id, aliases, None, limit, Direction::Older).await?;
    let mut lines: Vec<String> = page
        .entries
        .iter()
        .map(|e| {
            let who = if e.is_incoming() { "User" } else { "Agent" };
            format!("{}: {}", who, e.body().replace('\n', " "))
        })
        .collect();
    lines.reverse();
    Ok(lines)
}

fn cursor_clause(direction: Direction, column: &str) -> String {
    match direction {
        Direction::Older => format!("({column} < ? OR ({column} = ? AND id < ?))"),
        Direction::Newer => format!("({column} > ? OR ({column} = ? AND id > ?))"),
    }
}

async fn fetch_inbox_side(
    db: &Database,
    license_id: LicenseId,
    aliases: &AliasSet,
    cursor: Option<Cursor>,
    limit: i64,
    direction: Direction,
) -> Result<Vec<InboxMessage>> {
    let mut params: Vec<Value> = vec![license_id.into()];
    let cond = aliases.sql_condition(&mut params);
    let mut sql = format!(
        "SELECT id, license_key_id, channel, channel_message_id, sender_id, sender_name,
                sender_contact, subject, body, attachments, received_at, created_at, status,
                is_read, intent, urgency, sentiment, language, dialect, ai_summary,
                ai_draft_response, media_skipped, deleted_at,
                COALESCE(received_at, created_at) AS effective_at
         FROM inbox_messages
         WHERE license_key_id = ? AND {cond} AND status != 'pending' AND deleted_at IS NULL"
    );
    if let Some(c) = cursor {
        sql.push_str(" AND ");
        sql.push_str(&cursor_clause(direction, "COALESCE(received_at, created_at)"));
        params.push(Value::Timestamp(c.effective_at));
        params.push(Value::Timestamp(c.effective_at));
        params.push(c.id.into());
    }
    let order = match direction {
        Direction::Older => "DESC",
        Direction::Newer => "ASC",
    };
    sql.push_str(&format!(" ORDER BY effective_at {order}, id {order} LIMIT ?"));
    params.push(limit.into());

    let rows = db.fetch_all(&sql, &params).await?;
    rows.iter().map(map_inbox).collect()
}

async fn fetch_outbox_side(
    db: &Database,
    license_id: LicenseId,
    aliases: &AliasSet,
    cursor: Option<Cursor>,
    limit: i64,
    direction: Direction,
) -> Result<Vec<OutboxMessage>> {
    let mut params: Vec<Value> = vec![license_id.into()];
    let cond = aliases.outbox_condition(&mut params);
    let mut sql = format!(
        "SELECT id, license_key_id, inbox_message_id, channel, recipient_id, recipient_email,
                subject, body, attachments, status, delivery_status, platform_message_id,
                original_body, edit_count, error_message, created_at, approved_at, sent_at,
                deleted_at,
                COALESCE(sent_at, created_at) AS effective_at
         FROM outbox_messages
         WHERE license_key_id = ? AND {cond} AND deleted_at IS NULL"
    );
    if let Some(c) = cursor {
        sql.push_str(" AND ");
        sql.push_str(&cursor_clause(direction, "COALESCE(sent_at, created_at)"));
        params.push(Value::Timestamp(c.effective_at));
        params.push(Value::Timestamp(c.effective_at));
        params.push(c.id.into());
    }
    let order = match direction {
        Direction::Older => "DESC",
        Direction::Newer => "ASC",
    };
    sql.push_str(&format!(" ORDER BY effective_at {order}, id {order} LIMIT ?"));
    params.push(limit.into());

    let rows = db.fetch_all(&sql, &params).await?;
    rows.iter().map(map_outbox).collect()
}

fn map_inbox(row: &Row) -> Result<InboxMessage> {
    use rasil_store::StoreError;
    let attachments = match row.opt_text("attachments")? {
        Some(json) if !json.is_empty() => serde_json::from_str(&json).unwrap_or_default(),
        _ => Vec::new(),
    };
    Ok(InboxMessage {
        id: row.i64("id")?,
        license_id: row.i64("license_key_id")?,
        channel: row.text("channel")?.parse().map_err(StoreError::Config)?,
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

fn map_outbox(row: &Row) -> Result<OutboxMessage> {
    use rasil_store::StoreError;
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

#[cfg(test)]
mod tests {
    use super::*;
    use rasil_core::types::{Channel, InboxStatus, NormalizedMessage};
    use rasil_store::inbox::{save_inbox_message, update_inbox_status};
    use rasil_store::schema::init_schema;

    async fn seeded(n: usize) -> Database {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let base = chrono::Utc::now().naive_utc() - chrono::Duration::minutes(n as i64);
        for i in 0..n {
            let msg = NormalizedMessage {
                channel: Channel::Telegram,
                channel_message_id: Some(format!("m{}", i)),
                sender_id: None,
                sender_contact: Some("+963912345678".into()),
                sender_name: None,
                subject: None,
                body: format!("رسالة رقم {}", i),
                received_at: Some(base + chrono::Duration::minutes(i as i64)),
                attachments: Vec::new(),
                reply_to_platform_id: None,
                is_group: false,
                is_channel: false,
            };
            let id = save_inbox_message(&db, 1, &msg).await.unwrap();
            update_inbox_status(&db, id, InboxStatus::Analyzed).await.unwrap();
        }
        db
    }

    #[tokio::test]
    async fn older_then_newer_round_trips_without_gaps_or_dups() {
        let db = seeded(9).await;
        let aliases = AliasSet::single("+963912345678");

        // Page older, 3 at a time, from the top.
        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page =
                conversation_page(&db, 1, &aliases, cursor, 3, Direction::Older).await.unwrap();
            seen.extend(page.entries.iter().map(|e| e.id()));
            match page.next_cursor {
                Some(token) => cursor = Cursor::decode(&token),
                None => break,
            }
        }
        assert_eq!(seen.len(), 9);
        let mut dedup = seen.clone();
        dedup.dedup();
        assert_eq!(dedup.len(), 9, "no duplicates across pages");

        // Walk back newer from the oldest message: same ids, reversed.
        let oldest = *seen.last().unwrap();
        let oldest_page =
            conversation_page(&db, 1, &aliases, None, 100, Direction::Older).await.unwrap();
        let oldest_entry = oldest_page.entries.iter().find(|e| e.id() == oldest).unwrap();
        let mut cursor = Some(Cursor::new(oldest_entry.effective_at().unwrap(), oldest));
        let mut forward = vec![oldest];
        loop {
            let page =
                conversation_page(&db, 1, &aliases, cursor, 3, Direction::Newer).await.unwrap();
            if page.entries.is_empty() {
                break;
            }
            forward.extend(page.entries.iter().map(|e| e.id()));
            match page.next_cursor {
                Some(token) => cursor = Cursor::decode(&token),
                None => break,
            }
        }
        let mut reversed = seen.clone();
        reversed.reverse();
        assert_eq!(forward, reversed);
    }

    #[tokio::test]
    async fn history_lines_run_oldest_first() {
        let db = seeded(4).await;
        let aliases = AliasSet::single("+963912345678");
        let lines = chat_history_lines(&db, 1, &aliases, 10).await.unwrap();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("User: رسالة رقم 0"));
        assert!(lines[3].starts_with("User: رسالة رقم 3"));
    }
}
