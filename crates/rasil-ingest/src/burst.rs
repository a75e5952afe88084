//! Burst grouping. When one sender fires several fragments inside a single
//! ingest batch, every row is persisted but only the latest is analyzed —
//! with a merged `[HH:MM] body` transcript and the union of attachments.

use rasil_core::types::{
    Attachment, Channel, InboxStatus, NormalizedMessage, MERGED_SUMMARY,
};
use rasil_store::inbox::mark_inbox_terminal;
use rasil_store::Database;
use tracing::info;

use crate::error::Result;

/// One analysis unit produced from a batch: a single message, or the tail
/// of a burst carrying the merged context.
#[derive(Debug)]
pub struct PendingAnalysis {
    pub message_id: i64,
    pub channel: Channel,
    pub driving_body: String,
    pub sender_contact: Option<String>,
    pub sender_name: Option<String>,
    pub channel_message_id: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Group saved rows by sender, mark all-but-last of each burst merged, and
/// return one [`PendingAnalysis`] per group.
pub async fn group_bursts(
    db: &Database,
    saved: Vec<(i64, NormalizedMessage)>,
) -> Result<Vec<PendingAnalysis>> {
    // Insertion-ordered grouping keyed by sender_contact.
    let mut groups: Vec<(String, Vec<(i64, NormalizedMessage)>)> = Vec::new();
    for (id, msg) in saved {
        let key = msg
            .sender_contact
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, list)) => list.push((id, msg)),
            None => groups.push((key, vec![(id, msg)])),
        }
    }

    let mut out = Vec::new();
    for (sender, mut group) in groups {
        group.sort_by_key(|(id, msg)| (msg.received_at, *id));

        if group.len() == 1 {
            let (id, msg) = group.into_iter().next().unwrap();
            out.push(PendingAnalysis {
                message_id: id,
                channel: msg.channel,
                driving_body: msg.body,
                sender_contact: msg.sender_contact,
                sender_name: msg.sender_name,
                channel_message_id: msg.channel_message_id,
                attachments: msg.attachments,
            });
            continue;
        }

        info!(sender = %sender, count = group.len(), "burst detected, merging");

        let mut combined = String::new();
        let mut all_attachments = Vec::new();
        for (_, msg) in &group {
            let stamp = msg
                .received_at
                .map(|dt| dt.format("%H:%M").to_string())
                .unwrap_or_default();
            let body = if msg.body.is_empty() {
                "[ملف مرفق]"
            } else {
                &msg.body
            };
            combined.push_str(&format!("[{}] {}\n", stamp, body));
            all_attachments.extend(msg.attachments.iter().cloned());
        }
        let combined = combined.trim_end().to_string();

        // Everything except the tail is terminal-merged; no AI call.
        let last_index = group.len() - 1;
        for (id, _) in &group[..last_index] {
            mark_inbox_terminal(db, *id, InboxStatus::Merged, "merged", MERGED_SUMMARY).await?;
        }

        let (last_id, last_msg) = group.into_iter().last().unwrap();
        out.push(PendingAnalysis {
            message_id: last_id,
            channel: last_msg.channel,
            driving_body: combined,
            sender_contact: last_msg.sender_contact,
            sender_name: last_msg.sender_name,
            channel_message_id: last_msg.channel_message_id,
            attachments: all_attachments,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasil_store::inbox::{get_inbox_message, save_inbox_message};
    use rasil_store::schema::init_schema;

    fn msg(cmid: &str, sender: &str, body: &str, offset_secs: i64) -> NormalizedMessage {
        NormalizedMessage {
            channel: Channel::Telegram,
            channel_message_id: Some(cmid.into()),
            sender_id: None,
            sender_contact: Some(sender.into()),
            sender_name: None,
            subject: None,
            body: body.into(),
            received_at: Some(
                chrono::NaiveDate::from_ymd_opt(2024, 6, 1)
                    .unwrap()
                    .and_hms_opt(10, 0, 0)
                    .unwrap()
                    + chrono::Duration::seconds(offset_secs),
            ),
            attachments: Vec::new(),
            reply_to_platform_id: None,
            is_group: false,
            is_channel: false,
        }
    }

    #[tokio::test]
    async fn burst_merges_in_chronological_order() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();

        let mut saved = Vec::new();
        // Saved out of order on purpose; received_at must drive the merge.
        for (cmid, body, offset) in [("m2", "b", 1), ("m1", "a", 0), ("m3", "c", 2)] {
            let m = msg(cmid, "+963912345678", body, offset);
            let id = save_inbox_message(&db, 1, &m).await.unwrap();
            saved.push((id, m));
        }

        let analyses = group_bursts(&db, saved).await.unwrap();
        assert_eq!(analyses.len(), 1);
        assert_eq!(analyses[0].driving_body, "[10:00] a\n[10:00] b\n[10:00] c");
        assert_eq!(analyses[0].channel_message_id.as_deref(), Some("m3"));
    }

    #[tokio::test]
    async fn merged_rows_get_the_terminal_summary() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();

        let mut saved = Vec::new();
        for (cmid, offset) in [("m1", 0), ("m2", 1)] {
            let m = msg(cmid, "+963912345678", "جزء", offset);
            let id = save_inbox_message(&db, 1, &m).await.unwrap();
            saved.push((id, m));
        }
        let first_id = saved[0].0;

        group_bursts(&db, saved).await.unwrap();
        let merged = get_inbox_message(&db, first_id, 1).await.unwrap().unwrap();
        assert_eq!(merged.status, InboxStatus::Merged);
        assert_eq!(merged.intent.as_deref(), Some("merged"));
        assert_eq!(merged.ai_summary.as_deref(), Some(MERGED_SUMMARY));
        assert_eq!(merged.ai_draft_response.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn different_senders_stay_separate() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();

        let mut saved = Vec::new();
        for (cmid, sender) in [("m1", "+1"), ("m2", "+2")] {
            let m = msg(cmid, sender, "مرحبا", 0);
            let id = save_inbox_message(&db, 1, &m).await.unwrap();
            saved.push((id, m));
        }

        let analyses = group_bursts(&db, saved).await.unwrap();
        assert_eq!(analyses.len(), 2, "one analysis per sender");
    }
}
