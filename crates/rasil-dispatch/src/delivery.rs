//! Delivery-status reconciliation: webhook status events and periodic
//! receipt polling both land here. Transitions are monotone (sent <
//! delivered < read, failed terminal); anything moving backward is dropped
//! silently.

use std::sync::Arc;

use chrono::NaiveDateTime;
use rasil_channels::Transport;
use rasil_conversations::engine::Conversation;
use rasil_core::types::{DeliveryStatus, LicenseId};
use rasil_store::outbox;
use rasil_store::Database;
use tracing::{debug, info};

use crate::error::Result;

/// Payload for the `message_status_update` WS event.
#[derive(Debug, Clone)]
pub struct StatusBroadcast {
    pub license_id: LicenseId,
    pub outbox_id: i64,
    pub inbox_message_id: Option<i64>,
    pub sender_contact: Option<String>,
    pub platform_message_id: String,
    pub status: DeliveryStatus,
    pub timestamp: NaiveDateTime,
    pub conversation: Option<Conversation>,
}

/// Apply one status event. Returns the broadcast payload when state changed,
/// None when the platform id is unknown or the transition is not a
/// progression.
pub async fn update_delivery_status(
    db: &Database,
    platform_message_id: &str,
    status: DeliveryStatus,
    timestamp: Option<NaiveDateTime>,
) -> Result<Option<StatusBroadcast>> {
    let Some(msg) = outbox::find_by_platform_id(db, platform_message_id).await? else {
        debug!(platform_message_id, "status event for unknown message, dropping");
        return Ok(None);
    };

    // A row without a projection yet starts the chain at whatever arrives.
    if let Some(current) = msg.delivery_status {
        if !current.may_transition_to(status) {
            debug!(
                platform_message_id,
                current = %current,
                next = %status,
                "dropping non-progressing status update"
            );
            return Ok(None);
        }
    }

    outbox::set_delivery_status(db, msg.id, status).await?;
    info!(outbox_id = msg.id, status = %status, "delivery status updated");

    // Conversation identity: the original sender when this was a reply, the
    // recipient otherwise.
    let sender_contact = match msg.inbox_message_id {
        Some(inbox_id) => {
            match rasil_store::inbox::get_inbox_message(db, inbox_id, msg.license_id).await? {
                Some(inbox) => inbox.sender_contact,
                None => None,
            }
        }
        None => None,
    }
    .or_else(|| msg.recipient_email.clone())
    .or_else(|| msg.recipient_id.clone());

    let conversation = match &sender_contact {
        Some(contact) => {
            rasil_conversations::recompute(db, msg.license_id, contact, None, None).await?
        }
        None => None,
    };

    Ok(Some(StatusBroadcast {
        license_id: msg.license_id,
        outbox_id: msg.id,
        inbox_message_id: msg.inbox_message_id,
        sender_contact,
        platform_message_id: platform_message_id.to_string(),
        status,
        timestamp: timestamp.unwrap_or_else(|| chrono::Utc::now().naive_utc()),
        conversation,
    }))
}

/// Periodic driver for channels without push receipts: poll the adapter for
/// read watermarks on recent sent/delivered telegram rows and commit any
/// upgrades.
pub async fn poll_telegram_receipts(
    db: &Database,
    license_id: LicenseId,
    transport: &Arc<dyn Transport>,
) -> Result<Vec<StatusBroadcast>> {
    let cutoff = chrono::Utc::now().naive_utc() - chrono::Duration::hours(24);
    let candidates = outbox::telegram_receipt_candidates(db, license_id, cutoff).await?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let outstanding: Vec<String> = candidates
        .iter()
        .filter_map(|m| m.platform_message_id.clone())
        .collect();
    let statuses = transport.poll_receipts(&outstanding).await?;

    let mut broadcasts = Vec::new();
    for (platform_id, status) in statuses {
        if let Some(broadcast) =
            update_delivery_status(db, &platform_id, status, None).await?
        {
            broadcasts.push(broadcast);
        }
    }
    if !broadcasts.is_empty() {
        info!(
            license_id,
            count = broadcasts.len(),
            "telegram receipts upgraded"
        );
    }
    Ok(broadcasts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasil_core::types::Channel;
    use rasil_store::outbox::{create_outbox_message, save_platform_message_id, NewOutboxMessage};
    use rasil_store::schema::init_schema;

    async fn sent_message(db: &Database) -> i64 {
        let id = create_outbox_message(
            db,
            &NewOutboxMessage {
                license_id: 1,
                inbox_message_id: None,
                channel: Channel::Whatsapp,
                recipient_id: Some("966501234567".into()),
                recipient_email: Some("966501234567".into()),
                subject: None,
                body: "رد".into(),
                attachments: Vec::new(),
            },
        )
        .await
        .unwrap();
        save_platform_message_id(db, id, "wamid.S").await.unwrap();
        id
    }

    async fn current_status(db: &Database, id: i64) -> Option<DeliveryStatus> {
        outbox::get_outbox_message(db, id, 1)
            .await
            .unwrap()
            .unwrap()
            .delivery_status
    }

    #[tokio::test]
    async fn progression_delivered_then_read_applies() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let id = sent_message(&db).await;

        let b1 = update_delivery_status(&db, "wamid.S", DeliveryStatus::Delivered, None)
            .await
            .unwrap();
        assert!(b1.is_some());
        let b2 = update_delivery_status(&db, "wamid.S", DeliveryStatus::Read, None)
            .await
            .unwrap();
        assert!(b2.is_some());
        assert_eq!(current_status(&db, id).await, Some(DeliveryStatus::Read));
    }

    #[tokio::test]
    async fn out_of_order_replay_settles_on_read() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let id = sent_message(&db).await;

        // sent, read, delivered, sent — final state must be read.
        for status in [
            DeliveryStatus::Sent,
            DeliveryStatus::Read,
            DeliveryStatus::Delivered,
            DeliveryStatus::Sent,
        ] {
            let _ = update_delivery_status(&db, "wamid.S", status, None).await.unwrap();
        }
        assert_eq!(current_status(&db, id).await, Some(DeliveryStatus::Read));
    }

    #[tokio::test]
    async fn late_sent_after_read_produces_no_broadcast() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        sent_message(&db).await;

        update_delivery_status(&db, "wamid.S", DeliveryStatus::Read, None)
            .await
            .unwrap();
        let late = update_delivery_status(&db, "wamid.S", DeliveryStatus::Sent, None)
            .await
            .unwrap();
        assert!(late.is_none(), "backward move must not broadcast");
    }

    #[tokio::test]
    async fn failed_always_writes_and_is_terminal() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let id = sent_message(&db).await;

        update_delivery_status(&db, "wamid.S", DeliveryStatus::Failed, None)
            .await
            .unwrap();
        assert_eq!(current_status(&db, id).await, Some(DeliveryStatus::Failed));

        let after = update_delivery_status(&db, "wamid.S", DeliveryStatus::Read, None)
            .await
            .unwrap();
        assert!(after.is_none());
        assert_eq!(current_status(&db, id).await, Some(DeliveryStatus::Failed));
    }

    #[tokio::test]
    async fn unknown_platform_id_is_dropped_silently() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let result = update_delivery_status(&db, "wamid.GHOST", DeliveryStatus::Read, None)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
