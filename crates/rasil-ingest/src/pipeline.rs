//! The shared intake pipeline. Poll batches and webhook payloads go through
//! the same steps: save-time sender guard → dedup cache → DB existence →
//! filter chain → persistence → burst grouping → `analyze_message` enqueue.
//! Per-message errors are logged and swallowed; the batch continues.

use std::sync::Arc;

use async_trait::async_trait;
use rasil_cache::{Cooldown, DedupCache};
use rasil_channels::{DeliveryStatusEvent, OutboundEcho, WebhookEvent};
use rasil_core::config::LimitsConfig;
use rasil_core::types::{Channel, EventKind, LicenseId, NormalizedMessage};
use rasil_dispatch::TransportProvider;
use rasil_filters::{apply_filters, is_blocked_sender_keyword, FilterPolicy, RecentMessage, Verdict};
use rasil_store::inbox;
use rasil_store::{Database, Value};
use rasil_vault::Vault;
use tracing::{debug, info, warn};

use crate::burst::group_bursts;
use crate::error::Result;

/// WS fan-out seam; the gateway implements it over the connection registry
/// and the pub/sub bus. Broadcast failures never affect the pipeline.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, license_id: LicenseId, kind: EventKind, data: serde_json::Value);
}

/// Sink that drops everything; used in tests and headless tools.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _license_id: LicenseId, _kind: EventKind, _data: serde_json::Value) {}
}

/// Everything the scheduler and webhook handlers need, built once at
/// process start.
#[derive(Clone)]
pub struct IngestServices {
    pub db: Database,
    pub vault: Vault,
    pub dedup: Arc<DedupCache>,
    pub cooldown: Arc<Cooldown>,
    pub transports: Arc<dyn TransportProvider>,
    pub sink: Arc<dyn EventSink>,
    pub limits: LimitsConfig,
}

#[derive(Debug, Default)]
pub struct IngestSummary {
    pub saved: usize,
    pub filtered: usize,
    pub duplicates: usize,
    pub tasks_enqueued: usize,
    pub status_events: usize,
    pub echoes: usize,
}

/// Run one batch of transport events for a license through the pipeline.
pub async fn ingest_batch(
    svcs: &IngestServices,
    license_id: LicenseId,
    events: Vec<WebhookEvent>,
    auto_reply: bool,
) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    let mut saved: Vec<(i64, NormalizedMessage)> = Vec::new();

    // Duplicate-window comparisons run against recent inbox state.
    let recent = recent_messages(&svcs.db, license_id).await?;
    let policy = FilterPolicy::default();

    for event in events {
        match event {
            WebhookEvent::Status(status) => {
                summary.status_events += 1;
                apply_status_event(svcs, license_id, status).await;
            }
            WebhookEvent::OutboundEcho(echo) => {
                summary.echoes += 1;
                if let Err(e) = sync_outbound_echo(&svcs.db, license_id, &echo).await {
                    warn!(license_id, error = %e, "outbound echo sync failed");
                }
            }
            WebhookEvent::Inbound(msg) => {
                match ingest_one(svcs, license_id, msg, &policy, &recent).await {
                    Ok(Some(pair)) => {
                        summary.saved += 1;
                        saved.push(pair);
                    }
                    Ok(None) => summary.filtered += 1,
                    Err(e) if e_is_duplicate(&e) => summary.duplicates += 1,
                    Err(e) => warn!(license_id, error = %e, "message ingest failed, continuing"),
                }
            }
        }
    }

    // Burst grouping: rapid-fire fragments from one sender become a single
    // analysis call carrying the merged transcript.
    let analyses = group_bursts(&svcs.db, saved).await?;
    for analysis in analyses {
        let payload = serde_json::json!({
            "message_id": analysis.message_id,
            "license_id": license_id,
            "channel": analysis.channel.as_str(),
            "body": analysis.driving_body,
            "sender_contact": analysis.sender_contact,
            "sender_name": analysis.sender_name,
            "channel_message_id": analysis.channel_message_id,
            "attachments": analysis.attachments,
            "auto_reply": auto_reply,
        });
        rasil_queue::enqueue(&svcs.db, "analyze_message", &payload).await?;
        summary.tasks_enqueued += 1;
    }

    if summary.saved > 0 || summary.status_events > 0 {
        info!(
            license_id,
            saved = summary.saved,
            filtered = summary.filtered,
            duplicates = summary.duplicates,
            tasks = summary.tasks_enqueued,
            "ingest batch complete"
        );
    }
    Ok(summary)
}

async fn ingest_one(
    svcs: &IngestServices,
    license_id: LicenseId,
    msg: NormalizedMessage,
    policy: &FilterPolicy,
    recent: &[RecentMessage],
) -> Result<Option<(i64, NormalizedMessage)>> {
    // Known bots and promotional senders never reach the table.
    if is_blocked_sender_keyword(msg.sender_name.as_deref(), msg.sender_contact.as_deref()) {
        debug!(license_id, sender = ?msg.sender_contact, "blocked sender keyword");
        return Ok(None);
    }

    if svcs.dedup.is_duplicate(
        &msg.body,
        msg.sender_name.as_deref(),
        msg.channel_message_id.as_deref(),
    ) {
        debug!(license_id, "dedup cache hit, skipping");
        return Ok(None);
    }

    if let Some(cmid) = &msg.channel_message_id {
        if inbox::exists_channel_message(&svcs.db, license_id, msg.channel, cmid).await? {
            return Ok(None);
        }
    }

    let now = chrono::Utc::now().naive_utc();
    if let Verdict::Reject(reason) = apply_filters(&msg, policy, recent, now) {
        info!(license_id, %reason, "message filtered");
        return Ok(None);
    }

    let id = inbox::save_inbox_message(&svcs.db, license_id, &msg).await?;
    Ok(Some((id, msg)))
}

async fn apply_status_event(
    svcs: &IngestServices,
    license_id: LicenseId,
    status: DeliveryStatusEvent,
) {
    match rasil_dispatch::update_delivery_status(
        &svcs.db,
        &status.platform_message_id,
        status.status,
        status.timestamp,
    )
    .await
    {
        Ok(Some(broadcast)) => {
            svcs.sink
                .emit(
                    license_id,
                    EventKind::MessageStatusUpdate,
                    serde_json::json!({
                        "outbox_id": broadcast.outbox_id,
                        "sender_contact": broadcast.sender_contact,
                        "inbox_message_id": broadcast.inbox_message_id,
                        "platform_message_id": broadcast.platform_message_id,
                        "status": broadcast.status.as_str(),
                        "timestamp": broadcast.timestamp.and_utc().to_rfc3339(),
                    }),
                )
                .await;
        }
        Ok(None) => {}
        Err(e) => warn!(license_id, error = %e, "delivery status update failed"),
    }
}

/// A message we sent from the linked account elsewhere (phone, web client):
/// record it as a sent outbox row so the conversation reflects it.
pub async fn sync_outbound_echo(
    db: &Database,
    license_id: LicenseId,
    echo: &OutboundEcho,
) -> Result<()> {
    if let Some(pid) = &echo.platform_message_id {
        if rasil_store::outbox::find_by_platform_id(db, pid).await?.is_some() {
            return Ok(());
        }
    }

    let outbox_id = rasil_store::outbox::create_outbox_message(
        db,
        &rasil_store::outbox::NewOutboxMessage {
            license_id,
            inbox_message_id: None,
            channel: echo.channel,
            recipient_id: echo.recipient_id.clone(),
            recipient_email: echo.recipient_contact.clone(),
            subject: None,
            body: echo.body.clone(),
            attachments: Vec::new(),
        },
    )
    .await?;
    rasil_store::outbox::mark_outbox_sent(db, outbox_id).await?;
    if let Some(pid) = &echo.platform_message_id {
        rasil_store::outbox::save_platform_message_id(db, outbox_id, pid).await?;
    }
    if let Some(sent_at) = echo.sent_at {
        db.execute(
            "UPDATE outbox_messages SET sent_at = ? WHERE id = ?",
            &[Value::Timestamp(sent_at), outbox_id.into()],
        )
        .await?;
    }

    if let Some(contact) = echo
        .recipient_contact
        .as_deref()
        .or(echo.recipient_id.as_deref())
    {
        let _ = rasil_conversations::recompute(db, license_id, contact, None, None).await;
    }
    debug!(license_id, outbox_id, "outbound echo synced");
    Ok(())
}

async fn recent_messages(db: &Database, license_id: LicenseId) -> Result<Vec<RecentMessage>> {
    let rows = inbox::list_inbox(db, license_id, None, None, 500, 0).await?;
    Ok(rows
        .into_iter()
        .map(|m| RecentMessage {
            sender_contact: m.sender_contact,
            body: m.body,
            received_at: m.received_at.or(m.created_at),
        })
        .collect())
}

fn e_is_duplicate(e: &crate::error::IngestError) -> bool {
    match e {
        crate::error::IngestError::Store(inner) => inner.is_unique_violation(),
        _ => false,
    }
}

/// Channels with larger inboxes keep a deeper exclude window.
pub fn exclude_window_for(channel: Channel) -> i64 {
    match channel {
        Channel::Email => 500,
        _ => 200,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasil_store::schema::init_schema;

    fn services(db: Database) -> IngestServices {
        struct NoTransports;
        #[async_trait]
        impl TransportProvider for NoTransports {
            async fn transport_for(
                &self,
                _license_id: LicenseId,
                channel: Channel,
            ) -> rasil_dispatch::Result<Arc<dyn rasil_channels::Transport>> {
                Err(rasil_dispatch::DispatchError::NoTransport(
                    channel.as_str().to_string(),
                ))
            }
        }
        IngestServices {
            db,
            vault: Vault::from_secret("test").unwrap(),
            dedup: Arc::new(DedupCache::new()),
            cooldown: Arc::new(Cooldown::new()),
            transports: Arc::new(NoTransports),
            sink: Arc::new(NullSink),
            limits: LimitsConfig::default(),
        }
    }

    fn inbound(cmid: &str, sender: &str, body: &str) -> WebhookEvent {
        WebhookEvent::Inbound(NormalizedMessage {
            channel: Channel::Whatsapp,
            channel_message_id: Some(cmid.into()),
            sender_id: Some(sender.into()),
            sender_contact: Some(sender.into()),
            sender_name: Some("عميل".into()),
            subject: None,
            body: body.into(),
            received_at: Some(chrono::Utc::now().naive_utc()),
            attachments: Vec::new(),
            reply_to_platform_id: None,
            is_group: false,
            is_channel: false,
        })
    }

    #[tokio::test]
    async fn webhook_message_is_saved_and_enqueued() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let svcs = services(db.clone());

        let summary = ingest_batch(
            &svcs,
            1,
            vec![inbound("wamid.X", "966501234567", "مرحباً أريد الاستفسار")],
            false,
        )
        .await
        .unwrap();
        assert_eq!(summary.saved, 1);
        assert_eq!(summary.tasks_enqueued, 1);

        let row = db
            .fetch_one(
                "SELECT COUNT(*) AS n FROM inbox_messages WHERE license_key_id = ?",
                &[1i64.into()],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.i64("n").unwrap(), 1);
    }

    #[tokio::test]
    async fn second_delivery_of_same_webhook_is_suppressed() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let svcs = services(db.clone());

        let first = ingest_batch(
            &svcs,
            1,
            vec![inbound("update-12345", "966501234567", "رسالة تصل مرتين")],
            false,
        )
        .await
        .unwrap();
        assert_eq!(first.saved, 1);

        let second = ingest_batch(
            &svcs,
            1,
            vec![inbound("update-12345", "966501234567", "رسالة تصل مرتين")],
            false,
        )
        .await
        .unwrap();
        assert_eq!(second.saved, 0, "dedup must stop the replay");

        let row = db
            .fetch_one("SELECT COUNT(*) AS n FROM inbox_messages", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.i64("n").unwrap(), 1, "exactly one row persisted");
    }

    #[tokio::test]
    async fn spam_is_filtered_before_persistence() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let svcs = services(db.clone());

        let summary = ingest_batch(
            &svcs,
            1,
            vec![inbound("m1", "spammer", "اربح مجانا http://a.co http://b.co http://c.co http://d.co")],
            false,
        )
        .await
        .unwrap();
        assert_eq!(summary.saved, 0);
        assert_eq!(summary.filtered, 1);
        assert_eq!(summary.tasks_enqueued, 0);
    }

    #[tokio::test]
    async fn burst_of_three_yields_one_task_and_two_merged_rows() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let svcs = services(db.clone());

        let base = chrono::Utc::now().naive_utc();
        let mut events = Vec::new();
        for (i, body) in ["الرسالة الأولى", "الرسالة الثانية", "الرسالة الثالثة"]
            .iter()
            .enumerate()
        {
            let mut msg = match inbound(&format!("m{}", i), "+963912345678", body) {
                WebhookEvent::Inbound(m) => m,
                _ => unreachable!(),
            };
            msg.channel = Channel::Telegram;
            msg.received_at = Some(base + chrono::Duration::seconds(i as i64));
            events.push(WebhookEvent::Inbound(msg));
        }

        let summary = ingest_batch(&svcs, 1, events, false).await.unwrap();
        assert_eq!(summary.saved, 3);
        assert_eq!(summary.tasks_enqueued, 1, "one AI task for the whole burst");

        let row = db
            .fetch_one(
                "SELECT COUNT(*) AS n FROM inbox_messages WHERE status = 'merged'",
                &[],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.i64("n").unwrap(), 2);

        // The task payload carries the merged transcript in order.
        let task = db
            .fetch_one("SELECT payload FROM task_queue ORDER BY id LIMIT 1", &[])
            .await
            .unwrap()
            .unwrap();
        let payload: serde_json::Value =
            serde_json::from_str(&task.text("payload").unwrap()).unwrap();
        let body = payload["body"].as_str().unwrap();
        let first = body.find("الرسالة الأولى").unwrap();
        let second = body.find("الرسالة الثانية").unwrap();
        let third = body.find("الرسالة الثالثة").unwrap();
        assert!(first < second && second < third, "chronological merge order");
        assert!(body.contains('['), "bodies are prefixed with [HH:MM] stamps");
    }

    #[tokio::test]
    async fn outbound_echo_lands_in_outbox_not_inbox() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let svcs = services(db.clone());

        let echo = WebhookEvent::OutboundEcho(OutboundEcho {
            channel: Channel::Telegram,
            recipient_contact: Some("+963912345678".into()),
            recipient_id: Some("5551234".into()),
            body: "رد أرسلته من هاتفي".into(),
            platform_message_id: Some("5551234:99".into()),
            sent_at: Some(chrono::Utc::now().naive_utc()),
        });
        let summary = ingest_batch(&svcs, 1, vec![echo], false).await.unwrap();
        assert_eq!(summary.echoes, 1);
        assert_eq!(summary.saved, 0);

        let outbox = db
            .fetch_one("SELECT status, platform_message_id FROM outbox_messages", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outbox.text("status").unwrap(), "sent");
        assert_eq!(outbox.text("platform_message_id").unwrap(), "5551234:99");
    }
}
