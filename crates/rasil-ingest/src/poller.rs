//! The polling scheduler: a 300 s main loop that staggers per-license polls
//! by 10–15 s, drives the poll-based adapters, retries placeholder drafts,
//! and polls telegram read receipts.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rasil_core::config::{POLL_INTERVAL_SECS, STAGGER_MAX_SECS, STAGGER_MIN_SECS};
use rasil_core::types::{Channel, EventKind, LicenseId, ANALYSIS_PLACEHOLDER};
use rasil_store::{credentials, inbox, licenses};
use rasil_channels::FetchOptions;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::pipeline::{exclude_window_for, ingest_batch, IngestServices};

/// Backfill fetches raise the per-poll message limit.
const BACKFILL_LIMIT: usize = 500;
const NORMAL_LIMIT: usize = 200;
/// since_hours cap: 30 days, even when the credential is older.
const MAX_SINCE_HOURS: i64 = 720;

pub struct Poller {
    svcs: IngestServices,
    /// Message ids already retried this cycle; cleared at cycle start so a
    /// placeholder is re-enqueued at most once per cycle.
    retried_this_cycle: HashSet<i64>,
}

impl Poller {
    pub fn new(svcs: IngestServices) -> Self {
        Self {
            svcs,
            retried_this_cycle: HashSet::new(),
        }
    }

    /// Main loop. Runs until the shutdown watch flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("message poller started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.retried_this_cycle.clear();

            match licenses::active_license_ids(&self.svcs.db).await {
                Ok(ids) => {
                    for license_id in ids {
                        if *shutdown.borrow() {
                            break;
                        }
                        // Stagger spreads provider load across the cycle.
                        let stagger = rand::thread_rng()
                            .gen_range(STAGGER_MIN_SECS..STAGGER_MAX_SECS);
                        tokio::time::sleep(Duration::from_secs_f64(stagger)).await;

                        self.poll_license(license_id).await;
                    }
                }
                Err(e) => error!(error = %e, "active license enumeration failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("message poller stopped");
    }

    /// One license, one cycle. Every sub-step swallows its own errors so a
    /// broken credential never blocks the rest.
    pub async fn poll_license(&mut self, license_id: LicenseId) {
        if let Err(e) = self.poll_email(license_id).await {
            error!(license_id, error = %e, "email poll failed");
        }
        if let Err(e) = self.poll_telegram(license_id).await {
            error!(license_id, error = %e, "telegram poll failed");
        }
        if let Err(e) = self.retry_placeholders(license_id).await {
            error!(license_id, error = %e, "placeholder retry failed");
        }
        if let Err(e) = self.poll_telegram_receipts(license_id).await {
            error!(license_id, error = %e, "telegram receipt poll failed");
        }
    }

    async fn poll_email(&self, license_id: LicenseId) -> crate::Result<()> {
        let Some(config) =
            credentials::get_email_config(&self.svcs.db, &self.svcs.vault, license_id).await?
        else {
            return Ok(());
        };
        if !config.is_active || config.access_token.is_empty() {
            return Ok(());
        }

        // Respect the per-credential check interval.
        if let Some(last) = config.last_checked_at {
            let elapsed = Utc::now().naive_utc().signed_duration_since(last);
            if elapsed.num_minutes() < config.check_interval_minutes {
                return Ok(());
            }
        }

        let is_backfill = config.last_checked_at.is_none();
        let since_hours = if is_backfill {
            info!(license_id, "first email poll, triggering historical backfill");
            self.svcs.limits.backfill_days as i64 * 24
        } else {
            since_hours_from(config.created_at)
        };

        let exclude_ids = inbox::recent_channel_message_ids(
            &self.svcs.db,
            license_id,
            Channel::Email,
            exclude_window_for(Channel::Email),
        )
        .await?;

        let transport = self
            .svcs
            .transports
            .transport_for(license_id, Channel::Email)
            .await?;
        let events = transport
            .fetch_new(&FetchOptions {
                since_hours,
                limit: if is_backfill { BACKFILL_LIMIT } else { NORMAL_LIMIT },
                exclude_ids,
                unreplied_only: is_backfill,
            })
            .await?;

        if !events.is_empty() {
            ingest_batch(&self.svcs, license_id, events, config.auto_reply_enabled).await?;
        }
        credentials::update_email_last_checked(&self.svcs.db, license_id).await?;
        Ok(())
    }

    async fn poll_telegram(&self, license_id: LicenseId) -> crate::Result<()> {
        let Some(session) =
            credentials::get_telegram_session(&self.svcs.db, &self.svcs.vault, license_id).await?
        else {
            return Ok(());
        };

        let is_backfill = session.last_synced_at.is_none();
        let since_hours = if is_backfill {
            info!(license_id, "first telegram poll, triggering historical backfill");
            self.svcs.limits.backfill_days as i64 * 24
        } else {
            since_hours_from(session.created_at)
        };

        let exclude_ids = inbox::recent_channel_message_ids(
            &self.svcs.db,
            license_id,
            Channel::Telegram,
            exclude_window_for(Channel::Telegram),
        )
        .await?;

        let transport = self
            .svcs
            .transports
            .transport_for(license_id, Channel::Telegram)
            .await?;
        let fetched = transport
            .fetch_new(&FetchOptions {
                since_hours,
                limit: if is_backfill { BACKFILL_LIMIT } else { NORMAL_LIMIT },
                exclude_ids,
                unreplied_only: is_backfill,
            })
            .await;

        let events = match fetched {
            Ok(events) => events,
            Err(e) if !e.retryable => {
                // Revoked/invalid session: deactivate so the operator can
                // re-link instead of erroring every cycle.
                warn!(license_id, error = %e, "telegram session invalid, deactivating");
                credentials::deactivate_telegram_session(&self.svcs.db, license_id).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !events.is_empty() {
            ingest_batch(&self.svcs, license_id, events, session.auto_reply_enabled).await?;
        }
        credentials::update_telegram_session_sync_time(&self.svcs.db, license_id).await?;
        Ok(())
    }

    /// Re-enqueue at most one placeholder-draft message per license per
    /// cycle, skipped entirely while the provider cooldown is active.
    async fn retry_placeholders(&mut self, license_id: LicenseId) -> crate::Result<()> {
        if self.svcs.cooldown.is_active() {
            debug!(license_id, "global cooldown active, skipping placeholder retries");
            return Ok(());
        }

        let cutoff = Utc::now().naive_utc() - chrono::Duration::hours(24);
        let candidates = inbox::placeholder_messages(
            &self.svcs.db,
            license_id,
            ANALYSIS_PLACEHOLDER,
            cutoff,
            1,
        )
        .await?;

        for msg in candidates {
            if self.retried_this_cycle.contains(&msg.id) {
                continue;
            }
            self.retried_this_cycle.insert(msg.id);

            let payload = serde_json::json!({
                "message_id": msg.id,
                "license_id": license_id,
                "channel": msg.channel.as_str(),
                "body": msg.body,
                "sender_contact": msg.sender_contact,
                "sender_name": msg.sender_name,
                "channel_message_id": msg.channel_message_id,
                "attachments": msg.attachments,
                // Retries never auto-reply; the operator may have moved on.
                "auto_reply": false,
            });
            rasil_queue::enqueue(&self.svcs.db, "analyze_message", &payload).await?;
            info!(license_id, message_id = msg.id, "placeholder analysis re-enqueued");
        }
        Ok(())
    }

    async fn poll_telegram_receipts(&self, license_id: LicenseId) -> crate::Result<()> {
        let session =
            credentials::get_telegram_session(&self.svcs.db, &self.svcs.vault, license_id).await?;
        if session.is_none() {
            return Ok(());
        }

        let transport = self
            .svcs
            .transports
            .transport_for(license_id, Channel::Telegram)
            .await?;
        let broadcasts =
            rasil_dispatch::poll_telegram_receipts(&self.svcs.db, license_id, &transport).await?;

        for broadcast in broadcasts {
            self.svcs
                .sink
                .emit(
                    license_id,
                    EventKind::MessageStatusUpdate,
                    serde_json::json!({
                        "outbox_id": broadcast.outbox_id,
                        "sender_contact": broadcast.sender_contact,
                        "platform_message_id": broadcast.platform_message_id,
                        "status": broadcast.status.as_str(),
                        "timestamp": broadcast.timestamp.and_utc().to_rfc3339(),
                    }),
                )
                .await;
        }
        Ok(())
    }
}

/// Hours since the credential was connected, plus a one-hour buffer, capped
/// at 30 days.
fn since_hours_from(created_at: Option<chrono::NaiveDateTime>) -> i64 {
    match created_at {
        Some(created) => {
            let hours = Utc::now()
                .naive_utc()
                .signed_duration_since(created)
                .num_hours();
            (hours + 1).clamp(1, MAX_SINCE_HOURS)
        }
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::NullSink;
    use async_trait::async_trait;
    use rasil_cache::{Cooldown, DedupCache};
    use rasil_core::config::LimitsConfig;
    use rasil_core::types::NormalizedMessage;
    use rasil_dispatch::TransportProvider;
    use rasil_store::schema::init_schema;
    use rasil_store::Database;
    use rasil_vault::Vault;
    use std::sync::Arc;

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

    async fn poller_with_db() -> (Database, Poller) {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let svcs = IngestServices {
            db: db.clone(),
            vault: Vault::from_secret("t").unwrap(),
            dedup: Arc::new(DedupCache::new()),
            cooldown: Arc::new(Cooldown::new()),
            transports: Arc::new(NoTransports),
            sink: Arc::new(NullSink),
            limits: LimitsConfig::default(),
        };
        (db.clone(), Poller::new(svcs))
    }

    async fn seed_placeholder_message(db: &Database) -> i64 {
        let msg = NormalizedMessage {
            channel: Channel::Whatsapp,
            channel_message_id: Some("wamid.P".into()),
            sender_id: None,
            sender_contact: Some("966501234567".into()),
            sender_name: None,
            subject: None,
            body: "رسالة بانتظار التحليل".into(),
            received_at: None,
            attachments: Vec::new(),
            reply_to_platform_id: None,
            is_group: false,
            is_channel: false,
        };
        let id = inbox::save_inbox_message(db, 1, &msg).await.unwrap();
        db.execute(
            "UPDATE inbox_messages SET ai_draft_response = ?, created_at = ? WHERE id = ?",
            &[
                ANALYSIS_PLACEHOLDER.into(),
                rasil_store::Value::Timestamp(
                    Utc::now().naive_utc() - chrono::Duration::hours(1),
                ),
                id.into(),
            ],
        )
        .await
        .unwrap();
        id
    }

    async fn queued_analyze_tasks(db: &Database) -> i64 {
        db.fetch_one(
            "SELECT COUNT(*) AS n FROM task_queue WHERE task_type = 'analyze_message'",
            &[],
        )
        .await
        .unwrap()
        .unwrap()
        .i64("n")
        .unwrap()
    }

    #[tokio::test]
    async fn placeholder_is_retried_once_per_cycle() {
        let (db, mut poller) = poller_with_db().await;
        seed_placeholder_message(&db).await;

        // Two passes within the same cycle enqueue exactly once.
        poller.retry_placeholders(1).await.unwrap();
        poller.retry_placeholders(1).await.unwrap();
        assert_eq!(queued_analyze_tasks(&db).await, 1);

        // A new cycle clears the set and may retry again.
        poller.retried_this_cycle.clear();
        poller.retry_placeholders(1).await.unwrap();
        assert_eq!(queued_analyze_tasks(&db).await, 2);
    }

    #[tokio::test]
    async fn cooldown_suppresses_placeholder_retries() {
        let (db, mut poller) = poller_with_db().await;
        seed_placeholder_message(&db).await;

        poller.svcs.cooldown.set(std::time::Duration::from_secs(60));
        poller.retry_placeholders(1).await.unwrap();
        assert_eq!(queued_analyze_tasks(&db).await, 0);
    }

    #[test]
    fn since_hours_has_buffer_and_cap() {
        let now = Utc::now().naive_utc();
        assert_eq!(since_hours_from(None), 1);
        assert_eq!(since_hours_from(Some(now)), 1);
        assert_eq!(
            since_hours_from(Some(now - chrono::Duration::hours(5))),
            6,
            "one-hour buffer on top of elapsed time"
        );
        assert_eq!(
            since_hours_from(Some(now - chrono::Duration::days(90))),
            MAX_SINCE_HOURS,
            "capped at 30 days"
        );
    }
}
