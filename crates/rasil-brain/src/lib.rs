//! The AI orchestrator: one analysis pipeline per inbound message, wrapped
//! in a process-wide single-flight semaphore and the per-license rate caps.

pub mod analyzer;
mod error;
pub mod scrape;

pub use analyzer::{Analyzer, AnalyzerError, AnalyzerInput, HttpAnalyzer};
pub use error::{BrainError, Result};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rasil_cache::{Cooldown, DedupCache, RateLimiter};
use rasil_conversations::engine::Conversation;
use rasil_core::types::{
    Attachment, AttachmentKind, Channel, InboxStatus, LicenseId, DUPLICATE_SUMMARY,
};
use rasil_store::inbox::{update_inbox_analysis, AnalysisUpdate};
use rasil_store::{customers, Database};
use tracing::{debug, info, warn};

/// 429 from the provider pauses every license for this long.
const COOLDOWN_AFTER_429: Duration = Duration::from_secs(60);
/// History lines handed to the analyzer.
const HISTORY_LINES: i64 = 10;

/// Voice synthesis seam; the real service lives outside the core.
#[async_trait]
pub trait SpeechSynth: Send + Sync {
    async fn synthesize(&self, text: &str) -> std::result::Result<PathBuf, String>;
}

#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub message_id: i64,
    pub license_id: LicenseId,
    pub channel: Channel,
    /// The driving body — for a burst group this is the merged transcript,
    /// not the row's own body.
    pub body: String,
    pub sender_contact: Option<String>,
    pub sender_name: Option<String>,
    pub channel_message_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub auto_reply: bool,
}

#[derive(Debug)]
pub enum AnalyzeOutcome {
    /// Analysis persisted. Carries the draft for the auto-reply path and the
    /// fresh conversation snapshot for broadcasting.
    Completed {
        draft_response: String,
        auto_reply: bool,
        conversation: Option<Conversation>,
    },
    /// Exact duplicate (same channel_message_id) — marked, no AI call.
    SkippedDuplicate,
    /// Per-license caps reached; the retry pass re-attempts next cycle.
    RateLimited(String),
    /// Global provider cooldown active; nothing was attempted.
    CoolingDown,
}

pub struct Orchestrator {
    db: Database,
    http: reqwest::Client,
    analyzer: Arc<dyn Analyzer>,
    limiter: Arc<RateLimiter>,
    cooldown: Arc<Cooldown>,
    dedup: Arc<DedupCache>,
    /// Capacity 1: at most one provider request in flight per worker.
    single_flight: tokio::sync::Semaphore,
    speech: Option<Arc<dyn SpeechSynth>>,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        http: reqwest::Client,
        analyzer: Arc<dyn Analyzer>,
        limiter: Arc<RateLimiter>,
        cooldown: Arc<Cooldown>,
        dedup: Arc<DedupCache>,
        speech: Option<Arc<dyn SpeechSynth>>,
    ) -> Self {
        Self {
            db,
            http,
            analyzer,
            limiter,
            cooldown,
            dedup,
            single_flight: tokio::sync::Semaphore::new(1),
            speech,
        }
    }

    pub fn cooldown(&self) -> &Cooldown {
        &self.cooldown
    }

    pub async fn analyze(&self, req: &AnalyzeRequest) -> Result<AnalyzeOutcome> {
        // Exact-duplicate short circuit; same body alone never counts.
        if self.dedup.is_duplicate(
            &req.body,
            req.sender_name.as_deref(),
            req.channel_message_id.as_deref(),
        ) {
            info!(message_id = req.message_id, "skipping analysis: exact duplicate");
            rasil_store::inbox::mark_inbox_terminal(
                &self.db,
                req.message_id,
                InboxStatus::Duplicate,
                "duplicate",
                DUPLICATE_SUMMARY,
            )
            .await?;
            return Ok(AnalyzeOutcome::SkippedDuplicate);
        }

        if self.cooldown.is_active() {
            debug!(message_id = req.message_id, "global cooldown active, deferring");
            return Ok(AnalyzeOutcome::CoolingDown);
        }

        let (allowed, reason) = self.limiter.check(req.license_id).await?;
        if !allowed {
            let reason = reason.unwrap_or_else(|| "rate limited".into());
            debug!(message_id = req.message_id, %reason, "per-license cap reached");
            return Ok(AnalyzeOutcome::RateLimited(reason));
        }

        // Single-flight: keeps worker-wide provider RPM at one request at a
        // time, cooperating with the global cooldown.
        let _permit = self
            .single_flight
            .acquire()
            .await
            .map_err(|_| BrainError::Internal("single-flight semaphore closed".into()))?;

        let history = self.load_history(req).await;
        let link_context = scrape::scrape_link_context(&self.http, &req.body).await;

        let input = AnalyzerInput {
            body: req.body.clone(),
            history,
            link_context,
            sender_name: req.sender_name.clone(),
        };

        let analysis = match self.analyzer.analyze(&input).await {
            Ok(analysis) => analysis,
            Err(AnalyzerError::RateLimited) => {
                warn!("provider returned 429, entering global cooldown");
                self.cooldown.set(COOLDOWN_AFTER_429);
                return Err(BrainError::ProviderRateLimited);
            }
            Err(AnalyzerError::Provider(e)) => return Err(BrainError::Analyzer(e)),
        };

        let mut draft = analysis.draft_response.clone();

        // Voice in, voice out: synthesize the draft and tag the path.
        let has_audio = req
            .attachments
            .iter()
            .any(|a| matches!(a.kind, AttachmentKind::Audio | AttachmentKind::Voice));
        if has_audio {
            if let Some(speech) = &self.speech {
                match speech.synthesize(&draft).await {
                    Ok(path) => {
                        draft.push_str(&format!("\n[AUDIO: {}]", path.display()));
                    }
                    Err(e) => warn!(message_id = req.message_id, error = %e, "tts failed"),
                }
            }
        }

        let updated = update_inbox_analysis(
            &self.db,
            req.message_id,
            &AnalysisUpdate {
                intent: analysis.intent.clone(),
                urgency: analysis.urgency.as_str().to_string(),
                sentiment: analysis.sentiment.clone(),
                language: analysis.language.clone(),
                dialect: analysis.dialect.clone(),
                summary: analysis.summary.clone(),
                draft_response: draft.clone(),
            },
        )
        .await?;
        if !updated {
            debug!(
                message_id = req.message_id,
                "analysis write skipped: operator already acted on the row"
            );
        }

        self.link_customer(req, &analysis.intent, &analysis.sentiment)
            .await;

        let conversation = match &req.sender_contact {
            Some(contact) => rasil_conversations::recompute(
                &self.db,
                req.license_id,
                contact,
                req.sender_name.as_deref(),
                Some(req.channel.as_str()),
            )
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "conversation recompute after analysis failed");
                None
            }),
            None => None,
        };

        self.limiter.increment(req.license_id).await?;

        Ok(AnalyzeOutcome::Completed {
            auto_reply: req.auto_reply && !draft.trim().is_empty(),
            draft_response: draft,
            conversation,
        })
    }

    async fn load_history(&self, req: &AnalyzeRequest) -> Vec<String> {
        let Some(contact) = &req.sender_contact else {
            return Vec::new();
        };
        let aliases =
            match rasil_conversations::resolve_alias_set(&self.db, req.license_id, contact).await {
                Ok(set) => set,
                Err(e) => {
                    warn!(error = %e, "alias resolution for history failed");
                    return Vec::new();
                }
            };
        rasil_conversations::page::chat_history_lines(
            &self.db,
            req.license_id,
            &aliases,
            HISTORY_LINES,
        )
        .await
        .unwrap_or_default()
    }

    /// CRM projection: upsert the customer, link the message, fold intent
    /// and sentiment into the lead score. Failures never fail the analysis.
    async fn link_customer(&self, req: &AnalyzeRequest, intent: &str, sentiment: &str) {
        let Some(contact) = &req.sender_contact else { return };

        let (phone, email) = if contact.contains('@') {
            (None, Some(contact.as_str()))
        } else {
            (Some(contact.as_str()), None)
        };

        let result = async {
            let customer = customers::get_or_create_customer(
                &self.db,
                req.license_id,
                phone,
                email,
                req.sender_name.as_deref(),
            )
            .await?;
            customers::link_customer_message(&self.db, req.license_id, customer.id, req.message_id)
                .await?;
            customers::increment_customer_messages(&self.db, customer.id).await?;
            customers::update_customer_lead_score(&self.db, customer.id, intent, sentiment).await
        }
        .await;

        if let Err(e) = result {
            warn!(message_id = req.message_id, error = %e, "customer link failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasil_cache::RateCaps;
    use rasil_core::types::{Analysis, NormalizedMessage, Urgency};
    use rasil_store::inbox::{get_inbox_message, save_inbox_message};
    use rasil_store::schema::init_schema;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedAnalyzer {
        calls: AtomicU32,
        rate_limit: bool,
    }

    #[async_trait]
    impl Analyzer for FixedAnalyzer {
        async fn analyze(&self, _input: &AnalyzerInput) -> std::result::Result<Analysis, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.rate_limit {
                return Err(AnalyzerError::RateLimited);
            }
            Ok(Analysis {
                intent: "inquiry".into(),
                urgency: Urgency::Normal,
                sentiment: "positive".into(),
                language: Some("ar".into()),
                dialect: None,
                summary: "سؤال عن المنتج".into(),
                draft_response: "أهلاً! يسعدنا مساعدتك".into(),
            })
        }
    }

    async fn setup(rate_limit: bool, caps: RateCaps) -> (Database, Orchestrator, Arc<FixedAnalyzer>) {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let analyzer = Arc::new(FixedAnalyzer {
            calls: AtomicU32::new(0),
            rate_limit,
        });
        let orch = Orchestrator::new(
            db.clone(),
            reqwest::Client::new(),
            analyzer.clone(),
            Arc::new(RateLimiter::in_memory(caps)),
            Arc::new(Cooldown::new()),
            Arc::new(DedupCache::new()),
            None,
        );
        (db, orch, analyzer)
    }

    fn caps() -> RateCaps {
        RateCaps {
            per_day: 50,
            per_minute: 50,
        }
    }

    async fn seed_message(db: &Database, cmid: &str) -> i64 {
        let msg = NormalizedMessage {
            channel: Channel::Whatsapp,
            channel_message_id: Some(cmid.into()),
            sender_id: Some("966501234567".into()),
            sender_contact: Some("966501234567".into()),
            sender_name: Some("عميل".into()),
            subject: None,
            body: "كم سعر المنتج؟".into(),
            received_at: None,
            attachments: Vec::new(),
            reply_to_platform_id: None,
            is_group: false,
            is_channel: false,
        };
        save_inbox_message(db, 1, &msg).await.unwrap()
    }

    fn request(id: i64, cmid: &str, auto_reply: bool) -> AnalyzeRequest {
        AnalyzeRequest {
            message_id: id,
            license_id: 1,
            channel: Channel::Whatsapp,
            body: "كم سعر المنتج؟".into(),
            sender_contact: Some("966501234567".into()),
            sender_name: Some("عميل".into()),
            channel_message_id: Some(cmid.into()),
            attachments: Vec::new(),
            auto_reply,
        }
    }

    #[tokio::test]
    async fn analysis_persists_and_updates_conversation() {
        let (db, orch, analyzer) = setup(false, caps()).await;
        let id = seed_message(&db, "wamid.1").await;

        match orch.analyze(&request(id, "wamid.1", false)).await.unwrap() {
            AnalyzeOutcome::Completed {
                draft_response,
                conversation,
                auto_reply,
            } => {
                assert!(!auto_reply);
                assert_eq!(draft_response, "أهلاً! يسعدنا مساعدتك");
                let convo = conversation.unwrap();
                assert_eq!(convo.unread_count, 1);
                assert_eq!(convo.message_count, 1);
            }
            other => panic!("expected Completed, got {:?}", other),
        }

        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
        let msg = get_inbox_message(&db, id, 1).await.unwrap().unwrap();
        assert_eq!(msg.status, InboxStatus::Analyzed);
        assert_eq!(msg.intent.as_deref(), Some("inquiry"));
        assert!(msg.ai_draft_response.is_some());
    }

    #[tokio::test]
    async fn duplicate_channel_message_id_skips_the_ai_call() {
        let (db, orch, analyzer) = setup(false, caps()).await;
        let a = seed_message(&db, "wamid.1").await;
        let b = seed_message(&db, "wamid.1-copy").await;

        orch.analyze(&request(a, "wamid.1", false)).await.unwrap();
        // Same channel_message_id arrives again (replayed webhook).
        let outcome = orch.analyze(&request(b, "wamid.1", false)).await.unwrap();
        assert!(matches!(outcome, AnalyzeOutcome::SkippedDuplicate));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1, "exactly one AI call");

        let msg = get_inbox_message(&db, b, 1).await.unwrap().unwrap();
        assert_eq!(msg.status, InboxStatus::Duplicate);
        assert_eq!(msg.ai_summary.as_deref(), Some(DUPLICATE_SUMMARY));
    }

    #[tokio::test]
    async fn per_license_cap_defers_without_calling_provider() {
        let (db, orch, analyzer) = setup(
            false,
            RateCaps {
                per_day: 0,
                per_minute: 10,
            },
        )
        .await;
        let id = seed_message(&db, "wamid.1").await;

        let outcome = orch.analyze(&request(id, "wamid.1", false)).await.unwrap();
        assert!(matches!(outcome, AnalyzeOutcome::RateLimited(_)));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn provider_429_sets_global_cooldown() {
        let (db, orch, _) = setup(true, caps()).await;
        let id = seed_message(&db, "wamid.1").await;

        let err = orch.analyze(&request(id, "wamid.1", false)).await.unwrap_err();
        assert!(matches!(err, BrainError::ProviderRateLimited));
        assert!(orch.cooldown().is_active());

        // Next attempt short-circuits on the cooldown.
        let id2 = seed_message(&db, "wamid.2").await;
        let outcome = orch.analyze(&request(id2, "wamid.2", false)).await.unwrap();
        assert!(matches!(outcome, AnalyzeOutcome::CoolingDown));
    }

    #[tokio::test]
    async fn auto_reply_flag_carries_through_with_nonempty_draft() {
        let (db, orch, _) = setup(false, caps()).await;
        let id = seed_message(&db, "wamid.1").await;

        match orch.analyze(&request(id, "wamid.1", true)).await.unwrap() {
            AnalyzeOutcome::Completed { auto_reply, .. } => assert!(auto_reply),
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn customer_projection_is_updated() {
        let (db, orch, _) = setup(false, caps()).await;
        let id = seed_message(&db, "wamid.1").await;
        orch.analyze(&request(id, "wamid.1", false)).await.unwrap();

        let row = db
            .fetch_one(
                "SELECT lead_score, message_count FROM customers WHERE license_key_id = ? AND phone = ?",
                &[1i64.into(), "966501234567".into()],
            )
            .await
            .unwrap()
            .expect("customer row created");
        assert!(row.i64("lead_score").unwrap() > 0);
        assert_eq!(row.i64("message_count").unwrap(), 1);
    }
}
