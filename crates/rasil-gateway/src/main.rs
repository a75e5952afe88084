use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rasil_brain::{Analyzer, AnalyzerError, AnalyzerInput, HttpAnalyzer, Orchestrator};
use rasil_cache::{Cooldown, DedupCache, EventBus, RateCaps, RateLimiter};
use rasil_channels::gmail::OAuthApp;
use rasil_channels::telegram_listener::{ListenerEvent, TelegramListener};
use rasil_core::config::{RasilConfig, HTTP_TIMEOUT_SECS};
use rasil_core::types::Analysis;
use rasil_dispatch::Dispatcher;
use rasil_ingest::pipeline::IngestServices;
use rasil_ingest::{CoreTaskHandler, Poller};
use rasil_queue::TaskWorker;
use rasil_store::{credentials, schema, Database};
use rasil_vault::Vault;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod app;
mod http;
mod sync;
mod ws;

use app::{AppState, StoreTransportProvider, WsSink};
use ws::registry::WsRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rasil_gateway=info,rasil_ingest=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("RASIL_CONFIG").ok();
    let config = RasilConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({}), using defaults", e);
        RasilConfig::default()
    });

    // ── Persistence ─────────────────────────────────────────────────────────
    let db = Database::connect(&config.database).await?;
    schema::init_schema(&db).await?;

    let vault = match &config.vault.encryption_key {
        Some(secret) => Vault::from_secret(secret)?,
        None => Vault::ephemeral(),
    };

    // ── Caches, rate limits, pub/sub ────────────────────────────────────────
    let caps = RateCaps {
        per_day: config.limits.max_messages_per_user_day,
        per_minute: config.limits.max_messages_per_user_minute,
    };
    let (limiter, bus) = match &config.cache.redis_url {
        Some(url) => {
            info!("redis configured: distributed rate limits and ws pub/sub");
            (
                RateLimiter::redis(url, caps).await?,
                EventBus::redis(url).await?,
            )
        }
        None => (RateLimiter::in_memory(caps), EventBus::local()),
    };
    let limiter = Arc::new(limiter);
    let cooldown = Arc::new(Cooldown::new());
    let dedup = Arc::new(DedupCache::new());

    let registry = Arc::new(WsRegistry::new(bus));
    let sink = Arc::new(WsSink::new(registry.clone()));

    // ── Transports ──────────────────────────────────────────────────────────
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()?;

    let gmail_oauth = match (
        std::env::var("GOOGLE_CLIENT_ID").ok(),
        std::env::var("GOOGLE_CLIENT_SECRET").ok(),
    ) {
        (Some(client_id), Some(client_secret)) => Some(OAuthApp {
            client_id,
            client_secret,
        }),
        _ => None,
    };
    let telegram_api = config
        .telegram
        .api_id
        .zip(config.telegram.api_hash.clone());

    let media_dir = PathBuf::from(&config.storage.upload_dir);
    tokio::fs::create_dir_all(&media_dir).await.ok();

    let transports = Arc::new(StoreTransportProvider::new(
        db.clone(),
        vault.clone(),
        http_client.clone(),
        gmail_oauth,
        telegram_api.clone(),
        media_dir,
    ));

    // ── AI orchestration ────────────────────────────────────────────────────
    let analyzer: Arc<dyn Analyzer> = match &config.ai.openai_api_key {
        Some(key) => Arc::new(HttpAnalyzer::openai(
            http_client.clone(),
            key.clone(),
            config.ai.openai_model.clone(),
        )),
        None => match &config.ai.google_api_key {
            Some(key) => Arc::new(HttpAnalyzer::new(
                http_client.clone(),
                "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
                key.clone(),
                config
                    .ai
                    .google_model
                    .clone()
                    .unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            )),
            None => {
                warn!("no analyzer API key configured; analysis is disabled");
                Arc::new(DisabledAnalyzer)
            }
        },
    };

    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        http_client.clone(),
        analyzer,
        limiter.clone(),
        cooldown.clone(),
        dedup.clone(),
        None,
    ));
    let dispatcher = Arc::new(Dispatcher::new(db.clone(), transports.clone()));

    let ingest = IngestServices {
        db: db.clone(),
        vault: vault.clone(),
        dedup: dedup.clone(),
        cooldown: cooldown.clone(),
        transports: transports.clone(),
        sink: sink.clone(),
        limits: config.limits.clone(),
    };

    // ── Background services ─────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Startup repair: promote inbox rows a later event already handled.
    if let Err(e) = rasil_ingest::workers::repair_stale_statuses(&ingest).await {
        error!(error = %e, "stale-status repair at startup failed");
    }

    let worker = TaskWorker::new(
        db.clone(),
        Arc::new(CoreTaskHandler::new(
            ingest.clone(),
            orchestrator.clone(),
            dispatcher.clone(),
        )),
    );
    tokio::spawn(worker.run(shutdown_rx.clone()));

    tokio::spawn(Poller::new(ingest.clone()).run(shutdown_rx.clone()));
    tokio::spawn(rasil_ingest::workers::run_expiry_reminder(
        ingest.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(rasil_ingest::workers::run_token_cleanup(
        ingest.clone(),
        shutdown_rx.clone(),
    ));

    if let Some((api_id, api_hash)) = telegram_api {
        spawn_telegram_listener(
            api_id,
            api_hash,
            db.clone(),
            vault.clone(),
            ingest.clone(),
            shutdown_rx.clone(),
        );
    }

    // ── HTTP ────────────────────────────────────────────────────────────────
    let state = Arc::new(AppState {
        db,
        vault,
        registry,
        dedup,
        cooldown,
        orchestrator,
        dispatcher,
        ingest,
        sync_results: DashMap::new(),
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    info!("rasil gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}

/// The MTProto listener holds persistent per-license connections; its PID
/// lock keeps a second worker from opening the same sessions. Its events
/// feed the regular ingest pipeline.
fn spawn_telegram_listener(
    api_id: i32,
    api_hash: String,
    db: Database,
    vault: Vault,
    ingest: IngestServices,
    mut shutdown: watch::Receiver<bool>,
) {
    let lock_path = std::env::temp_dir().join("rasil-telegram-listener.pid");
    let (mut listener, mut events) = TelegramListener::new(api_id, api_hash, lock_path);
    if !listener.acquire_lock() {
        return;
    }

    // Session reconciler: keep a listener per active session.
    tokio::spawn(async move {
        let mut sync_tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = sync_tick.tick() => {
                    match credentials::all_active_telegram_sessions(&db, &vault).await {
                        Ok(sessions) => listener.sync_sessions(
                            sessions
                                .into_iter()
                                .map(|s| (s.license_id, s.session_blob))
                                .collect(),
                        ),
                        Err(e) => error!(error = %e, "listener session sync failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        listener.shutdown();
                        break;
                    }
                }
            }
        }
    });

    // Event consumer: live messages run through the same pipeline webhooks
    // use; invalid sessions get deactivated.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ListenerEvent::Message { license_id, event } => {
                    let auto_reply = credentials::get_telegram_session(
                        &ingest.db,
                        &ingest.vault,
                        license_id,
                    )
                    .await
                    .ok()
                    .flatten()
                    .map(|s| s.auto_reply_enabled)
                    .unwrap_or(false);

                    if let Err(e) =
                        rasil_ingest::ingest_batch(&ingest, license_id, vec![event], auto_reply)
                            .await
                    {
                        error!(license_id, error = %e, "listener event ingest failed");
                    }
                }
                ListenerEvent::SessionInvalid { license_id } => {
                    warn!(license_id, "listener reported invalid session, deactivating");
                    if let Err(e) =
                        credentials::deactivate_telegram_session(&ingest.db, license_id).await
                    {
                        error!(license_id, error = %e, "session deactivation failed");
                    }
                }
            }
        }
    });
}

/// Stands in when no provider key is configured: every task fails softly
/// and the placeholder-retry loop keeps the rows visible for later.
struct DisabledAnalyzer;

#[async_trait]
impl Analyzer for DisabledAnalyzer {
    async fn analyze(&self, _input: &AnalyzerInput) -> Result<Analysis, AnalyzerError> {
        Err(AnalyzerError::Provider(
            "no analyzer provider configured".into(),
        ))
    }
}
