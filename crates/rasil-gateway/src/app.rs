//! Central shared state and router assembly, plus the glue impls that bind
//! the adapter seams (transport lookup, MTProto entity cache, WS event sink)
//! to the store and the fan-out registry.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    routing::{delete, get, post},
    Router,
};
use rasil_brain::Orchestrator;
use rasil_cache::{Cooldown, DedupCache};
use rasil_channels::gmail::OAuthApp;
use rasil_channels::telegram_user::EntityCache;
use rasil_channels::{
    GmailTransport, TelegramBotTransport, TelegramUserTransport, Transport, WhatsappTransport,
};
use rasil_core::types::{Channel, EventKind, LicenseId};
use rasil_dispatch::{DispatchError, Dispatcher, TransportProvider};
use rasil_ingest::pipeline::{EventSink, IngestServices};
use rasil_store::{credentials, Database};
use rasil_vault::Vault;
use tracing::warn;

use crate::http;
use crate::sync::SyncResultCache;
use crate::ws::registry::WsRegistry;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub db: Database,
    pub vault: Vault,
    pub registry: Arc<WsRegistry>,
    pub dedup: Arc<DedupCache>,
    pub cooldown: Arc<Cooldown>,
    pub orchestrator: Arc<Orchestrator>,
    pub dispatcher: Arc<Dispatcher>,
    pub ingest: IngestServices,
    /// POST /sync/batch idempotency results, 24 h TTL.
    pub sync_results: SyncResultCache,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(http::health::health_handler))
        .route(
            "/webhook/telegram/{license}",
            post(http::webhooks::telegram_webhook),
        )
        .route(
            "/webhook/whatsapp",
            get(http::webhooks::whatsapp_verify).post(http::webhooks::whatsapp_webhook),
        )
        .route("/inbox", get(http::inbox::list_inbox_handler))
        .route("/inbox/{id}/approve", post(http::inbox::approve_handler))
        .route("/inbox/{id}/analyze", post(http::inbox::reanalyze_handler))
        .route("/inbox/cleanup", post(http::inbox::cleanup_handler))
        .route("/messages/{id}", delete(http::inbox::delete_message_handler))
        .route("/messages/{id}/read", post(http::inbox::mark_read_handler))
        .route("/outbox/{id}/edit", post(http::inbox::edit_outbox_handler))
        .route(
            "/conversations",
            get(http::conversations::list_conversations_handler),
        )
        .route(
            "/conversations/{sender}/messages",
            get(http::conversations::conversation_messages_handler),
        )
        .route(
            "/conversations/{sender}",
            delete(http::conversations::delete_conversation_handler),
        )
        .route("/sync/batch", post(crate::sync::sync_batch_handler))
        .route("/sync/delta", get(crate::sync::sync_delta_handler))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
}

// ── Transport lookup ──────────────────────────────────────────────────────────

/// Builds a fresh adapter per call from the per-license credential records.
pub struct StoreTransportProvider {
    db: Database,
    vault: Vault,
    http: reqwest::Client,
    gmail_oauth: Option<OAuthApp>,
    telegram_api: Option<(i32, String)>,
    media_dir: PathBuf,
}

impl StoreTransportProvider {
    pub fn new(
        db: Database,
        vault: Vault,
        http: reqwest::Client,
        gmail_oauth: Option<OAuthApp>,
        telegram_api: Option<(i32, String)>,
        media_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            vault,
            http,
            gmail_oauth,
            telegram_api,
            media_dir,
        }
    }
}

#[async_trait]
impl TransportProvider for StoreTransportProvider {
    async fn transport_for(
        &self,
        license_id: LicenseId,
        channel: Channel,
    ) -> rasil_dispatch::Result<Arc<dyn Transport>> {
        match channel {
            Channel::Email => {
                let config = credentials::get_email_config(&self.db, &self.vault, license_id)
                    .await?
                    .filter(|c| c.is_active)
                    .ok_or_else(|| DispatchError::NoTransport("email".into()))?;
                Ok(Arc::new(GmailTransport::new(
                    self.http.clone(),
                    config.access_token,
                    config.refresh_token,
                    self.gmail_oauth.clone(),
                    config.email_address,
                    Some(self.media_dir.clone()),
                )))
            }
            Channel::TelegramBot => {
                let config =
                    credentials::get_telegram_bot_config(&self.db, &self.vault, license_id)
                        .await?
                        .filter(|c| c.is_active)
                        .ok_or_else(|| DispatchError::NoTransport("telegram_bot".into()))?;
                Ok(Arc::new(TelegramBotTransport::new(
                    self.http.clone(),
                    config.bot_token,
                    config.bot_username,
                )))
            }
            Channel::Telegram => {
                let (api_id, api_hash) = self
                    .telegram_api
                    .clone()
                    .ok_or_else(|| DispatchError::NoTransport("telegram (no api creds)".into()))?;
                let session = credentials::get_telegram_session(&self.db, &self.vault, license_id)
                    .await?
                    .ok_or_else(|| DispatchError::NoTransport("telegram".into()))?;
                let entities: Arc<dyn EntityCache> = Arc::new(StoreEntityCache {
                    db: self.db.clone(),
                    license_id,
                });
                Ok(Arc::new(TelegramUserTransport::new(
                    api_id,
                    api_hash,
                    session.session_blob,
                    Some(entities),
                )))
            }
            Channel::Whatsapp => {
                let config = credentials::get_whatsapp_config(&self.db, &self.vault, license_id)
                    .await?
                    .filter(|c| c.is_active)
                    .ok_or_else(|| DispatchError::NoTransport("whatsapp".into()))?;
                Ok(Arc::new(WhatsappTransport::new(
                    self.http.clone(),
                    config.phone_number_id,
                    config.access_token,
                    config.verify_token,
                    config.webhook_secret,
                )))
            }
        }
    }
}

// ── MTProto entity cache over the store ───────────────────────────────────────

struct StoreEntityCache {
    db: Database,
    license_id: LicenseId,
}

#[async_trait]
impl EntityCache for StoreEntityCache {
    async fn get_hash(&self, entity_id: &str) -> Option<(String, String)> {
        credentials::get_telegram_entity(&self.db, self.license_id, entity_id)
            .await
            .ok()
            .flatten()
    }

    async fn put_hash(
        &self,
        entity_id: &str,
        access_hash: &str,
        entity_type: &str,
        username: Option<&str>,
    ) {
        if let Err(e) = credentials::save_telegram_entity(
            &self.db,
            self.license_id,
            entity_id,
            access_hash,
            entity_type,
            username,
        )
        .await
        {
            warn!(entity_id, error = %e, "entity hash persist failed");
        }
    }

    async fn alias_contact(&self, sender_id: &str) -> Option<String> {
        let row = self
            .db
            .fetch_one(
                "SELECT sender_contact FROM inbox_messages
                 WHERE license_key_id = ? AND sender_id = ?
                   AND sender_contact != sender_id AND sender_contact != ''
                 LIMIT 1",
                &[self.license_id.into(), sender_id.into()],
            )
            .await
            .ok()??;
        row.opt_text("sender_contact").ok()?
    }
}

// ── WS event sink ─────────────────────────────────────────────────────────────

/// Bridges pipeline events into the WS registry; failures are swallowed —
/// broadcasts never affect business operations.
pub struct WsSink {
    registry: Arc<WsRegistry>,
}

impl WsSink {
    pub fn new(registry: Arc<WsRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventSink for WsSink {
    async fn emit(&self, license_id: LicenseId, kind: EventKind, data: serde_json::Value) {
        self.registry.broadcast(license_id, kind, data).await;
    }
}
