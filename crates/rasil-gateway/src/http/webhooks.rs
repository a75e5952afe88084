//! Webhook intake. Telegram and WhatsApp handlers persist through the same
//! pipeline the poller uses; each returns its platform's expected 200 body
//! regardless of downstream success once parsing is done.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use rasil_core::types::LicenseId;
use rasil_ingest::ingest_batch;
use rasil_store::credentials;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppState;

/// POST /webhook/telegram/{license}: Telegram's update JSON. Always
/// `{"ok": true}` so Telegram never re-delivers forever.
pub async fn telegram_webhook(
    State(state): State<Arc<AppState>>,
    Path(license_id): Path<LicenseId>,
    body: Bytes,
) -> Json<Value> {
    let config =
        match credentials::get_telegram_bot_config(&state.db, &state.vault, license_id).await {
            Ok(Some(config)) if config.is_active => config,
            Ok(_) => {
                warn!(license_id, "telegram webhook for license without active bot");
                return Json(json!({"ok": true}));
            }
            Err(e) => {
                warn!(license_id, error = %e, "telegram webhook config lookup failed");
                return Json(json!({"ok": true}));
            }
        };

    let transport = rasil_channels::TelegramBotTransport::new(
        reqwest::Client::new(),
        config.bot_token,
        config.bot_username,
    );

    let mut events = match rasil_channels::Transport::parse_webhook(&transport, &body) {
        Ok(events) => events,
        Err(e) => {
            warn!(license_id, error = %e, "telegram webhook parse failed");
            return Json(json!({"ok": true}));
        }
    };

    // Small media is pulled inline before the pipeline persists the row.
    for event in events.iter_mut() {
        if let rasil_channels::WebhookEvent::Inbound(msg) = event {
            transport.hydrate_attachments(&mut msg.attachments).await;
        }
    }

    let auto_reply = config.auto_reply_enabled;
    let svcs = state.ingest.clone();
    tokio::spawn(async move {
        if let Err(e) = ingest_batch(&svcs, license_id, events, auto_reply).await {
            warn!(license_id, error = %e, "telegram webhook ingest failed");
        }
    });

    Json(json!({"ok": true}))
}

#[derive(serde::Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// GET /webhook/whatsapp: Meta's subscription handshake. Echo the
/// challenge when the token matches any license's stored token, else 403.
pub async fn whatsapp_verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VerifyParams>,
) -> Result<String, StatusCode> {
    let (Some(mode), Some(token), Some(challenge)) =
        (params.mode, params.verify_token, params.challenge)
    else {
        return Err(StatusCode::FORBIDDEN);
    };
    if mode != "subscribe" {
        return Err(StatusCode::FORBIDDEN);
    }

    match credentials::find_whatsapp_license_by_verify_token(&state.db, &token).await {
        Ok(Some(license_id)) => {
            info!(license_id, "whatsapp webhook verified");
            Ok(challenge)
        }
        _ => Err(StatusCode::FORBIDDEN),
    }
}

/// POST /webhook/whatsapp: Meta's change payload. The phone_number_id in
/// the metadata routes it to a license; the signature is HMAC-SHA256 of the
/// raw body. Always `{"status":"ok"}`.
pub async fn whatsapp_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let ok = Json(json!({"status": "ok"}));

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        warn!("whatsapp webhook with unparseable body");
        return ok;
    };
    let Some(phone_number_id) = payload
        .pointer("/entry/0/changes/0/value/metadata/phone_number_id")
        .and_then(Value::as_str)
    else {
        return ok;
    };

    let license_id = match credentials::find_whatsapp_license_by_phone_number_id(
        &state.db,
        phone_number_id,
    )
    .await
    {
        Ok(Some(id)) => id,
        _ => {
            warn!(phone_number_id, "whatsapp webhook for unknown phone_number_id");
            return ok;
        }
    };

    let config = match credentials::get_whatsapp_config(&state.db, &state.vault, license_id).await
    {
        Ok(Some(config)) => config,
        _ => return ok,
    };
    let auto_reply = config.auto_reply_enabled;
    let transport = rasil_channels::WhatsappTransport::new(
        reqwest::Client::new(),
        config.phone_number_id,
        config.access_token,
        config.verify_token,
        config.webhook_secret,
    );

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !transport.verify_signature(&body, signature) {
        warn!(license_id, "whatsapp webhook signature mismatch, dropping");
        return ok;
    }

    let events = rasil_channels::whatsapp::parse_change_payload(&payload);
    let svcs = state.ingest.clone();
    tokio::spawn(async move {
        if let Err(e) = ingest_batch(&svcs, license_id, events, auto_reply).await {
            warn!(license_id, error = %e, "whatsapp webhook ingest failed");
        }
    });

    ok
}
