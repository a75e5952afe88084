//! WhatsApp Business Cloud adapter. Webhook-driven: Meta pushes message and
//! status events; media arrives as an id that needs a two-step download
//! (resolve URL, then fetch bytes).

use async_trait::async_trait;
use chrono::DateTime;
use hmac::{Hmac, Mac};
use rasil_core::types::{
    Attachment, AttachmentKind, Channel, DeliveryStatus, NormalizedMessage,
};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::{
    DeliveryStatusEvent, OutboundMedia, SendReceipt, Transport, WebhookEvent,
};

type HmacSha256 = Hmac<Sha256>;

const GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";

pub struct WhatsappTransport {
    http: reqwest::Client,
    phone_number_id: String,
    access_token: String,
    verify_token: Option<String>,
    webhook_secret: Option<String>,
}

impl WhatsappTransport {
    pub fn new(
        http: reqwest::Client,
        phone_number_id: String,
        access_token: String,
        verify_token: Option<String>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            http,
            phone_number_id,
            access_token,
            verify_token,
            webhook_secret,
        }
    }

    /// GET verification handshake: echo the challenge only when mode and
    /// token match.
    pub fn verify_webhook(&self, mode: &str, token: &str, challenge: &str) -> Option<String> {
        if mode == "subscribe" && Some(token) == self.verify_token.as_deref() {
            Some(challenge.to_string())
        } else {
            None
        }
    }

    /// Verify `X-Hub-Signature-256: sha256=<hex>` over the raw body. With no
    /// secret configured, verification is skipped.
    pub fn verify_signature(&self, payload: &[u8], signature_header: &str) -> bool {
        let Some(secret) = &self.webhook_secret else {
            return true;
        };
        let Some(sig_hex) = signature_header.strip_prefix("sha256=") else {
            return false;
        };
        let Ok(expected) = hex::decode(sig_hex) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }

    /// Two-step media download: resolve the CDN URL by id, then fetch bytes
    /// with the same bearer token.
    pub async fn download_media(&self, media_id: &str) -> Result<Vec<u8>, TransportError> {
        let meta: Value = self
            .http
            .get(format!("{GRAPH_BASE}/{media_id}"))
            .bearer_auth(&self.access_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let url = meta
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::api("media lookup returned no url"))?;

        let bytes = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }

    pub async fn upload_media(&self, path: &str, mime: &str) -> Result<String, TransportError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| TransportError::payload(format!("cannot read media file: {e}")))?;
        let filename = std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("media")
            .to_string();

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str(mime)
            .map_err(|e| TransportError::payload(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .part("file", part);

        let resp: Value = self
            .http
            .post(format!("{GRAPH_BASE}/{}/media", self.phone_number_id))
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        resp.get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| TransportError::api("media upload returned no id"))
    }

    async fn post_message(&self, payload: &Value) -> Result<SendReceipt, TransportError> {
        let resp: Value = self
            .http
            .post(format!("{GRAPH_BASE}/{}/messages", self.phone_number_id))
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let id = resp
            .get("messages")
            .and_then(|m| m.get(0))
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
            .map(String::from);
        Ok(SendReceipt {
            platform_message_id: id,
        })
    }
}

#[async_trait]
impl Transport for WhatsappTransport {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    async fn send_text(
        &self,
        recipient: &str,
        text: &str,
        _reply_to: Option<&str>,
    ) -> Result<SendReceipt, TransportError> {
        self.post_message(&serde_json::json!({
            "messaging_product": "whatsapp",
            "to": recipient,
            "type": "text",
            "text": { "body": text },
        }))
        .await
    }

    async fn send_media(
        &self,
        recipient: &str,
        media: &OutboundMedia,
    ) -> Result<SendReceipt, TransportError> {
        let media_id = self.upload_media(&media.path, &media.mime).await?;
        let kind = match media.kind {
            AttachmentKind::Audio | AttachmentKind::Voice => "audio",
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::Document => "document",
        };
        self.post_message(&serde_json::json!({
            "messaging_product": "whatsapp",
            "to": recipient,
            "type": kind,
            kind: { "id": media_id },
        }))
        .await
    }

    async fn mark_read(
        &self,
        _chat: &str,
        up_to_id: Option<&str>,
    ) -> Result<bool, TransportError> {
        let Some(message_id) = up_to_id else {
            return Ok(false);
        };
        self.http
            .post(format!("{GRAPH_BASE}/{}/messages", self.phone_number_id))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({
                "messaging_product": "whatsapp",
                "status": "read",
                "message_id": message_id,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(true)
    }

    fn parse_webhook(&self, payload: &[u8]) -> Result<Vec<WebhookEvent>, TransportError> {
        let root: Value = serde_json::from_slice(payload)
            .map_err(|e| TransportError::payload(format!("invalid webhook JSON: {e}")))?;
        Ok(parse_change_payload(&root))
    }
}

/// Parse Meta's change payload into inbound and status events. Unknown
/// message types degrade to a bracketed placeholder body rather than being
/// dropped.
pub fn parse_change_payload(root: &Value) -> Vec<WebhookEvent> {
    let mut events = Vec::new();

    let entries = root.get("entry").and_then(Value::as_array);
    for entry in entries.into_iter().flatten() {
        let changes = entry.get("changes").and_then(Value::as_array);
        for change in changes.into_iter().flatten() {
            let value = &change["value"];

            let contact = value
                .get("contacts")
                .and_then(Value::as_array)
                .and_then(|c| c.first());
            let sender_name = contact
                .and_then(|c| c.pointer("/profile/name"))
                .and_then(Value::as_str);
            let wa_id = contact.and_then(|c| c.get("wa_id")).and_then(Value::as_str);

            for msg in value
                .get("messages")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(event) = parse_message(msg, sender_name, wa_id) {
                    events.push(event);
                }
            }

            for status in value
                .get("statuses")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(event) = parse_status(status) {
                    events.push(event);
                }
            }
        }
    }

    debug!(count = events.len(), "parsed whatsapp webhook events");
    events
}

fn parse_message(msg: &Value, sender_name: Option<&str>, wa_id: Option<&str>) -> Option<WebhookEvent> {
    let from = msg.get("from").and_then(Value::as_str)?;
    let id = msg.get("id").and_then(Value::as_str)?;
    let kind = msg.get("type").and_then(Value::as_str).unwrap_or("unknown");

    let mut attachments = Vec::new();
    let body = match kind {
        "text" => msg.pointer("/text/body").and_then(Value::as_str).unwrap_or("").to_string(),
        "image" => {
            push_media(&mut attachments, msg, "image", AttachmentKind::Image, "image/jpeg");
            msg.pointer("/image/caption")
                .and_then(Value::as_str)
                .unwrap_or("[صورة]")
                .to_string()
        }
        "audio" => {
            let voice = msg.pointer("/audio/voice").and_then(Value::as_bool).unwrap_or(false);
            let att_kind = if voice { AttachmentKind::Voice } else { AttachmentKind::Audio };
            push_media(&mut attachments, msg, "audio", att_kind, "audio/ogg");
            "[رسالة صوتية]".to_string()
        }
        "video" => {
            push_media(&mut attachments, msg, "video", AttachmentKind::Video, "video/mp4");
            "[فيديو]".to_string()
        }
        "document" => {
            push_media(
                &mut attachments,
                msg,
                "document",
                AttachmentKind::Document,
                "application/octet-stream",
            );
            let name = msg
                .pointer("/document/filename")
                .and_then(Value::as_str)
                .unwrap_or("ملف");
            format!("[مستند: {}]", name)
        }
        "location" => {
            let lat = msg.pointer("/location/latitude").and_then(Value::as_f64);
            let lon = msg.pointer("/location/longitude").and_then(Value::as_f64);
            match (lat, lon) {
                (Some(lat), Some(lon)) => format!("[موقع: {}, {}]", lat, lon),
                _ => "[موقع]".to_string(),
            }
        }
        "contacts" => "[جهة اتصال]".to_string(),
        "button" => msg
            .pointer("/button/text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        "interactive" => msg
            .pointer("/interactive/button_reply/title")
            .or_else(|| msg.pointer("/interactive/list_reply/title"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        other => format!("[{}]", other),
    };

    let received_at = msg
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|t| t.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.naive_utc());

    Some(WebhookEvent::Inbound(NormalizedMessage {
        channel: Channel::Whatsapp,
        channel_message_id: Some(id.to_string()),
        sender_id: Some(from.to_string()),
        sender_contact: Some(wa_id.unwrap_or(from).to_string()),
        sender_name: sender_name.map(String::from),
        subject: None,
        body,
        received_at,
        attachments,
        reply_to_platform_id: msg
            .pointer("/context/id")
            .and_then(Value::as_str)
            .map(String::from),
        is_group: false,
        is_channel: false,
    }))
}

fn push_media(
    attachments: &mut Vec<Attachment>,
    msg: &Value,
    field: &str,
    kind: AttachmentKind,
    default_mime: &str,
) {
    let media_id = msg
        .pointer(&format!("/{field}/id"))
        .and_then(Value::as_str)
        .map(String::from);
    let mime = msg
        .pointer(&format!("/{field}/mime_type"))
        .and_then(Value::as_str)
        .unwrap_or(default_mime);
    let mut att = Attachment::new(kind, mime);
    att.platform_media_id = media_id;
    attachments.push(att);
}

fn parse_status(status: &Value) -> Option<WebhookEvent> {
    let id = status.get("id").and_then(Value::as_str)?;
    let raw = status.get("status").and_then(Value::as_str)?;
    let parsed: DeliveryStatus = match raw.parse() {
        Ok(s) => s,
        Err(_) => {
            warn!(status = raw, "unknown whatsapp delivery status, dropping");
            return None;
        }
    };
    let timestamp = status
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|t| t.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.naive_utc());

    Some(WebhookEvent::Status(DeliveryStatusEvent {
        platform_message_id: id.to_string(),
        status: parsed,
        recipient: status
            .get("recipient_id")
            .and_then(Value::as_str)
            .map(String::from),
        timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(secret: Option<&str>) -> WhatsappTransport {
        WhatsappTransport::new(
            reqwest::Client::new(),
            "10293847".into(),
            "EAAG-token".into(),
            Some("my-verify-token".into()),
            secret.map(String::from),
        )
    }

    fn text_webhook() -> Value {
        serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "contacts": [{"profile": {"name": "عميل"}, "wa_id": "966501234567"}],
                        "messages": [{
                            "from": "966501234567",
                            "id": "wamid.X",
                            "timestamp": "1717245000",
                            "type": "text",
                            "text": {"body": "مرحباً"}
                        }]
                    }
                }]
            }]
        })
    }

    #[test]
    fn verification_echoes_challenge_only_on_match() {
        let t = transport(None);
        assert_eq!(
            t.verify_webhook("subscribe", "my-verify-token", "1158201444"),
            Some("1158201444".to_string())
        );
        assert_eq!(t.verify_webhook("subscribe", "wrong", "x"), None);
        assert_eq!(t.verify_webhook("unsubscribe", "my-verify-token", "x"), None);
    }

    #[test]
    fn signature_verifies_hmac_sha256_of_raw_body() {
        let t = transport(Some("app-secret"));
        let body = b"{\"entry\":[]}";
        let mut mac = HmacSha256::new_from_slice(b"app-secret").unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(t.verify_signature(body, &sig));
        assert!(!t.verify_signature(b"tampered", &sig));
        assert!(!t.verify_signature(body, "sha256=deadbeef"));
    }

    #[test]
    fn missing_secret_skips_signature_check() {
        let t = transport(None);
        assert!(t.verify_signature(b"anything", "sha256=whatever"));
    }

    #[test]
    fn text_message_parses_to_inbound() {
        let events = parse_change_payload(&text_webhook());
        assert_eq!(events.len(), 1);
        match &events[0] {
            WebhookEvent::Inbound(msg) => {
                assert_eq!(msg.channel, Channel::Whatsapp);
                assert_eq!(msg.channel_message_id.as_deref(), Some("wamid.X"));
                assert_eq!(msg.sender_contact.as_deref(), Some("966501234567"));
                assert_eq!(msg.body, "مرحباً");
                assert!(msg.received_at.is_some());
            }
            other => panic!("expected inbound, got {:?}", other),
        }
    }

    #[test]
    fn voice_note_parses_with_attachment() {
        let payload = serde_json::json!({
            "entry": [{"changes": [{"value": {
                "messages": [{
                    "from": "966501234567",
                    "id": "wamid.V",
                    "type": "audio",
                    "audio": {"id": "media-1", "mime_type": "audio/ogg; codecs=opus", "voice": true}
                }]
            }}]}]
        });
        let events = parse_change_payload(&payload);
        match &events[0] {
            WebhookEvent::Inbound(msg) => {
                assert_eq!(msg.body, "[رسالة صوتية]");
                assert_eq!(msg.attachments.len(), 1);
                assert_eq!(msg.attachments[0].kind, AttachmentKind::Voice);
                assert_eq!(msg.attachments[0].platform_media_id.as_deref(), Some("media-1"));
            }
            other => panic!("expected inbound, got {:?}", other),
        }
    }

    #[test]
    fn status_events_parse_separately() {
        let payload = serde_json::json!({
            "entry": [{"changes": [{"value": {
                "statuses": [
                    {"id": "wamid.S", "status": "delivered", "recipient_id": "966501234567",
                     "timestamp": "1717245100"},
                    {"id": "wamid.S", "status": "read", "timestamp": "1717245200"}
                ]
            }}]}]
        });
        let events = parse_change_payload(&payload);
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (WebhookEvent::Status(a), WebhookEvent::Status(b)) => {
                assert_eq!(a.status, DeliveryStatus::Delivered);
                assert_eq!(b.status, DeliveryStatus::Read);
            }
            other => panic!("expected two status events, got {:?}", other),
        }
    }

    #[test]
    fn unknown_status_is_dropped_not_crashed() {
        let payload = serde_json::json!({
            "entry": [{"changes": [{"value": {
                "statuses": [{"id": "wamid.S", "status": "warehoused"}]
            }}]}]
        });
        assert!(parse_change_payload(&payload).is_empty());
    }
}
