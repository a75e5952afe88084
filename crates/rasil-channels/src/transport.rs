use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rasil_core::types::{AttachmentKind, Channel, DeliveryStatus, NormalizedMessage};

use crate::error::TransportError;

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub since_hours: i64,
    pub limit: usize,
    /// Platform ids already in our inbox; adapters skip them early.
    pub exclude_ids: Vec<String>,
    /// Backfill mode: only return threads whose last message is not ours.
    pub unreplied_only: bool,
}

/// A delivery receipt pushed or polled from the platform.
#[derive(Debug, Clone)]
pub struct DeliveryStatusEvent {
    pub platform_message_id: String,
    pub status: DeliveryStatus,
    pub recipient: Option<String>,
    pub timestamp: Option<NaiveDateTime>,
}

/// A message *we* sent from the linked account, observed on the wire. Synced
/// into the outbox, never the inbox.
#[derive(Debug, Clone)]
pub struct OutboundEcho {
    pub channel: Channel,
    pub recipient_contact: Option<String>,
    pub recipient_id: Option<String>,
    pub body: String,
    pub platform_message_id: Option<String>,
    pub sent_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub enum WebhookEvent {
    Inbound(NormalizedMessage),
    Status(DeliveryStatusEvent),
    OutboundEcho(OutboundEcho),
}

#[derive(Debug, Clone, Default)]
pub struct SendReceipt {
    pub platform_message_id: Option<String>,
}

/// One outbound media part (today: the synthesized voice reply).
#[derive(Debug, Clone)]
pub struct OutboundMedia {
    pub kind: AttachmentKind,
    pub mime: String,
    pub path: String,
    pub filename: Option<String>,
}

/// Common contract implemented by every channel adapter.
///
/// Implementations must be `Send + Sync`; the scheduler and the dispatcher
/// drive them from separate tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> Channel;

    /// Pull new activity since `opts.since_hours`. Only poll-based adapters
    /// implement this; it may yield inbound messages and outbound echoes.
    async fn fetch_new(
        &self,
        _opts: &FetchOptions,
    ) -> Result<Vec<WebhookEvent>, TransportError> {
        Err(TransportError::unsupported("fetch_new"))
    }

    async fn send_text(
        &self,
        recipient: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SendReceipt, TransportError>;

    async fn send_media(
        &self,
        _recipient: &str,
        _media: &OutboundMedia,
    ) -> Result<SendReceipt, TransportError> {
        Err(TransportError::unsupported("send_media"))
    }

    /// Best-effort read marker; returns whether anything was marked.
    async fn mark_read(
        &self,
        _chat: &str,
        _up_to_id: Option<&str>,
    ) -> Result<bool, TransportError> {
        Ok(false)
    }

    /// Parse a webhook body into events. Only push-based adapters implement
    /// this.
    fn parse_webhook(&self, _payload: &[u8]) -> Result<Vec<WebhookEvent>, TransportError> {
        Err(TransportError::unsupported("parse_webhook"))
    }

    /// Poll read receipts for outstanding platform ids. Only adapters
    /// without push receipts implement this.
    async fn poll_receipts(
        &self,
        _outstanding: &[String],
    ) -> Result<HashMap<String, DeliveryStatus>, TransportError> {
        Ok(HashMap::new())
    }

    /// Best-effort emoji reaction on an inbound message; callers swallow
    /// errors.
    async fn react(
        &self,
        _chat: &str,
        _platform_message_id: &str,
        _emoji: &str,
    ) -> Result<(), TransportError> {
        Err(TransportError::unsupported("react"))
    }
}
