use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque tenant identifier. Every inbox row, outbox row, conversation and
/// credential record is owned by exactly one license.
pub type LicenseId = i64;

/// Draft text written while an AI analysis is still pending. The retry pass
/// in the scheduler finds un-analyzed messages by matching this sentinel.
pub const ANALYSIS_PLACEHOLDER: &str = "⏳ جاري تحليل الرسالة تلقائياً...";

/// Summary written on the non-last rows of a burst group.
pub const MERGED_SUMMARY: &str = "تم دمج الرسالة مع الرد التالي";

/// Summary written when analysis is skipped because the exact message
/// (same channel_message_id) was already processed.
pub const DUPLICATE_SUMMARY: &str = "تم تخطي التحليل: محتوى مكرر";

/// Body placeholder for media that exceeded the download cap.
pub const OVERSIZED_MEDIA_BODY: &str = "[ملف كبير]";

/// The four inbound/outbound transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    TelegramBot,
    /// Telegram user account over MTProto.
    Telegram,
    Whatsapp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::TelegramBot => "telegram_bot",
            Channel::Telegram => "telegram",
            Channel::Whatsapp => "whatsapp",
        }
    }

    /// Poll-based channels are driven by the scheduler; the rest arrive
    /// through webhooks (or the MTProto listener).
    pub fn is_polled(&self) -> bool {
        matches!(self, Channel::Email | Channel::Telegram)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "telegram_bot" => Ok(Channel::TelegramBot),
            "telegram" => Ok(Channel::Telegram),
            "whatsapp" => Ok(Channel::Whatsapp),
            other => Err(format!("unknown channel: {}", other)),
        }
    }
}

/// Inbox message lifecycle.
///
/// pending → analyzed → {approved | auto_replied | ignored}.
/// `merged` and `duplicate` are terminal; a pending row is invisible to the
/// conversation list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Pending,
    Analyzed,
    Approved,
    AutoReplied,
    Sent,
    Ignored,
    Merged,
    Duplicate,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Pending => "pending",
            InboxStatus::Analyzed => "analyzed",
            InboxStatus::Approved => "approved",
            InboxStatus::AutoReplied => "auto_replied",
            InboxStatus::Sent => "sent",
            InboxStatus::Ignored => "ignored",
            InboxStatus::Merged => "merged",
            InboxStatus::Duplicate => "duplicate",
        }
    }
}

impl std::str::FromStr for InboxStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InboxStatus::Pending),
            "analyzed" => Ok(InboxStatus::Analyzed),
            "approved" => Ok(InboxStatus::Approved),
            "auto_replied" => Ok(InboxStatus::AutoReplied),
            "sent" => Ok(InboxStatus::Sent),
            "ignored" => Ok(InboxStatus::Ignored),
            "merged" => Ok(InboxStatus::Merged),
            "duplicate" => Ok(InboxStatus::Duplicate),
            other => Err(format!("unknown inbox status: {}", other)),
        }
    }
}

impl fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbox lifecycle: pending → approved → sent | failed. Monotone forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Approved,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Approved => "approved",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "approved" => Ok(OutboxStatus::Approved),
            "sent" => Ok(OutboxStatus::Sent),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(format!("unknown outbox status: {}", other)),
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The platform's view of an outbound message, distinct from [`OutboxStatus`].
///
/// Ordered sent < delivered < read; `failed` is terminal in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// Position in the forward progression. `failed` sits outside the chain
    /// and is handled by [`DeliveryStatus::may_transition_to`].
    pub fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
            DeliveryStatus::Failed => 0,
        }
    }

    /// Whether moving from `self` to `next` is a legal (forward) transition.
    /// `failed` always writes; nothing leaves `failed`.
    pub fn may_transition_to(&self, next: DeliveryStatus) -> bool {
        if matches!(self, DeliveryStatus::Failed) {
            return false;
        }
        if matches!(next, DeliveryStatus::Failed) {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status: {}", other)),
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attachment payloads are free-form on every platform; this is the tagged
/// shape they all normalize into. Serialized as JSON in the message rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    Document,
    Voice,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Audio => "audio",
            AttachmentKind::Video => "video",
            AttachmentKind::Document => "document",
            AttachmentKind::Voice => "voice",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_media_id: Option<String>,
}

impl Attachment {
    pub fn new(kind: AttachmentKind, mime: impl Into<String>) -> Self {
        Self {
            kind,
            mime: mime.into(),
            url: None,
            path: None,
            base64: None,
            size: 0,
            platform_media_id: None,
        }
    }
}

/// One inbound message as produced by a transport adapter — identical to an
/// inbox row minus id/status, which persistence assigns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub channel: Channel,
    pub channel_message_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_contact: Option<String>,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    /// UTC, naive. Backends encode it per their timestamp convention.
    pub received_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_platform_id: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_channel: bool,
}

/// Fixed shape returned by the analyzer. The provider wire format behind it
/// is opaque to the rest of the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub intent: String,
    pub urgency: Urgency,
    pub sentiment: String,
    pub language: Option<String>,
    pub dialect: Option<String>,
    pub summary: String,
    pub draft_response: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::High => "high",
            Urgency::Urgent => "urgent",
        }
    }
}

impl std::str::FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Urgency::Low),
            "normal" => Ok(Urgency::Normal),
            "high" => Ok(Urgency::High),
            "urgent" => Ok(Urgency::Urgent),
            other => Err(format!("unknown urgency: {}", other)),
        }
    }
}

/// Event names pushed over the WebSocket fan-out. Best-effort, no replay log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    MessageStatusUpdate,
    ReactionAdded,
    ReactionRemoved,
    MessageEdited,
    MessageDeleted,
    ConversationDeleted,
    TypingIndicator,
    RecordingIndicator,
    PresenceUpdate,
    Notification,
    AnalyticsUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewMessage => "new_message",
            EventKind::MessageStatusUpdate => "message_status_update",
            EventKind::ReactionAdded => "reaction_added",
            EventKind::ReactionRemoved => "reaction_removed",
            EventKind::MessageEdited => "message_edited",
            EventKind::MessageDeleted => "message_deleted",
            EventKind::ConversationDeleted => "conversation_deleted",
            EventKind::TypingIndicator => "typing_indicator",
            EventKind::RecordingIndicator => "recording_indicator",
            EventKind::PresenceUpdate => "presence_update",
            EventKind::Notification => "notification",
            EventKind::AnalyticsUpdate => "analytics_update",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_progression_is_monotone() {
        assert!(DeliveryStatus::Sent.may_transition_to(DeliveryStatus::Delivered));
        assert!(DeliveryStatus::Sent.may_transition_to(DeliveryStatus::Read));
        assert!(DeliveryStatus::Delivered.may_transition_to(DeliveryStatus::Read));
        assert!(!DeliveryStatus::Read.may_transition_to(DeliveryStatus::Delivered));
        assert!(!DeliveryStatus::Read.may_transition_to(DeliveryStatus::Sent));
        assert!(!DeliveryStatus::Delivered.may_transition_to(DeliveryStatus::Sent));
    }

    #[test]
    fn failed_is_terminal_and_always_writable() {
        assert!(DeliveryStatus::Sent.may_transition_to(DeliveryStatus::Failed));
        assert!(DeliveryStatus::Read.may_transition_to(DeliveryStatus::Failed));
        assert!(!DeliveryStatus::Failed.may_transition_to(DeliveryStatus::Sent));
        assert!(!DeliveryStatus::Failed.may_transition_to(DeliveryStatus::Read));
    }

    #[test]
    fn channel_round_trips_through_str() {
        for ch in [
            Channel::Email,
            Channel::TelegramBot,
            Channel::Telegram,
            Channel::Whatsapp,
        ] {
            assert_eq!(ch.as_str().parse::<Channel>().unwrap(), ch);
        }
    }

    #[test]
    fn attachment_json_omits_empty_optionals() {
        let att = Attachment::new(AttachmentKind::Voice, "audio/ogg");
        let json = serde_json::to_string(&att).unwrap();
        assert!(json.contains("\"type\":\"voice\""));
        assert!(!json.contains("base64"));
        assert!(!json.contains("platform_media_id"));
    }
}
