//! Telegram user-account adapter over MTProto (grammers). Session blobs are
//! provisioned externally and stored base64-encoded in the credential
//! record; each call builds a client from the blob.
//!
//! Entity resolution for sends walks a four-step fallback: direct packed id,
//! stored access-hash, DB alias, then a full dialog scan that persists any
//! hash it finds.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use grammers_client::grammers_tl_types as tl;
use grammers_client::types::{Chat, Dialog, Media, Message};
use grammers_client::{Client, Config, InitParams, InputMessage};
use grammers_session::{PackedChat, PackedType, Session};
use rasil_core::types::{Attachment, AttachmentKind, Channel, DeliveryStatus, NormalizedMessage};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::transport::{
    FetchOptions, OutboundEcho, OutboundMedia, SendReceipt, Transport, WebhookEvent,
};

/// Dialogs examined per fetch; stale conversations beyond this are caught by
/// the next cycle.
const DIALOG_SCAN_LIMIT: usize = 30;

/// Persistence hooks the adapter needs from the host: the MTProto
/// access-hash cache and the inbox alias lookup. Implemented over the store
/// by the gateway wiring.
#[async_trait]
pub trait EntityCache: Send + Sync {
    async fn get_hash(&self, entity_id: &str) -> Option<(String, String)>;
    async fn put_hash(
        &self,
        entity_id: &str,
        access_hash: &str,
        entity_type: &str,
        username: Option<&str>,
    );
    /// A non-numeric contact string previously seen for this sender id.
    async fn alias_contact(&self, sender_id: &str) -> Option<String>;
}

pub struct TelegramUserTransport {
    api_id: i32,
    api_hash: String,
    session_blob: String,
    entities: Option<Arc<dyn EntityCache>>,
}

impl TelegramUserTransport {
    pub fn new(
        api_id: i32,
        api_hash: String,
        session_blob: String,
        entities: Option<Arc<dyn EntityCache>>,
    ) -> Self {
        Self {
            api_id,
            api_hash,
            session_blob,
            entities,
        }
    }

    pub async fn connect(&self) -> Result<Client, TransportError> {
        connect_with_session(self.api_id, &self.api_hash, &self.session_blob).await
    }

    async fn resolve_chat(&self, client: &Client, recipient: &str) -> Result<Chat, TransportError> {
        let clean = recipient.trim().trim_start_matches("tg:");
        let numeric: Option<i64> = clean.parse().ok();

        // 1. Stored access-hash lets us build the peer without any lookup.
        if let (Some(id), Some(entities)) = (numeric, &self.entities) {
            if let Some((hash, entity_type)) = entities.get_hash(clean).await {
                if let Ok(hash) = hash.parse::<i64>() {
                    let ty = match entity_type.as_str() {
                        "channel" => PackedType::Broadcast,
                        "group" => PackedType::Megagroup,
                        _ => PackedType::User,
                    };
                    let packed = PackedChat {
                        ty,
                        id,
                        access_hash: Some(hash),
                    };
                    if let Ok(chat) = client.unpack_chat(packed).await {
                        debug!(recipient, "resolved via stored access hash");
                        return Ok(chat);
                    }
                }
            }
        }

        // 2. Usernames resolve directly.
        if numeric.is_none() {
            if let Ok(Some(chat)) = client.resolve_username(clean.trim_start_matches('@')).await {
                return Ok(chat);
            }
        }

        // 3. A stored alias (username/phone) for this numeric id.
        if let (Some(_), Some(entities)) = (numeric, &self.entities) {
            if let Some(alias) = entities.alias_contact(clean).await {
                let alias_clean = alias.trim_start_matches('@');
                if alias_clean.parse::<i64>().is_err() {
                    if let Ok(Some(chat)) = client.resolve_username(alias_clean).await {
                        return Ok(chat);
                    }
                }
            }
        }

        // 4. Dialog scan; persist any access hash we learn on the way.
        let mut dialogs = client.iter_dialogs();
        while let Some(dialog) = dialogs
            .next()
            .await
            .map_err(|e| TransportError::network(e.to_string()))?
        {
            let chat = dialog.chat().clone();
            let matches = match numeric {
                Some(id) => chat.id() == id || chat.id().abs() == id.abs(),
                None => chat.name() == clean || chat.username() == Some(clean),
            };
            if matches {
                self.remember_chat(&chat).await;
                info!(recipient, chat_id = chat.id(), "resolved via dialog scan");
                return Ok(chat);
            }
        }

        Err(TransportError::api(format!(
            "cannot resolve telegram entity: {recipient}"
        )))
    }

    async fn remember_chat(&self, chat: &Chat) {
        let Some(entities) = &self.entities else { return };
        let packed = chat.pack();
        if let Some(hash) = packed.access_hash {
            let entity_type = match packed.ty {
                PackedType::Broadcast | PackedType::Gigagroup => "channel",
                PackedType::Megagroup | PackedType::Chat => "group",
                PackedType::User | PackedType::Bot => "user",
            };
            entities
                .put_hash(
                    &chat.id().to_string(),
                    &hash.to_string(),
                    entity_type,
                    chat.username(),
                )
                .await;
        }
    }
}

pub async fn connect_with_session(
    api_id: i32,
    api_hash: &str,
    session_blob: &str,
) -> Result<Client, TransportError> {
    let bytes = STANDARD
        .decode(session_blob)
        .map_err(|e| TransportError::auth(format!("session blob is not base64: {e}")))?;
    let session =
        Session::load(&bytes).map_err(|e| TransportError::auth(format!("bad session: {e}")))?;

    let client = Client::connect(Config {
        session,
        api_id,
        api_hash: api_hash.to_string(),
        params: InitParams::default(),
    })
    .await
    .map_err(|e| TransportError::network(format!("mtproto connect: {e}")))?;

    let authorized = client
        .is_authorized()
        .await
        .map_err(|e| TransportError::network(e.to_string()))?;
    if !authorized {
        return Err(TransportError::auth("telegram session is not authorized"));
    }
    Ok(client)
}

/// `{chat_id}:{message_id}` — MTProto message ids are only unique per chat,
/// so receipts need both halves.
pub fn platform_id(chat_id: i64, message_id: i32) -> String {
    format!("{}:{}", chat_id, message_id)
}

pub fn split_platform_id(platform_id: &str) -> Option<(i64, i32)> {
    let (chat, msg) = platform_id.split_once(':')?;
    Some((chat.parse().ok()?, msg.parse().ok()?))
}

fn is_bot_peer(chat: &Chat) -> bool {
    match chat {
        Chat::User(user) => {
            user.is_bot()
                || user
                    .username()
                    .map(|u| u.to_lowercase().ends_with("bot"))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

fn sender_contact_for(chat: &Chat) -> String {
    match chat {
        Chat::User(user) => {
            if let Some(phone) = user.phone() {
                format!("+{}", phone.trim_start_matches('+'))
            } else if let Some(username) = user.username() {
                username.to_string()
            } else {
                format!("tg:{}", user.id())
            }
        }
        other => other
            .username()
            .map(String::from)
            .unwrap_or_else(|| format!("tg:{}", other.id())),
    }
}

fn attachment_for(media: &Media) -> Option<Attachment> {
    match media {
        Media::Photo(_) => Some(Attachment::new(AttachmentKind::Image, "image/jpeg")),
        Media::Document(_) => Some(Attachment::new(
            AttachmentKind::Document,
            "application/octet-stream",
        )),
        _ => None,
    }
}

fn body_for(message: &Message) -> String {
    let text = message.text();
    if !text.is_empty() {
        return text.to_string();
    }
    match message.media() {
        Some(Media::Photo(_)) => "[صورة]".to_string(),
        Some(Media::Document(_)) => "[ملف مرفق]".to_string(),
        Some(_) => "[مرفق]".to_string(),
        None => String::new(),
    }
}

/// Convert one MTProto message into the pipeline event shape. Shared by the
/// polling path and the live listener.
pub fn message_to_event(message: &Message) -> Option<WebhookEvent> {
    let chat = message.chat();

    if message.outgoing() {
        return Some(WebhookEvent::OutboundEcho(OutboundEcho {
            channel: Channel::Telegram,
            recipient_contact: Some(sender_contact_for(&chat)),
            recipient_id: Some(chat.id().to_string()),
            body: body_for(message),
            platform_message_id: Some(platform_id(chat.id(), message.id())),
            sent_at: Some(message.date().naive_utc()),
        }));
    }

    let sender = message.sender().unwrap_or_else(|| chat.clone());
    if is_bot_peer(&sender) {
        return None;
    }

    let name = sender.name();
    let sender_name = if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    };

    let attachments = message.media().as_ref().and_then(attachment_for);

    Some(WebhookEvent::Inbound(NormalizedMessage {
        channel: Channel::Telegram,
        channel_message_id: Some(platform_id(chat.id(), message.id())),
        sender_id: Some(sender.id().to_string()),
        sender_contact: Some(sender_contact_for(&sender)),
        sender_name,
        subject: None,
        body: body_for(message),
        received_at: Some(message.date().naive_utc()),
        attachments: attachments.into_iter().collect(),
        reply_to_platform_id: message
            .reply_to_message_id()
            .map(|id| platform_id(chat.id(), id)),
        is_group: matches!(chat, Chat::Group(_)),
        is_channel: matches!(chat, Chat::Channel(_)),
    }))
}

fn read_outbox_max(dialog: &Dialog) -> Option<i32> {
    match &dialog.raw {
        tl::enums::Dialog::Dialog(d) => Some(d.read_outbox_max_id),
        _ => None,
    }
}

#[async_trait]
impl Transport for TelegramUserTransport {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    async fn fetch_new(&self, opts: &FetchOptions) -> Result<Vec<WebhookEvent>, TransportError> {
        let client = self.connect().await?;
        let cutoff = Utc::now() - Duration::hours(opts.since_hours.max(1));
        let per_dialog = (opts.limit / DIALOG_SCAN_LIMIT).max(5);

        let mut events = Vec::new();
        let mut scanned = 0usize;
        let mut dialogs = client.iter_dialogs();

        while let Some(dialog) = dialogs
            .next()
            .await
            .map_err(|e| TransportError::network(e.to_string()))?
        {
            scanned += 1;
            if scanned > DIALOG_SCAN_LIMIT || events.len() >= opts.limit {
                break;
            }

            let chat = dialog.chat().clone();
            if is_bot_peer(&chat) {
                continue;
            }
            // Backfill imports unreplied conversations only; a dialog whose
            // last message is ours is already handled.
            if opts.unreplied_only {
                if let Some(last) = &dialog.last_message {
                    if last.outgoing() {
                        continue;
                    }
                }
            }
            self.remember_chat(&chat).await;

            let mut messages = client.iter_messages(&chat).limit(per_dialog);
            while let Some(message) = messages
                .next()
                .await
                .map_err(|e| TransportError::network(e.to_string()))?
            {
                if message.date() < cutoff {
                    break;
                }
                let pid = platform_id(chat.id(), message.id());
                if opts.exclude_ids.iter().any(|x| x == &pid) {
                    continue;
                }
                if let Some(event) = message_to_event(&message) {
                    events.push(event);
                }
            }
        }

        debug!(count = events.len(), scanned, "telegram user fetch complete");
        Ok(events)
    }

    async fn send_text(
        &self,
        recipient: &str,
        text: &str,
        _reply_to: Option<&str>,
    ) -> Result<SendReceipt, TransportError> {
        let client = self.connect().await?;
        let chat = self.resolve_chat(&client, recipient).await?;
        let sent = client
            .send_message(&chat, text)
            .await
            .map_err(|e| TransportError::network(format!("send_message: {e}")))?;
        Ok(SendReceipt {
            platform_message_id: Some(platform_id(chat.id(), sent.id())),
        })
    }

    async fn send_media(
        &self,
        recipient: &str,
        media: &OutboundMedia,
    ) -> Result<SendReceipt, TransportError> {
        let client = self.connect().await?;
        let chat = self.resolve_chat(&client, recipient).await?;
        let uploaded = client
            .upload_file(&media.path)
            .await
            .map_err(|e| TransportError::network(format!("upload_file: {e}")))?;
        let sent = client
            .send_message(&chat, InputMessage::text("").document(uploaded))
            .await
            .map_err(|e| TransportError::network(format!("send media: {e}")))?;
        Ok(SendReceipt {
            platform_message_id: Some(platform_id(chat.id(), sent.id())),
        })
    }

    async fn mark_read(
        &self,
        chat: &str,
        _up_to_id: Option<&str>,
    ) -> Result<bool, TransportError> {
        let client = self.connect().await?;
        let chat = self.resolve_chat(&client, chat).await?;
        client
            .mark_as_read(&chat)
            .await
            .map_err(|e| TransportError::network(e.to_string()))?;
        Ok(true)
    }

    /// Read receipts are only recoverable by comparing each chat's
    /// `read_outbox_max_id` against our outstanding message ids.
    async fn poll_receipts(
        &self,
        outstanding: &[String],
    ) -> Result<HashMap<String, DeliveryStatus>, TransportError> {
        if outstanding.is_empty() {
            return Ok(HashMap::new());
        }
        let client = self.connect().await?;

        let mut read_watermarks: HashMap<i64, i32> = HashMap::new();
        let mut dialogs = client.iter_dialogs();
        let mut scanned = 0usize;
        while let Some(dialog) = dialogs
            .next()
            .await
            .map_err(|e| TransportError::network(e.to_string()))?
        {
            scanned += 1;
            if scanned > DIALOG_SCAN_LIMIT * 2 {
                break;
            }
            if let Some(max_id) = read_outbox_max(&dialog) {
                read_watermarks.insert(dialog.chat().id(), max_id);
            }
        }

        let mut statuses = HashMap::new();
        for pid in outstanding {
            let Some((chat_id, message_id)) = split_platform_id(pid) else {
                continue;
            };
            if let Some(&watermark) = read_watermarks.get(&chat_id) {
                if message_id <= watermark {
                    statuses.insert(pid.clone(), DeliveryStatus::Read);
                }
            }
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_id_round_trips() {
        let pid = platform_id(-1001234567890, 42);
        assert_eq!(split_platform_id(&pid), Some((-1001234567890, 42)));
    }

    #[test]
    fn malformed_platform_ids_are_none() {
        assert_eq!(split_platform_id("no-separator"), None);
        assert_eq!(split_platform_id("abc:def"), None);
        assert_eq!(split_platform_id(""), None);
    }
}
