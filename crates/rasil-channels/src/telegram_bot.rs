//! Telegram Bot adapter (teloxide). Webhook-driven: Telegram pushes Update
//! JSON; there is no polling path and the Bot API exposes no read receipts.

use async_trait::async_trait;
use rasil_core::types::{Attachment, AttachmentKind, Channel, NormalizedMessage};
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{InputFile, Message, ReplyParameters, Update, UpdateKind};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::{OutboundMedia, SendReceipt, Transport, WebhookEvent};

/// Bot-API media above this is left as a platform id only.
const MAX_INLINE_MEDIA_BYTES: u64 = 5 * 1024 * 1024;

pub struct TelegramBotTransport {
    bot: Bot,
    http: reqwest::Client,
    bot_token: String,
    /// Messages from this username (our own bot) are ignored.
    bot_username: Option<String>,
}

impl TelegramBotTransport {
    pub fn new(http: reqwest::Client, bot_token: String, bot_username: Option<String>) -> Self {
        Self {
            bot: Bot::new(&bot_token),
            http,
            bot_token,
            bot_username: bot_username.map(|u| u.trim_start_matches('@').to_lowercase()),
        }
    }

    fn parse_update(&self, update: Update) -> Option<WebhookEvent> {
        let msg = match update.kind {
            UpdateKind::Message(msg) => msg,
            _ => return None,
        };

        let from = msg.from.as_ref()?;
        if from.is_bot {
            debug!(user_id = from.id.0, "ignoring message from a bot");
            return None;
        }
        if let (Some(ours), Some(theirs)) = (&self.bot_username, &from.username) {
            if theirs.to_lowercase() == *ours {
                return None;
            }
        }

        let body = msg
            .text()
            .or(msg.caption())
            .map(String::from)
            .unwrap_or_else(|| media_placeholder(&msg));

        let sender_contact = from
            .username
            .clone()
            .unwrap_or_else(|| format!("tg:{}", from.id.0));
        let mut sender_name = from.first_name.clone();
        if let Some(last) = &from.last_name {
            sender_name.push(' ');
            sender_name.push_str(last);
        }

        Some(WebhookEvent::Inbound(NormalizedMessage {
            channel: Channel::TelegramBot,
            channel_message_id: Some(msg.id.0.to_string()),
            sender_id: Some(from.id.0.to_string()),
            sender_contact: Some(sender_contact),
            sender_name: Some(sender_name),
            subject: None,
            body,
            received_at: Some(msg.date.naive_utc()),
            attachments: collect_attachments(&msg),
            reply_to_platform_id: msg.reply_to_message().map(|r| r.id.0.to_string()),
            is_group: msg.chat.is_group() || msg.chat.is_supergroup(),
            is_channel: msg.chat.is_channel(),
        }))
    }

    /// Download small media inline (≤ 5 MB) into base64; larger files keep
    /// only their platform id. Best-effort: download failures are logged and
    /// the metadata survives.
    pub async fn hydrate_attachments(&self, attachments: &mut [Attachment]) {
        use base64::Engine;
        for att in attachments.iter_mut() {
            let Some(file_id) = att.platform_media_id.clone() else {
                continue;
            };
            if att.base64.is_some() {
                continue;
            }
            let file = match self.bot.get_file(file_id.as_str()).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(file_id, error = %e, "get_file failed");
                    continue;
                }
            };
            if u64::from(file.size) > MAX_INLINE_MEDIA_BYTES {
                debug!(file_id, size = file.size, "media above inline cap, keeping id only");
                att.size = u64::from(file.size);
                continue;
            }
            let mut buf: Vec<u8> = Vec::new();
            match self.bot.download_file(&file.path, &mut buf).await {
                Ok(()) => {
                    att.size = buf.len() as u64;
                    att.base64 =
                        Some(base64::engine::general_purpose::STANDARD.encode(&buf));
                }
                Err(e) => warn!(file_id, error = %e, "download_file failed"),
            }
        }
    }

    fn chat_id(recipient: &str) -> Result<ChatId, TransportError> {
        recipient
            .trim_start_matches("tg:")
            .parse::<i64>()
            .map(ChatId)
            .map_err(|_| {
                TransportError::payload(format!("telegram bot recipient must be a chat id: {recipient}"))
            })
    }

    /// Best-effort emoji reaction on an inbound message. Errors are the
    /// caller's to swallow.
    async fn set_reaction(
        &self,
        chat: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), TransportError> {
        let chat_id = Self::chat_id(chat)?;
        self.http
            .post(format!(
                "https://api.telegram.org/bot{}/setMessageReaction",
                self.bot_token
            ))
            .json(&serde_json::json!({
                "chat_id": chat_id.0,
                "message_id": message_id.parse::<i64>().unwrap_or(0),
                "reaction": [{"type": "emoji", "emoji": emoji}],
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramBotTransport {
    fn channel(&self) -> Channel {
        Channel::TelegramBot
    }

    async fn send_text(
        &self,
        recipient: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SendReceipt, TransportError> {
        let chat_id = Self::chat_id(recipient)?;
        let mut request = self.bot.send_message(chat_id, text);
        if let Some(reply_id) = reply_to.and_then(|r| r.parse::<i32>().ok()) {
            request = request
                .reply_parameters(ReplyParameters::new(teloxide::types::MessageId(reply_id)));
        }
        let sent = request
            .await
            .map_err(|e| TransportError::api(format!("sendMessage failed: {e}")))?;
        Ok(SendReceipt {
            platform_message_id: Some(sent.id.0.to_string()),
        })
    }

    async fn send_media(
        &self,
        recipient: &str,
        media: &OutboundMedia,
    ) -> Result<SendReceipt, TransportError> {
        let chat_id = Self::chat_id(recipient)?;
        let input = InputFile::file(std::path::PathBuf::from(&media.path));
        let sent: Message = match media.kind {
            AttachmentKind::Voice | AttachmentKind::Audio => self
                .bot
                .send_voice(chat_id, input)
                .await
                .map_err(|e| TransportError::api(format!("sendVoice failed: {e}")))?,
            AttachmentKind::Image => self
                .bot
                .send_photo(chat_id, input)
                .await
                .map_err(|e| TransportError::api(format!("sendPhoto failed: {e}")))?,
            AttachmentKind::Video => self
                .bot
                .send_video(chat_id, input)
                .await
                .map_err(|e| TransportError::api(format!("sendVideo failed: {e}")))?,
            AttachmentKind::Document => self
                .bot
                .send_document(chat_id, input)
                .await
                .map_err(|e| TransportError::api(format!("sendDocument failed: {e}")))?,
        };
        Ok(SendReceipt {
            platform_message_id: Some(sent.id.0.to_string()),
        })
    }

    fn parse_webhook(&self, payload: &[u8]) -> Result<Vec<WebhookEvent>, TransportError> {
        let update: Update = serde_json::from_slice(payload)
            .map_err(|e| TransportError::payload(format!("invalid telegram update: {e}")))?;
        Ok(self.parse_update(update).into_iter().collect())
    }

    async fn react(
        &self,
        chat: &str,
        platform_message_id: &str,
        emoji: &str,
    ) -> Result<(), TransportError> {
        self.set_reaction(chat, platform_message_id, emoji).await
    }
}

fn media_placeholder(msg: &Message) -> String {
    if msg.voice().is_some() {
        "[رسالة صوتية]".to_string()
    } else if msg.photo().is_some() {
        "[صورة]".to_string()
    } else if msg.video().is_some() {
        "[فيديو]".to_string()
    } else if msg.audio().is_some() {
        "[ملف صوتي]".to_string()
    } else if let Some(doc) = msg.document() {
        match &doc.file_name {
            Some(name) => format!("[مستند: {}]", name),
            None => "[مستند]".to_string(),
        }
    } else {
        "[رسالة]".to_string()
    }
}

fn collect_attachments(msg: &Message) -> Vec<Attachment> {
    let mut out = Vec::new();

    if let Some(photos) = msg.photo() {
        // Highest resolution is last.
        if let Some(photo) = photos.last() {
            let mut att = Attachment::new(AttachmentKind::Image, "image/jpeg");
            att.platform_media_id = Some(photo.file.id.clone());
            att.size = u64::from(photo.file.size);
            out.push(att);
        }
    }
    if let Some(voice) = msg.voice() {
        let mime = voice
            .mime_type
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "audio/ogg".to_string());
        let mut att = Attachment::new(AttachmentKind::Voice, mime);
        att.platform_media_id = Some(voice.file.id.clone());
        att.size = u64::from(voice.file.size);
        out.push(att);
    }
    if let Some(audio) = msg.audio() {
        let mime = audio
            .mime_type
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "audio/mpeg".to_string());
        let mut att = Attachment::new(AttachmentKind::Audio, mime);
        att.platform_media_id = Some(audio.file.id.clone());
        att.size = u64::from(audio.file.size);
        out.push(att);
    }
    if let Some(video) = msg.video() {
        let mime = video
            .mime_type
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "video/mp4".to_string());
        let mut att = Attachment::new(AttachmentKind::Video, mime);
        att.platform_media_id = Some(video.file.id.clone());
        att.size = u64::from(video.file.size);
        out.push(att);
    }
    if let Some(doc) = msg.document() {
        let mime = doc
            .mime_type
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let mut att = Attachment::new(AttachmentKind::Document, mime);
        att.platform_media_id = Some(doc.file.id.clone());
        att.size = u64::from(doc.file.size);
        out.push(att);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> TelegramBotTransport {
        TelegramBotTransport::new(
            reqwest::Client::new(),
            "123456:TEST".into(),
            Some("rasil_bot".into()),
        )
    }

    fn update_json(from_is_bot: bool, username: &str, text: &str) -> Vec<u8> {
        serde_json::json!({
            "update_id": 12345,
            "message": {
                "message_id": 7,
                "date": 1717245000,
                "chat": {"id": 555000111, "type": "private", "first_name": "سعيد"},
                "from": {
                    "id": 555000111,
                    "is_bot": from_is_bot,
                    "first_name": "سعيد",
                    "username": username
                },
                "text": text
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn plain_text_update_parses_to_inbound() {
        let events = transport()
            .parse_webhook(&update_json(false, "saeed", "مرحباً"))
            .unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            WebhookEvent::Inbound(msg) => {
                assert_eq!(msg.channel, Channel::TelegramBot);
                assert_eq!(msg.channel_message_id.as_deref(), Some("7"));
                assert_eq!(msg.sender_id.as_deref(), Some("555000111"));
                assert_eq!(msg.sender_contact.as_deref(), Some("saeed"));
                assert_eq!(msg.body, "مرحباً");
            }
            other => panic!("expected inbound, got {:?}", other),
        }
    }

    #[test]
    fn bot_senders_are_dropped() {
        let events = transport()
            .parse_webhook(&update_json(true, "otherbot", "hello"))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn own_bot_username_is_dropped() {
        let events = transport()
            .parse_webhook(&update_json(false, "rasil_bot", "loopback"))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn non_message_updates_are_ignored() {
        let payload = serde_json::json!({
            "update_id": 1,
            "callback_query": {
                "id": "cq", "from": {"id": 1, "is_bot": false, "first_name": "x"},
                "chat_instance": "ci"
            }
        })
        .to_string();
        let events = transport().parse_webhook(payload.as_bytes()).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn recipient_parsing_accepts_tg_prefix() {
        assert!(TelegramBotTransport::chat_id("tg:42").is_ok());
        assert!(TelegramBotTransport::chat_id("42").is_ok());
        assert!(TelegramBotTransport::chat_id("not-a-number").is_err());
    }
}
