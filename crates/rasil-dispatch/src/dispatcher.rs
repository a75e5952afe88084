//! Outbox lifecycle driver. The send path splits any `[AUDIO: <path>]` tag
//! out of the body; when audio is present the text part is suppressed so the
//! reply arrives as a voice note alone.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rasil_channels::{OutboundMedia, Transport};
use rasil_conversations::engine::Conversation;
use rasil_core::config::EDIT_WINDOW_MINUTES;
use rasil_core::types::{AttachmentKind, Channel, InboxStatus, LicenseId, OutboxStatus};
use rasil_store::inbox::InboxMessage;
use rasil_store::outbox::{self, NewOutboxMessage, OutboxMessage};
use rasil_store::Database;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{info, warn};

use crate::error::{DispatchError, Result};

static AUDIO_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[AUDIO: (.*?)\]").unwrap());

/// Per-license transport lookup, implemented over the credential store by
/// the gateway wiring.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn transport_for(
        &self,
        license_id: LicenseId,
        channel: Channel,
    ) -> Result<Arc<dyn Transport>>;
}

#[derive(Debug)]
pub struct SendOutcome {
    pub outbox_id: i64,
    pub status: OutboxStatus,
    pub platform_message_id: Option<String>,
    pub error: Option<String>,
    pub conversation: Option<Conversation>,
}

/// Split `[AUDIO: <path>]` out of a draft. Returns (text_part, audio_path);
/// the text part is what remains after removing the tag.
pub fn split_audio_tag(body: &str) -> (String, Option<String>) {
    match AUDIO_TAG.captures(body) {
        Some(caps) => {
            let path = caps.get(1).map(|m| m.as_str().trim().to_string());
            let text = AUDIO_TAG.replace(body, "").trim().to_string();
            (text, path)
        }
        None => (body.trim().to_string(), None),
    }
}

pub struct Dispatcher {
    db: Database,
    transports: Arc<dyn TransportProvider>,
}

impl Dispatcher {
    pub fn new(db: Database, transports: Arc<dyn TransportProvider>) -> Self {
        Self { db, transports }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Create + approve + send in one step — the auto-reply path.
    pub async fn send_auto_reply(
        &self,
        inbox: &InboxMessage,
        draft: &str,
    ) -> Result<SendOutcome> {
        let subject = inbox
            .subject
            .as_ref()
            .map(|s| format!("Re: {}", s));
        let outbox_id = outbox::create_outbox_message(
            &self.db,
            &NewOutboxMessage {
                license_id: inbox.license_id,
                inbox_message_id: Some(inbox.id),
                channel: inbox.channel,
                recipient_id: inbox.sender_id.clone(),
                recipient_email: inbox.sender_contact.clone(),
                subject,
                body: draft.to_string(),
                attachments: Vec::new(),
            },
        )
        .await?;
        outbox::approve_outbox_message(&self.db, outbox_id, None).await?;
        rasil_store::inbox::update_inbox_status(&self.db, inbox.id, InboxStatus::AutoReplied)
            .await?;
        self.send(outbox_id, inbox.license_id).await
    }

    /// Background send of an approved outbox message.
    pub async fn send(&self, outbox_id: i64, license_id: LicenseId) -> Result<SendOutcome> {
        let msg = outbox::get_outbox_message(&self.db, outbox_id, license_id)
            .await?
            .ok_or(DispatchError::NotFound(outbox_id))?;

        let recipient = msg
            .recipient_id
            .clone()
            .or_else(|| msg.recipient_email.clone())
            .ok_or(DispatchError::NoRecipient(outbox_id))?;

        let transport = self
            .transports
            .transport_for(license_id, msg.channel)
            .await?;

        let (text, audio_path) = split_audio_tag(&msg.body);
        let reply_to = self.reply_to_platform_id(&msg).await;

        let mut sent_anything = false;
        let mut platform_message_id: Option<String> = None;
        let mut send_error: Option<String> = None;

        // Audio-only when a voice part exists: the text was synthesized into
        // the recording, sending both would duplicate the reply.
        if !text.is_empty() && audio_path.is_none() {
            match transport
                .send_text(&recipient, &text, reply_to.as_deref())
                .await
            {
                Ok(receipt) => {
                    sent_anything = true;
                    platform_message_id = receipt.platform_message_id;
                }
                Err(e) => {
                    warn!(outbox_id, error = %e, "text send failed");
                    send_error = Some(e.to_string());
                }
            }
        }

        if let Some(path) = audio_path {
            let media = OutboundMedia {
                kind: AttachmentKind::Voice,
                mime: "audio/mpeg".to_string(),
                path,
                filename: None,
            };
            match transport.send_media(&recipient, &media).await {
                Ok(receipt) => {
                    sent_anything = true;
                    if platform_message_id.is_none() {
                        platform_message_id = receipt.platform_message_id;
                    }
                }
                Err(e) => {
                    warn!(outbox_id, error = %e, "audio send failed");
                    if send_error.is_none() {
                        send_error = Some(e.to_string());
                    }
                }
            }
        }

        let status = if sent_anything {
            outbox::mark_outbox_sent(&self.db, outbox_id).await?;
            if let Some(pid) = &platform_message_id {
                outbox::save_platform_message_id(&self.db, outbox_id, pid).await?;
            }
            info!(outbox_id, channel = %msg.channel, "outbox message sent");
            self.smart_reaction(&msg, &transport).await;
            OutboxStatus::Sent
        } else {
            let error = send_error
                .clone()
                .unwrap_or_else(|| "nothing was sent".to_string());
            outbox::mark_outbox_failed(&self.db, outbox_id, &error).await?;
            OutboxStatus::Failed
        };

        let conversation = self.recompute_for(&msg).await;

        Ok(SendOutcome {
            outbox_id,
            status,
            platform_message_id,
            error: send_error,
            conversation,
        })
    }

    /// Edit within the 15-minute window; the first edit preserves the
    /// original body.
    pub async fn edit(
        &self,
        outbox_id: i64,
        license_id: LicenseId,
        new_body: &str,
    ) -> Result<OutboxMessage> {
        let msg = outbox::get_outbox_message(&self.db, outbox_id, license_id)
            .await?
            .ok_or(DispatchError::NotFound(outbox_id))?;

        let anchor = msg.sent_at.or(msg.created_at);
        if let Some(anchor) = anchor {
            let age = Utc::now().naive_utc().signed_duration_since(anchor);
            if age.num_minutes() > EDIT_WINDOW_MINUTES {
                return Err(DispatchError::EditWindowExpired);
            }
        }

        outbox::apply_edit(&self.db, outbox_id, new_body).await?;
        let updated = outbox::get_outbox_message(&self.db, outbox_id, license_id)
            .await?
            .ok_or(DispatchError::NotFound(outbox_id))?;
        self.recompute_for(&updated).await;
        Ok(updated)
    }

    /// Emoji acknowledgement on the original inbound message. Non-critical:
    /// every failure is swallowed.
    async fn smart_reaction(&self, msg: &OutboxMessage, transport: &Arc<dyn Transport>) {
        let Some(inbox_id) = msg.inbox_message_id else { return };
        let Ok(Some(inbox)) =
            rasil_store::inbox::get_inbox_message(&self.db, inbox_id, msg.license_id).await
        else {
            return;
        };
        let (Some(chat), Some(pid)) = (&inbox.sender_id, &inbox.channel_message_id) else {
            return;
        };
        if let Err(e) = transport.react(chat, pid, "👍").await {
            tracing::debug!(inbox_id, error = %e, "smart reaction skipped");
        }
    }

    async fn reply_to_platform_id(&self, msg: &OutboxMessage) -> Option<String> {
        let inbox_id = msg.inbox_message_id?;
        let inbox = rasil_store::inbox::get_inbox_message(&self.db, inbox_id, msg.license_id)
            .await
            .ok()??;
        inbox.channel_message_id
    }

    async fn recompute_for(&self, msg: &OutboxMessage) -> Option<Conversation> {
        let contact = msg
            .recipient_email
            .clone()
            .or_else(|| msg.recipient_id.clone())?;
        rasil_conversations::recompute(&self.db, msg.license_id, &contact, None, None)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "conversation recompute after send failed");
                None
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasil_channels::{SendReceipt, TransportError};
    use rasil_store::schema::init_schema;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeTransport {
        sent_texts: Mutex<Vec<(String, String)>>,
        sent_media: Mutex<Vec<String>>,
        fail_sends: bool,
        text_calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn channel(&self) -> Channel {
            Channel::Whatsapp
        }

        async fn send_text(
            &self,
            recipient: &str,
            text: &str,
            _reply_to: Option<&str>,
        ) -> std::result::Result<SendReceipt, TransportError> {
            self.text_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_sends {
                return Err(TransportError::network("connection reset"));
            }
            self.sent_texts
                .lock()
                .unwrap()
                .push((recipient.to_string(), text.to_string()));
            Ok(SendReceipt {
                platform_message_id: Some("wamid.SENT".into()),
            })
        }

        async fn send_media(
            &self,
            _recipient: &str,
            media: &OutboundMedia,
        ) -> std::result::Result<SendReceipt, TransportError> {
            if self.fail_sends {
                return Err(TransportError::network("connection reset"));
            }
            self.sent_media.lock().unwrap().push(media.path.clone());
            Ok(SendReceipt {
                platform_message_id: Some("wamid.MEDIA".into()),
            })
        }

        async fn poll_receipts(
            &self,
            _outstanding: &[String],
        ) -> std::result::Result<HashMap<String, rasil_core::types::DeliveryStatus>, TransportError>
        {
            Ok(HashMap::new())
        }
    }

    struct FakeProvider(Arc<FakeTransport>);

    #[async_trait]
    impl TransportProvider for FakeProvider {
        async fn transport_for(
            &self,
            _license_id: LicenseId,
            _channel: Channel,
        ) -> Result<Arc<dyn Transport>> {
            Ok(self.0.clone())
        }
    }

    async fn setup(fail_sends: bool) -> (Database, Dispatcher, Arc<FakeTransport>) {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        let transport = Arc::new(FakeTransport {
            fail_sends,
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(db.clone(), Arc::new(FakeProvider(transport.clone())));
        (db, dispatcher, transport)
    }

    async fn approved_outbox(db: &Database, body: &str) -> i64 {
        let id = outbox::create_outbox_message(
            db,
            &NewOutboxMessage {
                license_id: 1,
                inbox_message_id: None,
                channel: Channel::Whatsapp,
                recipient_id: Some("966501234567".into()),
                recipient_email: Some("966501234567".into()),
                subject: None,
                body: body.into(),
                attachments: Vec::new(),
            },
        )
        .await
        .unwrap();
        outbox::approve_outbox_message(db, id, None).await.unwrap();
        id
    }

    #[test]
    fn audio_tag_splits_cleanly() {
        let (text, audio) = split_audio_tag("رد نصي\n[AUDIO: /tmp/reply.mp3]");
        assert_eq!(text, "رد نصي");
        assert_eq!(audio.as_deref(), Some("/tmp/reply.mp3"));

        let (text, audio) = split_audio_tag("نص فقط");
        assert_eq!(text, "نص فقط");
        assert!(audio.is_none());
    }

    #[tokio::test]
    async fn text_send_captures_platform_id_and_marks_sent() {
        let (db, dispatcher, transport) = setup(false).await;
        let id = approved_outbox(&db, "أهلاً بك").await;

        let outcome = dispatcher.send(id, 1).await.unwrap();
        assert_eq!(outcome.status, OutboxStatus::Sent);
        assert_eq!(outcome.platform_message_id.as_deref(), Some("wamid.SENT"));

        let msg = outbox::get_outbox_message(&db, id, 1).await.unwrap().unwrap();
        assert_eq!(msg.status, OutboxStatus::Sent);
        assert_eq!(msg.platform_message_id.as_deref(), Some("wamid.SENT"));
        assert_eq!(transport.sent_texts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn audio_present_suppresses_text_part() {
        let (db, dispatcher, transport) = setup(false).await;
        let id = approved_outbox(&db, "نص الرد\n[AUDIO: /tmp/voice.mp3]").await;

        let outcome = dispatcher.send(id, 1).await.unwrap();
        assert_eq!(outcome.status, OutboxStatus::Sent);
        assert_eq!(transport.text_calls.load(Ordering::SeqCst), 0, "text must not be sent");
        assert_eq!(
            transport.sent_media.lock().unwrap().as_slice(),
            &["/tmp/voice.mp3".to_string()]
        );
    }

    #[tokio::test]
    async fn transport_failure_marks_failed_with_error() {
        let (db, dispatcher, _) = setup(true).await;
        let id = approved_outbox(&db, "سيفشل").await;

        let outcome = dispatcher.send(id, 1).await.unwrap();
        assert_eq!(outcome.status, OutboxStatus::Failed);
        assert!(outcome.error.is_some());

        let msg = outbox::get_outbox_message(&db, id, 1).await.unwrap().unwrap();
        assert_eq!(msg.status, OutboxStatus::Failed);
        assert!(msg.error_message.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn edit_outside_window_is_rejected() {
        let (db, dispatcher, _) = setup(false).await;
        let id = approved_outbox(&db, "الأصل").await;

        // Within the window it works and keeps the original body.
        let updated = dispatcher.edit(id, 1, "المعدل").await.unwrap();
        assert_eq!(updated.body, "المعدل");
        assert_eq!(updated.original_body.as_deref(), Some("الأصل"));

        // Age the row past the window.
        db.execute(
            "UPDATE outbox_messages SET created_at = ? WHERE id = ?",
            &[
                rasil_store::Value::Timestamp(
                    Utc::now().naive_utc() - chrono::Duration::minutes(20),
                ),
                id.into(),
            ],
        )
        .await
        .unwrap();
        let err = dispatcher.edit(id, 1, "متأخر").await.unwrap_err();
        assert!(matches!(err, DispatchError::EditWindowExpired));
    }
}
