//! Task-queue dispatch: `analyze_message` runs the AI orchestrator (and the
//! auto-reply path), `send_message` drives the outbound dispatcher.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rasil_brain::{AnalyzeOutcome, AnalyzeRequest, BrainError, Orchestrator};
use rasil_core::types::{Attachment, Channel, EventKind, OutboxStatus};
use rasil_dispatch::Dispatcher;
use rasil_queue::{Task, TaskHandler, TaskOutcome};
use rasil_store::inbox::get_inbox_message;
use tracing::{info, warn};

use crate::pipeline::{EventSink, IngestServices};

pub struct CoreTaskHandler {
    svcs: IngestServices,
    orchestrator: Arc<Orchestrator>,
    dispatcher: Arc<Dispatcher>,
}

impl CoreTaskHandler {
    pub fn new(
        svcs: IngestServices,
        orchestrator: Arc<Orchestrator>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            svcs,
            orchestrator,
            dispatcher,
        }
    }

    async fn handle_analyze(&self, task: &Task) -> TaskOutcome {
        let payload = &task.payload;
        let message_id = payload["message_id"].as_i64().unwrap_or(0);
        let license_id = payload["license_id"].as_i64().unwrap_or(0);
        let channel = payload["channel"]
            .as_str()
            .and_then(|c| Channel::from_str(c).ok());
        let Some(channel) = channel else {
            return TaskOutcome::Failed(format!("bad channel in payload for task {}", task.id));
        };

        let attachments: Vec<Attachment> = payload
            .get("attachments")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let req = AnalyzeRequest {
            message_id,
            license_id,
            channel,
            body: payload["body"].as_str().unwrap_or_default().to_string(),
            sender_contact: payload["sender_contact"].as_str().map(String::from),
            sender_name: payload["sender_name"].as_str().map(String::from),
            channel_message_id: payload["channel_message_id"].as_str().map(String::from),
            attachments,
            auto_reply: payload["auto_reply"].as_bool().unwrap_or(false),
        };

        match self.orchestrator.analyze(&req).await {
            Ok(AnalyzeOutcome::Completed {
                draft_response,
                auto_reply,
                conversation,
            }) => {
                self.svcs
                    .sink
                    .emit(
                        license_id,
                        EventKind::NewMessage,
                        serde_json::json!({
                            "message_id": message_id,
                            "sender_contact": req.sender_contact,
                            "sender_name": req.sender_name,
                            "channel": channel.as_str(),
                            "status": "analyzed",
                            "direction": "incoming",
                            "unread_count": conversation.as_ref().map(|c| c.unread_count),
                            "preview": conversation.as_ref().map(|c| c.last_message_body.clone()),
                        }),
                    )
                    .await;

                if auto_reply {
                    self.auto_reply(message_id, license_id, &req, &draft_response)
                        .await;
                }
                TaskOutcome::Done
            }
            // Deferred states: the row keeps its placeholder and the
            // scheduler's retry pass re-enqueues next cycle — queue-level
            // retry would only burn attempts against the same closed gate.
            Ok(AnalyzeOutcome::SkippedDuplicate)
            | Ok(AnalyzeOutcome::RateLimited(_))
            | Ok(AnalyzeOutcome::CoolingDown) => TaskOutcome::Done,
            Err(BrainError::ProviderRateLimited) => TaskOutcome::Done,
            Err(e) => TaskOutcome::Failed(e.to_string()),
        }
    }

    async fn auto_reply(
        &self,
        message_id: i64,
        license_id: i64,
        req: &AnalyzeRequest,
        draft: &str,
    ) {
        // Mark the original read on the platform first — best-effort.
        if let (Some(contact), Some(cmid)) = (&req.sender_contact, &req.channel_message_id) {
            if let Ok(transport) = self
                .svcs
                .transports
                .transport_for(license_id, req.channel)
                .await
            {
                if let Err(e) = transport.mark_read(contact, Some(cmid)).await {
                    warn!(message_id, error = %e, "mark_read before auto-reply failed");
                }
            }
        }

        let inbox = match get_inbox_message(&self.svcs.db, message_id, license_id).await {
            Ok(Some(inbox)) => inbox,
            Ok(None) => return,
            Err(e) => {
                warn!(message_id, error = %e, "auto-reply inbox lookup failed");
                return;
            }
        };

        match self.dispatcher.send_auto_reply(&inbox, draft).await {
            Ok(outcome) => {
                info!(message_id, outbox_id = outcome.outbox_id, "auto-reply sent");
                self.svcs
                    .sink
                    .emit(
                        license_id,
                        EventKind::MessageStatusUpdate,
                        serde_json::json!({
                            "outbox_id": outcome.outbox_id,
                            "inbox_message_id": message_id,
                            "sender_contact": inbox.sender_contact,
                            "status": outcome.status.as_str(),
                            "direction": "outgoing",
                        }),
                    )
                    .await;
            }
            Err(e) => warn!(message_id, error = %e, "auto-reply send failed"),
        }
    }

    async fn handle_send(&self, task: &Task) -> TaskOutcome {
        let outbox_id = task.payload["outbox_id"].as_i64().unwrap_or(0);
        let license_id = task.payload["license_id"].as_i64().unwrap_or(0);

        match self.dispatcher.send(outbox_id, license_id).await {
            Ok(outcome) => {
                self.svcs
                    .sink
                    .emit(
                        license_id,
                        EventKind::MessageStatusUpdate,
                        serde_json::json!({
                            "outbox_id": outcome.outbox_id,
                            "status": outcome.status.as_str(),
                            "platform_message_id": outcome.platform_message_id,
                            "error": outcome.error,
                            "direction": "outgoing",
                            "sender_contact": outcome
                                .conversation
                                .as_ref()
                                .map(|c| c.sender_contact.clone()),
                        }),
                    )
                    .await;
                // A failed send is recorded on the row; the operator
                // re-sends explicitly, so the task itself is done.
                if outcome.status == OutboxStatus::Failed {
                    if let Some(error) = outcome.error {
                        warn!(outbox_id, %error, "send completed as failed");
                    }
                }
                TaskOutcome::Done
            }
            Err(e) => TaskOutcome::Failed(e.to_string()),
        }
    }
}

#[async_trait]
impl TaskHandler for CoreTaskHandler {
    async fn handle(&self, task: &Task) -> TaskOutcome {
        match task.task_type.as_str() {
            "analyze_message" => self.handle_analyze(task).await,
            "send_message" => self.handle_send(task).await,
            other => TaskOutcome::Failed(format!("unknown task type: {}", other)),
        }
    }
}
