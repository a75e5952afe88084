//! Operator inbox routes: listing, approve/ignore, soft delete, read
//! markers, and the 15-minute outbox edit.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use rasil_core::types::{Channel, EventKind, InboxStatus};
use rasil_store::inbox;
use rasil_store::outbox::{create_outbox_message, approve_outbox_message, NewOutboxMessage};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::http::errors::ApiError;
use crate::http::license_from_headers;

#[derive(Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub channel: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /inbox: paged, pending rows excluded.
pub async fn list_inbox_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let license_id = license_from_headers(&state, &headers).await?;

    let status = params
        .status
        .as_deref()
        .map(InboxStatus::from_str)
        .transpose()
        .map_err(|_| ApiError::validation("unknown status", "حالة غير معروفة"))?;
    let channel = params
        .channel
        .as_deref()
        .map(Channel::from_str)
        .transpose()
        .map_err(|_| ApiError::validation("unknown channel", "قناة غير معروفة"))?;

    let limit = params.limit.clamp(1, 200);
    let messages =
        inbox::list_inbox(&state.db, license_id, status, channel, limit, params.offset).await?;
    let total = inbox::count_inbox(&state.db, license_id, status, channel).await?;

    let items: Vec<Value> = messages.iter().map(message_json).collect();
    Ok(Json(json!({
        "messages": items,
        "total": total,
        "limit": limit,
        "offset": params.offset,
    })))
}

#[derive(Deserialize)]
pub struct ApproveRequest {
    pub action: String,
    #[serde(rename = "editedBody")]
    pub edited_body: Option<String>,
}

/// POST /inbox/{id}/approve — {action: approve|ignore, edited_body?}.
/// Approve creates + approves an outbox reply and queues the send; the
/// operator sees their message immediately via the broadcast.
pub async fn approve_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<i64>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<Value>, ApiError> {
    let license_id = license_from_headers(&state, &headers).await?;

    let message = inbox::get_inbox_message(&state.db, message_id, license_id)
        .await?
        .ok_or_else(|| ApiError::not_found("message", "الرسالة"))?;

    match req.action.as_str() {
        "approve" => {
            let body = req
                .edited_body
                .or(message.ai_draft_response.clone())
                .filter(|b| !b.trim().is_empty())
                .ok_or_else(|| {
                    ApiError::validation("no response body", "لا يوجد نص للرد")
                })?;

            let outbox_id = create_outbox_message(
                &state.db,
                &NewOutboxMessage {
                    license_id,
                    inbox_message_id: Some(message_id),
                    channel: message.channel,
                    recipient_id: message.sender_id.clone(),
                    recipient_email: message.sender_contact.clone(),
                    subject: message.subject.as_ref().map(|s| format!("Re: {}", s)),
                    body: body.clone(),
                    attachments: Vec::new(),
                },
            )
            .await?;
            approve_outbox_message(&state.db, outbox_id, Some(&body)).await?;
            inbox::update_inbox_status(&state.db, message_id, InboxStatus::Approved).await?;

            // The whole chat flips to handled, across the alias set.
            if let Some(contact) = &message.sender_contact {
                let aliases =
                    rasil_conversations::resolve_alias_set(&state.db, license_id, contact).await?;
                inbox::approve_chat_messages(&state.db, license_id, &aliases).await?;
            }

            // Show the outgoing message to clients before it hits the wire.
            state
                .registry
                .broadcast(
                    license_id,
                    EventKind::MessageStatusUpdate,
                    json!({
                        "outbox_id": outbox_id,
                        "inbox_message_id": message_id,
                        "sender_contact": message.sender_contact,
                        "status": "sending",
                        "direction": "outgoing",
                        "body": body,
                    }),
                )
                .await;

            rasil_queue::enqueue(
                &state.db,
                "send_message",
                &json!({ "outbox_id": outbox_id, "license_id": license_id }),
            )
            .await?;

            Ok(Json(json!({ "success": true, "outbox_id": outbox_id })))
        }
        "ignore" => {
            // Ignore means "handled without a reply": the alias set's
            // analyzed rows flip to approved.
            if let Some(contact) = &message.sender_contact {
                let aliases =
                    rasil_conversations::resolve_alias_set(&state.db, license_id, contact).await?;
                inbox::approve_chat_messages(&state.db, license_id, &aliases).await?;
                rasil_conversations::recompute(&state.db, license_id, contact, None, None)
                    .await?;
            } else {
                inbox::update_inbox_status(&state.db, message_id, InboxStatus::Approved).await?;
            }
            Ok(Json(json!({ "success": true })))
        }
        other => Err(ApiError::validation(
            &format!("unknown action: {}", other),
            "إجراء غير معروف",
        )),
    }
}

/// POST /inbox/cleanup: operator-triggered stale-status repair. Promotes
/// analyzed rows whose sender already has a later handled message.
pub async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let license_id = license_from_headers(&state, &headers).await?;
    let repaired = inbox::repair_stale_statuses(&state.db, license_id).await?;
    Ok(Json(json!({ "success": true, "repaired": repaired })))
}

/// POST /inbox/{id}/analyze: operator-triggered re-analysis for rows left
/// with a placeholder draft.
pub async fn reanalyze_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let license_id = license_from_headers(&state, &headers).await?;

    let message = inbox::get_inbox_message(&state.db, message_id, license_id)
        .await?
        .ok_or_else(|| ApiError::not_found("message", "الرسالة"))?;

    // Re-open the row so the guarded analysis write can land again.
    inbox::update_inbox_status(&state.db, message_id, InboxStatus::Pending).await?;

    let request = rasil_brain::AnalyzeRequest {
        message_id,
        license_id,
        channel: message.channel,
        body: message.body.clone(),
        sender_contact: message.sender_contact.clone(),
        sender_name: message.sender_name.clone(),
        channel_message_id: message.channel_message_id.clone(),
        attachments: message.attachments.clone(),
        auto_reply: false,
    };

    match state.orchestrator.analyze(&request).await {
        Ok(rasil_brain::AnalyzeOutcome::Completed { draft_response, .. }) => {
            Ok(Json(json!({ "success": true, "draft_response": draft_response })))
        }
        Ok(rasil_brain::AnalyzeOutcome::RateLimited(reason)) => Ok(Json(json!({
            "success": false,
            "reason": reason,
        }))),
        Ok(_) => Ok(Json(json!({ "success": false, "reason": "deferred" }))),
        Err(e) => Err(ApiError::internal(e.to_string())),
    }
}

/// DELETE /messages/{id}: soft delete + conversation recompute.
pub async fn delete_message_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let license_id = license_from_headers(&state, &headers).await?;

    let message = inbox::get_inbox_message(&state.db, message_id, license_id)
        .await?
        .ok_or_else(|| ApiError::not_found("message", "الرسالة"))?;

    inbox::soft_delete_message(&state.db, message_id, license_id).await?;
    if let Some(contact) = &message.sender_contact {
        rasil_conversations::recompute(&state.db, license_id, contact, None, None).await?;
    }

    state
        .registry
        .broadcast(
            license_id,
            EventKind::MessageDeleted,
            json!({ "message_id": message_id, "sender_contact": message.sender_contact }),
        )
        .await;

    Ok(Json(json!({ "success": true })))
}

/// POST /messages/{id}/read: mark a whole chat read by its sender.
pub async fn mark_read_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let license_id = license_from_headers(&state, &headers).await?;

    let message = inbox::get_inbox_message(&state.db, message_id, license_id)
        .await?
        .ok_or_else(|| ApiError::not_found("message", "الرسالة"))?;

    match &message.sender_contact {
        Some(contact) => {
            let aliases =
                rasil_conversations::resolve_alias_set(&state.db, license_id, contact).await?;
            inbox::mark_chat_read(&state.db, license_id, &aliases).await?;
            rasil_conversations::recompute(&state.db, license_id, contact, None, None).await?;
        }
        None => {
            inbox::mark_message_read(&state.db, message_id, license_id).await?;
        }
    }
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct EditRequest {
    pub body: String,
}

/// POST /outbox/{id}/edit: 15-minute window, original kept on first edit.
pub async fn edit_outbox_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(outbox_id): Path<i64>,
    Json(req): Json<EditRequest>,
) -> Result<Json<Value>, ApiError> {
    let license_id = license_from_headers(&state, &headers).await?;
    if req.body.trim().is_empty() {
        return Err(ApiError::validation("empty body", "نص الرسالة فارغ"));
    }

    let updated = state.dispatcher.edit(outbox_id, license_id, &req.body).await?;

    state
        .registry
        .broadcast(
            license_id,
            EventKind::MessageEdited,
            json!({
                "outbox_id": outbox_id,
                "body": updated.body,
                "edit_count": updated.edit_count,
            }),
        )
        .await;

    Ok(Json(json!({ "success": true, "edit_count": updated.edit_count })))
}

fn message_json(m: &inbox::InboxMessage) -> Value {
    json!({
        "id": m.id,
        "channel": m.channel.as_str(),
        "channel_message_id": m.channel_message_id,
        "sender_id": m.sender_id,
        "sender_name": m.sender_name,
        "sender_contact": m.sender_contact,
        "subject": m.subject,
        "body": m.body,
        "attachments": m.attachments,
        "received_at": m.received_at.map(|t| t.and_utc().to_rfc3339()),
        "status": m.status.as_str(),
        "is_read": m.is_read,
        "intent": m.intent,
        "urgency": m.urgency,
        "sentiment": m.sentiment,
        "language": m.language,
        "dialect": m.dialect,
        "ai_summary": m.ai_summary,
        "ai_draft_response": m.ai_draft_response,
    })
}
