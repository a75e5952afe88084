//! Conversation routes: the denormalized list, the cursor-paged merged
//! timeline, and whole-conversation deletion.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use rasil_conversations::{conversation_page, list_conversations, ChatEntry, Cursor, Direction};
use rasil_core::types::EventKind;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::http::errors::ApiError;
use crate::http::license_from_headers;

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /conversations: reads the denormalized table only.
pub async fn list_conversations_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let license_id = license_from_headers(&state, &headers).await?;
    let limit = params.limit.clamp(1, 200);

    let conversations = list_conversations(&state.db, license_id, limit, params.offset).await?;
    let items: Vec<Value> = conversations
        .iter()
        .map(|c| {
            json!({
                "sender_contact": c.sender_contact,
                "sender_name": c.sender_name,
                "channel": c.channel,
                "last_message_id": c.last_message_id,
                "last_message_body": c.last_message_body,
                "last_message_ai_summary": c.last_message_ai_summary,
                "last_message_at": c.last_message_at.map(|t| t.and_utc().to_rfc3339()),
                "status": c.status,
                "unread_count": c.unread_count,
                "message_count": c.message_count,
            })
        })
        .collect();

    Ok(Json(json!({ "conversations": items, "limit": limit, "offset": params.offset })))
}

#[derive(Deserialize)]
pub struct PageParams {
    pub cursor: Option<String>,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
    #[serde(default = "default_direction")]
    pub direction: String,
}

fn default_page_limit() -> i64 {
    30
}

fn default_direction() -> String {
    "older".to_string()
}

/// GET /conversations/{sender}/messages?cursor&limit&direction, with strict
/// (effective_ts, id) ordering in both directions.
pub async fn conversation_messages_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sender): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Value>, ApiError> {
    let license_id = license_from_headers(&state, &headers).await?;

    let cursor = match &params.cursor {
        Some(token) => Some(Cursor::decode(token).ok_or_else(|| {
            ApiError::validation("malformed cursor", "مؤشر صفحة غير صالح")
        })?),
        None => None,
    };
    let direction = Direction::parse(&params.direction);
    let limit = params.limit.clamp(1, 100);

    let aliases = rasil_conversations::resolve_alias_set(&state.db, license_id, &sender).await?;
    let page =
        conversation_page(&state.db, license_id, &aliases, cursor, limit, direction).await?;

    let entries: Vec<Value> = page.entries.iter().map(entry_json).collect();
    Ok(Json(json!({
        "messages": entries,
        "next_cursor": page.next_cursor,
        "direction": params.direction,
    })))
}

/// DELETE /conversations/{sender}: soft-delete every inbox+outbox row of
/// the alias set and hard-delete the cached conversation row.
pub async fn delete_conversation_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sender): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let license_id = license_from_headers(&state, &headers).await?;

    let aliases = rasil_conversations::resolve_alias_set(&state.db, license_id, &sender).await?;
    let inbox_n = rasil_store::inbox::soft_delete_chat(&state.db, license_id, &aliases).await?;
    let outbox_n =
        rasil_store::outbox::soft_delete_for_aliases(&state.db, license_id, &aliases).await?;
    rasil_conversations::engine::delete_conversation_row(&state.db, license_id, &sender).await?;

    state
        .registry
        .broadcast(
            license_id,
            EventKind::ConversationDeleted,
            json!({ "sender_contact": sender }),
        )
        .await;

    Ok(Json(json!({
        "success": true,
        "deleted_inbox": inbox_n,
        "deleted_outbox": outbox_n,
    })))
}

fn entry_json(entry: &ChatEntry) -> Value {
    match entry {
        ChatEntry::Incoming(m) => json!({
            "id": m.id,
            "direction": "incoming",
            "body": m.body,
            "attachments": m.attachments,
            "status": m.status.as_str(),
            "is_read": m.is_read,
            "ai_summary": m.ai_summary,
            "ai_draft_response": m.ai_draft_response,
            "effective_at": m.effective_at().map(|t| t.and_utc().to_rfc3339()),
        }),
        ChatEntry::Outgoing(m) => json!({
            "id": m.id,
            "direction": "outgoing",
            "body": m.body,
            "attachments": m.attachments,
            "status": m.status.as_str(),
            "delivery_status": m.delivery_status.map(|s| s.as_str()),
            "platform_message_id": m.platform_message_id,
            "edit_count": m.edit_count,
            "effective_at": m.effective_at().map(|t| t.and_utc().to_rfc3339()),
        }),
    }
}
