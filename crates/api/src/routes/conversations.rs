//! Conversation routes for the admin surface
//!
//! The admin UI and CLI live elsewhere; these endpoints are the seam
//! through which they delegate to the lifecycle manager. Transfer
//! conflicts come back as 200 with `success=false` so operator tooling
//! can show the reason without special-casing status codes.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use livedesk_shared::{Conversation, Message, TransferKind, TransferRecord};

use crate::error::{ApiError, ApiResult};
use crate::lifecycle::{CloseActor, TransferError};
use crate::state::AppState;
use crate::websocket::events::MessagePayload;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ConversationsListResponse {
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub to_agent_id: Uuid,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ActionResponse {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            message: Some(message),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub conversation_id: Uuid,
    pub messages: Vec<MessagePayload>,
}

// =============================================================================
// Helpers
// =============================================================================

/// Resolve the bearer token to an enabled admin agent
async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let claims = state
        .jwt
        .verify_agent_token(token)
        .map_err(|_| ApiError::InvalidToken)?;

    let agent = state
        .lifecycle
        .store()
        .agent(claims.sub)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    if !agent.enabled {
        return Err(ApiError::Unauthorized);
    }
    if !agent.is_admin {
        return Err(ApiError::Forbidden);
    }
    Ok(agent.id)
}

// =============================================================================
// Handlers
// =============================================================================

/// List recent conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListConversationsQuery>,
) -> ApiResult<Json<ConversationsListResponse>> {
    require_admin(&state, &headers).await?;

    let limit = query.limit.unwrap_or(50).min(200);
    let conversations = state.lifecycle.store().recent_conversations(limit).await?;

    Ok(Json(ConversationsListResponse { conversations }))
}

/// Full message history of one conversation (admin view; includes system
/// messages the customer never sees)
pub async fn get_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<MessagesResponse>> {
    require_admin(&state, &headers).await?;

    state
        .lifecycle
        .store()
        .conversation(conversation_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let messages: Vec<Message> = state.lifecycle.store().messages(conversation_id).await?;

    Ok(Json(MessagesResponse {
        conversation_id,
        messages: messages.iter().map(MessagePayload::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct TransferHistoryResponse {
    pub conversation_id: Uuid,
    pub transfers: Vec<TransferRecord>,
}

/// Transfer history of one conversation
pub async fn get_transfer_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<TransferHistoryResponse>> {
    require_admin(&state, &headers).await?;

    state
        .lifecycle
        .store()
        .conversation(conversation_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let transfers = state.lifecycle.store().transfers(conversation_id).await?;

    Ok(Json(TransferHistoryResponse {
        conversation_id,
        transfers,
    }))
}

/// Force-transfer a conversation to another agent
pub async fn transfer_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<Json<ActionResponse>> {
    let admin_id = require_admin(&state, &headers).await?;

    let result = state
        .lifecycle
        .transfer(
            conversation_id,
            req.to_agent_id,
            TransferKind::Manual,
            Some(admin_id),
            &req.reason,
        )
        .await;

    match result {
        Ok(()) => {
            tracing::info!(
                conversation_id = %conversation_id,
                to_agent_id = %req.to_agent_id,
                operator_id = %admin_id,
                "Manual transfer via admin surface"
            );
            Ok(Json(ActionResponse::ok()))
        }
        Err(TransferError::NotFound) => Err(ApiError::NotFound),
        Err(TransferError::Store(msg)) => Err(ApiError::Database(msg)),
        // Precondition conflicts surface as success=false with the reason
        Err(e) => Ok(Json(ActionResponse::failed(e.to_string()))),
    }
}

/// Close a conversation on behalf of an operator
pub async fn close_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<ActionResponse>> {
    let admin_id = require_admin(&state, &headers).await?;

    state
        .lifecycle
        .close_conversation(conversation_id, CloseActor::Admin)
        .await?;

    tracing::info!(
        conversation_id = %conversation_id,
        operator_id = %admin_id,
        "Conversation closed via admin surface"
    );
    Ok(Json(ActionResponse::ok()))
}

/// Mark the customer's messages read on behalf of the assigned agent
pub async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<ActionResponse>> {
    require_admin(&state, &headers).await?;

    let conversation = state
        .lifecycle
        .store()
        .conversation(conversation_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if let Some(agent_id) = conversation.agent_id {
        state
            .lifecycle
            .mark_read_by_agent(agent_id, conversation_id)
            .await?;
    }
    Ok(Json(ActionResponse::ok()))
}
