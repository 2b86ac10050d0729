//! WebSocket handler for Axum
//!
//! Upgrades the connection, authenticates the principal named in the
//! query string (`type=agent&token=...` or `type=customer&uuid=...`),
//! registers the session and demultiplexes inbound frames to the
//! lifecycle manager.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use livedesk_shared::CustomerProfile;

use crate::lifecycle::CloseActor;
use crate::registry::Principal;
use crate::state::AppState;

use super::{
    connection::SessionHandle,
    events::{ClientFrame, MessagePayload, ServerFrame},
};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// "agent" or "customer"
    #[serde(rename = "type")]
    kind: Option<String>,
    /// Agent bearer token
    token: Option<String>,
    /// Customer stable opaque id
    uuid: Option<String>,
    locale: Option<String>,
    source: Option<String>,
}

/// Extract client IP address from common proxy headers
fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("cf-connecting-ip")
        .or_else(|| headers.get("x-real-ip"))
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|h| h.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
}

/// WebSocket handler - upgrades the HTTP connection
/// Authentication happens post-upgrade so rejections arrive as an `error`
/// frame before the close, which embedded clients can surface.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Response {
    let profile = CustomerProfile {
        address: extract_client_ip(&headers),
        user_agent: headers
            .get("user-agent")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string()),
        locale: query.locale.clone(),
        source_page: query.source.clone(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, query, profile, state))
}

/// Handle one WebSocket connection for its whole lifetime
async fn handle_socket(socket: WebSocket, query: ConnectQuery, profile: CustomerProfile, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // Frames pushed from anywhere in the system land in this channel; the
    // writer task owns the socket sink and preserves push order.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let handle = SessionHandle::new(tx);
    let session_id = handle.session_id;

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let evicted = matches!(frame, ServerFrame::Kicked { .. });
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to serialize WebSocket frame");
                }
            }
            if evicted {
                // Graceful close after the kicked notice
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    });

    // Handshake: resolve the principal or reject with an error frame
    let principal = match authenticate(&state, &query, profile, &handle).await {
        Ok(principal) => principal,
        Err(reject) => {
            tracing::info!(session_id = %session_id, reason = %reject, "WebSocket handshake rejected");
            handle.send(ServerFrame::Error { message: reject });
            drop(handle);
            let _ = send_task.await;
            return;
        }
    };

    // Inbound frame loop
    while let Some(msg) = stream.next().await {
        let Ok(msg) = msg else { break };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    if let Err(e) = dispatch_frame(&state, principal, &handle, frame).await {
                        // A failing handler never tears down the session
                        tracing::error!(
                            session_id = %session_id,
                            error = %e,
                            "Frame handler failed"
                        );
                    }
                }
                Err(e) => {
                    // Unrecognized or malformed frames are dropped
                    tracing::debug!(
                        session_id = %session_id,
                        error = %e,
                        "Dropped unparseable frame"
                    );
                }
            },
            Message::Close(_) => {
                tracing::debug!(session_id = %session_id, "WebSocket close frame received");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Axum answers transport pings on its own
            }
            _ => {} // Ignore binary frames
        }
    }

    // Cleanup. Agents go OFFLINE with liveness cleared; reassignment of
    // their conversations is the heartbeat reconciler's call, so transient
    // reconnects inside the TTL window don't thrash.
    tracing::info!(session_id = %session_id, "WebSocket connection closing");
    state.registry.unbind_by_session(session_id).await;
    send_task.abort();
}

/// Resolve and register the principal for a fresh connection
async fn authenticate(
    state: &AppState,
    query: &ConnectQuery,
    profile: CustomerProfile,
    handle: &SessionHandle,
) -> Result<Principal, String> {
    match query.kind.as_deref() {
        Some("agent") => {
            let token = query.token.as_deref().ok_or("missing token")?;
            let claims = state
                .jwt
                .verify_agent_token(token)
                .map_err(|e| e.to_string())?;

            // Allowlist check: the token is only as good as the record
            let agent = state
                .lifecycle
                .store()
                .agent(claims.sub)
                .await
                .map_err(|e| e.to_string())?
                .ok_or("unknown agent")?;
            if !agent.enabled {
                return Err("agent disabled".to_string());
            }

            let load = state.lifecycle.current_load(agent.id).await;
            state
                .registry
                .bind_agent(agent.id, handle.clone(), load)
                .await;

            handle.send(ServerFrame::Connected {
                session_id: handle.session_id,
                agent_id: Some(agent.id),
                customer_id: None,
                status: Some(livedesk_shared::AgentStatus::Online),
            });

            // Service anything already queued
            match state.lifecycle.try_drain_waiting_for(agent.id).await {
                Ok(assigned) if assigned > 0 => {
                    tracing::info!(agent_id = %agent.id, assigned = assigned, "Connect-time queue drain");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(agent_id = %agent.id, error = %e, "Connect-time drain failed");
                }
            }

            Ok(Principal::Agent(agent.id))
        }
        Some("customer") => {
            let external_id = query.uuid.as_deref().ok_or("missing uuid")?;
            if external_id.is_empty() {
                return Err("missing uuid".to_string());
            }

            let customer = state
                .lifecycle
                .store()
                .get_or_create_customer(external_id, profile)
                .await
                .map_err(|e| e.to_string())?;

            state.registry.bind_customer(customer.id, handle.clone()).await;

            handle.send(ServerFrame::Connected {
                session_id: handle.session_id,
                agent_id: None,
                customer_id: Some(customer.id),
                status: None,
            });

            // Replay anything the agent said while the customer was away
            if let Ok(Some(conversation)) = state
                .lifecycle
                .store()
                .open_conversation_for(customer.id)
                .await
            {
                if let Ok(unread) = state
                    .lifecycle
                    .store()
                    .unread_messages(conversation.id, livedesk_shared::SenderKind::Agent)
                    .await
                {
                    if !unread.is_empty() {
                        handle.send(ServerFrame::OfflineMessages {
                            conversation_id: conversation.id,
                            messages: unread.iter().map(MessagePayload::from).collect(),
                        });
                    }
                }
            }

            Ok(Principal::Customer(customer.id))
        }
        _ => Err("unknown connection type".to_string()),
    }
}

/// Route one parsed inbound frame
async fn dispatch_frame(
    state: &AppState,
    principal: Principal,
    handle: &SessionHandle,
    frame: ClientFrame,
) -> Result<(), crate::store::StoreError> {
    match (principal, frame) {
        (principal, ClientFrame::Ping) => {
            handle.send(ServerFrame::Pong);
            if let Principal::Agent(agent_id) = principal {
                state.registry.heartbeat(agent_id).await;
            }
        }

        (
            Principal::Customer(customer_id),
            ClientFrame::Message {
                content,
                content_kind,
                ..
            },
        ) => {
            state
                .lifecycle
                .customer_message(customer_id, &content, content_kind)
                .await?;
        }
        (
            Principal::Agent(agent_id),
            ClientFrame::Message {
                conversation_id,
                content,
                content_kind,
            },
        ) => {
            let Some(conversation_id) = conversation_id else {
                tracing::debug!(agent_id = %agent_id, "Agent message without conversation id dropped");
                return Ok(());
            };
            state
                .lifecycle
                .agent_message(agent_id, conversation_id, &content, content_kind)
                .await?;
        }

        (
            Principal::Agent(agent_id),
            ClientFrame::Typing {
                conversation_id,
                typing,
            },
        ) => {
            state
                .lifecycle
                .typing_from_agent(agent_id, conversation_id, typing)
                .await?;
        }
        (
            Principal::Customer(customer_id),
            ClientFrame::Typing {
                conversation_id,
                typing,
            },
        ) => {
            state
                .lifecycle
                .typing_from_customer(customer_id, conversation_id, typing)
                .await?;
        }

        (Principal::Agent(agent_id), ClientFrame::Read { conversation_id }) => {
            state
                .lifecycle
                .mark_read_by_agent(agent_id, conversation_id)
                .await?;
        }
        (Principal::Customer(customer_id), ClientFrame::Read { conversation_id }) => {
            state
                .lifecycle
                .mark_read_by_customer(customer_id, conversation_id)
                .await?;
        }

        (Principal::Agent(agent_id), ClientFrame::CloseConversation { conversation_id }) => {
            state
                .lifecycle
                .close_conversation(conversation_id, CloseActor::Agent(agent_id))
                .await?;
        }
        (Principal::Customer(_), ClientFrame::CloseConversation { .. }) => {
            tracing::debug!("Customer close frame dropped");
        }

        (Principal::Agent(agent_id), ClientFrame::Status { status }) => {
            state.lifecycle.agent_status_change(agent_id, status).await;
            handle.send(ServerFrame::StatusChanged { status });
        }
        (Principal::Customer(_), ClientFrame::Status { .. }) => {
            tracing::debug!("Customer status frame dropped");
        }
    }
    Ok(())
}
