use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::{AgentEvent, Attachment, BootGate, TurnError, UserInput};
use crate::runtime::BackendRuntime;
use crate::state::{AgentState, ChatTurn, JournalEntry};
use crate::store::migration::BootDecision;

#[derive(Clone)]
pub struct ServerState {
    pub agent: Arc<crate::agent::Agent>,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    boot: BootGate,
    persistence: bool,
    processing: bool,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct AttachmentBody {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    #[serde(default)]
    text: String,
    attachment: Option<AttachmentBody>,
}

#[derive(Debug, Serialize)]
struct SendMessageResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DecisionKind {
    Restore,
    Fresh,
}

#[derive(Debug, Deserialize)]
struct BootDecisionRequest {
    decision: DecisionKind,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    key: String,
}

#[derive(Debug, Serialize)]
struct BackupResponse {
    key: String,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<AgentEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("PERSONA_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid PERSONA_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        agent: runtime.agent.clone(),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);
    let cadence = runtime.start().await;

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Persona backend listening on http://{}", bind_addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Backend server failed");

    tracing::info!("Shutting down; flushing pending saves");
    cadence.shutdown().await;
    runtime.agent.shutdown().await;
    served
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/state", get(get_state))
        .route("/chat", get(get_chat))
        .route("/journal", get(get_journal))
        .route("/messages", post(send_message))
        .route("/boot", get(get_boot))
        .route("/boot/decision", post(decide_boot))
        .route("/boot/retry", post(retry_boot))
        .route("/backups", get(list_backups).post(create_backup))
        .route("/backups/restore", post(restore_backup))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<AgentEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_agent_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_agent_event(event: AgentEvent) -> ApiEventEnvelope {
    let event_type = match &event {
        AgentEvent::StatusChanged { .. } => "status_changed",
        AgentEvent::TurnAppended { .. } => "turn_appended",
        AgentEvent::Interim { .. } => "interim",
        AgentEvent::JournalWritten { .. } => "journal_written",
        AgentEvent::DecisionRequired { .. } => "decision_required",
        AgentEvent::Observation { .. } => "observation",
        AgentEvent::Error { .. } => "error",
    };
    let mut payload = serde_json::to_value(&event).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(fields) = payload.as_object_mut() {
        fields.remove("type");
    }
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("PERSONA_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("PERSONA_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "PERSONA_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid PERSONA_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("Bearer "))
        .map(str::trim);
    match (auth.token.as_deref(), presented) {
        (Some(expected), Some(presented)) if expected == presented => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        boot: state.agent.gate().await,
        persistence: state.agent.persistence_enabled(),
        processing: state.agent.is_processing(),
    })
}

async fn get_state(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<AgentState>, (StatusCode, String)> {
    require_ready(&state).await?;
    Ok(Json(state.agent.snapshot().await))
}

async fn get_chat(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ChatTurn>>, (StatusCode, String)> {
    require_ready(&state).await?;
    let limit = clamp_limit(query.limit, 100, 1, 1000);
    let history = state.agent.snapshot().await.chat_history;
    let skip = history.len().saturating_sub(limit);
    Ok(Json(history.into_iter().skip(skip).collect()))
}

async fn get_journal(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<JournalEntry>>, (StatusCode, String)> {
    require_ready(&state).await?;
    let limit = clamp_limit(query.limit, 50, 1, 1000);
    let journal = state.agent.snapshot().await.journal;
    let skip = journal.len().saturating_sub(limit);
    Ok(Json(journal.into_iter().skip(skip).collect()))
}

/// Accepts the message and runs the turn in the background; progress and
/// the reply arrive on the event stream.
async fn send_message(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<SendMessageResponse>), (StatusCode, String)> {
    let attachment = match body.attachment {
        Some(attachment) => {
            base64::engine::general_purpose::STANDARD
                .decode(attachment.data.as_bytes())
                .map_err(|e| {
                    (
                        StatusCode::BAD_REQUEST,
                        format!("attachment is not valid base64: {}", e),
                    )
                })?;
            Some(Attachment {
                mime_type: attachment.mime_type,
                data: attachment.data,
            })
        }
        None => None,
    };
    let input = UserInput {
        text: body.text,
        attachment,
    };
    if input.text.trim().is_empty() && input.attachment.is_none() {
        return Err(turn_error(TurnError::EmptyMessage));
    }

    let guard = state.agent.begin_turn().await.map_err(turn_error)?;
    let agent = state.agent.clone();
    tokio::spawn(async move {
        if let Err(e) = agent.handle_user_message(guard, input).await {
            tracing::warn!("Turn failed: {}", e);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SendMessageResponse { status: "accepted" }),
    ))
}

async fn get_boot(State(state): State<Arc<ServerState>>) -> Json<BootGate> {
    Json(state.agent.gate().await)
}

async fn decide_boot(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<BootDecisionRequest>,
) -> Result<Json<BootGate>, (StatusCode, String)> {
    let decision = match body.decision {
        DecisionKind::Restore => BootDecision::Restore { key: body.key },
        DecisionKind::Fresh => BootDecision::StartFresh,
    };
    state
        .agent
        .resolve_boot(decision)
        .await
        .map(Json)
        .map_err(turn_error)
}

async fn retry_boot(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<BootGate>, (StatusCode, String)> {
    state.agent.retry_boot().await.map(Json).map_err(turn_error)
}

async fn list_backups(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<String>>, (StatusCode, String)> {
    state.agent.list_backups().await.map(Json).map_err(turn_error)
}

async fn create_backup(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<BackupResponse>, (StatusCode, String)> {
    require_ready(&state).await?;
    let key = state.agent.snapshot_backup().await.map_err(turn_error)?;
    Ok(Json(BackupResponse { key }))
}

async fn restore_backup(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RestoreRequest>,
) -> Result<Json<BootGate>, (StatusCode, String)> {
    state
        .agent
        .restore_backup(body.key.trim())
        .await
        .map_err(turn_error)?;
    Ok(Json(state.agent.gate().await))
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

/// Forward envelopes until the client goes away. A client that falls
/// behind gets an error envelope instead of the events it missed.
async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        let envelope = tokio::select! {
            result = rx.recv() => match result {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Websocket client lagged by {} event(s)", skipped);
                    map_agent_event(AgentEvent::Error {
                        message: format!("{} event(s) dropped; refresh the chat", skipped),
                    })
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };

        match serde_json::to_string(&envelope) {
            Ok(text) => {
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(error) => tracing::warn!("Failed to serialize websocket event: {}", error),
        }
    }
}

async fn require_ready(state: &ServerState) -> Result<(), (StatusCode, String)> {
    match state.agent.gate().await {
        BootGate::Ready => Ok(()),
        other => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            format!("agent not ready: {:?}", other),
        )),
    }
}

fn turn_error(error: TurnError) -> (StatusCode, String) {
    let status = match &error {
        TurnError::Busy => StatusCode::CONFLICT,
        TurnError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        TurnError::EmptyMessage => StatusCode::BAD_REQUEST,
        TurnError::LoopAborted { .. } | TurnError::Model(_) => StatusCode::BAD_GATEWAY,
        TurnError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string())
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::booted;
    use crate::llm_client::scripted::ScriptedModel;
    use crate::llm_client::ModelResponse;
    use axum::http::HeaderValue;

    fn server_state(agent: Arc<crate::agent::Agent>) -> Arc<ServerState> {
        let (ws_events, _) = broadcast::channel(16);
        Arc::new(ServerState {
            agent,
            auth: BackendAuthConfig {
                mode: AuthMode::Disabled,
                token: None,
            },
            ws_events,
        })
    }

    #[test]
    fn authorize_accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert!(authorize(
            &headers,
            &BackendAuthConfig {
                mode: AuthMode::Required,
                token: Some("token-123".to_string()),
            }
        )
        .is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_invalid_token() {
        let auth = BackendAuthConfig {
            mode: AuthMode::Required,
            token: Some("token-123".to_string()),
        };
        assert!(authorize(&HeaderMap::new(), &auth).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(authorize(&headers, &auth).is_err());
    }

    #[test]
    fn parse_auth_mode_defaults_to_required() {
        assert!(matches!(parse_auth_mode(None).unwrap(), AuthMode::Required));
        assert!(matches!(
            parse_auth_mode(Some("disabled".to_string())).unwrap(),
            AuthMode::Disabled
        ));
        assert!(parse_auth_mode(Some("nope".to_string())).is_err());
    }

    #[test]
    fn map_agent_event_strips_the_tag_into_event_type() {
        let envelope = map_agent_event(AgentEvent::Interim {
            tool: "generate_image".to_string(),
            message: "Generating...".to_string(),
        });
        assert_eq!(envelope.event_type, "interim");
        assert_eq!(envelope.payload["tool"], "generate_image");
        assert!(envelope.payload.get("type").is_none());
        assert!(envelope.emitted_at <= Utc::now());
    }

    #[test]
    fn turn_errors_map_to_http_statuses() {
        assert_eq!(turn_error(TurnError::Busy).0, StatusCode::CONFLICT);
        assert_eq!(
            turn_error(TurnError::Unavailable {
                reason: "awaiting decision".to_string()
            })
            .0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            turn_error(TurnError::EmptyMessage).0,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn send_message_is_accepted_then_busy_while_processing() {
        let h = booted(ScriptedModel::repeating(ModelResponse::text("hi"))).await;
        let state = server_state(h.agent.clone());

        let guard = h.agent.begin_turn().await.unwrap();
        let busy = send_message(
            State(state.clone()),
            Json(SendMessageRequest {
                text: "hello".to_string(),
                attachment: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(busy.0, StatusCode::CONFLICT);
        drop(guard);

        let (status, _) = send_message(
            State(state.clone()),
            Json(SendMessageRequest {
                text: "hello".to_string(),
                attachment: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        for _ in 0..50 {
            if h.agent.snapshot().await.chat_history.len() == 2 && !h.agent.is_processing() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let Json(chat) = get_chat(State(state), Query(LimitQuery { limit: Some(1) }))
            .await
            .unwrap();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].text(), "hi");
    }

    #[tokio::test]
    async fn invalid_attachment_is_rejected() {
        let h = booted(ScriptedModel::new(vec![])).await;
        let err = send_message(
            State(server_state(h.agent.clone())),
            Json(SendMessageRequest {
                text: String::new(),
                attachment: Some(AttachmentBody {
                    mime_type: "image/png".to_string(),
                    data: "not base64!".to_string(),
                }),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(!h.agent.is_processing());
    }

    #[tokio::test]
    async fn backups_round_trip_through_the_handlers() {
        let h = booted(ScriptedModel::new(vec![])).await;
        let state = server_state(h.agent.clone());
        let Json(created) = create_backup(State(state.clone())).await.unwrap();
        let Json(listed) = list_backups(State(state.clone())).await.unwrap();
        assert_eq!(listed, vec![created.key.clone()]);

        let Json(gate) = restore_backup(
            State(state),
            Json(RestoreRequest { key: created.key }),
        )
        .await
        .unwrap();
        assert_eq!(gate, BootGate::Ready);
    }
}
