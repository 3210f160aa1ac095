//! HTTP server implementation using Axum.

use crate::error::{Error, Result};
use crate::log_stream::{self, LogTransport};
use crate::process::{self, ExecuteRequest, ExecuteResponse};
use crate::session::logs::{self, LogDecoder, LogFollower};
use crate::session::{
    CommandInfo, CommandState, CreateSessionRequest, SessionExecuteRequest,
    SessionExecuteResponse, SessionInfo, SessionService, WriteInputRequest,
};
use crate::state::AppState;
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const LOG_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default)]
    follow: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Stateless execution
        .route("/process/execute", post(execute_command))
        // Session management
        .route("/process/session", post(create_session).get(list_sessions))
        .route(
            "/process/session/:session_id",
            get(get_session).delete(delete_session),
        )
        .route("/process/session/:session_id/exec", post(execute_session_command))
        .route(
            "/process/session/:session_id/command/:command_id",
            get(get_session_command),
        )
        .route(
            "/process/session/:session_id/command/:command_id/input",
            post(write_input),
        )
        .route(
            "/process/session/:session_id/command/:command_id/logs",
            get(get_command_logs),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port until SIGINT/SIGTERM, then tear
/// down all sessions.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let sessions = state.sessions.clone();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, terminating sessions");
    sessions.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn execute_command(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>> {
    let Json(req) = payload?;
    info!("POST /process/execute - command: {:?}", req.command);
    let response = process::execute(req, &state.terminator, state.execute_timeout).await?;
    info!("POST /process/execute - exit={}", response.exit_code);
    Ok(Json(response))
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<StatusCode> {
    let Json(req) = payload?;
    if req.session_id.trim().is_empty() {
        return Err(Error::BadRequest("sessionId is required".to_string()));
    }
    let is_legacy = log_stream::is_legacy_client(&headers);
    state.sessions.create(&req.session_id, is_legacy).await?;
    Ok(StatusCode::CREATED)
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>> {
    Ok(Json(state.sessions.get(&session_id).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode> {
    state.sessions.delete(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn execute_session_command(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    payload: std::result::Result<Json<SessionExecuteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionExecuteResponse>)> {
    let Json(req) = payload?;
    let status = if req.run_async {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    let response = state.sessions.execute(&session_id, req).await?;
    Ok((status, Json(response)))
}

async fn get_session_command(
    State(state): State<AppState>,
    Path((session_id, command_id)): Path<(String, String)>,
) -> Result<Json<CommandInfo>> {
    Ok(Json(state.sessions.get_command(&session_id, &command_id).await?))
}

async fn write_input(
    State(state): State<AppState>,
    Path((session_id, command_id)): Path<(String, String)>,
    payload: std::result::Result<Json<WriteInputRequest>, JsonRejection>,
) -> Result<StatusCode> {
    let Json(req) = payload?;
    state
        .sessions
        .write_input(&session_id, &command_id, &req.input)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_command_logs(
    State(state): State<AppState>,
    Path((session_id, command_id)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response> {
    let follow = query.follow.as_deref() == Some("true");
    let negotiation = log_stream::negotiate(&headers, follow);
    let combined = negotiation.combined_output;
    let paths = state.sessions.command_paths(&session_id, &command_id).await?;

    match negotiation.transport {
        LogTransport::Fetch => {
            let log = logs::read_log(&paths.output_log())
                .await
                .map_err(|e| Error::Internal(format!("failed to read logs: {}", e)))?;
            let body = if combined { logs::strip_markers(&log) } else { log };
            Ok(String::from_utf8_lossy(&body).into_owned().into_response())
        }
        LogTransport::WebSocket { follow } => {
            let ws = ws.ok_or_else(|| {
                Error::BadRequest("invalid websocket upgrade request".to_string())
            })?;
            let stream = LogStream {
                sessions: state.sessions.clone(),
                session_id,
                command_id,
                log_path: paths.output_log(),
                combined,
                follow,
            };
            Ok(ws
                .protocols(negotiation.subprotocols)
                .on_upgrade(move |socket| stream.run(socket)))
        }
    }
}

/// Streams a command log over a WebSocket.
struct LogStream {
    sessions: Arc<SessionService>,
    session_id: String,
    command_id: String,
    log_path: PathBuf,
    combined: bool,
    follow: bool,
}

impl LogStream {
    async fn run(self, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();
        let mut follower = LogFollower::new(&self.log_path);
        let mut decoder = LogDecoder::new();
        let mut ticker = interval(LOG_POLL_INTERVAL);

        loop {
            tokio::select! {
                msg = receiver.next() => match msg {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                        debug!(command_id = %self.command_id, "log stream closed by client");
                        return;
                    }
                    Some(Ok(_)) => {}
                },
                _ = ticker.tick() => {
                    // Checked before reading so the last read sees all output.
                    let finished = !self.follow || !matches!(
                        self.sessions.command_state(&self.session_id, &self.command_id).await,
                        Some(CommandState::Running)
                    );

                    let chunk = match follower.read_new().await {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            warn!(command_id = %self.command_id, error = %e, "failed to read command log");
                            break;
                        }
                    };
                    let payload = if self.combined { decoder.strip(&chunk) } else { chunk };
                    if !payload.is_empty() && sender.send(log_message(payload)).await.is_err() {
                        return;
                    }

                    if finished {
                        break;
                    }
                }
            }
        }

        if self.combined {
            let rest: Vec<u8> = decoder.finish().into_iter().flat_map(|(_, b)| b).collect();
            if !rest.is_empty() && sender.send(log_message(rest)).await.is_err() {
                return;
            }
        }
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .await;
    }
}

fn log_message(payload: Vec<u8>) -> Message {
    match String::from_utf8(payload) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}
