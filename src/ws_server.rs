//! Streaming command transport over WebSocket.
//!
//! Clients send `{"type":"execute","command":...}` or `{"type":"terminate"}`
//! and receive `output` chunks followed by a single `complete` (or
//! `interactive`, or `error`) per command. A connection tracks one session,
//! renewing it transparently when it expires.

use crate::backend::StreamKind;
use crate::engine::StreamEvent;
use crate::error::Error;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long queued frames may take to flush once the connection winds down.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    session_id: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Execute {
        command: String,
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
        #[serde(default, rename = "userId")]
        user_id: Option<String>,
    },
    Terminate,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage {
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
        renewed: bool,
    },
    Output {
        stream: StreamKind,
        data: String,
    },
    Interactive {
        #[serde(rename = "cmdFifo")]
        cmd_fifo: String,
        #[serde(rename = "respFifo")]
        resp_fifo: String,
    },
    Cwd {
        path: String,
    },
    Complete {
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    Error {
        error: String,
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
}

impl From<StreamEvent> for ServerMessage {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Output { stream, text } => ServerMessage::Output { stream, data: text },
            StreamEvent::Interactive(fifos) => ServerMessage::Interactive {
                cmd_fifo: fifos.cmd_fifo,
                resp_fifo: fifos.resp_fifo,
            },
            StreamEvent::WorkingDirectory(path) => ServerMessage::Cwd { path },
            StreamEvent::Complete { exit_code } => ServerMessage::Complete { exit_code },
        }
    }
}

impl From<&Error> for ServerMessage {
    fn from(error: &Error) -> Self {
        ServerMessage::Error {
            error: error.to_string(),
            exit_code: error.exit_code(),
        }
    }
}

/// WebSocket upgrade handler.
///
/// GET /ws?sessionId=..&userId=..
pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    query: Option<Query<ConnectQuery>>,
    ws: WebSocketUpgrade,
) -> Response {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    let client_ip = addr.ip().to_string();
    ws.on_upgrade(move |socket| handle_connection(socket, state, client_ip, query))
}

async fn handle_connection(socket: WebSocket, state: AppState, client_ip: String, query: ConnectQuery) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let mut session_id = query.session_id;
    let user_id = query.user_id;
    let shutdown = state.shutdown_token();
    debug!(client_ip = %client_ip, "WebSocket connected");

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = receiver.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "WebSocket receive failed");
                break;
            }
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Execute {
                command,
                session_id: requested,
                user_id: hint,
            }) => {
                if requested.is_some() {
                    session_id = requested;
                }
                let hint = hint.or_else(|| user_id.clone());
                session_id = execute(
                    &state,
                    session_id.take(),
                    hint.as_deref(),
                    &client_ip,
                    &command,
                    &out_tx,
                )
                .await;
            }
            Ok(ClientMessage::Terminate) => {
                if let Some(id) = &session_id {
                    if state.engine.terminate(id).await {
                        info!(session_id = %id, "Command terminated by client");
                    }
                }
            }
            Err(e) => {
                let _ = out_tx.send(ServerMessage::Error {
                    error: format!("Invalid message: {e}"),
                    exit_code: 1,
                });
            }
        }
    }

    if let Some(id) = &session_id {
        if state.engine.terminate(id).await {
            info!(session_id = %id, "Terminated command of closed connection");
        }
    }
    drop(out_tx);
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
    debug!(client_ip = %client_ip, "WebSocket closed");
}

/// Starts one command and returns the session id the connection now uses.
async fn execute(
    state: &AppState,
    session_id: Option<String>,
    user_hint: Option<&str>,
    client_ip: &str,
    command: &str,
    out: &mpsc::UnboundedSender<ServerMessage>,
) -> Option<String> {
    let command = command.trim();
    if command.is_empty() {
        let _ = out.send(ServerMessage::Error {
            error: "No command provided".to_string(),
            exit_code: 1,
        });
        return session_id;
    }

    let resolved = match state
        .session_for_command(session_id.as_deref(), user_hint, client_ip)
        .await
    {
        Ok(resolved) => resolved,
        Err(e) => {
            let _ = out.send(ServerMessage::from(&e));
            return session_id;
        }
    };
    let id = resolved.session.id.clone();

    if resolved.renewed {
        let _ = out.send(ServerMessage::Session {
            session_id: id.clone(),
            renewed: session_id.is_some(),
        });
        if session_id.is_some() {
            let short: String = id.chars().take(8).collect();
            let _ = out.send(ServerMessage::Output {
                stream: StreamKind::Stdout,
                data: format!("Session expired. Created new session: {short}...\n"),
            });
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Err(e) = state.execute_stream(&resolved.session, command, tx).await {
        let _ = out.send(ServerMessage::from(&e));
        return Some(id);
    }

    let out = out.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if out.send(ServerMessage::from(event)).is_err() {
                break;
            }
        }
    });
    Some(id)
}
