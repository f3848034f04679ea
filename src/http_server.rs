//! HTTP server implementation using Axum.

use crate::engine::{FifoPair, Outcome};
use crate::error::{Error, Result};
use crate::state::{AppState, ResolvedSession};
use crate::ws_server;
use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const SESSION_ID_HEADER: &str = "x-session-id";
const SESSION_DATA_HEADER: &str = "x-session-data";

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    user_id: Option<String>,
    #[serde(default)]
    preserve_data: bool,
}

#[derive(Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    command: String,
}

/// Body of `X-Session-Data`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionData {
    user_id: Option<String>,
}

#[derive(Deserialize)]
struct EndSessionQuery {
    #[serde(default)]
    preserve: bool,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct Renewal {
    session_renewed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_session_id: Option<String>,
}

impl From<&ResolvedSession> for Renewal {
    fn from(resolved: &ResolvedSession) -> Self {
        Self {
            session_renewed: resolved.renewed,
            new_session_id: resolved.renewed.then(|| resolved.session.id.clone()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    output: String,
    exit_code: i32,
    #[serde(flatten)]
    renewal: Renewal,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InteractiveResponse {
    interactive: bool,
    #[serde(flatten)]
    fifos: FifoPair,
    #[serde(flatten)]
    renewal: Renewal,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    exit_code: i32,
    #[serde(flatten)]
    renewal: Option<Renewal>,
}

/// Error as sent over HTTP, optionally annotated with a session renewal.
pub struct ApiError {
    error: Error,
    renewal: Option<Renewal>,
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            error,
            renewal: None,
        }
    }
}

/// Status code an error maps to.
pub fn status_of(error: &Error) -> StatusCode {
    match error {
        Error::InvalidSession => StatusCode::UNAUTHORIZED,
        Error::Forbidden(_) | Error::PathTraversal(_) => StatusCode::FORBIDDEN,
        Error::ExecutionTimeout(_) => StatusCode::REQUEST_TIMEOUT,
        Error::ExecutionFailed { .. } => StatusCode::BAD_REQUEST,
        Error::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Container(_) | Error::Io(_) | Error::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_of(&self.error);
        if status.is_server_error() {
            warn!(error = %self.error, "Request failed");
        }
        let body = ErrorBody {
            error: self.error.to_string(),
            exit_code: self.error.exit_code(),
            renewal: self.renewal,
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/create-session", post(create_session))
        .route("/execute-command", post(execute_command))
        .route("/session", get(get_session).delete(end_session))
        .route("/health", get(health))
        .route("/ws", get(ws_server::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves `state` on `listener` until `signal` resolves. Background tasks
/// are not started here.
pub async fn serve<F>(listener: TcpListener, state: AppState, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = state.shutdown_token();
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            // Lets open WebSocket loops notice and close.
            token.cancel();
        })
        .await?;
    Ok(())
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, backend = ?state.config.backend, "Starting HTTP server");

    state.start_background().await;
    serve(listener, state.clone(), shutdown_signal()).await?;
    state.shutdown().await;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health().await)
}

async fn create_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Option<Json<CreateSessionRequest>>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let info = state
        .create_session(req.user_id.as_deref(), &addr.ip().to_string(), req.preserve_data)
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn execute_command(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<ExecuteRequest>,
) -> std::result::Result<Response, ApiError> {
    let command = req.command.trim();
    if command.is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "No command provided".to_string(),
                exit_code: 1,
                renewal: None,
            }),
        )
            .into_response());
    }

    let session_id = header_str(&headers, SESSION_ID_HEADER);
    let user_hint = header_str(&headers, SESSION_DATA_HEADER)
        .and_then(|raw| serde_json::from_str::<SessionData>(raw).ok())
        .and_then(|data| data.user_id);

    let resolved = state
        .session_for_command(session_id, user_hint.as_deref(), &addr.ip().to_string())
        .await?;

    match state.execute(&resolved.session, command).await {
        Ok(Outcome::Completed { output, exit_code }) => Ok(Json(ExecuteResponse {
            output,
            exit_code,
            renewal: Renewal::from(&resolved),
        })
        .into_response()),
        Ok(Outcome::Interactive(fifos)) => Ok(Json(InteractiveResponse {
            interactive: true,
            fifos,
            renewal: Renewal::from(&resolved),
        })
        .into_response()),
        Err(error) => Err(ApiError {
            error,
            renewal: Some(Renewal::from(&resolved)),
        }),
    }
}

async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let session_id = header_str(&headers, SESSION_ID_HEADER).ok_or(Error::InvalidSession)?;
    let details = state
        .session_details(session_id)
        .await
        .ok_or(Error::InvalidSession)?;
    Ok(Json(details))
}

async fn end_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EndSessionQuery>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let session_id = header_str(&headers, SESSION_ID_HEADER).ok_or(Error::InvalidSession)?;
    if !state.end_session(session_id, query.preserve).await? {
        return Err(Error::InvalidSession.into());
    }
    Ok(Json(serde_json::json!({ "success": true })))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}
