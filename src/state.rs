//! Shared application state: the façade both transports call into, plus
//! the background tasks it owns.

use crate::backend::{ContainerBackend, DirectoryBackend, DockerCli, IsolationBackend};
use crate::config::{BackendKind, Config};
use crate::engine::{ExecutionEngine, Outcome, ProcessTable, StreamEvent};
use crate::error::{Error, Result};
use crate::pool::{SessionPool, FILL_INTERVAL};
use crate::session::{Session, SessionInfo, SessionStore, REAP_INTERVAL};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Longest command accepted from a client.
pub const MAX_COMMAND_LEN: usize = 4096;

/// A session the command path settled on.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub session: Session,
    /// The presented id was missing or expired and `session` replaced it.
    pub renewed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetails {
    pub session_id: String,
    pub user_id: String,
    pub created: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Milliseconds.
    pub expires_in: u64,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: &'static str,
    pub active_sessions: usize,
    pub running_commands: usize,
    pub pooled_sessions: usize,
    pub backend: BackendKind,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: Arc<dyn IsolationBackend>,
    pub sessions: Arc<SessionStore>,
    pub pool: Arc<SessionPool>,
    pub engine: Arc<ExecutionEngine>,
    containers: Option<Arc<ContainerBackend>>,
    shutdown: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AppState {
    /// Builds the backend named by `config` and loads persisted state.
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.user_data_dir).await?;
        match config.backend {
            BackendKind::Directory => {
                let backend = Arc::new(DirectoryBackend::new(
                    config.user_data_dir.clone(),
                    config.scripts_dir.clone(),
                    config.limits,
                ));
                Self::with_backend(config, backend, None).await
            }
            BackendKind::Container => {
                let containers = Arc::new(
                    ContainerBackend::open(
                        DockerCli::default(),
                        config.containers.clone(),
                        config.container_homes_dir(),
                        config.scripts_dir.clone(),
                        config.container_state_file(),
                    )
                    .await?,
                );
                let backend: Arc<dyn IsolationBackend> = containers.clone();
                Self::with_backend(config, backend, Some(containers)).await
            }
        }
    }

    /// Wires the rest of the state around an existing backend.
    pub async fn with_backend(
        config: Config,
        backend: Arc<dyn IsolationBackend>,
        containers: Option<Arc<ContainerBackend>>,
    ) -> Result<Self> {
        let processes = Arc::new(ProcessTable::with_backend(backend.clone()));
        let sessions = Arc::new(
            SessionStore::open(
                backend.clone(),
                processes.clone(),
                config.session_timeout(),
                config.session_state_file(),
            )
            .await?,
        );
        let pool = Arc::new(SessionPool::new(backend.clone(), &config.pool));
        let engine = Arc::new(ExecutionEngine::new(&config, backend.clone(), processes));
        info!(backend = ?config.backend, data_dir = %config.user_data_dir.display(), "State ready");
        Ok(Self {
            config: Arc::new(config),
            backend,
            sessions,
            pool,
            engine,
            containers,
            shutdown: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Starts the reaper and the pool filler.
    pub async fn start_background(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(
            self.sessions
                .clone()
                .spawn_reaper(REAP_INTERVAL, self.shutdown.child_token()),
        );
        if self.pool.is_enabled() {
            tasks.push(
                self.pool
                    .clone()
                    .spawn_filler(FILL_INTERVAL, self.shutdown.child_token()),
            );
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops background tasks, terminates running commands and flushes state.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        let terminated = self.engine.processes().terminate_all().await;
        self.pool.drain().await;
        self.sessions.persist().await;
        if let Err(e) = self.backend.shutdown().await {
            warn!(error = %e, "Backend shutdown failed");
        }
        info!(terminated, "Shutdown complete");
    }

    /// Stops every pooled container. No-op for the directory backend.
    pub async fn stop_containers(&self) -> Result<()> {
        match &self.containers {
            Some(containers) => containers.stop_all().await,
            None => Ok(()),
        }
    }

    pub async fn create_session(
        &self,
        user_id: Option<&str>,
        client_ip: &str,
        preserve_data: bool,
    ) -> Result<SessionInfo> {
        let session = self.open_session(user_id, client_ip, preserve_data).await?;
        Ok(self.sessions.info(&session))
    }

    async fn open_session(&self, user_id: Option<&str>, client_ip: &str, preserve_data: bool) -> Result<Session> {
        let user_id = match user_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let session = match self.pool.take().await {
            Some(slot) => {
                self.sessions
                    .adopt(slot, &user_id, client_ip, preserve_data)
                    .await
            }
            None => {
                self.sessions
                    .create(&user_id, client_ip, preserve_data)
                    .await?
            }
        };
        if self.pool.is_enabled() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.fill().await;
            });
        }
        Ok(session)
    }

    /// Live session for a command, renewing it when the presented id is gone.
    /// A known `user_hint` reconnects to that user's latest session first.
    pub async fn session_for_command(
        &self,
        session_id: Option<&str>,
        user_hint: Option<&str>,
        client_ip: &str,
    ) -> Result<ResolvedSession> {
        if let Some(id) = session_id.filter(|id| !id.is_empty()) {
            if let Some(session) = self.sessions.get(id).await {
                return Ok(ResolvedSession {
                    session,
                    renewed: false,
                });
            }
        }
        if let Some(user_id) = user_hint {
            if let Some(session) = self.sessions.find_by_user(user_id).await {
                info!(session_id = %session.id, user_id, "Reconnected user to existing session");
                return Ok(ResolvedSession {
                    renewed: session_id != Some(session.id.as_str()),
                    session,
                });
            }
        }
        let session = self.open_session(user_hint, client_ip, false).await?;
        info!(session_id = %session.id, previous = ?session_id, "Session renewed");
        Ok(ResolvedSession {
            session,
            renewed: true,
        })
    }

    /// Runs `command` in a known session. No renewal.
    pub async fn execute_command(&self, session_id: &str, command: &str) -> Result<Outcome> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or(Error::InvalidSession)?;
        self.execute(&session, command).await
    }

    pub async fn execute(&self, session: &Session, command: &str) -> Result<Outcome> {
        check_length(command)?;
        self.sessions.touch(&session.id).await;
        info!(
            session_id = %session.id,
            user_id = %session.user_id,
            client_ip = %session.client_ip,
            command = %command,
            "Executing command"
        );
        self.engine.run(session, command).await
    }

    /// Streaming variant; events arrive on `tx`.
    pub async fn execute_stream(
        &self,
        session: &Session,
        command: &str,
        tx: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<()> {
        check_length(command)?;
        self.sessions.touch(&session.id).await;
        info!(
            session_id = %session.id,
            user_id = %session.user_id,
            client_ip = %session.client_ip,
            command = %command,
            "Streaming command"
        );
        self.engine.run_stream(session, command, tx).await
    }

    pub async fn end_session(&self, session_id: &str, preserve_data: bool) -> Result<bool> {
        self.sessions.end(session_id, preserve_data).await
    }

    pub async fn session_details(&self, session_id: &str) -> Option<SessionDetails> {
        let session = self.sessions.get(session_id).await?;
        let now = Utc::now();
        Some(SessionDetails {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            created: session.created,
            last_accessed: session.last_accessed,
            expires_in: session.expires_in(now, self.sessions.timeout()).as_millis() as u64,
            running: self.engine.is_running(&session.id).await,
        })
    }

    pub async fn health(&self) -> Health {
        Health {
            status: "ok",
            active_sessions: self.sessions.len().await,
            running_commands: self.engine.processes().len().await,
            pooled_sessions: self.pool.len().await,
            backend: self.config.backend,
        }
    }

    /// Session timeout, for clients that schedule keep-alives.
    pub fn session_timeout(&self) -> Duration {
        self.config.session_timeout()
    }
}

fn check_length(command: &str) -> Result<()> {
    if command.len() > MAX_COMMAND_LEN {
        return Err(Error::Forbidden(format!(
            "Command too long (maximum {MAX_COMMAND_LEN} characters)"
        )));
    }
    Ok(())
}
