//! Session records, expiry, and the persisted session table.

use crate::backend::{BackendHandle, IsolationBackend};
use crate::engine::ProcessTable;
use crate::error::{Error, Result};
use crate::paths::{read_json, write_json_atomic};
use crate::pool::PoolSlot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reaper period.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub client_ip: String,
    pub created: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub handle: BackendHandle,
    /// Keep the home on disk when the session ends or expires.
    pub preserve_on_delete: bool,
}

impl Session {
    pub fn home_dir(&self) -> &Path {
        self.handle.host_home()
    }

    pub fn idle(&self, now: DateTime<Utc>) -> Duration {
        // A clock step backwards counts as no idle time.
        (now - self.last_accessed).to_std().unwrap_or_default()
    }

    pub fn is_live(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.idle(now) < timeout
    }

    pub fn expires_in(&self, now: DateTime<Utc>, timeout: Duration) -> Duration {
        timeout.saturating_sub(self.idle(now))
    }

    fn refresh(&mut self, now: DateTime<Utc>) {
        if now > self.last_accessed {
            self.last_accessed = now;
        }
    }
}

/// What `create` hands back to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub created: DateTime<Utc>,
    /// Milliseconds.
    pub expires_in: u64,
    pub working_directory: String,
}

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<String, Session>,
    /// Most recent session per user, for reconnects.
    user_sessions: HashMap<String, String>,
}

impl Tables {
    fn remove(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        if self.user_sessions.get(&session.user_id).map(String::as_str) == Some(session_id) {
            self.user_sessions.remove(&session.user_id);
        }
        Some(session)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedTable {
    sessions: HashMap<String, SessionRecord>,
    user_sessions: HashMap<String, String>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    user_id: String,
    client_ip: String,
    created: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    home_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    container: Option<ContainerSlot>,
    #[serde(default)]
    preserve_on_delete: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerSlot {
    container_id: String,
    linux_user: String,
    uid: u32,
}

impl From<&Session> for SessionRecord {
    fn from(session: &Session) -> Self {
        let container = match &session.handle {
            BackendHandle::Directory { .. } => None,
            BackendHandle::Container {
                container_id,
                linux_user,
                uid,
                ..
            } => Some(ContainerSlot {
                container_id: container_id.clone(),
                linux_user: linux_user.clone(),
                uid: *uid,
            }),
        };
        Self {
            user_id: session.user_id.clone(),
            client_ip: session.client_ip.clone(),
            created: session.created,
            last_accessed: session.last_accessed,
            home_dir: session.home_dir().to_path_buf(),
            container,
            preserve_on_delete: session.preserve_on_delete,
        }
    }
}

impl SessionRecord {
    fn into_session(self, id: String) -> Session {
        let handle = match self.container {
            None => BackendHandle::Directory {
                home_dir: self.home_dir,
            },
            Some(slot) => BackendHandle::Container {
                container_id: slot.container_id,
                linux_user: slot.linux_user,
                uid: slot.uid,
                home_dir: self.home_dir,
            },
        };
        Session {
            id,
            user_id: self.user_id,
            client_ip: self.client_ip,
            created: self.created,
            last_accessed: self.last_accessed,
            handle,
            preserve_on_delete: self.preserve_on_delete,
        }
    }
}

/// Owns every session. Expired entries are evicted lazily on read and
/// eagerly by the reaper.
pub struct SessionStore {
    backend: Arc<dyn IsolationBackend>,
    processes: Arc<ProcessTable>,
    timeout: Duration,
    state_file: PathBuf,
    tables: RwLock<Tables>,
    persist_lock: Mutex<()>,
}

impl SessionStore {
    /// Reloads the persisted table, dropping sessions whose backend target
    /// has disappeared.
    pub async fn open(
        backend: Arc<dyn IsolationBackend>,
        processes: Arc<ProcessTable>,
        timeout: Duration,
        state_file: PathBuf,
    ) -> Result<Self> {
        let persisted = match read_json::<PersistedTable>(&state_file).await {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, file = %state_file.display(), "Ignoring unreadable session table");
                None
            }
        };

        let mut tables = Tables::default();
        if let Some(persisted) = persisted {
            for (id, record) in persisted.sessions {
                let session = record.into_session(id.clone());
                if backend.handle_exists(&session.handle).await {
                    tables.sessions.insert(id, session);
                } else {
                    debug!(session_id = %id, "Dropping session with missing home");
                }
            }
            tables.user_sessions = persisted
                .user_sessions
                .into_iter()
                .filter(|(_, id)| tables.sessions.contains_key(id))
                .collect();
        }
        info!(sessions = tables.sessions.len(), "Session table loaded");

        let store = Self {
            backend,
            processes,
            timeout,
            state_file,
            tables: RwLock::new(tables),
            persist_lock: Mutex::new(()),
        };
        store.persist().await;
        Ok(store)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Allocates and initializes a fresh session.
    pub async fn create(&self, user_id: &str, client_ip: &str, preserve_on_delete: bool) -> Result<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let handle = self.backend.resolve(&id, user_id).await?;
        if let Err(e) = self.backend.initialize(&handle).await {
            error!(session_id = %id, error = %e, "Session initialization failed");
            if let Err(e) = self.backend.release(&handle, false).await {
                warn!(session_id = %id, error = %e, "Release after failed initialization");
            }
            return Err(match e {
                Error::BackendUnavailable(_) => e,
                other => Error::BackendUnavailable(other.to_string()),
            });
        }
        Ok(self.insert(id, handle, user_id, client_ip, preserve_on_delete).await)
    }

    /// Binds a pre-warmed slot to a caller.
    pub async fn adopt(&self, slot: PoolSlot, user_id: &str, client_ip: &str, preserve_on_delete: bool) -> Session {
        self.insert(slot.id, slot.handle, user_id, client_ip, preserve_on_delete)
            .await
    }

    async fn insert(
        &self,
        id: String,
        handle: BackendHandle,
        user_id: &str,
        client_ip: &str,
        preserve_on_delete: bool,
    ) -> Session {
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            user_id: user_id.to_string(),
            client_ip: client_ip.to_string(),
            created: now,
            last_accessed: now,
            handle,
            preserve_on_delete,
        };
        {
            let mut tables = self.tables.write().await;
            tables.sessions.insert(id.clone(), session.clone());
            tables.user_sessions.insert(user_id.to_string(), id.clone());
        }
        info!(session_id = %id, user_id, client_ip, "Created session");
        self.persist().await;
        session
    }

    pub fn info(&self, session: &Session) -> SessionInfo {
        SessionInfo {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            created: session.created,
            expires_in: session.expires_in(Utc::now(), self.timeout).as_millis() as u64,
            working_directory: "~".to_string(),
        }
    }

    /// Live session by id, refreshing its last access. Expired sessions are
    /// evicted and reported as absent.
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        let now = Utc::now();
        let expired = {
            let mut tables = self.tables.write().await;
            let session = tables.sessions.get_mut(session_id)?;
            if session.is_live(now, self.timeout) {
                session.refresh(now);
                let session = session.clone();
                tables
                    .user_sessions
                    .insert(session.user_id.clone(), session.id.clone());
                return Some(session);
            }
            tables.remove(session_id)?
        };
        info!(session_id, user_id = %expired.user_id, "Session expired on access");
        self.dispose(&expired).await;
        self.persist().await;
        None
    }

    /// Refreshes last access. False if the session is unknown.
    pub async fn touch(&self, session_id: &str) -> bool {
        let now = Utc::now();
        match self.tables.write().await.sessions.get_mut(session_id) {
            Some(session) => {
                session.refresh(now);
                true
            }
            None => false,
        }
    }

    /// Last live session of a user, for clients that lost their id.
    pub async fn find_by_user(&self, user_id: &str) -> Option<Session> {
        let id = self.tables.read().await.user_sessions.get(user_id).cloned()?;
        self.get(&id).await
    }

    /// Removes a session, wiping its data unless `preserve_data` or the
    /// session's own flag says otherwise.
    pub async fn end(&self, session_id: &str, preserve_data: bool) -> Result<bool> {
        let Some(mut session) = self.tables.write().await.remove(session_id) else {
            return Ok(false);
        };
        session.preserve_on_delete |= preserve_data;
        info!(session_id, preserve = session.preserve_on_delete, "Ending session");
        self.processes.terminate(session_id).await;
        let released = self
            .backend
            .release(&session.handle, session.preserve_on_delete)
            .await;
        self.persist().await;
        released.map(|_| true)
    }

    /// Evicts every expired session. Returns how many were removed.
    pub async fn reap(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Session> = {
            let mut tables = self.tables.write().await;
            let ids: Vec<String> = tables
                .sessions
                .values()
                .filter(|s| !s.is_live(now, self.timeout))
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| tables.remove(id)).collect()
        };
        if expired.is_empty() {
            return 0;
        }
        for session in &expired {
            info!(session_id = %session.id, user_id = %session.user_id, "Reaping expired session");
            self.dispose(session).await;
        }
        self.persist().await;
        expired.len()
    }

    /// Runs `reap` every `period` until `cancel` fires.
    pub fn spawn_reaper(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let reaped = self.reap().await;
                        if reaped > 0 {
                            info!(reaped, "Expired sessions cleaned up");
                        }
                    }
                }
            }
            debug!("Reaper stopped");
        })
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn dispose(&self, session: &Session) {
        self.processes.terminate(&session.id).await;
        if let Err(e) = self
            .backend
            .release(&session.handle, session.preserve_on_delete)
            .await
        {
            warn!(session_id = %session.id, error = %e, "Failed to release session");
        }
    }

    /// Best effort; failures are logged.
    pub async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let table = {
            let tables = self.tables.read().await;
            PersistedTable {
                sessions: tables
                    .sessions
                    .iter()
                    .map(|(id, s)| (id.clone(), SessionRecord::from(s)))
                    .collect(),
                user_sessions: tables.user_sessions.clone(),
                timestamp: Utc::now(),
            }
        };
        if let Err(e) = write_json_atomic(&self.state_file, &table).await {
            error!(error = %e, file = %self.state_file.display(), "Failed to persist session table");
        }
    }
}
