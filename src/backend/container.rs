//! Container isolation: a pool of long-lived containers shared by many users,
//! each user mapped to a stable Linux account inside one of them.
//!
//! Allocation state (`containers`, `user_map`) lives behind one mutex and is
//! persisted after every change. Commands are spawned outside the lock.

use super::directory::{bootstrap_home, SYSTEM_PATH};
use super::{spawn_command, BackendHandle, Env, IsolationBackend, SpawnedProcess};
use crate::config::{BackendKind, ContainerConfig, OverflowPolicy};
use crate::error::{Error, Result};
use crate::paths::{read_json, write_json_atomic};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const CREATE_USER_SCRIPT: &str = "/usr/local/bin/create-user.sh";
const WORKSPACE_VOLUME: &str = "isoterm-workspace";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
}

/// What a new pooled container is started with.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    /// Host directory mounted at `/home`.
    pub homes_dir: PathBuf,
    pub memory: String,
    pub cpu_quota: u64,
}

/// Container engine operations the pool needs.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Starts a detached container and returns its id.
    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String>;

    /// `None` when the container does not exist.
    async fn status(&self, id: &str) -> Result<Option<ContainerStatus>>;

    async fn restart(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    /// Runs `argv` as root inside the container, returning exit code and output.
    async fn exec_as_root(&self, id: &str, argv: &[&str]) -> Result<(i32, String)>;

    /// Signals every process `user` owns inside the container.
    async fn terminate_user(&self, id: &str, user: &str) -> Result<()>;

    /// Builds (without spawning) a command that runs `script` under bash as
    /// `user` inside the container.
    fn exec_command(&self, id: &str, user: &str, workdir: &Path, env: &Env, script: &str) -> Command;
}

/// Drives the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    /// Any docker-compatible CLI, e.g. `podman`.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Container(format!("{} {}: {e}", self.binary, args.join(" "))))
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        let homes = format!("{}:/home", spec.homes_dir.display());
        let workspace = format!("{WORKSPACE_VOLUME}:/workspace");
        let cpu_quota = spec.cpu_quota.to_string();
        let args = [
            "run",
            "-d",
            "--name",
            name,
            "-v",
            homes.as_str(),
            "-v",
            workspace.as_str(),
            "--memory",
            spec.memory.as_str(),
            "--cpu-quota",
            cpu_quota.as_str(),
            "--network",
            "bridge",
            "--restart",
            "unless-stopped",
            spec.image.as_str(),
        ];
        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Container(format!("docker run failed: {}", stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn status(&self, id: &str) -> Result<Option<ContainerStatus>> {
        let output = self
            .run(&["inspect", "--format", "{{.State.Running}}", id])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
        Ok(Some(if running {
            ContainerStatus::Running
        } else {
            ContainerStatus::Stopped
        }))
    }

    async fn restart(&self, id: &str) -> Result<()> {
        let output = self.run(&["restart", id]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Container(format!("docker restart failed: {}", stderr.trim())));
        }
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let output = self.run(&["stop", id]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Container(format!("docker stop failed: {}", stderr.trim())));
        }
        Ok(())
    }

    async fn exec_as_root(&self, id: &str, argv: &[&str]) -> Result<(i32, String)> {
        let mut args = vec!["exec", "-u", "root", id];
        args.extend_from_slice(argv);
        let output = self.run(&args).await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.code().unwrap_or(-1), text))
    }

    async fn terminate_user(&self, id: &str, user: &str) -> Result<()> {
        // pkill exits 1 when nothing matched.
        match self.exec_as_root(id, &["pkill", "-TERM", "-u", user]).await? {
            (0 | 1, _) => Ok(()),
            (code, output) => Err(Error::Container(format!(
                "pkill for {user} exited {code}: {}",
                output.trim()
            ))),
        }
    }

    fn exec_command(&self, id: &str, user: &str, workdir: &Path, env: &Env, script: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec").arg("-u").arg(user).arg("-w").arg(workdir);
        for (k, v) in env {
            cmd.arg("-e").arg(format!("{k}={v}"));
        }
        cmd.arg(id).arg("bash").arg("-c").arg(script);
        cmd
    }
}

/// Snapshot of one pooled container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub id: String,
    pub status: Option<ContainerStatus>,
    pub users: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolState {
    containers: Vec<String>,
    /// user id -> (container id, linux username)
    user_map: HashMap<String, (String, String)>,
}

impl PoolState {
    fn load_of(&self, container_id: &str) -> usize {
        self.user_map
            .values()
            .filter(|(cid, _)| cid == container_id)
            .count()
    }
}

/// Linux account for a logical user: `user<m>` with uid `2000 + m`, where
/// `m` comes from a SHA-256 of the user id so it survives restarts. Users
/// that collide share one consistent account.
pub fn linux_identity(user_id: &str) -> (String, u32) {
    let digest = Sha256::digest(user_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let m = (u64::from_be_bytes(head) % 8000) as u32;
    (format!("user{m}"), 2000 + m)
}

pub struct ContainerBackend<R = DockerCli> {
    runtime: R,
    config: ContainerConfig,
    spec: ContainerSpec,
    scripts_dir: PathBuf,
    state_file: PathBuf,
    pool: Mutex<PoolState>,
}

impl<R: ContainerRuntime> ContainerBackend<R> {
    /// Loads persisted pool state and drops containers that are gone.
    pub async fn open(
        runtime: R,
        config: ContainerConfig,
        homes_dir: PathBuf,
        scripts_dir: PathBuf,
        state_file: PathBuf,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&homes_dir).await?;
        let state = match read_json::<PoolState>(&state_file).await {
            Ok(Some(state)) => state,
            Ok(None) => PoolState::default(),
            Err(e) => {
                warn!(error = %e, file = %state_file.display(), "Ignoring unreadable container state");
                PoolState::default()
            }
        };
        let spec = ContainerSpec {
            image: config.container_image.clone(),
            homes_dir,
            memory: "512m".to_string(),
            cpu_quota: 50_000,
        };
        let backend = Self {
            runtime,
            config,
            spec,
            scripts_dir,
            state_file,
            pool: Mutex::new(state),
        };
        {
            let mut pool = backend.pool.lock().await;
            backend.verify(&mut pool).await;
            backend.save(&pool).await;
            info!(containers = pool.containers.len(), users = pool.user_map.len(), "Container pool loaded");
        }
        Ok(backend)
    }

    pub async fn containers(&self) -> Vec<ContainerRecord> {
        let pool = self.pool.lock().await;
        let mut records = Vec::with_capacity(pool.containers.len());
        for id in &pool.containers {
            let status = self.runtime.status(id).await.unwrap_or(None);
            records.push(ContainerRecord {
                id: id.clone(),
                status,
                users: pool.load_of(id),
            });
        }
        records
    }

    /// Current `(container id, linux username)` for a user, if assigned.
    pub async fn assignment(&self, user_id: &str) -> Option<(String, String)> {
        self.pool.lock().await.user_map.get(user_id).cloned()
    }

    /// Stops every pooled container and forgets them. Assignments are kept
    /// so users land on the same account once containers are recreated.
    pub async fn stop_all(&self) -> Result<()> {
        let mut pool = self.pool.lock().await;
        for id in pool.containers.drain(..) {
            match self.runtime.stop(&id).await {
                Ok(()) => info!(container_id = %id, "Stopped container"),
                Err(e) => error!(container_id = %id, error = %e, "Failed to stop container"),
            }
        }
        self.save(&pool).await;
        Ok(())
    }

    /// Keeps running containers, restarts stopped ones once and evicts the
    /// rest. Returns the active set.
    async fn verify(&self, pool: &mut PoolState) -> Vec<String> {
        let mut active = Vec::with_capacity(pool.containers.len());
        for id in &pool.containers {
            match self.runtime.status(id).await {
                Ok(Some(ContainerStatus::Running)) => active.push(id.clone()),
                Ok(Some(ContainerStatus::Stopped)) => match self.runtime.restart(id).await {
                    Ok(()) => {
                        info!(container_id = %id, "Restarted stopped container");
                        active.push(id.clone());
                    }
                    Err(e) => warn!(container_id = %id, error = %e, "Evicting container after failed restart"),
                },
                Ok(None) => warn!(container_id = %id, "Evicting missing container"),
                Err(e) => warn!(container_id = %id, error = %e, "Evicting unreachable container"),
            }
        }
        pool.containers = active.clone();
        active
    }

    /// Whether `id` is usable, restarting it once if stopped. A container that
    /// is missing or will not restart is evicted from the pool.
    async fn revive(&self, pool: &mut PoolState, id: &str) -> bool {
        if !pool.containers.iter().any(|c| c == id) {
            return false;
        }
        let usable = match self.runtime.status(id).await {
            Ok(Some(ContainerStatus::Running)) => true,
            Ok(Some(ContainerStatus::Stopped)) => match self.runtime.restart(id).await {
                Ok(()) => {
                    info!(container_id = %id, "Restarted stopped container");
                    true
                }
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Evicting container after failed restart");
                    false
                }
            },
            Ok(None) => {
                warn!(container_id = %id, "Evicting missing container");
                false
            }
            Err(e) => {
                warn!(container_id = %id, error = %e, "Evicting unreachable container");
                false
            }
        };
        if !usable {
            pool.containers.retain(|c| c != id);
        }
        usable
    }

    async fn pick_container(&self, pool: &mut PoolState) -> Result<String> {
        let active = self.verify(pool).await;

        if !self.config.multi_container {
            return match active.first() {
                Some(id) => Ok(id.clone()),
                None => self.create_container(pool).await,
            };
        }

        let least_loaded = active
            .iter()
            .map(|id| (pool.load_of(id), id))
            .min_by_key(|(load, _)| *load);

        if let Some((load, id)) = least_loaded {
            if load < self.config.users_per_container {
                return Ok(id.clone());
            }
        }

        if pool.containers.len() < self.config.max_containers {
            return self.create_container(pool).await;
        }

        match (least_loaded, self.config.overflow) {
            (Some((load, id)), OverflowPolicy::Allow) => {
                warn!(container_id = %id, users = load, "All containers at capacity, overflowing");
                Ok(id.clone())
            }
            (Some(_), OverflowPolicy::Reject) => Err(Error::BackendUnavailable(
                "all containers are at capacity".to_string(),
            )),
            (None, _) => self.create_container(pool).await,
        }
    }

    async fn create_container(&self, pool: &mut PoolState) -> Result<String> {
        let name = format!("isoterm-pool-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        match self.runtime.create(&name, &self.spec).await {
            Ok(id) => {
                info!(container_id = %id, name = %name, "Created pooled container");
                pool.containers.push(id.clone());
                Ok(id)
            }
            Err(e) => {
                error!(error = %e, "Container creation failed");
                let fallback = pool
                    .containers
                    .iter()
                    .min_by_key(|id| pool.load_of(id))
                    .cloned();
                match fallback {
                    Some(id) => {
                        warn!(container_id = %id, "Falling back to existing container");
                        Ok(id)
                    }
                    None => Err(Error::BackendUnavailable(e.to_string())),
                }
            }
        }
    }

    async fn create_user(&self, container_id: &str, username: &str, uid: u32) {
        let uid = uid.to_string();
        match self
            .runtime
            .exec_as_root(container_id, &[CREATE_USER_SCRIPT, username, &uid])
            .await
        {
            Ok((0, _)) => debug!(container_id, username, "Linux user ready"),
            Ok((code, output)) => {
                warn!(container_id, username, exit_code = code, output = %output.trim(), "User creation failed")
            }
            Err(e) => warn!(container_id, username, error = %e, "User creation failed"),
        }
    }

    async fn save(&self, pool: &PoolState) {
        if let Err(e) = write_json_atomic(&self.state_file, pool).await {
            error!(error = %e, file = %self.state_file.display(), "Failed to persist container state");
        }
    }
}

#[async_trait]
impl<R: ContainerRuntime> IsolationBackend for ContainerBackend<R> {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn supports_prewarm(&self) -> bool {
        false
    }

    fn base_path(&self) -> String {
        SYSTEM_PATH.to_string()
    }

    async fn resolve(&self, session_id: &str, user_id: &str) -> Result<BackendHandle> {
        let (username, uid) = linux_identity(user_id);
        let mut pool = self.pool.lock().await;

        if let Some((cid, linux_user)) = pool.user_map.get(user_id).cloned() {
            if self.revive(&mut pool, &cid).await {
                debug!(session_id, user_id, container_id = %cid, "Reusing container assignment");
                return Ok(self.handle(cid, linux_user, uid));
            }
            warn!(user_id, container_id = %cid, "Assigned container is gone, reassigning");
            pool.user_map.remove(user_id);
            self.save(&pool).await;
        }

        let cid = self.pick_container(&mut pool).await?;
        self.create_user(&cid, &username, uid).await;
        pool.user_map
            .insert(user_id.to_string(), (cid.clone(), username.clone()));
        self.save(&pool).await;

        info!(session_id, user_id, container_id = %cid, linux_user = %username, "Assigned user to container");
        Ok(self.handle(cid, username, uid))
    }

    async fn initialize(&self, handle: &BackendHandle) -> Result<()> {
        let BackendHandle::Container { home_dir, uid, .. } = handle else {
            return Err(Error::BackendUnavailable(
                "directory handle given to the container backend".to_string(),
            ));
        };
        let home = home_dir.clone();
        let scripts = self.scripts_dir.clone();
        let uid = *uid;
        tokio::task::spawn_blocking(move || -> Result<()> {
            bootstrap_home(&home, &scripts)?;
            if let Err(e) = chown_tree(&home, uid) {
                warn!(home = %home.display(), uid, error = %e, "Could not hand home over to its user");
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::BackendUnavailable(format!("bootstrap task: {e}")))?
    }

    async fn release(&self, handle: &BackendHandle, _preserve_data: bool) -> Result<()> {
        // Containers are shared and accounts are stable per user, so nothing
        // is torn down when a single session ends.
        debug!(handle = ?handle, "Container session released");
        Ok(())
    }

    async fn handle_exists(&self, handle: &BackendHandle) -> bool {
        match handle {
            BackendHandle::Container { container_id, .. } => {
                self.pool.lock().await.containers.contains(container_id)
            }
            BackendHandle::Directory { .. } => false,
        }
    }

    fn spawn(&self, handle: &BackendHandle, script: &str, env: &Env) -> Result<SpawnedProcess> {
        let BackendHandle::Container {
            container_id,
            linux_user,
            ..
        } = handle
        else {
            return Err(Error::BackendUnavailable(
                "directory handle given to the container backend".to_string(),
            ));
        };
        let cmd = self
            .runtime
            .exec_command(container_id, linux_user, &handle.exec_home(), env, script);
        spawn_command(cmd)
    }

    async fn terminate(&self, handle: &BackendHandle) -> Result<()> {
        match handle {
            BackendHandle::Container {
                container_id,
                linux_user,
                ..
            } => self.runtime.terminate_user(container_id, linux_user).await,
            BackendHandle::Directory { .. } => Ok(()),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let pool = self.pool.lock().await;
        write_json_atomic(&self.state_file, &*pool).await
    }
}

impl<R> ContainerBackend<R> {
    fn handle(&self, container_id: String, linux_user: String, uid: u32) -> BackendHandle {
        let home_dir = self.spec.homes_dir.join(&linux_user);
        BackendHandle::Container {
            container_id,
            linux_user,
            uid,
            home_dir,
        }
    }
}

fn chown_tree(path: &Path, uid: u32) -> nix::Result<()> {
    use nix::unistd::{chown, Gid, Uid};

    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(uid)))?;
    if path.is_dir() && !path.is_symlink() {
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                chown_tree(&entry.path(), uid)?;
            }
        }
    }
    Ok(())
}
