//! Directory isolation: one private home per session on the host.

use super::{spawn_command, BackendHandle, Env, IsolationBackend, SpawnedProcess};
use crate::config::{BackendKind, ResourceLimits};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const PROFILE: &str = r#"# Sourced before every command. Must stay silent.
export PATH="$HOME/.local/bin:$PATH"
export PYTHONUSERBASE="$HOME/.local"
export LANG=C.UTF-8
export PYTHONIOENCODING=utf-8
export PYTHONUNBUFFERED=1
export TERM=xterm-256color
export SSL_DIR="$HOME/.ssl"

if [ -f "$HOME/.bashrc" ]; then
    . "$HOME/.bashrc"
fi
"#;

const BASHRC: &str = r#"if [ -d "$HOME/venv" ]; then
    . "$HOME/venv/bin/activate"
fi

export PATH="$HOME/.local/bin:$PATH"
export PYTHONUSERBASE="$HOME/.local"

alias ll='ls -la'
alias python=python3

pip-user() {
    pip install --user "$@"
}
"#;

const HELP: &str = "Terminal Help
=============

Commands
--------
- Files:       ls, cp, mv, rm, mkdir, cat, touch
- Network:     curl, wget, ping
- Processes:   ps, kill
- Python:      python3, pip install <pkg> (installs into ~/.local)

Built-ins
---------
- help                 show this text
- install-python       install pip into your home directory
- install-node         install node and npm into your home directory
- session-keep-alive   keep the session from expiring

Files in your home directory are kept between commands. Full-screen
editors are not available; create files with echo or cat instead.
";

/// Helper scripts that are copied into `.local/bin` without their suffix.
pub const HELPER_SCRIPTS: &[&str] = &[
    "install-python-pip.sh",
    "install-node-npm.sh",
    "session-keep-alive.sh",
    "show-help.sh",
];

pub struct DirectoryBackend {
    root: PathBuf,
    scripts_dir: PathBuf,
    limits: ResourceLimits,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>, scripts_dir: impl Into<PathBuf>, limits: ResourceLimits) -> Self {
        Self {
            root: root.into(),
            scripts_dir: scripts_dir.into(),
            limits,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn home_of<'a>(&self, handle: &'a BackendHandle) -> Result<&'a Path> {
        match handle {
            BackendHandle::Directory { home_dir } => Ok(home_dir),
            BackendHandle::Container { container_id, .. } => Err(Error::BackendUnavailable(
                format!("container handle {container_id} given to the directory backend"),
            )),
        }
    }
}

#[async_trait]
impl IsolationBackend for DirectoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Directory
    }

    fn supports_prewarm(&self) -> bool {
        true
    }

    fn base_path(&self) -> String {
        std::env::var("PATH").unwrap_or_else(|_| SYSTEM_PATH.to_string())
    }

    async fn resolve(&self, session_id: &str, _user_id: &str) -> Result<BackendHandle> {
        let home_dir = self.root.join(session_id);
        tokio::fs::create_dir_all(&home_dir)
            .await
            .map_err(|e| Error::BackendUnavailable(format!("mkdir {}: {e}", home_dir.display())))?;
        Ok(BackendHandle::Directory { home_dir })
    }

    async fn initialize(&self, handle: &BackendHandle) -> Result<()> {
        let home = self.home_of(handle)?.to_path_buf();
        let scripts = self.scripts_dir.clone();
        tokio::task::spawn_blocking(move || bootstrap_home(&home, &scripts))
            .await
            .map_err(|e| Error::BackendUnavailable(format!("bootstrap task: {e}")))??;
        Ok(())
    }

    async fn release(&self, handle: &BackendHandle, preserve_data: bool) -> Result<()> {
        let home = self.home_of(handle)?.to_path_buf();
        if preserve_data {
            debug!(home = %home.display(), "Keeping session directory");
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&home).await {
            Ok(()) => {
                info!(home = %home.display(), "Removed session directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_exists(&self, handle: &BackendHandle) -> bool {
        match self.home_of(handle) {
            Ok(home) => tokio::fs::metadata(home)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn spawn(&self, handle: &BackendHandle, script: &str, env: &Env) -> Result<SpawnedProcess> {
        let home = self.home_of(handle)?;
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(script)
            .current_dir(home)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let limits = self.limits;
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || limits.apply().map_err(io::Error::from));
        }
        spawn_command(cmd)
    }
}

/// Lays out a session home. Existing files are left untouched.
pub fn bootstrap_home(home: &Path, scripts_dir: &Path) -> Result<()> {
    for dir in [".local/bin", "projects", "downloads", ".ssl"] {
        fs::create_dir_all(home.join(dir))?;
    }

    write_if_absent(&home.join(".profile"), PROFILE)?;
    write_if_absent(&home.join(".bashrc"), BASHRC)?;
    write_if_absent(&home.join("help.txt"), HELP)?;

    copy_helper_scripts(scripts_dir, &home.join(".local/bin"))
}

fn write_if_absent(path: &Path, contents: &str) -> Result<()> {
    if !path.exists() {
        fs::write(path, contents)?;
    }
    Ok(())
}

fn copy_helper_scripts(scripts_dir: &Path, bin_dir: &Path) -> Result<()> {
    if !scripts_dir.is_dir() {
        warn!(dir = %scripts_dir.display(), "Script directory not found, skipping helper copy");
        return Ok(());
    }
    for name in HELPER_SCRIPTS {
        let src = scripts_dir.join(name);
        if !src.is_file() {
            continue;
        }
        let dest = bin_dir.join(name.trim_end_matches(".sh"));
        if dest.exists() {
            continue;
        }
        fs::copy(&src, &dest)?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
