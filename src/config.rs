//! Runtime configuration. Every flag can also be supplied through the
//! environment, using the variable names operators already deploy with.

use clap::{ArgAction, Args, ValueEnum};
use nix::sys::resource::{setrlimit, Resource};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One private directory per session on the host.
    Directory,
    /// A pool of shared containers, one Linux user per logical user.
    Container,
}

/// What to do when every container is at `users_per_container`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OverflowPolicy {
    /// Assign to the least-loaded container anyway.
    Allow,
    /// Refuse the allocation.
    Reject,
}

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Isolation backend
    #[arg(long, env = "ISOTERM_BACKEND", value_enum, default_value = "directory")]
    pub backend: BackendKind,

    /// Root directory for session homes and persisted state
    #[arg(long, env = "USER_DATA_DIR", default_value = "user_data")]
    pub user_data_dir: PathBuf,

    /// Directory holding helper scripts copied into each session
    #[arg(long, env = "SCRIPT_DIR", default_value = "user_scripts")]
    pub scripts_dir: PathBuf,

    /// Idle seconds before a session expires
    #[arg(long = "session-timeout", env = "SESSION_TIMEOUT", default_value_t = 3600)]
    pub session_timeout_secs: u64,

    /// Wall-clock seconds before a command is reported as timed out
    #[arg(long = "command-timeout", env = "COMMAND_TIMEOUT", default_value_t = 300)]
    pub command_timeout_secs: u64,

    /// Allow system package managers and service control
    #[arg(
        long,
        env = "ENABLE_SYSTEM_COMMANDS",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub enable_system_commands: bool,

    /// Helper that sets up FIFOs for interactive commands
    #[arg(
        long,
        env = "INTERACTIVE_HELPER",
        default_value = "/usr/local/bin/interactive-handler"
    )]
    pub interactive_helper: PathBuf,

    /// Seconds to wait for the interactive helper to report its FIFOs
    #[arg(long = "interactive-timeout", env = "INTERACTIVE_TIMEOUT", default_value_t = 5)]
    pub interactive_timeout_secs: u64,

    /// Passphrase exported to the crypto CLI; unset means none is injected
    #[arg(long, env = "OPENSSL_PASSPHRASE")]
    pub crypto_passphrase: Option<String>,

    #[command(flatten)]
    pub pool: PoolConfig,

    #[command(flatten)]
    pub containers: ContainerConfig,

    #[command(flatten)]
    pub limits: ResourceLimits,
}

impl Config {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn interactive_timeout(&self) -> Duration {
        Duration::from_secs(self.interactive_timeout_secs)
    }

    /// File holding the persisted session table.
    pub fn session_state_file(&self) -> PathBuf {
        self.user_data_dir.join("sessions.json")
    }

    /// File holding the persisted container pool.
    pub fn container_state_file(&self) -> PathBuf {
        self.user_data_dir.join("container_state.json")
    }

    /// Host directory bind-mounted as `/home` in every pooled container.
    pub fn container_homes_dir(&self) -> PathBuf {
        self.user_data_dir.join("container-homes")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Directory,
            user_data_dir: PathBuf::from("user_data"),
            scripts_dir: PathBuf::from("user_scripts"),
            session_timeout_secs: 3600,
            command_timeout_secs: 300,
            enable_system_commands: true,
            interactive_helper: PathBuf::from("/usr/local/bin/interactive-handler"),
            interactive_timeout_secs: 5,
            crypto_passphrase: None,
            pool: PoolConfig::default(),
            containers: ContainerConfig::default(),
            limits: ResourceLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct PoolConfig {
    /// Pre-warmed sessions kept ready (0 disables the pool)
    #[arg(long, env = "SESSION_POOL_SIZE", default_value_t = 2)]
    pub pool_size: usize,

    /// Seconds after which an unused pooled session is discarded
    #[arg(long = "max-pool-age", env = "SESSION_POOL_MAX_AGE", default_value_t = 600)]
    pub max_pool_age_secs: u64,
}

impl PoolConfig {
    pub fn max_pool_age(&self) -> Duration {
        Duration::from_secs(self.max_pool_age_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            max_pool_age_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ContainerConfig {
    /// Spread users across several containers instead of one
    #[arg(long, env = "MULTI_CONTAINER_MODE", default_value_t = false, action = ArgAction::Set)]
    pub multi_container: bool,

    #[arg(long, env = "MAX_CONTAINERS", default_value_t = 10)]
    pub max_containers: usize,

    #[arg(long, env = "USERS_PER_CONTAINER", default_value_t = 20)]
    pub users_per_container: usize,

    #[arg(long, env = "CONTAINER_IMAGE", default_value = "terminal-multi-user:latest")]
    pub container_image: String,

    #[arg(long, env = "CONTAINER_OVERFLOW", value_enum, default_value = "allow")]
    pub overflow: OverflowPolicy,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            multi_container: false,
            max_containers: 10,
            users_per_container: 20,
            container_image: "terminal-multi-user:latest".to_string(),
            overflow: OverflowPolicy::Allow,
        }
    }
}

/// Per-process limits applied to directory-backend commands before exec.
#[derive(Debug, Clone, Copy, Args)]
pub struct ResourceLimits {
    /// Address space limit in KB
    #[arg(long = "mem", default_value_t = 2097152)]
    pub mem_kb: u64,

    /// Maximum file size in KB
    #[arg(long = "fsize", default_value_t = 1048576)]
    pub fsize_kb: u64,

    /// Maximum number of open files
    #[arg(long, default_value_t = 256)]
    pub nofile: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            mem_kb: 2097152,
            fsize_kb: 1048576,
            nofile: 256,
        }
    }
}

impl ResourceLimits {
    /// Runs in the forked child, so it only calls `setrlimit`.
    pub fn apply(&self) -> nix::Result<()> {
        let mem_bytes = self.mem_kb * 1024;
        setrlimit(Resource::RLIMIT_AS, mem_bytes, mem_bytes)?;

        let fsize_bytes = self.fsize_kb * 1024;
        setrlimit(Resource::RLIMIT_FSIZE, fsize_bytes, fsize_bytes)?;

        setrlimit(Resource::RLIMIT_NOFILE, self.nofile, self.nofile)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        Ok(())
    }
}
