//! isoterm - isolated per-user shell sessions over HTTP and WebSocket.
//!
//! Each session owns a private home, either a directory on the host or a
//! Linux account inside a pooled container. Commands go through a rewrite
//! pipeline before they reach a shell.

#[cfg(not(target_os = "linux"))]
compile_error!("isoterm only works on Linux.");

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod http_server;
pub mod paths;
pub mod pipeline;
pub mod pool;
pub mod session;
pub mod state;
pub mod ws_server;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;
