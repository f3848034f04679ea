#![allow(dead_code)]

use isoterm::{http_server, AppState, Config};
use std::net::SocketAddr;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub fn config(dir: &TempDir) -> Config {
    Config {
        user_data_dir: dir.path().join("data"),
        scripts_dir: dir.path().join("scripts"),
        interactive_helper: dir.path().join("no-helper"),
        ..Config::default()
    }
}

pub async fn state(dir: &TempDir) -> AppState {
    AppState::new(config(dir)).await.unwrap()
}

pub struct Server {
    pub addr: SocketAddr,
    pub state: AppState,
    stop: CancellationToken,
}

impl Server {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/ws{}", self.addr, query)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Serves a fresh state on an ephemeral local port.
pub async fn spawn_server(config: Config) -> Server {
    let state = AppState::new(config).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = CancellationToken::new();
    let signal = stop.clone();
    let serving = state.clone();
    tokio::spawn(async move {
        http_server::serve(listener, serving, async move { signal.cancelled().await })
            .await
            .unwrap();
    });
    Server { addr, state, stop }
}
