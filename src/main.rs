//! isoterm - isolated shell sessions with an HTTP and WebSocket API.
//!
//! Usage:
//!   isoterm serve [--port 3000]                  # Start the server
//!   isoterm run [--user alice] -- <command...>   # One-shot command in a throwaway session

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

use clap::{Parser, Subcommand};
use isoterm::config::BackendKind;
use isoterm::engine::Outcome;
use isoterm::{http_server, AppState, Config};
use std::process::exit;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "isoterm", version)]
#[command(about = "Isolated per-user shell sessions over HTTP and WebSocket")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value_t = 3000)]
        port: u16,

        #[command(flatten)]
        config: Config,
    },
    /// Run one command in a fresh session, then remove it
    Run {
        /// User the session belongs to
        #[arg(long)]
        user: Option<String>,

        #[command(flatten)]
        config: Config,

        /// Command and arguments to run
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("isoterm=info,tower_http=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Serve { port, config } => {
            if config.backend == BackendKind::Container && !nix::unistd::geteuid().is_root() {
                warn!("Not running as root; handing container homes to their users will fail");
            }
            let state = match AppState::new(config).await {
                Ok(state) => state,
                Err(e) => {
                    error!(error = %e, "Failed to initialize");
                    exit(1);
                }
            };
            if let Err(e) = http_server::run_server(port, state).await {
                error!(error = %e, "Server failed");
                exit(1);
            }
        }
        Commands::Run {
            user,
            mut config,
            cmd,
        } => {
            // A throwaway session has no use for pre-warmed ones.
            config.pool.pool_size = 0;
            exit(run_once(config, user.as_deref(), &cmd.join(" ")).await);
        }
    }
}

async fn run_once(config: Config, user: Option<&str>, command: &str) -> i32 {
    let state = match AppState::new(config).await {
        Ok(state) => state,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };
    let info = match state.create_session(user, "127.0.0.1", false).await {
        Ok(info) => info,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };

    let code = match state.execute_command(&info.session_id, command).await {
        Ok(Outcome::Completed { output, exit_code }) => {
            print!("{output}");
            exit_code
        }
        Ok(Outcome::Interactive(fifos)) => {
            println!("cmd fifo: {}", fifos.cmd_fifo);
            println!("resp fifo: {}", fifos.resp_fifo);
            0
        }
        Err(e) => {
            eprintln!("{e}");
            e.exit_code()
        }
    };

    if let Err(e) = state.end_session(&info.session_id, false).await {
        warn!(session_id = %info.session_id, error = %e, "Failed to remove session");
    }
    state.shutdown().await;
    code
}
