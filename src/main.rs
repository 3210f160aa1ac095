//! Sandboxd - host-side process daemon with an HTTP API and shell sessions.
//!
//! Usage:
//!   sandboxd serve [--port 2280]                      # Start HTTP server
//!   sandboxd exec [--cwd DIR] [--timeout SECS] CMD    # One-shot execution

use clap::{Parser, Subcommand};
use sandboxd::config::Config;
use sandboxd::http_server;
use sandboxd::process::{self, ExecuteRequest, Terminator};
use sandboxd::state::AppState;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandboxd")]
#[command(about = "Host-side process daemon for sandboxes")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[command(flatten)]
        config: Config,
    },
    /// Run one command with a timeout and print its combined output
    Exec {
        /// Working directory
        #[arg(long)]
        cwd: Option<String>,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<i64>,

        /// Command line, split on whitespace with quote handling
        command: String,
    },
}

#[tokio::main]
async fn main() {
    use std::process::exit;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve { config } => {
            let state = AppState::new(&config);
            if let Err(e) = http_server::run_server(config.port, state).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Exec {
            cwd,
            timeout,
            command,
        } => {
            let request = ExecuteRequest {
                command,
                cwd,
                timeout,
            };
            match process::execute(request, &Terminator::new(), process::DEFAULT_TIMEOUT).await {
                Ok(response) => {
                    print!("{}", response.result);
                    exit(response.exit_code);
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
    }
}
