mod assessments;
mod calc;
mod config;
mod db;
mod error;
mod export;
mod import;
mod ipc;
mod questions;
mod quizzes;
mod students;
mod template;
mod users;
mod workbook;

use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Assessment records daemon: JSON requests on stdin, one response per line
/// on stdout.
#[derive(Debug, Parser)]
#[command(name = "assessd", version)]
struct Cli {
    /// Workspace directory to open at startup.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Log filter, e.g. `assessd=debug`. `RUST_LOG` wins when set.
    #[arg(long, default_value = "assessd=info")]
    log_filter: String,
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // stdout carries the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);

    let mut state = ipc::AppState::new();
    if let Some(path) = cli.workspace.as_deref() {
        if let Err(e) = ipc::select_workspace(&mut state, path) {
            tracing::error!(workspace = %path.display(), error = ?e, "startup workspace failed to open");
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "assessd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{resp}");
                let _ = stdout.flush();
                continue;
            }
        };

        let method = req.method.clone();
        let resp = ipc::handle_request(&mut state, req);
        tracing::debug!(%method, ok = resp["ok"].as_bool().unwrap_or(false), "handled");
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
