use std::io::{self, BufRead, Write};

use anyhow::Context;
use clap::Parser;
use gradebookd::config::{Cli, Config, Mode};
use gradebookd::error::ErrorCode;
use gradebookd::{db, http, ipc};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // stdout carries responses; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let config = Config::load(Cli::parse());

    let mut state = ipc::AppState::empty();
    if let Some(path) = &config.workspace {
        let conn = db::open_db(path)
            .with_context(|| format!("failed to open workspace {}", path.to_string_lossy()))?;
        state.workspace = Some(path.clone());
        state.db = Some(conn);
    }

    match config.mode {
        Mode::Stdio => run_stdio(state),
        Mode::Http { bind } => {
            if state.db.is_none() {
                anyhow::bail!("serve needs a workspace (--workspace or GRADEBOOK_WORKSPACE)");
            }
            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            runtime.block_on(http::serve(state, &bind))
        }
    }
}

fn run_stdio(mut state: ipc::AppState) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "stdio sidecar ready");
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                // Best effort: echo the id back when the line is at least an object.
                let id = serde_json::from_str::<serde_json::Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
                    .unwrap_or_default();
                ipc::err(
                    &id,
                    ErrorCode::ValidationError.as_str(),
                    format!("malformed request: {e}"),
                    None,
                )
            }
        };
        writeln!(stdout, "{resp}").context("failed to write response")?;
        stdout.flush().context("failed to flush stdout")?;
    }
    Ok(())
}
