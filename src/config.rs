use std::env;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

pub const WORKSPACE_ENV: &str = "GRADEBOOK_WORKSPACE";
pub const BIND_ENV: &str = "GRADEBOOK_BIND";
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

#[derive(Debug, Parser)]
#[command(name = "gradebookd", version, about = "School gradebook daemon")]
pub struct Cli {
    /// Workspace directory holding the gradebook database.
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the REST API instead of the stdio sidecar.
    Serve {
        /// Address to listen on.
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Stdio,
    Http { bind: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: Option<PathBuf>,
    pub mode: Mode,
}

impl Config {
    /// Command line first, then environment, then defaults.
    pub fn load(cli: Cli) -> Self {
        let workspace = cli.workspace.or_else(|| var(WORKSPACE_ENV).map(PathBuf::from));
        let mode = match cli.command {
            None => Mode::Stdio,
            Some(Command::Serve { bind }) => Mode::Http {
                bind: bind.or_else(|| var(BIND_ENV)).unwrap_or_else(|| {
                    info!("{BIND_ENV} not set, using default: {DEFAULT_BIND}");
                    DEFAULT_BIND.to_string()
                }),
            },
        };
        if workspace.is_none() {
            info!("no workspace configured; waiting for workspace.select");
        }
        Self { workspace, mode }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
