//! tether - language server queries as MCP tools.
//!
//! ```text
//! host <-- JSON lines on stdio --> mcp::serve -> ToolRegistry -> Bridge <-- LSP --> server
//! ```
//!
//! Stdout carries the host protocol, so logs go to
//! `<project>/.tether/logs/tether.log`, then the user data directory, then stderr.

mod mcp;

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether_config::{LogLevel, TetherConfig};
use tether_lsp::{Bridge, BridgeConfig};
use tether_tools::ToolRegistry;

#[derive(Debug, Parser)]
#[command(name = "tether", version, about)]
struct Cli {
    /// Project root handed to the language server (default: current directory).
    #[arg(long, short = 'p')]
    project: Option<PathBuf>,

    /// Config file (default: <project>/tether.toml when present).
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Per-request timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    max_restart_attempts: Option<u32>,

    /// Serve requests while the server is still indexing.
    #[arg(long)]
    fast_start: bool,

    /// error, warn, info, debug or trace. `RUST_LOG` takes precedence.
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Language server command, replacing the configured one.
    #[arg(long)]
    server: Option<String>,

    /// Arguments for `--server`.
    #[arg(last = true)]
    server_args: Vec<String>,
}

impl Cli {
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(ms) = self.timeout_ms {
            config.request_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(attempts) = self.max_restart_attempts {
            config.max_restart_attempts = attempts;
        }
        if self.fast_start {
            config.fast_start = true;
        }
        if let Some(command) = &self.server {
            config.server.command.clone_from(command);
            config.server.args.clone_from(&self.server_args);
        }
    }
}

fn init_tracing(level: LogLevel, project_root: &Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_filter()))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file(project_root);

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file(project_root: &Path) -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates(project_root) {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates(project_root: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![
        project_root
            .join(".tether")
            .join("logs")
            .join("tether.log"),
    ];
    if let Some(data_dir) = dirs::data_local_dir() {
        candidates.push(data_dir.join("tether").join("logs").join("tether.log"));
    }
    candidates
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let project = match &cli.project {
        Some(path) => path.clone(),
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let project_root = fs::canonicalize(&project)
        .with_context(|| format!("project root {} is not accessible", project.display()))?;

    let file_config = TetherConfig::discover(cli.config.as_deref(), &project_root)?;
    let (file_config, config_path) = match file_config {
        Some((config, path)) => (config, Some(path)),
        None => (TetherConfig::default(), None),
    };
    let level = cli.log_level.unwrap_or_else(|| file_config.log_level());
    init_tracing(level, &project_root);
    if let Some(path) = &config_path {
        tracing::info!(path = %path.display(), "Loaded config");
    }

    let mut config = file_config.into_bridge_config(project_root);
    cli.apply(&mut config);

    let bridge = Bridge::stdio(config).context("failed to prepare language server")?;
    if let Err(e) = bridge.launch().await {
        // Keep serving: every tool call reports the failure to the host.
        tracing::error!(error = %e, "Language server failed to start");
    }

    let registry = Arc::new(ToolRegistry::with_lsp_tools());
    let served = tokio::select! {
        result = mcp::serve(tokio::io::stdin(), tokio::io::stdout(), bridge.clone(), registry) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    };

    bridge.shutdown().await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "Host connection failed");
    }
    served
}
