//! `tether.toml` loading.
//!
//! ```toml
//! [bridge]
//! timeout_ms = 30000
//! max_restart_attempts = 3
//! fast_start = false
//! log_level = "info"
//!
//! [server]
//! command = "clangd"
//! args = ["--background-index", "--log=error"]
//! install_dirs = [".tether/bin"]
//! ```
//!
//! String values in `[server]` may reference environment variables as `${VAR}`.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tether_lsp::{BridgeConfig, ReadinessSignal, ServerConfig};

pub const CONFIG_FILE_NAME: &str = "tether.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive usable as an `EnvFilter` fallback.
    #[must_use]
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!(
                "unknown log level '{other}' (expected error, warn, info, debug or trace)"
            )),
        }
    }
}

/// `[bridge]` table. Unset values keep the bridge defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeSection {
    pub timeout_ms: Option<u64>,
    pub ready_timeout_ms: Option<u64>,
    pub max_restart_attempts: Option<u32>,
    pub fast_start: Option<bool>,
    pub shutdown_grace_ms: Option<u64>,
    pub diagnostics_settle_ms: Option<u64>,
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TetherConfig {
    #[serde(default)]
    pub bridge: BridgeSection,
    pub server: Option<ServerConfig>,
}

/// Expand `${VAR}` references from the environment. Unset variables expand
/// to nothing; an unclosed `${` is kept literally.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&std::env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

/// clangd with background indexing, searched under `.tether/bin` first.
#[must_use]
pub fn default_server() -> ServerConfig {
    let mut server = ServerConfig::new("clangd");
    server.args = vec!["--background-index".to_string(), "--log=error".to_string()];
    server.install_dirs = vec![PathBuf::from(".tether").join("bin")];
    server.readiness_signal = ReadinessSignal::Progress;
    server.language_ids = [
        ("c", "c"),
        ("h", "cpp"),
        ("cc", "cpp"),
        ("cpp", "cpp"),
        ("cxx", "cpp"),
        ("hpp", "cpp"),
        ("hh", "cpp"),
    ]
    .into_iter()
    .map(|(ext, id)| (ext.to_string(), id.to_string()))
    .collect::<HashMap<_, _>>();
    server
}

impl TetherConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str::<Self>(&content) {
            Ok(mut config) => {
                config.expand_env();
                Ok(config)
            }
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Load `explicit` if given (it must exist), else `<project_root>/tether.toml`
    /// when present. Returns the config with the path it came from.
    pub fn discover(
        explicit: Option<&Path>,
        project_root: &Path,
    ) -> Result<Option<(Self, PathBuf)>, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from(path).map(|config| Some((config, path.to_path_buf())));
        }
        let path = project_root.join(CONFIG_FILE_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        Self::load_from(&path).map(|config| Some((config, path)))
    }

    fn expand_env(&mut self) {
        if let Some(server) = &mut self.server {
            server.command = expand_env_vars(&server.command);
            for arg in &mut server.args {
                *arg = expand_env_vars(arg);
            }
            for dir in &mut server.install_dirs {
                if let Some(raw) = dir.to_str() {
                    *dir = PathBuf::from(expand_env_vars(raw));
                }
            }
        }
    }

    #[must_use]
    pub fn log_level(&self) -> LogLevel {
        self.bridge.log_level.unwrap_or_default()
    }

    /// Bridge configuration for `project_root`, defaults filled in.
    #[must_use]
    pub fn into_bridge_config(self, project_root: PathBuf) -> BridgeConfig {
        let server = self.server.unwrap_or_else(default_server);
        let mut config = BridgeConfig::new(project_root, server);
        let bridge = self.bridge;
        if let Some(ms) = bridge.timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = bridge.ready_timeout_ms {
            config.ready_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = bridge.max_restart_attempts {
            config.max_restart_attempts = attempts;
        }
        if let Some(fast_start) = bridge.fast_start {
            config.fast_start = fast_start;
        }
        if let Some(ms) = bridge.shutdown_grace_ms {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = bridge.diagnostics_settle_ms {
            config.diagnostics_settle = Duration::from_millis(ms);
        }
        config
    }
}
