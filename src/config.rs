//! Command-line and file configuration, merged CLI > file > built-in defaults.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

/// Default external command used to clone a revision forward (`cp -a src dst`).
const DEFAULT_CLONE_COMMAND: &str = "cp -a";

/// Default `tracing` filter directive when neither `--log-filter` nor a config
/// file value is supplied.
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser, Debug)]
#[command(name = "revisionfs", about = "A versioning overlay filesystem")]
pub struct Cli {
    /// Directory on the host filesystem backing every revision and tombstone.
    pub backing_root: PathBuf,

    /// Directory where the versioned view is mounted.
    pub mount_point: PathBuf,

    /// Optional TOML configuration file overlaying the built-in defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the external command used to clone a revision forward.
    #[arg(long)]
    pub clone_command: Option<String>,

    /// Override the `tracing_subscriber::EnvFilter` directive.
    #[arg(long)]
    pub log_filter: Option<String>,

    /// Run the mount in the foreground instead of daemonizing.
    #[arg(long, default_value_t = true)]
    pub foreground: bool,
}

#[derive(Deserialize, Debug, Default)]
pub struct FileConfig {
    pub clone_command: Option<String>,
    pub log_filter: Option<String>,
}

/// Fully resolved configuration the rest of the crate runs with.
#[derive(Debug, Clone)]
pub struct Config {
    pub backing_root: PathBuf,
    pub mount_point: PathBuf,
    pub clone_command: String,
    pub log_filter: String,
}

#[derive(Debug)]
pub enum ConfigError {
    BackingRootNotFound(PathBuf),
    BackingRootNotDir(PathBuf),
    ReadFile(PathBuf, std::io::Error),
    ParseFile(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::BackingRootNotFound(p) => write!(f, "backing root {} does not exist", p.display()),
            ConfigError::BackingRootNotDir(p) => write!(f, "backing root {} is not a directory", p.display()),
            ConfigError::ReadFile(p, e) => write!(f, "failed to read config file {}: {e}", p.display()),
            ConfigError::ParseFile(p, e) => write!(f, "failed to parse config file {}: {e}", p.display()),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn load(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => Some(load_file(path)?),
            None => None,
        };

        if !cli.backing_root.exists() {
            return Err(ConfigError::BackingRootNotFound(cli.backing_root.clone()));
        }
        if !cli.backing_root.is_dir() {
            return Err(ConfigError::BackingRootNotDir(cli.backing_root.clone()));
        }

        let clone_command = cli
            .clone_command
            .or_else(|| file.as_ref().and_then(|f| f.clone_command.clone()))
            .unwrap_or_else(|| DEFAULT_CLONE_COMMAND.to_string());
        let log_filter = cli
            .log_filter
            .or_else(|| file.as_ref().and_then(|f| f.log_filter.clone()))
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Ok(Config {
            backing_root: cli.backing_root,
            mount_point: cli.mount_point,
            clone_command,
            log_filter,
        })
    }

    pub fn log_path(&self) -> PathBuf {
        self.backing_root.join("log.txt")
    }
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile(path.to_path_buf(), e))?;
    toml::from_str(&text).map_err(|e| ConfigError::ParseFile(path.to_path_buf(), e))
}
