//! Configuration.
//!
//! Values come from an optional TOML file (`stockfeed.toml` in the
//! platform config directory, or an explicit `--config` path) with CLI
//! flags taking precedence. The feed URL is the only setting with no
//! usable default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cli::{FeedArgs, StatusArgs};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration {value:?}: {source}")]
    Duration {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("no feed URL configured; set source_url in the config file or pass --url")]
    MissingSourceUrl,

    #[error("could not determine a data directory for this platform")]
    NoDataDir,
}

/// On-disk shape of stockfeed.toml.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    source_url: Option<String>,
    interval: Option<String>,
    start_immediately: Option<bool>,
    db_path: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    http_timeout: Option<String>,
}

#[derive(Debug)]
pub struct Config {
    pub source_url: String,
    pub interval: Duration,
    pub start_immediately: bool,
    pub db_path: PathBuf,
    pub work_dir: PathBuf,
    pub http_timeout: Duration,
}

impl Config {
    pub fn load(args: &FeedArgs) -> Result<Self, ConfigError> {
        let file = read_file(args.config.as_deref())?;

        let source_url = args
            .url
            .clone()
            .or(file.source_url)
            .ok_or(ConfigError::MissingSourceUrl)?;

        let interval = match args.interval.as_ref().or(file.interval.as_ref()) {
            Some(raw) => parse_duration(raw)?,
            None => DEFAULT_INTERVAL,
        };

        let http_timeout = match &file.http_timeout {
            Some(raw) => parse_duration(raw)?,
            None => DEFAULT_HTTP_TIMEOUT,
        };

        let db_path = match args.db.clone().or(file.db_path) {
            Some(path) => path,
            None => default_db_path()?,
        };

        let work_dir = match args.work_dir.clone().or(file.work_dir) {
            Some(path) => path,
            None => default_work_dir()?,
        };

        Ok(Config {
            source_url,
            interval,
            start_immediately: args.immediate || file.start_immediately.unwrap_or(false),
            db_path,
            work_dir,
            http_timeout,
        })
    }
}

/// Database location for commands that only read (`status`).
pub fn resolve_db_path(args: &StatusArgs) -> Result<PathBuf, ConfigError> {
    let file = read_file(args.config.as_deref())?;

    match args.db.clone().or(file.db_path) {
        Some(path) => Ok(path),
        None => default_db_path(),
    }
}

/// An explicit `--config` path must exist; the default location is
/// optional.
fn read_file(explicit: Option<&Path>) -> Result<FileConfig, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match default_config_path() {
            Some(path) => (path, false),
            None => return Ok(FileConfig::default()),
        },
    };

    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FileConfig::default());
        }
        Err(e) => return Err(ConfigError::Read { path, source: e }),
    };

    toml::from_str(&raw).map_err(|e| ConfigError::Parse { path, source: e })
}

fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw).map_err(|e| ConfigError::Duration {
        value: raw.to_string(),
        source: e,
    })
}

fn project_dirs() -> Result<directories::ProjectDirs, ConfigError> {
    directories::ProjectDirs::from("", "", "stockfeed").ok_or(ConfigError::NoDataDir)
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "stockfeed")
        .map(|dirs| dirs.config_dir().join("stockfeed.toml"))
}

fn default_db_path() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.data_dir().join("stockfeed.db"))
}

/// Cycle scratch space; cleared on every tick, so the cache dir is the
/// right home for it.
fn default_work_dir() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.cache_dir().join("work"))
}
