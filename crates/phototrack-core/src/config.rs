use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::DEFAULT_PHOTO_EXTENSIONS;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackerConfig {
    pub roots: Vec<RootConfig>,
    #[serde(default)]
    pub startup: bool,
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub proc: ProcConfig,
    #[serde(default = "default_catalog_dir")]
    pub catalog_dir: PathBuf,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub watcher: WatcherSettings,
    #[serde(default = "default_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub log_level: Option<String>,
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.roots.is_empty() {
            return Err(ConfigValidationError::EmptyRoots);
        }
        for root in &self.roots {
            if root.path.as_os_str().is_empty() {
                return Err(ConfigValidationError::EmptyRootPath);
            }
            if root.user_id.trim().is_empty() {
                return Err(ConfigValidationError::MissingUser {
                    root: root.path.clone(),
                });
            }
        }
        if self.proc.processes == 0 {
            return Err(ConfigValidationError::ZeroProcesses);
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigValidationError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds a config from the tracker's environment variable layout.
    ///
    /// `TRACKER_ROOTS` and `TRACKER_USERS` are parallel comma separated lists.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let roots_var = lookup("TRACKER_ROOTS")
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigValidationError::MissingVar("TRACKER_ROOTS"))?;
        let users_var = lookup("TRACKER_USERS").unwrap_or_default();
        let users: Vec<&str> = users_var.split(',').map(str::trim).collect();

        let roots = roots_var
            .split(',')
            .map(str::trim)
            .enumerate()
            .map(|(idx, path)| RootConfig {
                path: PathBuf::from(path),
                user_id: users.get(idx).copied().unwrap_or_default().to_owned(),
            })
            .collect();

        let mut proc = ProcConfig::default();
        if let Some(host) = lookup("PROC_HOST").filter(|value| !value.is_empty()) {
            proc.host = host;
        }
        if let Some(raw) = lookup("PROC_NUMBER").filter(|value| !value.is_empty()) {
            proc.processes = raw
                .trim()
                .parse()
                .map_err(|_| ConfigValidationError::InvalidNumber {
                    var: "PROC_NUMBER",
                    value: raw.clone(),
                })?;
        }

        let content = ContentConfig {
            thumb_dir: lookup("CONTENT_THUMB_DIR")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            thumb_types: lookup("CONTENT_THUMB_TYPES")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
        };

        Ok(Self {
            roots,
            startup: lookup("TRACKER_STARTUP").is_some_and(|value| parse_flag(&value)),
            watch: lookup("TRACKER_WATCH").is_some_and(|value| parse_flag(&value)),
            proc,
            catalog_dir: lookup("CATALOG_DIR")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(default_catalog_dir),
            content,
            scan: ScanSettings::default(),
            watcher: WatcherSettings::default(),
            allowed_extensions: default_extensions(),
            log_level: lookup("PROC_LOG_LEVEL").filter(|value| !value.is_empty()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootConfig {
    pub path: PathBuf,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_processes")]
    pub processes: usize,
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            processes: default_processes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentConfig {
    #[serde(default)]
    pub thumb_dir: Option<PathBuf>,
    #[serde(default)]
    pub thumb_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanSettings {
    #[serde(default = "default_drain_debounce_ms")]
    pub drain_debounce_ms: u64,
    #[serde(default)]
    pub recurse: RecursePolicy,
}

impl ScanSettings {
    pub fn drain_debounce(&self) -> Duration {
        Duration::from_millis(self.drain_debounce_ms)
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            drain_debounce_ms: default_drain_debounce_ms(),
            recurse: RecursePolicy::default(),
        }
    }
}

/// Which albums of a completed listing get a follow-up job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecursePolicy {
    /// Every listed album, whether it was inserted, kept or updated.
    #[default]
    All,
    /// Only albums that were new to the catalog. Albums that were kept or
    /// updated are not listed again, so on a rescan their contents stay
    /// flagged and are swept once the queue drains.
    Inserted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatcherSettings {
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_write_settle_ms")]
    pub write_settle_ms: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

impl WatcherSettings {
    pub fn write_settle(&self) -> Duration {
        Duration::from_millis(self.write_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            write_settle_ms: default_write_settle_ms(),
            poll_ms: default_poll_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("no tracker roots configured")]
    EmptyRoots,
    #[error("tracker root path must be provided")]
    EmptyRootPath,
    #[error("'userId' is not defined for the path '{}'", root.display())]
    MissingUser { root: PathBuf },
    #[error("worker count must be at least 1")]
    ZeroProcesses,
    #[error("environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("environment variable {var} is not a number: {value}")]
    InvalidNumber { var: &'static str, value: String },
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

fn default_host() -> String {
    "*".into()
}

fn default_processes() -> usize {
    1
}

fn default_catalog_dir() -> PathBuf {
    PathBuf::from("catalog")
}

fn default_drain_debounce_ms() -> u64 {
    8_000
}

fn default_depth() -> usize {
    64
}

fn default_write_settle_ms() -> u64 {
    2_000
}

fn default_poll_ms() -> u64 {
    100
}

fn default_extensions() -> Vec<String> {
    DEFAULT_PHOTO_EXTENSIONS
        .iter()
        .map(|ext| (*ext).to_owned())
        .collect()
}
