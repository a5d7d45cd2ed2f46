//! Diagnostic configuration.
//!
//! The engine never opens configuration files itself.  Hosts either hand in
//! a JSON document (the FFI path) or expose their own key/value settings
//! through [`ConfigSource`]; `server.cfg`-style text can be parsed with
//! [`KeyValueConfig::parse`].

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instance::EntryIndex;

/// Entrypoint index a debugger uses to request detaching from a script.
/// Executing it fails with an index error that is not a real fault.
pub const DEFAULT_DETACH_SENTINEL: EntryIndex = -10;

/// Settings consumed by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticConfig {
    /// Terminate the process after reporting a runtime error.
    pub die_on_error: bool,
    /// Shell command spawned after each reported runtime error.
    pub run_on_error: String,
    /// Directories searched for the script file, in order.
    pub search_dirs: Vec<PathBuf>,
    /// Environment variable holding additional search paths.
    pub script_path_env: String,
    /// Entrypoint index whose index errors are silently ignored.
    pub detach_sentinel_index: Option<EntryIndex>,
    /// Marker prepended to every diagnostic line.
    pub log_prefix: String,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            die_on_error: false,
            run_on_error: String::new(),
            search_dirs: vec![PathBuf::from("gamemodes"), PathBuf::from("filterscripts")],
            script_path_env: "CRASHSCOPE_SCRIPT_PATH".to_string(),
            detach_sentinel_index: Some(DEFAULT_DETACH_SENTINEL),
            log_prefix: "[debug] ".to_string(),
        }
    }
}

impl DiagnosticConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(ConfigError::Json)
    }

    /// Build a configuration from typed lookups, keeping defaults for
    /// missing or malformed keys.
    pub fn from_source<S: ConfigSource>(source: &S) -> Self {
        let defaults = Self::default();
        let search_dirs = source
            .raw("search_dirs")
            .map(|raw| raw.split_whitespace().map(PathBuf::from).collect())
            .unwrap_or(defaults.search_dirs);
        let detach_sentinel_index = match source.raw("detach_sentinel_index") {
            None => defaults.detach_sentinel_index,
            Some(raw) => match raw.trim() {
                "" | "none" | "off" => None,
                value => value.parse().ok().or(defaults.detach_sentinel_index),
            },
        };
        Self {
            die_on_error: source.get("die_on_error", defaults.die_on_error),
            run_on_error: source.get("run_on_error", defaults.run_on_error),
            search_dirs,
            script_path_env: source.get("script_path_env", defaults.script_path_env),
            detach_sentinel_index,
            log_prefix: source.get("log_prefix", defaults.log_prefix),
        }
    }

    /// Extra search paths read from [`Self::script_path_env`], split on the
    /// platform's path-list separator. Empty entries are dropped.
    pub fn env_search_paths(&self) -> Vec<PathBuf> {
        match env::var_os(&self.script_path_env) {
            Some(value) => env::split_paths(&value)
                .filter(|path| !path.as_os_str().is_empty())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Configured directories followed by the environment-supplied ones.
    pub fn script_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.search_dirs.clone();
        paths.extend(self.env_search_paths());
        paths
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration JSON: {0}")]
    Json(#[source] serde_json::Error),
}

/// Value types readable from a [`ConfigSource`].
pub trait ConfigValue: Sized {
    fn parse_config(raw: &str) -> Option<Self>;
}

impl ConfigValue for bool {
    fn parse_config(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

impl ConfigValue for String {
    fn parse_config(raw: &str) -> Option<Self> {
        Some(raw.trim().to_owned())
    }
}

impl ConfigValue for PathBuf {
    fn parse_config(raw: &str) -> Option<Self> {
        Some(PathBuf::from(raw.trim()))
    }
}

macro_rules! numeric_config_value {
    ($($ty:ty),*) => {
        $(impl ConfigValue for $ty {
            fn parse_config(raw: &str) -> Option<Self> {
                raw.trim().parse().ok()
            }
        })*
    };
}

numeric_config_value!(i32, i64, u32, u64, usize);

/// Key/value settings provider.
pub trait ConfigSource {
    fn raw(&self, key: &str) -> Option<String>;

    fn get<T: ConfigValue>(&self, key: &str, default: T) -> T
    where
        Self: Sized,
    {
        self.raw(key)
            .and_then(|raw| T::parse_config(&raw))
            .unwrap_or(default)
    }
}

/// In-memory `key value` settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueConfig {
    entries: HashMap<String, String>,
}

impl KeyValueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one `key value` pair per line. Blank lines and lines starting
    /// with `#` are skipped; a key without a value maps to the empty string.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            config.insert(key, value.trim());
        }
        config
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }
}

impl ConfigSource for KeyValueConfig {
    fn raw(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}
