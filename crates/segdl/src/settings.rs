//! Runtime settings consulted when a task starts.
//!
//! The surrounding application persists user settings as loosely typed values (the
//! legacy store kept numbers as strings), so every lookup returns a raw string and the
//! engine parses it, falling back to its defaults on anything missing or malformed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES};

pub const KEY_CONCURRENCY: &str = "concurrency";
pub const KEY_MAX_RETRIES: &str = "max_retries";
pub const KEY_DEFAULT_DOWNLOAD_PATH: &str = "default_download_path";

/// A source of raw setting values keyed by name.
pub trait SettingsSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Effective per-task limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSettings {
    pub concurrency: usize,
    pub max_retries: u32,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl TaskSettings {
    /// Reads the limits from `source`, using `defaults` for missing or invalid values.
    /// A concurrency of zero is treated as invalid.
    pub fn resolve(source: &dyn SettingsSource, defaults: TaskSettings) -> Self {
        let concurrency = source
            .get(KEY_CONCURRENCY)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.concurrency);

        let max_retries = source
            .get(KEY_MAX_RETRIES)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(defaults.max_retries);

        Self {
            concurrency,
            max_retries,
        }
    }
}

/// In-memory settings, also used for command-line overrides.
#[derive(Debug, Default)]
pub struct StaticSettings {
    values: RwLock<HashMap<String, String>>,
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: impl Into<String>, value: impl ToString) {
        self.values.write().insert(key.into(), value.to_string());
    }

    pub fn remove(&self, key: &str) {
        self.values.write().remove(key);
    }
}

impl SettingsSource for StaticSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }
}

/// Reads `SEGDL_<KEY>` environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSettings;

impl SettingsSource for EnvSettings {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(format!("SEGDL_{}", key.to_ascii_uppercase())).ok()
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default, alias = "concurrent")]
    concurrency: Option<toml::Value>,
    #[serde(default, alias = "retry")]
    max_retries: Option<toml::Value>,
    #[serde(default, alias = "defaultDownloadPath")]
    default_download_path: Option<String>,
}

fn value_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Settings stored in a TOML file. The file is re-read on every lookup so edits made
/// while the process runs apply to the next task that starts.
#[derive(Debug, Clone)]
pub struct TomlSettings {
    path: PathBuf,
}

impl TomlSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Option<SettingsFile> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Settings file not readable");
                return None;
            }
        };
        match toml::from_str::<SettingsFile>(&content) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring malformed settings file");
                None
            }
        }
    }
}

impl SettingsSource for TomlSettings {
    fn get(&self, key: &str) -> Option<String> {
        let file = self.load()?;
        match key {
            KEY_CONCURRENCY => file.concurrency.as_ref().and_then(value_to_string),
            KEY_MAX_RETRIES => file.max_retries.as_ref().and_then(value_to_string),
            KEY_DEFAULT_DOWNLOAD_PATH => file.default_download_path.filter(|p| !p.is_empty()),
            _ => None,
        }
    }
}

/// Consults each layer in order and returns the first value found.
#[derive(Default)]
pub struct LayeredSettings {
    layers: Vec<Box<dyn SettingsSource>>,
}

impl LayeredSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(mut self, source: impl SettingsSource + 'static) -> Self {
        self.layers.push(Box::new(source));
        self
    }
}

impl SettingsSource for LayeredSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_values_fall_back_to_defaults() {
        let settings = TaskSettings::resolve(&StaticSettings::new(), TaskSettings::default());
        assert_eq!(settings, TaskSettings::default());
    }

    #[test]
    fn non_numeric_values_fall_back_to_defaults() {
        let source = StaticSettings::new()
            .with(KEY_CONCURRENCY, "lots")
            .with(KEY_MAX_RETRIES, "-1");
        let settings = TaskSettings::resolve(&source, TaskSettings::default());
        assert_eq!(settings.concurrency, 5);
        assert_eq!(settings.max_retries, 3);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let source = StaticSettings::new().with(KEY_CONCURRENCY, "0");
        let settings = TaskSettings::resolve(&source, TaskSettings::default());
        assert_eq!(settings.concurrency, 5);
    }

    #[test]
    fn string_values_are_parsed() {
        let source = StaticSettings::new()
            .with(KEY_CONCURRENCY, " 8 ")
            .with(KEY_MAX_RETRIES, "0");
        let settings = TaskSettings::resolve(&source, TaskSettings::default());
        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.max_retries, 0);
    }

    #[test]
    fn toml_file_accepts_legacy_keys_and_string_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "concurrent = \"4\"\nretry = 2\ndefaultDownloadPath = \"/media\"\n",
        )
        .unwrap();

        let source = TomlSettings::new(&path);
        assert_eq!(source.get(KEY_CONCURRENCY).as_deref(), Some("4"));
        assert_eq!(source.get(KEY_MAX_RETRIES).as_deref(), Some("2"));
        assert_eq!(source.get(KEY_DEFAULT_DOWNLOAD_PATH).as_deref(), Some("/media"));

        // edits are picked up on the next read
        std::fs::write(&path, "concurrency = 9\n").unwrap();
        assert_eq!(source.get(KEY_CONCURRENCY).as_deref(), Some("9"));
        assert_eq!(source.get(KEY_MAX_RETRIES), None);
    }

    #[test]
    fn missing_or_malformed_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = TomlSettings::new(dir.path().join("nope.toml"));
        assert_eq!(missing.get(KEY_CONCURRENCY), None);

        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "concurrency = [").unwrap();
        assert_eq!(TomlSettings::new(&path).get(KEY_CONCURRENCY), None);
    }

    #[test]
    fn first_layer_wins() {
        let layered = LayeredSettings::new()
            .layer(StaticSettings::new().with(KEY_CONCURRENCY, 2))
            .layer(StaticSettings::new().with(KEY_CONCURRENCY, 7).with(KEY_MAX_RETRIES, 1));

        assert_eq!(layered.get(KEY_CONCURRENCY).as_deref(), Some("2"));
        assert_eq!(layered.get(KEY_MAX_RETRIES).as_deref(), Some("1"));
        assert_eq!(layered.get("unknown"), None);
    }
}
