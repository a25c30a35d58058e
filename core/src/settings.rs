//! Settings accessor used by transports at load time.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Result;

/// Default host for network transports.
pub const DEFAULT_HOST: &str = "localhost";
/// Default queue broker port.
pub const DEFAULT_PORT: u16 = 50061;

/// Lookup of settings by logical path (e.g. `["bus", "queue", "port"]`).
pub trait SettingsSource: Send + Sync {
    fn get_setting(&self, path: &[&str]) -> Option<Value>;
}

/// Read a typed setting, falling back to `default` when the path is absent
/// or holds a value of the wrong shape.
pub fn setting_or<T: DeserializeOwned>(
    source: &dyn SettingsSource,
    path: &[&str],
    default: T,
) -> T {
    match source.get_setting(path) {
        Some(value) => match serde_json::from_value(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path.join("."), error = %e, "Ignoring malformed setting");
                default
            }
        },
        None => default,
    }
}

/// Settings tree backed by a JSON value.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    root: Value,
}

impl SettingsSource for Settings {
    fn get_setting(&self, path: &[&str]) -> Option<Value> {
        let mut node = &self.root;
        for key in path {
            node = node.get(key)?;
        }
        Some(node.clone())
    }
}

impl Settings {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let table: toml::Value = toml::from_str(s)?;
        Ok(Self::new(serde_json::to_value(table)?))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            crate::BusError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Load settings from a TOML file (path via BUSGATE_CONFIG or ./busgate.toml).
    /// A missing or unreadable file yields empty settings.
    pub fn load() -> Self {
        let path = std::env::var("BUSGATE_CONFIG").unwrap_or_else(|_| "busgate.toml".into());
        if !Path::new(&path).exists() {
            tracing::info!(path = %path, "No TOML config found; using defaults/env");
            return Self::empty();
        }
        match Self::from_file(&path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Failed to load TOML; using defaults");
                Self::empty()
            }
        }
    }

    pub fn get_setting_or<T: DeserializeOwned>(&self, path: &[&str], default: T) -> T {
        setting_or(self, path, default)
    }
}

/// Host/port pair for network transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub host: String,
    pub port: u16,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl NetworkSettings {
    /// Resolve `bus.<section>.host` / `bus.<section>.port`. `BUSGATE_HOST` and
    /// `BUSGATE_PORT` override whatever the settings say.
    pub fn from_settings(source: &dyn SettingsSource, section: &str) -> Self {
        let defaults = Self::default();
        let host = std::env::var("BUSGATE_HOST")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| setting_or(source, &["bus", section, "host"], defaults.host));
        let port = std::env::var("BUSGATE_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or_else(|| setting_or(source, &["bus", section, "port"], defaults.port));
        Self { host, port }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
