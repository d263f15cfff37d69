use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rpc::ClientOptions;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5996,
        }
    }
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientSettings {
    pub request_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let options = ClientOptions::default();
        Self {
            request_timeout_ms: u64::try_from(options.request_timeout.as_millis()).unwrap_or(u64::MAX),
            reconnect_interval_ms: u64::try_from(options.reconnect_interval.as_millis())
                .unwrap_or(u64::MAX),
            max_reconnect_attempts: options.max_reconnect_attempts,
        }
    }
}

impl ClientSettings {
    pub fn options(&self) -> ClientOptions {
        ClientOptions {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Default per-job budget when a request does not name one.
    pub time_limit_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub worker: WorkerSettings,
    /// Grammar id -> `.sublime-syntax` file.
    pub grammars: BTreeMap<String, PathBuf>,
    /// Theme id -> VS Code style JSON theme file.
    pub themes: BTreeMap<String, PathBuf>,
    pub default_theme: Option<String>,
    /// Level name, `error` through `trace`. `RUST_LOG` takes precedence.
    pub log_level: Option<String>,
}

impl Settings {
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve relative grammar and theme paths against `base`
    /// (the directory holding the config file).
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        for path in self.grammars.values_mut().chain(self.themes.values_mut()) {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        self
    }
}
