//! Locating and loading the configuration file.
//!
//! User config location: `$XDG_CONFIG_HOME/tincture/tincture.toml`
//! Fallback: the platform config directory (`dirs::config_dir()`)

use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use super::settings::Settings;

pub const CONFIG_DIR_NAME: &str = "tincture";
pub const CONFIG_FILE_NAME: &str = "tincture.toml";

/// Overrides `[server] port`.
pub const PORT_ENV: &str = "TINCTURE_PORT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("TINCTURE_PORT must be a port number, got {value:?}")]
    InvalidPort { value: String },
}

/// Returns the path of the user configuration file.
///
/// 1. If $XDG_CONFIG_HOME is set: $XDG_CONFIG_HOME/tincture/tincture.toml
/// 2. Otherwise the platform config directory
///
/// Returns None if neither can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)?;
    Some(base.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load and parse one file. Relative grammar/theme paths are resolved
/// against the file's directory.
pub fn load_file(path: &Path) -> Result<Settings, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let settings = Settings::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(settings.resolve_paths(base))
}

/// Load settings following the lookup order, then apply environment
/// overrides.
///
/// An explicit path must exist. A missing user config falls back to
/// defaults; a malformed one is an error.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut settings = match explicit {
        Some(path) => {
            info!(target: "tincture::config", "Loading config from {}", path.display());
            load_file(path)?
        }
        None => match user_config_path() {
            Some(path) if path.is_file() => {
                info!(target: "tincture::config", "Loading config from {}", path.display());
                load_file(&path)?
            }
            candidate => {
                debug!(
                    target: "tincture::config",
                    "No config file found (looked at {:?}), using defaults",
                    candidate
                );
                Settings::default()
            }
        },
    };
    apply_env_overrides(&mut settings)?;
    Ok(settings)
}

pub fn apply_env_overrides(settings: &mut Settings) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(PORT_ENV) {
        let port = value
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort {
                value: value.clone(),
            })?;
        debug!(target: "tincture::config", "{} overrides port to {}", PORT_ENV, port);
        settings.server.port = port;
    }
    Ok(())
}
