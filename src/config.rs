//! Configuration for the analysis server and its clients.
//!
//! Settings come from one TOML file, looked up in order: an explicit path,
//! `$XDG_CONFIG_HOME/tincture/tincture.toml`, then the platform config
//! directory. Without a file every field takes its default.

mod settings;
mod user;

pub use settings::{ClientSettings, ServerSettings, Settings, WorkerSettings};
pub use user::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, ConfigError, PORT_ENV, apply_env_overrides, load_file,
    load_settings, user_config_path,
};
