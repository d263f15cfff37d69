//! Error handling types for tincture
//!
//! This module provides the crate-level error type. Each subsystem keeps its
//! own narrower error enum and converts into [`TinctureError`] at the seams.

use std::sync::PoisonError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::rpc::ClientError;
use crate::tokenize::PoolError;
use crate::types::TypeResolveError;

/// Comprehensive error type for analysis operations
#[derive(Debug, Error)]
pub enum TinctureError {
    /// Theme could not be parsed or compiled
    #[error("Theme error: {message}")]
    Theme { message: String },

    /// No theme registered under the requested id
    #[error("Theme not found: {theme}")]
    ThemeNotFound { theme: String },

    /// Worker pool failure (per-job or fatal)
    #[error(transparent)]
    Tokenize(#[from] PoolError),

    /// Declaration type resolution failed
    #[error(transparent)]
    TypeResolution(#[from] TypeResolveError),

    /// RPC client failure
    #[error(transparent)]
    Rpc(#[from] ClientError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for analysis operations
pub type TinctureResult<T> = Result<T, TinctureError>;

/// Helper trait to recover from poisoned `std::sync` locks
pub trait LockResultExt<T> {
    /// Recover the guard from a poisoned lock, logging which operation hit it.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "tincture::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

impl TinctureError {
    /// Create a theme error
    pub fn theme(message: impl Into<String>) -> Self {
        TinctureError::Theme {
            message: message.into(),
        }
    }

    /// Create a theme not found error
    pub fn theme_not_found(theme: impl Into<String>) -> Self {
        TinctureError::ThemeNotFound {
            theme: theme.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        TinctureError::Internal(message.into())
    }

    /// Short machine-readable name of the failing stage.
    ///
    /// Sent as `error.data.kind` in RPC error responses so callers can tell
    /// a cache failure from a worker rejection without parsing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            TinctureError::Theme { .. } => "theme",
            TinctureError::ThemeNotFound { .. } => "themeNotFound",
            TinctureError::Tokenize(_) => "tokenize",
            TinctureError::TypeResolution(_) => "typeResolution",
            TinctureError::Rpc(_) => "rpc",
            TinctureError::Config(_) => "config",
            TinctureError::Io(_) => "io",
            TinctureError::Json(_) => "json",
            TinctureError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn recover_poison_returns_inner_guard() {
        let lock = Arc::new(Mutex::new(7));
        let clone = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(lock.is_poisoned());
        let guard = lock.lock().recover_poison("test");
        assert_eq!(*guard, 7);
    }

    #[test]
    fn kind_names_the_failing_stage() {
        assert_eq!(TinctureError::theme_not_found("dark").kind(), "themeNotFound");
        assert_eq!(TinctureError::internal("boom").kind(), "internal");
    }
}
