//! Named theme registry shared between the RPC handlers and the worker.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;

use super::resolve::Theme;
use crate::error::{TinctureError, TinctureResult};

/// Theme ids mapped to shared theme instances.
///
/// Replacing an id installs a new `Theme`, which compiles its own rules; the
/// previous instance keeps its compiled rules for callers still holding it.
#[derive(Debug, Default)]
pub struct ThemeRegistry {
    themes: DashMap<String, Arc<Theme>>,
}

impl ThemeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a theme, returning the instance it replaced.
    pub fn register(&self, id: impl Into<String>, theme: Theme) -> Option<Arc<Theme>> {
        let id = id.into();
        log::info!(
            target: "tincture::theme",
            "Registered theme '{}' ({})",
            id,
            theme.name().unwrap_or("<unnamed>")
        );
        self.themes.insert(id, Arc::new(theme))
    }

    pub fn load_file(&self, id: impl Into<String>, path: &Path) -> TinctureResult<()> {
        let theme = Theme::load(path)?;
        self.register(id, theme);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Theme>> {
        self.themes.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn require(&self, id: &str) -> TinctureResult<Arc<Theme>> {
        self.get(id)
            .ok_or_else(|| TinctureError::theme_not_found(id))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.themes.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.themes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.themes.is_empty()
    }
}
