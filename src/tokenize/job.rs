use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Grammar id mapped to `.sublime-syntax` YAML source.
pub type GrammarMap = HashMap<String, String>;

/// One unit of tokenization work.
///
/// The source is moved into the worker on submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenizeJob {
    pub grammar_id: String,
    pub source: String,
    /// Budget for the whole job in milliseconds. Lines past the deadline are
    /// emitted unscoped.
    #[serde(default, rename = "timeLimit", skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
    /// Theme to color tokens with inside the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme_id: Option<String>,
}

impl TokenizeJob {
    pub fn new(grammar_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            grammar_id: grammar_id.into(),
            source: source.into(),
            time_limit_ms: None,
            theme_id: None,
        }
    }

    pub fn with_time_limit(mut self, millis: u64) -> Self {
        self.time_limit_ms = Some(millis);
        self
    }

    pub fn with_theme(mut self, theme_id: impl Into<String>) -> Self {
        self.theme_id = Some(theme_id.into());
        self
    }
}

/// A span of one line with its scope stack (outermost first).
///
/// `start`/`end` are byte offsets within the line, line terminator excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopedToken {
    pub content: String,
    pub start: usize,
    pub end: usize,
    pub scopes: Vec<String>,
    /// Index into [`TokenizeResult::color_map`] when the job named a theme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenizeResult {
    pub lines: Vec<Vec<ScopedToken>>,
    #[serde(default)]
    pub color_map: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_color: Option<String>,
    /// Set when the time limit cut scoping short.
    #[serde(default)]
    pub truncated: bool,
}
