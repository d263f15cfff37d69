//! Raw theme model as found in VS Code / TextMate JSON theme files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A theme as loaded from disk, before compilation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTheme {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `"light"`, `"dark"`, `"hc-black"`, ... Anything but `"light"` counts as dark.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Workbench colors; only `editor.foreground` is consulted.
    #[serde(default)]
    pub colors: HashMap<String, String>,
    #[serde(default)]
    pub token_colors: Vec<RawTokenColor>,
}

/// One `tokenColors` entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTokenColor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeField>,
    #[serde(default)]
    pub settings: RawSettings,
}

/// Theme authors write `scope` either as a comma list or as an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeField {
    One(String),
    Many(Vec<String>),
}

impl ScopeField {
    /// The selector as a single comma-separated string.
    pub fn joined(&self) -> String {
        match self {
            ScopeField::One(selector) => selector.clone(),
            ScopeField::Many(selectors) => selectors.join(","),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_style: Option<String>,
}

impl RawTheme {
    pub fn is_light(&self) -> bool {
        self.kind.as_deref() == Some("light")
    }
}
