//! Scope stack to style resolution.

use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::compile::{CompiledTheme, ThemeRule};
use super::raw::RawTheme;
use crate::error::{TinctureError, TinctureResult};

/// A theme instance.
///
/// Rules are compiled on first use and kept for the lifetime of the instance,
/// so sharing one `Arc<Theme>` means compiling once.
#[derive(Debug)]
pub struct Theme {
    raw: RawTheme,
    compiled: OnceLock<CompiledTheme>,
}

impl Theme {
    pub fn new(raw: RawTheme) -> Self {
        Self {
            raw,
            compiled: OnceLock::new(),
        }
    }

    pub fn from_json(json: &str) -> TinctureResult<Self> {
        let raw: RawTheme =
            serde_json::from_str(json).map_err(|e| TinctureError::theme(e.to_string()))?;
        Ok(Self::new(raw))
    }

    pub fn load(path: &Path) -> TinctureResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|e| match e {
            TinctureError::Theme { message } => {
                TinctureError::theme(format!("{}: {}", path.display(), message))
            }
            other => other,
        })
    }

    pub fn raw(&self) -> &RawTheme {
        &self.raw
    }

    pub fn name(&self) -> Option<&str> {
        self.raw.name.as_deref()
    }

    pub fn compiled(&self) -> &CompiledTheme {
        self.compiled.get_or_init(|| CompiledTheme::compile(&self.raw))
    }

    pub fn base_color(&self) -> &str {
        &self.compiled().base_color
    }
}

/// Resolved style for one token, shaped for CSS consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_weight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_decoration: Option<String>,
}

/// Decode a TextMate `fontStyle` string into CSS properties.
///
/// Returns `(font_style, font_weight, text_decoration)`.
pub fn decode_font_style(raw: &str) -> (Option<String>, Option<String>, Option<String>) {
    let mut font_style = None;
    let mut font_weight = None;
    let mut decorations: Vec<&str> = Vec::new();

    for flag in raw.split_whitespace() {
        match flag {
            "italic" => font_style = Some("italic".to_string()),
            "bold" => font_weight = Some("bold".to_string()),
            "underline" => {
                if !decorations.contains(&"underline") {
                    decorations.push("underline");
                }
            }
            "strikethrough" => {
                if !decorations.contains(&"line-through") {
                    decorations.push("line-through");
                }
            }
            _ => {}
        }
    }

    let text_decoration = (!decorations.is_empty()).then(|| decorations.join(" "));
    (font_style, font_weight, text_decoration)
}

/// Resolve the style for a token's scope stack (outermost scope first).
///
/// The winning rule has the highest specificity; ties go to the rule
/// declared last. With no match the theme's base color is used.
pub fn compute_style_for_scopes<S: AsRef<str>>(scopes: &[S], theme: &Theme) -> TokenStyle {
    let compiled = theme.compiled();
    let stack: Vec<Vec<&str>> = scopes
        .iter()
        .map(|scope| scope.as_ref().split('.').collect())
        .collect();

    let mut best: Option<&ThemeRule> = None;
    for rule in &compiled.rules {
        if !rule.matches(&stack) {
            continue;
        }
        let accept = match best {
            None => true,
            Some(current) => {
                rule.specificity > current.specificity
                    || (rule.specificity == current.specificity && rule.order >= current.order)
            }
        };
        if accept {
            best = Some(rule);
        }
    }

    let Some(rule) = best else {
        return TokenStyle {
            color: Some(compiled.base_color.clone()),
            ..TokenStyle::default()
        };
    };

    let (font_style, font_weight, text_decoration) = rule
        .settings
        .font_style
        .as_deref()
        .map(decode_font_style)
        .unwrap_or_default();

    TokenStyle {
        color: rule.settings.foreground.clone(),
        font_style,
        font_weight,
        text_decoration,
    }
}
