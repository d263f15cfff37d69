//! Selector compilation.
//!
//! A selector string such as `"source.ts keyword.control, comment"` compiles
//! into two chains. Each chain is an ordered list of segments, and each
//! segment is the dot-split list of sub-scopes:
//!
//! ```text
//! "source.ts keyword.control, comment"
//!   chain 0: [["source", "ts"], ["keyword", "control"]]
//!   chain 1: [["comment"]]
//! ```

use super::raw::RawTheme;

const LIGHT_FALLBACK_FOREGROUND: &str = "#000000";
const DARK_FALLBACK_FOREGROUND: &str = "#FFFFFF";

/// One comma-separated alternative of a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorChain {
    segments: Vec<Vec<String>>,
}

impl SelectorChain {
    /// Parse one chain. Returns `None` for a blank chain.
    pub fn parse(chain: &str) -> Option<Self> {
        let segments: Vec<Vec<String>> = chain
            .split_whitespace()
            .map(|segment| {
                segment
                    .split('.')
                    .filter(|part| !part.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|parts| !parts.is_empty())
            .collect();

        if segments.is_empty() {
            None
        } else {
            Some(Self { segments })
        }
    }

    pub fn segments(&self) -> &[Vec<String>] {
        &self.segments
    }

    /// Total number of sub-scope parts across all segments.
    pub fn part_count(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    /// Match the chain against a pre-split scope stack.
    ///
    /// Segments must appear as a monotonic subsequence of the stack, each one
    /// a part-wise prefix of the stack entry it lands on.
    pub fn matches(&self, stack: &[Vec<&str>]) -> bool {
        let mut cursor = 0;
        for segment in &self.segments {
            loop {
                let Some(entry) = stack.get(cursor) else {
                    return false;
                };
                cursor += 1;
                if is_part_prefix(segment, entry) {
                    break;
                }
            }
        }
        true
    }
}

fn is_part_prefix(segment: &[String], entry: &[&str]) -> bool {
    segment.len() <= entry.len()
        && segment
            .iter()
            .zip(entry.iter())
            .all(|(want, have)| want == have)
}

/// Style carried by a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSettings {
    pub foreground: Option<String>,
    pub font_style: Option<String>,
}

/// A compiled `tokenColors` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeRule {
    pub selector_chains: Vec<SelectorChain>,
    pub settings: RuleSettings,
    /// Largest `part_count` over the rule's chains. Fixed at compile time.
    pub specificity: usize,
    /// Declaration index within `tokenColors`.
    pub order: usize,
}

impl ThemeRule {
    /// Compile a selector string. Returns `None` when it has no usable chain.
    pub fn compile(selector: &str, settings: RuleSettings, order: usize) -> Option<Self> {
        let selector_chains: Vec<SelectorChain> =
            selector.split(',').filter_map(SelectorChain::parse).collect();
        if selector_chains.is_empty() {
            return None;
        }

        let specificity = selector_chains
            .iter()
            .map(SelectorChain::part_count)
            .max()
            .unwrap_or(0);

        Some(Self {
            selector_chains,
            settings,
            specificity,
            order,
        })
    }

    pub fn matches(&self, stack: &[Vec<&str>]) -> bool {
        self.selector_chains.iter().any(|chain| chain.matches(stack))
    }
}

/// Rules plus the fallback foreground used when nothing matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTheme {
    pub rules: Vec<ThemeRule>,
    pub base_color: String,
}

impl CompiledTheme {
    pub fn compile(raw: &RawTheme) -> Self {
        let mut rules = Vec::with_capacity(raw.token_colors.len());
        let mut default_foreground = None;

        for (order, entry) in raw.token_colors.iter().enumerate() {
            let settings = RuleSettings {
                foreground: entry.settings.foreground.clone(),
                font_style: entry.settings.font_style.clone(),
            };

            let selector = entry.scope.as_ref().map(|scope| scope.joined());
            match selector
                .as_deref()
                .and_then(|selector| ThemeRule::compile(selector, settings.clone(), order))
            {
                Some(rule) => rules.push(rule),
                // Scope-less entries set the editor default instead of a rule
                None => {
                    if settings.foreground.is_some() {
                        default_foreground = settings.foreground;
                    }
                }
            }
        }

        let base_color = raw
            .colors
            .get("editor.foreground")
            .cloned()
            .or(default_foreground)
            .unwrap_or_else(|| {
                if raw.is_light() {
                    LIGHT_FALLBACK_FOREGROUND.to_string()
                } else {
                    DARK_FALLBACK_FOREGROUND.to_string()
                }
            });

        log::debug!(
            target: "tincture::theme",
            "Compiled theme {:?}: {} rules, base color {}",
            raw.name.as_deref().unwrap_or("<unnamed>"),
            rules.len(),
            base_color
        );

        Self { rules, base_color }
    }
}
