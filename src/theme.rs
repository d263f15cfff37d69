//! Theme scope resolution.
//!
//! Compiles a VS Code style theme into ordered, specificity-ranked rules and
//! matches token scope stacks against them, CSS-cascade style:
//!
//! - `raw`: serde model of the theme JSON
//! - `compile`: selector parsing and specificity
//! - `resolve`: winner selection and font-style decoding
//! - `registry`: theme ids to shared `Theme` instances

mod compile;
mod raw;
mod registry;
mod resolve;

pub use compile::{CompiledTheme, RuleSettings, SelectorChain, ThemeRule};
pub use raw::{RawSettings, RawTheme, RawTokenColor, ScopeField};
pub use registry::ThemeRegistry;
pub use resolve::{Theme, TokenStyle, compute_style_for_scopes, decode_font_style};
