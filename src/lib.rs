pub mod analysis;
pub mod config;
pub mod error;
mod pending;
pub mod rpc;
pub mod theme;
pub mod tokenize;
pub mod types;

pub use analysis::{AnalysisServer, AnalysisServices};
pub use config::Settings;
pub use error::{TinctureError, TinctureResult};
pub use rpc::{RpcClient, RpcServer};
pub use theme::{Theme, ThemeRegistry, compute_style_for_scopes};
pub use tokenize::TokenizerPool;
pub use types::{TypeResolutionCache, TypeResolver};
