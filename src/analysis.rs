//! The analysis server: tokenization, theming and type resolution behind
//! one RPC surface.
//!
//! - `services`: the process-wide service object and the styled-token
//!   composition
//! - `server`: RPC method registration and change broadcasts

mod server;
mod services;

pub use server::{
    AnalysisServer, GRAMMARS_INITIALIZE, THEMES_REGISTER, THEMES_UPDATED, TOKENS_RAW,
    TOKENS_STYLED, TYPES_INVALIDATE, TYPES_INVALIDATED, TYPES_RESOLVE,
};
pub use services::{
    AnalysisServices, StyledToken, StyledTokens, StyledTokensRequest, TypeLocation,
};
