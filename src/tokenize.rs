//! Off-thread grammar tokenization.
//!
//! A single background worker thread owns the compiled syntax set and does
//! all CPU-heavy tokenization. The async side talks to it through
//! [`TokenizerPool`], which correlates replies to callers by job id.
//!
//! ```text
//!  caller ──run_tokenize_job──▶ TokenizerPool ──{type,id,payload}──▶ worker thread
//!     ▲                              │ pending[id]                        │
//!     └──────── oneshot ◀── dispatcher task ◀──{type:"<op>:ok",id,...}────┘
//! ```

mod job;
mod message;
mod pool;
mod worker;

pub use job::{GrammarMap, ScopedToken, TokenizeJob, TokenizeResult};
pub use pool::{PoolError, TokenizerPool};
