//! Bidirectional RPC between the long-lived analysis process and its callers.
//!
//! - `protocol`: wire shapes (`Request`, `Response`, `Notification`) and the
//!   fixed error codes
//! - `framing`: `Content-Length` framing over any async byte stream
//! - `server`: method registry, per-request dispatch, peer broadcast
//! - `client`: single logical connection with offline queueing, request
//!   timeouts and bounded reconnection
//! - `connection_state`: the client's lifecycle states

mod client;
mod connection_state;
mod framing;
mod protocol;
mod server;

pub use client::{ClientError, ClientOptions, PendingCall, RpcClient};
pub use connection_state::{ConnectionState, ReconnectOutcome};
pub use framing::{FrameError, MAX_FRAME_BYTES, read_frame, write_frame};
pub use protocol::{
    ErrorObject, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, Incoming, METHOD_NOT_FOUND,
    Notification, PARSE_ERROR, PROTOCOL_VERSION, Request, Response, VERSION_METHOD,
};
pub use server::{HandlerResult, RpcServer};
