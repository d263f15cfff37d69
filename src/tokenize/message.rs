//! Messages exchanged with the worker thread.
//!
//! Outbound: `{type: "init" | "tokenize", id, payload}`.
//! Inbound: `{type: "<op>:ok" | "<op>:error", id, payload | error}`, plus a
//! fatal signal that is not tied to any job.

use super::job::{GrammarMap, TokenizeJob, TokenizeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerOp {
    Init,
    Tokenize,
    #[cfg(test)]
    Crash,
}

impl WorkerOp {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            WorkerOp::Init => "init",
            WorkerOp::Tokenize => "tokenize",
            #[cfg(test)]
            WorkerOp::Crash => "crash",
        }
    }
}

#[derive(Debug)]
pub(crate) enum OutboundPayload {
    Init(GrammarMap),
    Tokenize(TokenizeJob),
    /// Makes the worker panic.
    #[cfg(test)]
    Crash,
}

impl OutboundPayload {
    pub(crate) fn op(&self) -> WorkerOp {
        match self {
            OutboundPayload::Init(_) => WorkerOp::Init,
            OutboundPayload::Tokenize(_) => WorkerOp::Tokenize,
            #[cfg(test)]
            OutboundPayload::Crash => WorkerOp::Crash,
        }
    }
}

#[derive(Debug)]
pub(crate) struct OutboundMessage {
    pub(crate) id: u64,
    pub(crate) payload: OutboundPayload,
}

#[derive(Debug)]
pub(crate) enum ReplyPayload {
    Initialized { grammar_count: usize },
    Tokenized(TokenizeResult),
}

#[derive(Debug)]
pub(crate) enum InboundMessage {
    Ok {
        id: u64,
        op: WorkerOp,
        payload: ReplyPayload,
    },
    Error {
        id: u64,
        op: WorkerOp,
        error: String,
    },
    /// The worker is going away; every job it still holds is lost.
    Fatal { error: String },
}

impl InboundMessage {
    /// Wire-style type tag, used in logs.
    pub(crate) fn type_tag(&self) -> String {
        match self {
            InboundMessage::Ok { op, .. } => format!("{}:ok", op.as_str()),
            InboundMessage::Error { op, .. } => format!("{}:error", op.as_str()),
            InboundMessage::Fatal { .. } => "fatal".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_follow_op_suffix_convention() {
        let ok = InboundMessage::Ok {
            id: 1,
            op: WorkerOp::Tokenize,
            payload: ReplyPayload::Tokenized(TokenizeResult::default()),
        };
        let err = InboundMessage::Error {
            id: 2,
            op: WorkerOp::Init,
            error: "bad grammar".into(),
        };
        assert_eq!(ok.type_tag(), "tokenize:ok");
        assert_eq!(err.type_tag(), "init:error");
    }
}
