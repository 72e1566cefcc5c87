//! Error sink for handler dispatch failures.
//!
//! The wire protocol has no error channel: a `set` to an unknown key has no
//! effect, and a failing getter is omitted from its response. The sink makes
//! both observable to operators without changing wire compatibility.

use crate::error::Error;

/// Which bus operation a dispatch failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Set,
    Get,
    Action,
    Update,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Set => "set",
            Op::Get => "get",
            Op::Action => "action",
            Op::Update => "update",
        }
    }
}

/// Observer for dispatch failures that the protocol swallows.
pub trait ErrorSink: Send + Sync + 'static {
    /// A message referenced a key with no registered handler.
    fn unknown_key(&self, op: Op, key: &str);

    /// A registered setter or getter returned an error.
    fn handler_error(&self, op: Op, key: &str, err: &Error);
}

/// Default sink: log and move on.
#[derive(Debug, Default)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn unknown_key(&self, op: Op, key: &str) {
        tracing::debug!("invalid {} key: {:?}", op.as_str(), key);
    }

    fn handler_error(&self, op: Op, key: &str, err: &Error) {
        tracing::warn!("{} handler for {:?} failed: {}", op.as_str(), key, err);
    }
}
