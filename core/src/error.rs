//! Error types shared by the dispatch core.
//!
//! # Design
//! Each concern gets its own small enum so callers can match on exactly the
//! failures a given operation can produce. `SubmitError` is fatal to one
//! submission only; `QueueError` is fatal to the current dispatch tick;
//! `HeaderError` is tolerated (the offending line is skipped and logged).

use std::error::Error as StdError;

/// Errors raised while turning a work item into a request plan.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    /// Only `GET` and `POST` are dispatched; anything else never reaches
    /// the transfer engine.
    #[error("Unsupported request method {0}")]
    UnsupportedMethod(String),
}

/// A response header line that does not follow `Name: value` framing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header line has no colon separator")]
    MissingColon,

    #[error("header line has an empty field name")]
    EmptyName,

    #[error("invalid header field name {0:?}")]
    InvalidName(String),

    #[error("obsolete line folding is not accepted")]
    ObsoleteFold,

    #[error("header value contains a control character")]
    InvalidValue,
}

/// Out-of-order signals fed to a request lifecycle.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("request was already released")]
    AlreadyReleased,

    #[error("engine completion was already observed")]
    AlreadyCompleted,

    #[error("socket close confirmed with no open socket")]
    NoOpenSocket,

    #[error("socket opened after engine completion")]
    SocketAfterCompletion,
}

/// Errors parsing a retention interval such as `"3 days"`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("interval is empty")]
    Empty,

    #[error("invalid number {0:?} in interval")]
    InvalidNumber(String),

    #[error("unknown interval unit {0:?}")]
    UnknownUnit(String),

    #[error("interval is too large")]
    Overflow,
}

/// Failures of the durable queue backend.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A placeholder already exists for this id, so it was dispatched before.
    #[error("response record {0} already exists")]
    DuplicatePlaceholder(i64),

    /// A completion write found no placeholder row to update.
    #[error("no placeholder response record for {0}")]
    MissingPlaceholder(i64),

    /// The storage engine itself failed.
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),
}

impl QueueError {
    /// Wrap any backend error.
    pub fn backend(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        QueueError::Backend(err.into())
    }
}
