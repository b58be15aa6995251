//! Worker error types.
//!
//! # Design
//! `TransferError` is a per-request transport failure. It never escapes the
//! worker: its display text becomes the `error_msg` of the request's
//! response record. `WorkerError` covers everything that stops a dispatch
//! tick or the reactor itself.

use std::io;
use std::path::PathBuf;

use netq_core::{IntervalError, QueueError};

/// Transport-level failure of one transfer.
///
/// Messages follow the wording operators already know from libcurl, so
/// existing alerting on `error_msg` keeps matching.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("URL using bad/illegal format or missing URL")]
    UrlMalformat,

    #[error("Unsupported protocol")]
    UnsupportedProtocol,

    #[error("Couldn't resolve host name")]
    CouldntResolveHost,

    #[error("Couldn't connect to server")]
    CouldntConnect,

    #[error("Timeout was reached")]
    Timeout,

    #[error("SSL connect error")]
    Tls,

    #[error("SSL peer certificate or SSH remote key was not OK")]
    PeerFailedVerification,

    #[error("Failure when sending data to the peer")]
    Send,

    #[error("Failure when receiving data from the peer")]
    Recv,

    #[error("Weird server reply")]
    WeirdReply,

    #[error("Server returned nothing (no headers, no data)")]
    GotNothing,

    #[error("Transferred a partial file")]
    PartialFile,

    #[error("Failed to register socket with the event loop")]
    SocketWatch,
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid ttl: {0}")]
    Ttl(#[from] IntervalError),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Failures of the worker itself.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("event loop I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}
