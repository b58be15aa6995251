//! I/O-free core of the netq HTTP dispatch worker.
//!
//! # Overview
//! Holds everything about dispatching queued HTTP requests that can be
//! decided without a socket: the queue's data model, the method policy that
//! turns a work item into a request plan, the response header-line parser,
//! the dual-completion lifecycle of an in-flight request, retention
//! intervals, and the durable-queue contract.
//!
//! # Design
//! - The worker crate owns all I/O (reactor, transfer engine, storage
//!   backends) and depends on this crate for the rules it applies.
//! - `Queue` is the only storage seam; `MemoryQueue` implements it in
//!   memory for tests and demos.
//! - Types use owned `String` / `Vec` fields so values move freely between
//!   the poller, the engine and storage.

pub mod error;
pub mod header;
pub mod http;
pub mod interval;
pub mod lifecycle;
pub mod queue;
pub mod types;

pub use error::{HeaderError, IntervalError, LifecycleError, QueueError, SubmitError};
pub use header::parse_header_line;
pub use http::{Method, RequestPlan, USER_AGENT};
pub use interval::Interval;
pub use lifecycle::{Lifecycle, Phase};
pub use queue::{MemoryQueue, Queue, QueueOp};
pub use types::{ResponseHeaders, ResponseRecord, WorkItem};
