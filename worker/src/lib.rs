//! netq dispatch worker.
//!
//! # Overview
//! Executes queued outbound HTTP requests without blocking whoever enqueued
//! them, and persists exactly one terminal result per work item. One thread
//! runs everything: a mio reactor, a multi-transfer HTTP/1.1 engine the
//! reactor drives through socket and timer hooks, and a dispatcher that
//! polls the queue on an idle tick.
//!
//! # Design
//! - [`Worker`] is the single context object: it owns the reactor and the
//!   dispatcher, and the dispatcher owns the queue, the engine and every
//!   in-flight request.
//! - Storage is reached only through [`netq_core::Queue`]; [`SqliteQueue`]
//!   is the production backend and `netq_core::MemoryQueue` backs tests.
//! - [`StopHandle`] and [`ReloadHandle`] are the only cross-thread handles.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod reactor;
pub mod request;
pub mod socket;
pub mod sqlite;
pub mod timer;

pub use config::{ConfigSource, ReloadHandle, Settings};
pub use dispatch::{Dispatcher, TickSummary, ABANDONED_MSG};
pub use engine::{Engine, EngineConfig, TransferError};
pub use error::{ConfigError, WorkerError};
pub use reactor::{Reactor, StopHandle};
pub use sqlite::SqliteQueue;

use netq_core::Queue;
use tracing::warn;

pub struct Worker<Q> {
    reactor: Reactor,
    dispatcher: Dispatcher<Q>,
}

impl<Q: Queue> Worker<Q> {
    pub fn new(settings: &Settings, queue: Q) -> Result<Self, WorkerError> {
        Self::with_source(settings, queue, ConfigSource::default())
    }

    /// Like [`Worker::new`], remembering where `settings` came from so a
    /// reload can re-read it.
    pub fn with_source(
        settings: &Settings,
        queue: Q,
        source: ConfigSource,
    ) -> Result<Self, WorkerError> {
        settings.validate()?;
        let reactor = Reactor::new(settings.idle_interval())?;
        let engine = Engine::new(settings.engine_config(), reactor.waker())?;
        let dispatcher = Dispatcher::new(queue, engine, settings.ttl.clone(), source);
        Ok(Self {
            reactor,
            dispatcher,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.reactor.stop_handle()
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.dispatcher.reload_handle()
    }

    /// Stop on SIGTERM/SIGINT, reload on SIGHUP.
    pub fn watch_signals(&mut self) -> Result<(), WorkerError> {
        Ok(self.reactor.watch_signals()?)
    }

    /// Recover stranded requests, then run the reactor until stopped.
    pub fn run(mut self) -> Result<(), WorkerError> {
        let abandoned = self.dispatcher.recover()?;
        if abandoned > 0 {
            warn!(abandoned, "closed requests left in flight by a previous run");
        }
        self.reactor.run(&mut self.dispatcher)
    }
}
