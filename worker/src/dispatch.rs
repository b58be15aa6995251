//! Queue poller and completion handler.
//!
//! # Design
//! The dispatcher is the only code that talks to the queue. On every idle
//! tick it purges expired queue rows, selects the rows without a response
//! record, submits each one to the engine and marks it in flight with a
//! placeholder. When the engine reports a transfer complete, the dispatcher
//! writes the single completion for that id and hands the request context
//! to the request table for release.
//!
//! Storage failures inside a tick abort the rest of that tick; the next
//! tick starts over from the queue's current state. A completion that could
//! not be written is kept and written again at the start of every tick
//! until it lands. A row is selected only
//! while it has no response record, so a placeholder that made it to
//! storage is never dispatched again.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

use netq_core::{Interval, Queue, QueueError, RequestPlan, ResponseRecord, WorkItem};
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConfigSource, ReloadHandle};
use crate::engine::{ActionFlags, Engine, EngineHooks, Message, PollAction, SocketRef, TransferId};
use crate::error::WorkerError;
use crate::reactor::ReactorIo;
use crate::request::{RequestContext, RequestTable};

/// Recorded on placeholders stranded by a previous run.
pub const ABANDONED_MSG: &str = "request abandoned: worker stopped before completion";

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub purged: u64,
    pub dispatched: usize,
    pub rejected: usize,
}

/// Engine hooks backed by the reactor's socket table and timer.
struct Hooks<'a, 'io> {
    io: &'a mut ReactorIo<'io>,
    requests: &'a mut RequestTable,
}

impl EngineHooks for Hooks<'_, '_> {
    fn socket(
        &mut self,
        fd: RawFd,
        transfer: TransferId,
        action: PollAction,
        socketp: Option<SocketRef>,
    ) -> io::Result<Option<SocketRef>> {
        if action == PollAction::Remove {
            if let Some(token) = socketp {
                self.io.sockets.remove(self.io.registry, token);
            }
            return Ok(None);
        }

        let (token, created) = self
            .io
            .sockets
            .watch(self.io.registry, fd, transfer, action, socketp)?;
        if created {
            self.requests.socket_opened(transfer);
        }
        Ok(Some(token))
    }

    fn timer(&mut self, timeout: Option<std::time::Duration>) {
        trace!(?timeout, "engine timer");
        self.io.timer.schedule(timeout, Instant::now());
    }
}

pub struct Dispatcher<Q> {
    queue: Q,
    engine: Engine<RequestContext>,
    requests: RequestTable,
    ttl: Interval,
    config: ConfigSource,
    reload: ReloadHandle,
    unsaved: VecDeque<(i64, ResponseRecord)>,
}

impl<Q: Queue> Dispatcher<Q> {
    pub fn new(queue: Q, engine: Engine<RequestContext>, ttl: Interval, config: ConfigSource) -> Self {
        Self {
            queue,
            engine,
            requests: RequestTable::new(),
            ttl,
            config,
            reload: ReloadHandle::default(),
            unsaved: VecDeque::new(),
        }
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.reload.clone()
    }

    /// Transfers submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.engine.running()
    }

    /// Completions still waiting for a successful write.
    pub fn unsaved(&self) -> usize {
        self.unsaved.len()
    }

    /// Close out placeholders a previous run left without a completion.
    pub fn recover(&mut self) -> Result<u64, WorkerError> {
        Ok(self.queue.abandon_in_flight(ABANDONED_MSG)?)
    }

    pub(crate) fn tick(&mut self, io: &mut ReactorIo<'_>) -> Result<TickSummary, WorkerError> {
        let mut summary = TickSummary::default();
        if !self.queue.is_ready()? {
            debug!("queue not ready, skipping tick");
            return Ok(summary);
        }
        self.apply_reload();
        self.flush_unsaved()?;

        summary.purged = self.queue.purge(self.ttl.duration())?;
        for item in self.queue.fetch_pending()? {
            if self.submit(item, io)? {
                summary.dispatched += 1;
            } else {
                summary.rejected += 1;
            }
        }

        if summary != TickSummary::default() {
            info!(
                purged = summary.purged,
                dispatched = summary.dispatched,
                rejected = summary.rejected,
                in_flight = self.engine.running(),
                "dispatch tick"
            );
        }
        Ok(summary)
    }

    /// Hand one work item to the engine and mark it in flight.
    /// Returns false when the item was rejected without a transfer.
    fn submit(&mut self, item: WorkItem, io: &mut ReactorIo<'_>) -> Result<bool, WorkerError> {
        let plan = match RequestPlan::from_item(&item) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(id = item.id, %err, "rejecting request");
                self.queue.insert_placeholder(item.id)?;
                self.queue
                    .update_response(item.id, &ResponseRecord::failure(err.to_string()))?;
                return Ok(false);
            }
        };

        let ctx = RequestContext::new(&item);
        let transfer = {
            let mut hooks = Hooks {
                io: &mut *io,
                requests: &mut self.requests,
            };
            self.engine.add(plan, ctx, &mut hooks)
        };
        self.requests.insert(transfer, item.id);

        if let Err(err) = self.queue.insert_placeholder(item.id) {
            // Transfers only start on the engine's next timeout action, so
            // nothing has been sent yet.
            let mut hooks = Hooks {
                io: &mut *io,
                requests: &mut self.requests,
            };
            self.engine.remove(transfer, &mut hooks);
            self.requests.discard(transfer);
            return Err(err.into());
        }
        debug!(id = item.id, %transfer, "submitted");
        Ok(true)
    }

    /// Drive the engine for one readiness event or timeout, then persist
    /// whatever completed.
    pub(crate) fn socket_action(&mut self, fd: Option<RawFd>, flags: ActionFlags, io: &mut ReactorIo<'_>) {
        let mut hooks = Hooks {
            io: &mut *io,
            requests: &mut self.requests,
        };
        self.engine.socket_action(fd, flags, &mut hooks);
        self.drain(io);
    }

    /// The reactor confirmed a socket close.
    pub(crate) fn socket_closed(&mut self, transfer: TransferId) {
        self.requests.socket_closed(transfer);
    }

    fn drain(&mut self, io: &mut ReactorIo<'_>) {
        while let Some(message) = self.engine.info_read() {
            self.complete(message, io);
        }
    }

    fn complete(&mut self, message: Message, io: &mut ReactorIo<'_>) {
        let ctx = {
            let mut hooks = Hooks {
                io: &mut *io,
                requests: &mut self.requests,
            };
            self.engine.remove(message.transfer, &mut hooks)
        };
        let Some(mut ctx) = ctx else {
            warn!(transfer = %message.transfer, "completion for a detached transfer");
            return;
        };

        let record = match &message.result {
            Ok(done) => ResponseRecord::success(
                done.status,
                &ctx.response_body,
                std::mem::take(&mut ctx.response_headers),
                done.content_type.clone(),
            ),
            Err(err) => ResponseRecord::failure(err.to_string()),
        };

        match self.queue.update_response(ctx.id, &record) {
            Ok(()) => match &message.result {
                Ok(done) => info!(id = ctx.id, status = done.status, "request completed"),
                Err(err) => info!(id = ctx.id, error = %err, "request failed"),
            },
            Err(QueueError::MissingPlaceholder(id)) => {
                error!(id, "no placeholder for completed request, dropping result");
            }
            Err(err) => {
                error!(id = ctx.id, %err, "failed to persist response, retrying next tick");
                self.unsaved.push_back((ctx.id, record));
            }
        }

        self.requests.engine_completed(message.transfer, ctx);
    }

    /// Write kept completions in order, stopping at the first failure.
    fn flush_unsaved(&mut self) -> Result<(), WorkerError> {
        while let Some((id, record)) = self.unsaved.front() {
            let id = *id;
            match self.queue.update_response(id, record) {
                Ok(()) => info!(id, "persisted completion on retry"),
                Err(QueueError::MissingPlaceholder(_)) => {
                    error!(id, "placeholder vanished, dropping kept completion");
                }
                Err(err) => return Err(err.into()),
            }
            self.unsaved.pop_front();
        }
        Ok(())
    }

    fn apply_reload(&mut self) {
        if !self.reload.take() {
            return;
        }
        match self.config.reload_ttl() {
            Ok(Some(ttl)) if ttl != self.ttl => {
                info!(old = %self.ttl, new = %ttl, "ttl reloaded");
                self.ttl = ttl;
            }
            Ok(Some(_)) => debug!("ttl unchanged after reload"),
            Ok(None) => debug!("no config file to reload"),
            Err(err) => warn!(%err, ttl = %self.ttl, "config reload failed, keeping current ttl"),
        }
    }
}
