//! Socket contexts: the reactor's record of each watched engine socket.
//!
//! # Design
//! A context is created the first time the engine asks to watch a socket
//! and is identified by a slab token, which doubles as the engine's socket
//! reference. Later watch requests only change the registered interest.
//! Removal deregisters the descriptor at once but frees the context
//! asynchronously: it is parked in a closing list and only released after
//! the loop confirms the close, which is when the owning request hears
//! that its socket is gone.

use std::io;
use std::os::fd::RawFd;

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use slab::Slab;
use tracing::{debug, trace};

use crate::engine::{ActionFlags, PollAction, TransferId};

/// Engine-side handle for a watched socket.
pub type SocketRef = Token;

#[derive(Debug, Clone)]
pub struct SocketContext {
    pub token: Token,
    pub fd: RawFd,
    pub transfer: TransferId,
    pub interest: Interest,
    closing: bool,
}

impl SocketContext {
    pub fn is_closing(&self) -> bool {
        self.closing
    }
}

/// Owns every socket context. Tokens come from the slab, so they must stay
/// below the reserved reactor tokens.
#[derive(Debug, Default)]
pub struct SocketTable {
    contexts: Slab<SocketContext>,
    closing: Vec<Token>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start or update a watch. Returns the socket reference and whether a
    /// new context was created.
    pub fn watch(
        &mut self,
        registry: &Registry,
        fd: RawFd,
        transfer: TransferId,
        action: PollAction,
        existing: Option<Token>,
    ) -> io::Result<(Token, bool)> {
        let Some(interest) = interest_for(action) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "remove is not a watch",
            ));
        };

        if let Some(ctx) = existing.and_then(|token| self.contexts.get_mut(token.0)) {
            if !ctx.closing && ctx.fd == fd {
                if ctx.interest != interest {
                    registry.reregister(&mut SourceFd(&fd), ctx.token, interest)?;
                    ctx.interest = interest;
                }
                trace!(token = ctx.token.0, fd, ?action, "socket interest updated");
                return Ok((ctx.token, false));
            }
        }

        let entry = self.contexts.vacant_entry();
        let token = Token(entry.key());
        registry.register(&mut SourceFd(&fd), token, interest)?;
        entry.insert(SocketContext {
            token,
            fd,
            transfer,
            interest,
            closing: false,
        });
        debug!(token = token.0, fd, %transfer, "socket context created");
        Ok((token, true))
    }

    /// Stop watching and schedule the context for release.
    pub fn remove(&mut self, registry: &Registry, token: Token) {
        let Some(ctx) = self.contexts.get_mut(token.0) else {
            return;
        };
        if ctx.closing {
            return;
        }
        if let Err(err) = registry.deregister(&mut SourceFd(&ctx.fd)) {
            debug!(token = token.0, %err, "deregister failed");
        }
        ctx.closing = true;
        self.closing.push(token);
    }

    /// Live (not closing) context for `token`.
    pub fn get(&self, token: Token) -> Option<&SocketContext> {
        self.contexts.get(token.0).filter(|ctx| !ctx.closing)
    }

    /// Release every context whose close was requested. The returned
    /// contexts tell their requests that a socket is gone.
    pub fn confirm_closes(&mut self) -> Vec<SocketContext> {
        let mut closed = Vec::with_capacity(self.closing.len());
        for token in self.closing.drain(..) {
            if self.contexts.contains(token.0) {
                closed.push(self.contexts.remove(token.0));
            }
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

fn interest_for(action: PollAction) -> Option<Interest> {
    match action {
        PollAction::In => Some(Interest::READABLE),
        PollAction::Out => Some(Interest::WRITABLE),
        PollAction::InOut => Some(Interest::READABLE | Interest::WRITABLE),
        PollAction::Remove => None,
    }
}

/// Translate a readiness event for the engine.
pub fn action_flags(event: &Event) -> ActionFlags {
    ActionFlags {
        readable: event.is_readable() || event.is_read_closed(),
        writable: event.is_writable() || event.is_write_closed(),
        error: event.is_error(),
    }
}
