//! The single-threaded reactor loop.
//!
//! # Design
//! One `mio::Poll` is the only place the worker thread ever blocks. It
//! wakes for:
//! - readiness on a socket the engine asked to watch,
//! - the engine timer deadline,
//! - the idle dispatch tick (the first one fires immediately),
//! - the shared waker (finished host lookups, or a stop request),
//! - SIGTERM / SIGINT / SIGHUP when signal handling is enabled.
//!
//! Every engine action is followed by a drain of completed transfers.
//! Socket close confirmations are processed after all actions of the same
//! iteration, so a request never sees its socket vanish in the middle of an
//! engine call.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use netq_core::Queue;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::engine::ActionFlags;
use crate::error::WorkerError;
use crate::socket::{action_flags, SocketTable};
use crate::timer::TimerState;

const WAKE: Token = Token(usize::MAX);
const SIGNALS: Token = Token(usize::MAX - 1);
const EVENT_CAPACITY: usize = 1024;

/// The reactor state the engine hooks need during one action.
pub(crate) struct ReactorIo<'a> {
    pub registry: &'a Registry,
    pub sockets: &'a mut SocketTable,
    pub timer: &'a mut TimerState,
}

/// Stops a running reactor from any thread.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(err) = self.waker.wake() {
            warn!(%err, "failed to wake reactor for stop");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    sockets: SocketTable,
    timer: TimerState,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    signals: Option<Signals>,
    idle_interval: Duration,
}

impl Reactor {
    pub fn new(idle_interval: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            sockets: SocketTable::new(),
            timer: TimerState::new(),
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            signals: None,
            idle_interval,
        })
    }

    /// Waker shared with the engine's resolver.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Route SIGTERM and SIGINT to a stop and SIGHUP to a settings reload.
    pub fn watch_signals(&mut self) -> io::Result<()> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
        self.poll
            .registry()
            .register(&mut signals, SIGNALS, Interest::READABLE)?;
        self.signals = Some(signals);
        Ok(())
    }

    fn io(&mut self) -> ReactorIo<'_> {
        ReactorIo {
            registry: self.poll.registry(),
            sockets: &mut self.sockets,
            timer: &mut self.timer,
        }
    }

    fn poll_timeout(&self, now: Instant, next_tick: Instant) -> Duration {
        let idle = next_tick.saturating_duration_since(now);
        match self.timer.remaining(now) {
            Some(timer) => timer.min(idle),
            None => idle,
        }
    }

    /// Run until stopped. In-flight transfers are abandoned on exit.
    pub fn run<Q: Queue>(&mut self, dispatcher: &mut Dispatcher<Q>) -> Result<(), WorkerError> {
        let mut ready: Vec<(Token, ActionFlags)> = Vec::with_capacity(EVENT_CAPACITY);
        let mut next_tick = Instant::now();
        info!(idle_interval = ?self.idle_interval, "reactor started");

        loop {
            let timeout = self.poll_timeout(Instant::now(), next_tick);
            if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            let mut woken = false;
            let mut signalled = false;
            ready.clear();
            for event in self.events.iter() {
                match event.token() {
                    WAKE => woken = true,
                    SIGNALS => signalled = true,
                    token => ready.push((token, action_flags(event))),
                }
            }

            if signalled {
                self.handle_signals(dispatcher);
            }
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            for &(token, flags) in &ready {
                // Contexts closed earlier in this batch are skipped.
                let Some(fd) = self.sockets.get(token).map(|ctx| ctx.fd) else {
                    continue;
                };
                dispatcher.socket_action(Some(fd), flags, &mut self.io());
            }

            let now = Instant::now();
            if self.timer.fire(now) || woken {
                dispatcher.socket_action(None, ActionFlags::default(), &mut self.io());
            }

            for ctx in self.sockets.confirm_closes() {
                debug!(token = ctx.token.0, transfer = %ctx.transfer, "socket close confirmed");
                dispatcher.socket_closed(ctx.transfer);
            }

            if Instant::now() >= next_tick {
                if let Err(err) = dispatcher.tick(&mut self.io()) {
                    error!(%err, "dispatch tick failed");
                }
                next_tick = Instant::now() + self.idle_interval;
            }
        }

        if dispatcher.unsaved() > 0 {
            warn!(unsaved = dispatcher.unsaved(), "stopping with completions not yet persisted");
        }
        info!(in_flight = dispatcher.in_flight(), "reactor stopped");
        Ok(())
    }

    fn handle_signals<Q: Queue>(&mut self, dispatcher: &Dispatcher<Q>) {
        let Some(signals) = self.signals.as_mut() else {
            return;
        };
        for signal in signals.pending() {
            match signal {
                SIGHUP => {
                    info!("SIGHUP received, reloading settings at next tick");
                    dispatcher.reload_handle().request();
                }
                SIGTERM | SIGINT => {
                    info!(signal, "shutdown signal received");
                    self.stop.store(true, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }
}
