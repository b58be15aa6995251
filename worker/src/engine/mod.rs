//! Multi-transfer HTTP/1.1 client engine driven by socket actions.
//!
//! # Design
//! The engine owns no event loop. The host tells it which socket became
//! ready (or that its timer expired) through [`Engine::socket_action`], and
//! the engine reports back through [`EngineHooks`]:
//! - `socket` asks the host to start, change or stop watching a socket. The
//!   host returns a socket reference that the engine hands back on later
//!   calls for the same watch.
//! - `timer` asks for a single oneshot wake-up, or cancels it with `None`.
//!
//! Completed transfers are queued as [`Message`]s and drained with
//! [`Engine::info_read`]. A completed transfer keeps its private data until
//! the host calls [`Engine::remove`].
//!
//! ```text
//!  Waiting ──► Resolving ──► Connecting ──► Sending ──► Receiving ──► Done
//!     │                                        ▲
//!     └──────────── idle keep-alive reuse ─────┘
//! ```
//!
//! Connections (connecting, resolving, busy and idle) never exceed
//! `max_connections`; transfers beyond the cap wait in FIFO order. An idle
//! keep-alive connection is not watched, so every watch period of a socket
//! belongs to exactly one transfer.

mod conn;
mod parse;
mod resolve;
mod wire;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::Waker;
use netq_core::RequestPlan;
use rustls::{ClientConfig, RootCertStore};
use slab::Slab;
use tracing::{debug, trace, warn};

use conn::{classify, Connection};
use parse::{Finished, ResponseParser};
use resolve::Resolver;
use wire::{encode_request, HostAddr, Origin, Target};

pub use crate::error::TransferError;
pub use crate::socket::SocketRef;

const READ_CHUNK: usize = 16 * 1024;

/// Identifies one transfer for its whole life. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

#[cfg(test)]
impl TransferId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the host should watch a socket for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    In,
    Out,
    InOut,
    Remove,
}

/// Readiness reported by the host for one socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionFlags {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Receives response data for one transfer.
pub trait TransferSink {
    /// One complete header line, CRLF included. The status line and the
    /// blank line ending the header block are delivered too.
    fn header_line(&mut self, line: &[u8]);

    fn body_chunk(&mut self, chunk: &[u8]);
}

/// Callbacks from the engine to its host event loop.
pub trait EngineHooks {
    /// Start, change or stop watching `fd`. `socketp` is the reference
    /// returned by the previous call for this watch, if any.
    fn socket(
        &mut self,
        fd: RawFd,
        transfer: TransferId,
        action: PollAction,
        socketp: Option<SocketRef>,
    ) -> io::Result<Option<SocketRef>>;

    /// Schedule the single engine timeout. `None` cancels it.
    fn timer(&mut self, timeout: Option<Duration>);
}

/// A successful exchange: any status code counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub status: u16,
    pub content_type: Option<String>,
}

#[derive(Debug)]
pub struct Message {
    pub transfer: TransferId,
    pub result: Result<Completed, TransferError>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub max_idle_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            connect_timeout: Duration::from_secs(300),
            max_idle_age: Duration::from_secs(118),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Waiting,
    Resolving,
    Connecting,
    Sending,
    Receiving,
    Done,
}

struct Transfer<T> {
    plan: RequestPlan,
    private: T,
    stage: Stage,
    target: Option<Target>,
    conn: Option<usize>,
    addrs: VecDeque<SocketAddr>,
    deadline: Option<Instant>,
    request: Vec<u8>,
    written: usize,
    response: ResponseParser,
    reused: bool,
    retried: bool,
}

enum Step {
    Pending,
    Unreachable,
    Finished(Finished),
    Failed(TransferError),
}

pub struct Engine<T> {
    config: EngineConfig,
    tls: Arc<ClientConfig>,
    resolver: Resolver,
    next_id: u64,
    transfers: HashMap<TransferId, Transfer<T>>,
    conns: Slab<Connection>,
    by_fd: HashMap<RawFd, usize>,
    idle: VecDeque<usize>,
    waiting: VecDeque<TransferId>,
    messages: VecDeque<Message>,
    timer_deadline: Option<Instant>,
}

/// Client TLS setup: ring provider, webpki roots, HTTP/1.1 only.
pub fn client_tls_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

impl<T: TransferSink> Engine<T> {
    /// `waker` is signalled whenever a background lookup finishes; the host
    /// must then run a timeout action.
    pub fn new(config: EngineConfig, waker: Arc<Waker>) -> Result<Self, crate::WorkerError> {
        Ok(Self {
            config,
            tls: client_tls_config()?,
            resolver: Resolver::new(waker),
            next_id: 1,
            transfers: HashMap::new(),
            conns: Slab::new(),
            by_fd: HashMap::new(),
            idle: VecDeque::new(),
            waiting: VecDeque::new(),
            messages: VecDeque::new(),
            timer_deadline: None,
        })
    }

    /// Queue a transfer. It starts on the next timeout action.
    pub fn add(&mut self, plan: RequestPlan, private: T, hooks: &mut dyn EngineHooks) -> TransferId {
        let id = TransferId(self.next_id);
        self.next_id += 1;
        debug!(transfer = %id, method = %plan.method, url = %plan.url, "transfer added");
        self.transfers.insert(
            id,
            Transfer {
                plan,
                private,
                stage: Stage::Waiting,
                target: None,
                conn: None,
                addrs: VecDeque::new(),
                deadline: None,
                request: Vec::new(),
                written: 0,
                response: ResponseParser::new(),
                reused: false,
                retried: false,
            },
        );
        self.waiting.push_back(id);
        self.update_timer(hooks);
        id
    }

    /// Drive the engine. `Some(fd)` reports readiness on a watched socket;
    /// `None` is the timeout action.
    pub fn socket_action(
        &mut self,
        fd: Option<RawFd>,
        flags: ActionFlags,
        hooks: &mut dyn EngineHooks,
    ) {
        let now = Instant::now();
        match fd {
            Some(fd) => {
                let transfer = self
                    .by_fd
                    .get(&fd)
                    .and_then(|&key| self.conns.get(key))
                    .and_then(|conn| conn.transfer);
                match transfer {
                    Some(id) => self.drive(id, flags, hooks),
                    None => trace!(fd, "readiness on a socket with no transfer"),
                }
            }
            None => {
                self.timer_deadline = None;
                self.collect_resolved(hooks);
                self.expire(now, hooks);
                self.prune_idle(now);
            }
        }
        self.start_waiting(hooks);
        self.update_timer(hooks);
    }

    /// Next completion message, if any.
    pub fn info_read(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    /// Detach a transfer and hand back its private data. A transfer still
    /// in progress is aborted and its connection closed.
    pub fn remove(&mut self, id: TransferId, hooks: &mut dyn EngineHooks) -> Option<T> {
        self.release_conn(id, false, hooks);
        self.waiting.retain(|&queued| queued != id);
        let transfer = self.transfers.remove(&id)?;
        self.update_timer(hooks);
        Some(transfer.private)
    }

    /// Transfers not yet completed.
    pub fn running(&self) -> usize {
        self.transfers
            .values()
            .filter(|t| t.stage != Stage::Done)
            .count()
    }

    fn drive(&mut self, id: TransferId, flags: ActionFlags, hooks: &mut dyn EngineHooks) {
        let Some(t) = self.transfers.get_mut(&id) else {
            return;
        };
        let Some(key) = t.conn else {
            return;
        };
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };

        let step = advance(t, conn, flags);
        let interest = match t.stage {
            Stage::Connecting => PollAction::Out,
            Stage::Sending => conn.send_interest(),
            _ => conn.recv_interest(),
        };
        let retryable = t.reused && !t.retried && !t.response.started();

        match step {
            Step::Pending => self.watch(key, interest, hooks),
            Step::Unreachable => {
                self.release_conn(id, false, hooks);
                self.connect_next(id, hooks);
            }
            Step::Finished(done) => {
                self.release_conn(id, done.reusable, hooks);
                self.complete(
                    id,
                    Ok(Completed {
                        status: done.status,
                        content_type: done.content_type,
                    }),
                );
            }
            Step::Failed(err) if retryable => {
                // The server dropped a kept-alive connection before answering.
                debug!(transfer = %id, %err, "stale connection, retrying on a fresh one");
                self.release_conn(id, false, hooks);
                if let Some(t) = self.transfers.get_mut(&id) {
                    t.stage = Stage::Waiting;
                    t.written = 0;
                    t.response = ResponseParser::new();
                    t.reused = false;
                    t.retried = true;
                }
                self.waiting.push_front(id);
            }
            Step::Failed(err) => {
                self.release_conn(id, false, hooks);
                self.complete(id, Err(err));
            }
        }
    }

    fn start_waiting(&mut self, hooks: &mut dyn EngineHooks) {
        while let Some(&id) = self.waiting.front() {
            let origin = match self.prepare(id) {
                Some(Ok(origin)) => origin,
                Some(Err(err)) => {
                    self.waiting.pop_front();
                    self.complete(id, Err(err));
                    continue;
                }
                None => {
                    self.waiting.pop_front();
                    continue;
                }
            };

            if let Some(key) = self.checkout_idle(&origin) {
                self.waiting.pop_front();
                self.attach(id, key, hooks);
                continue;
            }

            if self.slots_in_use() >= self.config.max_connections && !self.evict_idle() {
                break;
            }
            self.waiting.pop_front();
            self.begin(id, hooks);
        }
    }

    /// Parse the target and build the request bytes once.
    fn prepare(&mut self, id: TransferId) -> Option<Result<Origin, TransferError>> {
        let t = self.transfers.get_mut(&id)?;
        if t.target.is_none() {
            match Target::parse(&t.plan.url) {
                Ok(target) => {
                    t.request = encode_request(&t.plan, &target);
                    t.target = Some(target);
                }
                Err(err) => return Some(Err(err)),
            }
        }
        t.target.as_ref().map(|target| Ok(target.origin.clone()))
    }

    fn begin(&mut self, id: TransferId, hooks: &mut dyn EngineHooks) {
        let deadline = Instant::now() + self.config.connect_timeout;
        let Some(t) = self.transfers.get_mut(&id) else {
            return;
        };
        let Some(target) = &t.target else {
            return;
        };
        let addr = target.addr.clone();
        let port = target.origin.port;
        t.deadline = Some(deadline);

        match addr {
            HostAddr::Ip(ip) => {
                t.addrs = VecDeque::from([SocketAddr::new(ip, port)]);
                self.connect_next(id, hooks);
            }
            HostAddr::Name(name) => {
                if self.resolver.lookup(id, &name, port) {
                    debug!(transfer = %id, host = %name, "resolving");
                    t.stage = Stage::Resolving;
                } else {
                    self.complete(id, Err(TransferError::CouldntResolveHost));
                }
            }
        }
    }

    fn collect_resolved(&mut self, hooks: &mut dyn EngineHooks) {
        while let Some(resolved) = self.resolver.try_recv() {
            let id = resolved.transfer;
            let Some(t) = self.transfers.get_mut(&id) else {
                continue;
            };
            if t.stage != Stage::Resolving {
                continue;
            }
            match resolved.addrs {
                Ok(addrs) if !addrs.is_empty() => {
                    t.addrs = addrs.into();
                    t.stage = Stage::Connecting;
                    self.connect_next(id, hooks);
                }
                Ok(_) => self.complete(id, Err(TransferError::CouldntResolveHost)),
                Err(err) => {
                    debug!(transfer = %id, %err, "lookup failed");
                    self.complete(id, Err(TransferError::CouldntResolveHost));
                }
            }
        }
    }

    /// Open a connection to the next candidate address.
    fn connect_next(&mut self, id: TransferId, hooks: &mut dyn EngineHooks) {
        loop {
            let Some(t) = self.transfers.get_mut(&id) else {
                return;
            };
            let Some(addr) = t.addrs.pop_front() else {
                self.complete(id, Err(TransferError::CouldntConnect));
                return;
            };
            let Some(origin) = t.target.as_ref().map(|target| target.origin.clone()) else {
                return;
            };

            let stream = match TcpStream::connect(addr) {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(transfer = %id, %addr, %err, "connect failed");
                    continue;
                }
            };
            let mut conn = match Connection::new(stream, origin, &self.tls) {
                Ok(conn) => conn,
                Err(err) => {
                    self.complete(id, Err(err));
                    return;
                }
            };
            conn.transfer = Some(id);
            let fd = conn.fd();
            let key = self.conns.insert(conn);
            self.by_fd.insert(fd, key);
            t.conn = Some(key);
            t.stage = Stage::Connecting;
            debug!(transfer = %id, %addr, "connecting");
            self.watch(key, PollAction::Out, hooks);
            return;
        }
    }

    /// Put a transfer on a parked keep-alive connection.
    fn attach(&mut self, id: TransferId, key: usize, hooks: &mut dyn EngineHooks) {
        let deadline = Instant::now() + self.config.connect_timeout;
        if let Some(conn) = self.conns.get_mut(key) {
            conn.transfer = Some(id);
            conn.idle_since = None;
        }
        if let Some(t) = self.transfers.get_mut(&id) {
            t.conn = Some(key);
            t.stage = Stage::Sending;
            t.reused = true;
            t.deadline = Some(deadline);
        }
        debug!(transfer = %id, "reusing connection");
        self.drive(id, ActionFlags::default(), hooks);
    }

    fn watch(&mut self, key: usize, action: PollAction, hooks: &mut dyn EngineHooks) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        let Some(transfer) = conn.transfer else {
            return;
        };
        if conn.watching == Some(action) {
            return;
        }
        trace!(%transfer, ?action, "watch");
        match hooks.socket(conn.fd(), transfer, action, conn.socketp) {
            Ok(socketp) => {
                conn.socketp = socketp;
                conn.watching = Some(action);
            }
            Err(err) => {
                warn!(%transfer, %err, "failed to watch socket");
                self.release_conn(transfer, false, hooks);
                self.complete(transfer, Err(TransferError::SocketWatch));
            }
        }
    }

    fn unwatch(&mut self, key: usize, hooks: &mut dyn EngineHooks) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        if let (Some(transfer), Some(_)) = (conn.transfer, conn.watching) {
            let socketp = conn.socketp.take();
            if let Err(err) = hooks.socket(conn.fd(), transfer, PollAction::Remove, socketp) {
                debug!(%transfer, %err, "failed to unwatch socket");
            }
        }
        conn.watching = None;
        conn.socketp = None;
    }

    /// Detach the transfer's connection, parking it for reuse or closing it.
    fn release_conn(&mut self, id: TransferId, reusable: bool, hooks: &mut dyn EngineHooks) {
        let Some(key) = self.transfers.get_mut(&id).and_then(|t| t.conn.take()) else {
            return;
        };
        self.unwatch(key, hooks);
        if !reusable {
            self.close_conn(key);
            return;
        }
        if let Some(conn) = self.conns.get_mut(key) {
            conn.transfer = None;
            conn.idle_since = Some(Instant::now());
            self.idle.push_back(key);
        }
    }

    fn close_conn(&mut self, key: usize) {
        if self.conns.contains(key) {
            let conn = self.conns.remove(key);
            self.by_fd.remove(&conn.fd());
            trace!(fd = conn.fd(), "connection closed");
        }
    }

    fn checkout_idle(&mut self, origin: &Origin) -> Option<usize> {
        let now = Instant::now();
        let max_age = self.config.max_idle_age;
        while let Some(pos) = self
            .idle
            .iter()
            .position(|&key| self.conns.get(key).is_some_and(|c| &c.origin == origin))
        {
            let key = self.idle.remove(pos)?;
            let usable = self.conns.get(key).is_some_and(|c| {
                c.idle_since
                    .is_some_and(|since| now.saturating_duration_since(since) < max_age)
                    && c.idle_alive()
            });
            if usable {
                return Some(key);
            }
            debug!("discarding closed keep-alive connection");
            self.close_conn(key);
        }
        None
    }

    fn evict_idle(&mut self) -> bool {
        match self.idle.pop_front() {
            Some(key) => {
                self.close_conn(key);
                true
            }
            None => false,
        }
    }

    fn prune_idle(&mut self, now: Instant) {
        let max_age = self.config.max_idle_age;
        let conns = &self.conns;
        let (stale, fresh): (VecDeque<usize>, VecDeque<usize>) =
            self.idle.iter().partition(|&&key| {
                conns.get(key).map_or(true, |c| {
                    c.idle_since
                        .map_or(true, |since| now.saturating_duration_since(since) >= max_age)
                })
            });
        self.idle = fresh;
        for key in stale {
            self.close_conn(key);
        }
    }

    fn expire(&mut self, now: Instant, hooks: &mut dyn EngineHooks) {
        let expired: Vec<TransferId> = self
            .transfers
            .iter()
            .filter(|(_, t)| {
                matches!(t.stage, Stage::Resolving | Stage::Connecting | Stage::Sending)
                    && t.deadline.is_some_and(|deadline| deadline <= now)
            })
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            debug!(transfer = %id, "connect timeout");
            self.release_conn(id, false, hooks);
            self.complete(id, Err(TransferError::Timeout));
        }
    }

    fn complete(&mut self, id: TransferId, result: Result<Completed, TransferError>) {
        let Some(t) = self.transfers.get_mut(&id) else {
            return;
        };
        if t.stage == Stage::Done {
            return;
        }
        t.stage = Stage::Done;
        t.deadline = None;
        match &result {
            Ok(done) => debug!(transfer = %id, status = done.status, "transfer complete"),
            Err(err) => debug!(transfer = %id, %err, "transfer failed"),
        }
        self.messages.push_back(Message {
            transfer: id,
            result,
        });
    }

    fn slots_in_use(&self) -> usize {
        let resolving = self
            .transfers
            .values()
            .filter(|t| t.stage == Stage::Resolving)
            .count();
        self.conns.len() + resolving
    }

    fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let can_start =
            self.slots_in_use() < self.config.max_connections || !self.idle.is_empty();
        if !self.waiting.is_empty() && can_start {
            return Some(now);
        }

        let transfers = self.transfers.values().filter_map(|t| match t.stage {
            Stage::Resolving | Stage::Connecting | Stage::Sending => t.deadline,
            _ => None,
        });
        let idle = self.idle.iter().filter_map(|&key| {
            self.conns
                .get(key)
                .and_then(|c| c.idle_since)
                .map(|since| since + self.config.max_idle_age)
        });
        transfers.chain(idle).min()
    }

    /// Report the wanted timeout to the host when it changes.
    fn update_timer(&mut self, hooks: &mut dyn EngineHooks) {
        let now = Instant::now();
        let wanted = self.next_deadline(now);
        if wanted != self.timer_deadline {
            self.timer_deadline = wanted;
            hooks.timer(wanted.map(|deadline| deadline.saturating_duration_since(now)));
        }
    }
}

fn advance<T: TransferSink>(t: &mut Transfer<T>, conn: &mut Connection, flags: ActionFlags) -> Step {
    if t.stage == Stage::Connecting {
        match conn.connect_result() {
            Ok(true) => t.stage = Stage::Sending,
            Ok(false) if flags.error => return Step::Unreachable,
            Ok(false) => return Step::Pending,
            Err(err) => {
                debug!(%err, "connect attempt failed");
                return Step::Unreachable;
            }
        }
    }

    if t.stage == Stage::Sending {
        loop {
            if t.written < t.request.len() {
                match conn.write(&t.request[t.written..]) {
                    Ok(0) => {}
                    Ok(n) => {
                        t.written += n;
                        continue;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Step::Pending,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Step::Failed(classify(&err, TransferError::Send)),
                }
            }
            match conn.flush() {
                Ok(true) if t.written == t.request.len() => {
                    t.stage = Stage::Receiving;
                    break;
                }
                Ok(true) => continue,
                Ok(false) => return Step::Pending,
                Err(err) => return Step::Failed(classify(&err, TransferError::Tls)),
            }
        }
    }

    let mut buf = [0u8; READ_CHUNK];
    loop {
        match conn.read(&mut buf) {
            Ok(0) => {
                return match t.response.finish_eof() {
                    Ok(done) => Step::Finished(done),
                    Err(err) => Step::Failed(err),
                }
            }
            Ok(n) => match t.response.feed(&buf[..n], &mut t.private) {
                Ok(Some(done)) => return Step::Finished(done),
                Ok(None) => {}
                Err(err) => return Step::Failed(err),
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Step::Pending,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Step::Failed(classify(&err, TransferError::Recv)),
        }
    }
}
