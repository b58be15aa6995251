//! Host name resolution off the reactor thread.
//!
//! `getaddrinfo` blocks, so every lookup runs on its own short-lived
//! thread and a slow name never holds up the others. Results come back
//! over a channel and the reactor is woken through its waker; the engine
//! collects them on its next timeout action. Lookups in progress count
//! against the engine's connection cap, which bounds the thread count.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::Waker;
use tracing::warn;

use super::TransferId;

pub(crate) struct Resolved {
    pub transfer: TransferId,
    pub addrs: io::Result<Vec<SocketAddr>>,
}

pub(crate) struct Resolver {
    waker: Arc<Waker>,
    results_tx: Sender<Resolved>,
    results: Receiver<Resolved>,
}

impl Resolver {
    pub fn new(waker: Arc<Waker>) -> Self {
        let (results_tx, results) = unbounded();
        Self {
            waker,
            results_tx,
            results,
        }
    }

    /// Start a lookup. Returns false if no thread could be spawned.
    pub fn lookup(&self, transfer: TransferId, host: &str, port: u16) -> bool {
        let host = host.to_string();
        let results = self.results_tx.clone();
        let waker = Arc::clone(&self.waker);
        let spawned = thread::Builder::new()
            .name("netq-resolve".into())
            .spawn(move || {
                let addrs = (host.as_str(), port)
                    .to_socket_addrs()
                    .map(|found| found.collect::<Vec<_>>());
                // The engine is gone when the send fails.
                if results.send(Resolved { transfer, addrs }).is_ok() {
                    if let Err(err) = waker.wake() {
                        warn!(%err, "failed to wake reactor after lookup");
                    }
                }
            });
        match spawned {
            Ok(_) => true,
            Err(err) => {
                warn!(%transfer, %err, "failed to spawn resolver thread");
                false
            }
        }
    }

    pub fn try_recv(&self) -> Option<Resolved> {
        match self.results.try_recv() {
            Ok(resolved) => Some(resolved),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}
