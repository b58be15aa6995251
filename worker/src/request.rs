//! Request contexts and the dual-completion join.
//!
//! # Design
//! A [`RequestContext`] owns every buffer tied to one in-flight work item:
//! copies of the request inputs, the response header pairs and the body.
//! Dropping it tears all of them down at once.
//!
//! A request ends only after two independent signals: the engine finished
//! the transfer, and every socket the transfer used has been closed by the
//! reactor. [`RequestTable`] joins the two through a
//! [`Lifecycle`](netq_core::Lifecycle) per transfer. While the transfer
//! runs, the context is the engine's private data; after completion it is
//! parked here until the last socket close is confirmed.

use std::collections::HashMap;

use netq_core::{parse_header_line, Lifecycle, ResponseHeaders, WorkItem};
use tracing::{debug, warn};

use crate::engine::{TransferId, TransferSink};

#[derive(Debug)]
pub struct RequestContext {
    pub id: i64,
    pub method: String,
    pub url: String,
    pub request_headers: Vec<String>,
    pub request_body: Option<String>,
    pub response_headers: ResponseHeaders,
    pub response_body: Vec<u8>,
    pub done: bool,
}

impl RequestContext {
    pub fn new(item: &WorkItem) -> Self {
        Self {
            id: item.id,
            method: item.method.clone(),
            url: item.url.clone(),
            request_headers: item.headers.clone(),
            request_body: item.body.clone(),
            response_headers: ResponseHeaders::new(),
            response_body: Vec::new(),
            done: false,
        }
    }
}

impl TransferSink for RequestContext {
    fn header_line(&mut self, line: &[u8]) {
        match parse_header_line(line) {
            Ok(Some((name, value))) => self.response_headers.push(name, value),
            Ok(None) => {}
            Err(err) => warn!(
                id = self.id,
                %err,
                line = %String::from_utf8_lossy(line).trim_end(),
                "skipping malformed response header line"
            ),
        }
    }

    fn body_chunk(&mut self, chunk: &[u8]) {
        self.response_body.extend_from_slice(chunk);
    }
}

#[derive(Debug)]
struct Entry {
    id: i64,
    lifecycle: Lifecycle,
    parked: Option<RequestContext>,
}

/// Lifecycle bookkeeping for every request with an engine transfer.
#[derive(Debug, Default)]
pub struct RequestTable {
    entries: HashMap<TransferId, Entry>,
    released: u64,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, transfer: TransferId, id: i64) {
        self.entries.insert(
            transfer,
            Entry {
                id,
                lifecycle: Lifecycle::new(),
                parked: None,
            },
        );
    }

    /// Forget a transfer that never reached the network.
    pub fn discard(&mut self, transfer: TransferId) {
        self.entries.remove(&transfer);
    }

    pub fn socket_opened(&mut self, transfer: TransferId) {
        let Some(entry) = self.entries.get_mut(&transfer) else {
            warn!(%transfer, "socket opened for unknown request");
            return;
        };
        if let Err(err) = entry.lifecycle.socket_opened() {
            warn!(id = entry.id, %err, "unexpected socket open");
        }
    }

    pub fn socket_closed(&mut self, transfer: TransferId) {
        let Some(entry) = self.entries.get_mut(&transfer) else {
            warn!(%transfer, "socket closed for unknown request");
            return;
        };
        match entry.lifecycle.socket_closed() {
            Ok(true) => self.release(transfer),
            Ok(false) => {}
            Err(err) => warn!(id = entry.id, %err, "unexpected socket close"),
        }
    }

    /// The engine finished with the transfer and handed its context back.
    pub fn engine_completed(&mut self, transfer: TransferId, mut ctx: RequestContext) {
        ctx.done = true;
        let Some(entry) = self.entries.get_mut(&transfer) else {
            warn!(%transfer, id = ctx.id, "completion for unknown request");
            return;
        };
        match entry.lifecycle.engine_completed() {
            Ok(true) => {
                entry.parked = Some(ctx);
                self.release(transfer);
            }
            Ok(false) => entry.parked = Some(ctx),
            Err(err) => warn!(id = entry.id, %err, "unexpected engine completion"),
        }
    }

    fn release(&mut self, transfer: TransferId) {
        if let Some(entry) = self.entries.remove(&transfer) {
            self.released += 1;
            let body_len = entry.parked.map_or(0, |ctx| ctx.response_body.len());
            debug!(id = entry.id, %transfer, body_len, "request released");
        }
    }

    /// Requests not yet released.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn released(&self) -> u64 {
        self.released
    }

    pub fn is_active(&self, transfer: TransferId) -> bool {
        self.entries.contains_key(&transfer)
    }
}
