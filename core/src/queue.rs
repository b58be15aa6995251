//! The durable-queue contract and an in-memory implementation.
//!
//! # Design
//! The dispatcher only ever talks to storage through `Queue`. Every call is
//! synchronous and runs on the reactor thread; a failing call aborts the
//! current dispatch tick. Ids are selected for dispatch only while they have
//! no response record, which is what makes the placeholder insert the
//! at-most-once dispatch guard.
//!
//! `MemoryQueue` keeps the same semantics in process memory. Clones share
//! state, so a test can enqueue and inspect results from one thread while
//! the worker drains the queue on another. It also counts placeholder and
//! completion writes per id, and can fail a chosen storage call on demand.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::QueueError;
use crate::types::{ResponseRecord, WorkItem};

/// Storage operations consumed by the queue poller.
pub trait Queue {
    /// Liveness precondition: the queue schema exists and can be polled.
    fn is_ready(&mut self) -> Result<bool, QueueError>;

    /// Delete queue rows older than `ttl`. Response records are untouched.
    fn purge(&mut self, ttl: Duration) -> Result<u64, QueueError>;

    /// Queue rows that have no response record yet, ordered by id.
    fn fetch_pending(&mut self) -> Result<Vec<WorkItem>, QueueError>;

    /// Mark `id` in flight with an id-only response record.
    fn insert_placeholder(&mut self, id: i64) -> Result<(), QueueError>;

    /// Write the single completion for `id` over its placeholder.
    fn update_response(&mut self, id: i64, record: &ResponseRecord) -> Result<(), QueueError>;

    /// Close out placeholders left behind by a previous run, recording
    /// `error_msg` on each. Returns how many were closed.
    fn abandon_in_flight(&mut self, error_msg: &str) -> Result<u64, QueueError>;
}

/// One `Queue` operation, for targeted failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOp {
    IsReady,
    Purge,
    FetchPending,
    InsertPlaceholder,
    UpdateResponse,
    AbandonInFlight,
}

#[derive(Debug)]
struct QueuedRow {
    item: WorkItem,
    created: Instant,
}

#[derive(Debug)]
struct MemoryState {
    ready: bool,
    next_id: i64,
    rows: BTreeMap<i64, QueuedRow>,
    responses: BTreeMap<i64, ResponseRecord>,
    placeholder_writes: HashMap<i64, u32>,
    completion_writes: HashMap<i64, u32>,
    fail_next: Option<String>,
    fail_on: HashMap<QueueOp, String>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            ready: true,
            next_id: 1,
            rows: BTreeMap::new(),
            responses: BTreeMap::new(),
            placeholder_writes: HashMap::new(),
            completion_writes: HashMap::new(),
            fail_next: None,
            fail_on: HashMap::new(),
        }
    }
}

impl MemoryState {
    fn take_failure(&mut self, op: QueueOp) -> Result<(), QueueError> {
        match self.fail_next.take().or_else(|| self.fail_on.remove(&op)) {
            Some(msg) => Err(QueueError::backend(msg)),
            None => Ok(()),
        }
    }
}

/// Shared, thread-safe in-memory queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a work item and return its id.
    pub fn enqueue(&self, method: &str, url: &str, headers: &[&str], body: Option<&str>) -> i64 {
        self.enqueue_aged(method, url, headers, body, Duration::ZERO)
    }

    /// Add a work item that was created `age` ago.
    pub fn enqueue_aged(
        &self,
        method: &str,
        url: &str,
        headers: &[&str],
        body: Option<&str>,
        age: Duration,
    ) -> i64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let now = Instant::now();
        state.rows.insert(
            id,
            QueuedRow {
                item: WorkItem {
                    id,
                    method: method.to_string(),
                    url: url.to_string(),
                    headers: headers.iter().map(|h| h.to_string()).collect(),
                    body: body.map(str::to_owned),
                },
                created: now.checked_sub(age).unwrap_or(now),
            },
        );
        id
    }

    pub fn response(&self, id: i64) -> Option<ResponseRecord> {
        self.lock().responses.get(&id).cloned()
    }

    /// True once `id` has a completion (not just a placeholder).
    pub fn is_complete(&self, id: i64) -> bool {
        self.response(id).is_some_and(|r| !r.is_placeholder())
    }

    pub fn queued_ids(&self) -> Vec<i64> {
        self.lock().rows.keys().copied().collect()
    }

    pub fn response_ids(&self) -> Vec<i64> {
        self.lock().responses.keys().copied().collect()
    }

    pub fn placeholder_writes(&self, id: i64) -> u32 {
        self.lock().placeholder_writes.get(&id).copied().unwrap_or(0)
    }

    pub fn completion_writes(&self, id: i64) -> u32 {
        self.lock().completion_writes.get(&id).copied().unwrap_or(0)
    }

    pub fn set_ready(&self, ready: bool) {
        self.lock().ready = ready;
    }

    /// Make the next storage call fail with `msg`.
    pub fn fail_next(&self, msg: &str) {
        self.lock().fail_next = Some(msg.to_string());
    }

    /// Make the next call of `op` fail with `msg`; other calls succeed.
    pub fn fail_on(&self, op: QueueOp, msg: &str) {
        self.lock().fail_on.insert(op, msg.to_string());
    }
}

impl Queue for MemoryQueue {
    fn is_ready(&mut self) -> Result<bool, QueueError> {
        let mut state = self.lock();
        state.take_failure(QueueOp::IsReady)?;
        Ok(state.ready)
    }

    fn purge(&mut self, ttl: Duration) -> Result<u64, QueueError> {
        let mut state = self.lock();
        state.take_failure(QueueOp::Purge)?;
        let now = Instant::now();
        let before = state.rows.len();
        state
            .rows
            .retain(|_, row| now.saturating_duration_since(row.created) <= ttl);
        Ok((before - state.rows.len()) as u64)
    }

    fn fetch_pending(&mut self) -> Result<Vec<WorkItem>, QueueError> {
        let mut state = self.lock();
        state.take_failure(QueueOp::FetchPending)?;
        Ok(state
            .rows
            .values()
            .filter(|row| !state.responses.contains_key(&row.item.id))
            .map(|row| row.item.clone())
            .collect())
    }

    fn insert_placeholder(&mut self, id: i64) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.take_failure(QueueOp::InsertPlaceholder)?;
        if state.responses.contains_key(&id) {
            return Err(QueueError::DuplicatePlaceholder(id));
        }
        state.responses.insert(id, ResponseRecord::placeholder());
        *state.placeholder_writes.entry(id).or_default() += 1;
        Ok(())
    }

    fn update_response(&mut self, id: i64, record: &ResponseRecord) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.take_failure(QueueOp::UpdateResponse)?;
        match state.responses.get_mut(&id) {
            Some(slot) => *slot = record.clone(),
            None => return Err(QueueError::MissingPlaceholder(id)),
        }
        *state.completion_writes.entry(id).or_default() += 1;
        Ok(())
    }

    fn abandon_in_flight(&mut self, error_msg: &str) -> Result<u64, QueueError> {
        let mut state = self.lock();
        state.take_failure(QueueOp::AbandonInFlight)?;
        let mut closed = 0;
        for record in state.responses.values_mut() {
            if record.is_placeholder() {
                *record = ResponseRecord::failure(error_msg);
                closed += 1;
            }
        }
        Ok(closed)
    }
}
