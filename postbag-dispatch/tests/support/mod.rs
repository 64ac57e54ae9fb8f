//! Scripted collaborators for dispatch tests
//!
//! - [`ScriptedTransport`] replays a queue of send results and records every call
//! - [`GatedTransport`] blocks inside `send` until the test opens the gate
//! - [`HangingTransport`] never completes, for timeout tests
//! - [`InstrumentedStore`] wraps the memory store, counts calls and injects failures
#![allow(dead_code, clippy::expect_used)] // Not every test binary uses every helper

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use postbag_dispatch::{
    BatchId, ComposedMessage, MemoryMessageStore, MessageId, MessageRecord, MessageStatus,
    MessageStore, NewMessage, SendReport, StoreError, Transport, TransportError,
};
use tokio::sync::{Notify, Semaphore};

/// Insert `count` valid queued messages
pub fn seed(store: &MemoryMessageStore, count: usize) {
    for n in 0..count {
        store
            .insert(NewMessage::new(
                format!("user{n}@example.com"),
                format!("Message {n}"),
                "<p>Hello</p>",
            ))
            .expect("insert");
    }
}

/// A record already carrying delivery state
pub fn record(id: u64, attempts: u32, status: MessageStatus) -> MessageRecord {
    let mut record = MessageRecord::queued(
        MessageId(id),
        NewMessage::new(format!("user{id}@example.com"), "Hello", "<p>Hello</p>"),
    );
    record.attempts = attempts;
    record.status = status;
    record
}

pub async fn fetch(store: &MemoryMessageStore, id: u64) -> MessageRecord {
    store
        .get(MessageId(id))
        .await
        .expect("get")
        .expect("record exists")
}

fn tokens(messages: &[ComposedMessage]) -> Vec<MessageId> {
    messages
        .iter()
        .filter_map(ComposedMessage::correlation_token)
        .collect()
}

/// Transport replaying queued results; `AllDelivered` once the script runs out
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<SendReport, TransportError>>>,
    calls: Mutex<Vec<Vec<MessageId>>>,
    reject_all: bool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(
        script: impl IntoIterator<Item = Result<SendReport, TransportError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        })
    }

    /// Every message of every call is reported as failed
    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            reject_all: true,
            ..Self::default()
        })
    }

    /// Correlation tokens of every call, in call order
    pub fn calls(&self) -> Vec<Vec<MessageId>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, messages: &[ComposedMessage]) -> Result<SendReport, TransportError> {
        let sent = tokens(messages);
        self.calls.lock().push(sent.clone());

        if self.reject_all {
            return Ok(SendReport::PartialFailure(sent.into_iter().collect()));
        }

        self.script
            .lock()
            .pop_front()
            .unwrap_or(Ok(SendReport::AllDelivered))
    }
}

/// Transport that parks every call until [`GatedTransport::open`]
pub struct GatedTransport {
    entered: Notify,
    gate: Semaphore,
    calls: Mutex<usize>,
}

impl GatedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            gate: Semaphore::new(0),
            calls: Mutex::new(0),
        })
    }

    /// Wait until a call is parked inside `send`
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn send(&self, _: &[ComposedMessage]) -> Result<SendReport, TransportError> {
        *self.calls.lock() += 1;
        self.entered.notify_one();

        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| TransportError::Internal(e.to_string()))?;

        Ok(SendReport::AllDelivered)
    }
}

/// Transport whose calls never complete
pub struct HangingTransport;

#[async_trait]
impl Transport for HangingTransport {
    async fn send(&self, _: &[ComposedMessage]) -> Result<SendReport, TransportError> {
        std::future::pending().await
    }
}

/// Memory store with call counting and failure injection
#[derive(Default)]
pub struct InstrumentedStore {
    pub inner: MemoryMessageStore,
    fetches: Mutex<usize>,
    updates: Mutex<HashMap<MessageId, usize>>,
    fail_updates_for: Mutex<HashSet<MessageId>>,
    fail_fetch: Mutex<bool>,
}

impl InstrumentedStore {
    pub fn new(inner: MemoryMessageStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            ..Self::default()
        })
    }

    pub fn fail_updates_for(&self, id: MessageId) {
        self.fail_updates_for.lock().insert(id);
    }

    pub fn fail_fetches(&self, fail: bool) {
        *self.fail_fetch.lock() = fail;
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock()
    }

    /// Update calls per record, including rejected ones
    pub fn updates(&self) -> HashMap<MessageId, usize> {
        self.updates.lock().clone()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().values().sum()
    }
}

#[async_trait]
impl MessageStore for InstrumentedStore {
    async fn find_eligible(
        &self,
        statuses: &[MessageStatus],
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        *self.fetches.lock() += 1;

        if *self.fail_fetch.lock() {
            return Err(StoreError::Unavailable("database is down".to_string()));
        }

        self.inner.find_eligible(statuses, limit).await
    }

    async fn update_attempt_and_status(
        &self,
        id: MessageId,
        attempts: u32,
        status: MessageStatus,
        batch_id: BatchId,
    ) -> Result<(), StoreError> {
        *self.updates.lock().entry(id).or_default() += 1;

        if self.fail_updates_for.lock().contains(&id) {
            return Err(StoreError::Unavailable("write rejected".to_string()));
        }

        self.inner
            .update_attempt_and_status(id, attempts, status, batch_id)
            .await
    }

    async fn restore_near_exhausted(
        &self,
        batch_id: BatchId,
        attempts_threshold: u32,
    ) -> Result<u64, StoreError> {
        self.inner
            .restore_near_exhausted(batch_id, attempts_threshold)
            .await
    }

    async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
        self.inner.get(id).await
    }
}
