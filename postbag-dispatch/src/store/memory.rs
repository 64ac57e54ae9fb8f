use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{MessageStore, Result};
use crate::{
    error::StoreError,
    record::{BatchId, MessageId, MessageRecord, MessageStatus, NewMessage},
};

/// In-memory message store
///
/// Records live in a `BTreeMap` keyed by id, so page fetches come out in id
/// order without sorting. Intended for tests and dry runs; nothing survives a
/// restart.
///
/// # Capacity Management
/// An optional capacity bounds the number of stored records; inserts past it
/// fail with [`StoreError::Unavailable`].
#[derive(Debug, Clone)]
pub struct MemoryMessageStore {
    records: Arc<RwLock<BTreeMap<MessageId, MessageRecord>>>,
    next_id: Arc<AtomicU64>,
    capacity: Option<usize>,
}

impl MemoryMessageStore {
    /// Create a new empty store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity: None,
        }
    }

    /// Create a new empty store holding at most `capacity` records
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Insert a new `QUEUED` record, assigning the next id
    ///
    /// # Errors
    /// Returns an error if the store is at capacity
    pub fn insert(&self, message: NewMessage) -> Result<MessageRecord> {
        let mut records = self.records.write();

        if let Some(cap) = self.capacity
            && records.len() >= cap
        {
            return Err(StoreError::Unavailable(format!(
                "Memory store capacity exceeded: {}/{cap} records",
                records.len()
            )));
        }

        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = MessageRecord::queued(id, message);
        records.insert(id, record.clone());

        Ok(record)
    }

    /// Replace a record wholesale, bypassing the state machine
    ///
    /// Used to load records that already carry delivery state.
    pub fn put(&self, record: MessageRecord) {
        self.next_id.fetch_max(record.id.0.saturating_add(1), Ordering::Relaxed);
        self.records.write().insert(record.id, record);
    }

    /// Snapshot of every record, ordered by id
    #[must_use]
    pub fn all(&self) -> Vec<MessageRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Number of records currently in `status`
    #[must_use]
    pub fn count_by_status(&self, status: MessageStatus) -> usize {
        self.records
            .read()
            .values()
            .filter(|record| record.status == status)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn find_eligible(
        &self,
        statuses: &[MessageStatus],
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|record| statuses.contains(&record.status))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_attempt_and_status(
        &self,
        id: MessageId,
        attempts: u32,
        status: MessageStatus,
        batch_id: BatchId,
    ) -> Result<()> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        record.attempts = attempts;
        record.status = status;
        record.batch_id = Some(batch_id);

        Ok(())
    }

    async fn restore_near_exhausted(
        &self,
        batch_id: BatchId,
        attempts_threshold: u32,
    ) -> Result<u64> {
        let mut restored = 0;

        for record in self.records.write().values_mut().filter(|record| {
            record.status == MessageStatus::Failed
                && record.batch_id == Some(batch_id)
                && record.attempts == attempts_threshold
        }) {
            record.status = MessageStatus::Retrying;
            restored += 1;
        }

        Ok(restored)
    }

    async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>> {
        Ok(self.records.read().get(&id).cloned())
    }
}
