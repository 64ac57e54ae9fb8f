//! Storage collaborator for message records
//!
//! Durable storage lives outside this crate; the dispatcher only needs a page
//! fetch by status, an atomic per-record update and the bulk restore used by
//! the recovery fallback. [`MemoryMessageStore`] implements the contract in
//! memory for tests and dry runs.

mod memory;

use async_trait::async_trait;

pub use memory::MemoryMessageStore;

use crate::{
    error::StoreError,
    record::{BatchId, MessageId, MessageRecord, MessageStatus},
};

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fetch up to `limit` records whose status is one of `statuses`,
    /// ordered by id ascending.
    async fn find_eligible(
        &self,
        statuses: &[MessageStatus],
        limit: usize,
    ) -> Result<Vec<MessageRecord>>;

    /// Atomically set `attempts`, `status` and `batch_id` on a single record.
    async fn update_attempt_and_status(
        &self,
        id: MessageId,
        attempts: u32,
        status: MessageStatus,
        batch_id: BatchId,
    ) -> Result<()>;

    /// Move every `FAILED` record stamped with `batch_id` whose `attempts`
    /// equals `attempts_threshold` back to `RETRYING`, leaving `attempts`
    /// untouched. Returns the number of records restored.
    async fn restore_near_exhausted(
        &self,
        batch_id: BatchId,
        attempts_threshold: u32,
    ) -> Result<u64>;

    /// Fetch a single record
    async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>>;
}
