//! Batch email dispatch and retry-state engine
//!
//! This crate provides:
//! - The message record model and its status state machine
//! - Storage and transport collaborator traits, with an in-memory store
//! - A batch dispatcher that attributes transport results per message
//! - A circuit breaker with a recovery fallback for exhausted messages
//! - A single-flight scheduler that fans batches out over a worker pool

mod circuit_breaker;
mod config;
mod dispatcher;
mod error;
pub mod policy;
mod record;
mod scheduler;
pub mod store;
pub mod transport;

// Re-export breaker types
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, Trip,
};
pub use config::DispatchConfig;
pub use dispatcher::{BatchDispatcher, BatchOutcome};
// Re-export error types
pub use error::{ComposeError, DispatchError, StoreError, TransportError};
pub use policy::RetryPolicy;
// Re-export core types
pub use record::{BatchId, MessageId, MessageRecord, MessageStatus, NewMessage};
pub use scheduler::{CycleReport, CycleSummary, FlightPermit, Scheduler, SingleFlight};
pub use store::{MemoryMessageStore, MessageStore};
pub use transport::{ComposedMessage, CorrelationToken, SendReport, Transport, compose};
