//! Policy abstractions for dispatch operations.
//!
//! Policies are plain values with pure methods so the state machine can be
//! reasoned about and tested apart from the dispatcher.
//!
//! - [`RetryPolicy`]: Resolves the status transition after a delivery attempt

pub mod retry;

pub use retry::{Delivery, RetryPolicy, Transition};
