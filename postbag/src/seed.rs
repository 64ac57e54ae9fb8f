//! Startup seed loader
//!
//! Fills an empty store with HTML welcome messages so a fresh instance has
//! something to dispatch. A store that already holds records is left alone.

use postbag_common::internal;
use postbag_dispatch::{MemoryMessageStore, NewMessage, StoreError};
use serde::Deserialize;

const fn default_count() -> usize {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedConfig {
    /// Address every seeded message is sent to
    pub recipient: String,

    /// Number of messages to insert
    #[serde(default = "default_count")]
    pub count: usize,
}

/// Insert the seed messages, returning how many were inserted
///
/// # Errors
/// Returns an error if the store rejects an insert
pub fn load(store: &MemoryMessageStore, config: &SeedConfig) -> Result<usize, StoreError> {
    if !store.is_empty() {
        internal!(
            level = INFO,
            existing = store.len(),
            "Store already holds messages, skipping seed"
        );
        return Ok(0);
    }

    for n in 1..=config.count {
        store.insert(welcome(&config.recipient, n))?;
    }

    internal!(
        level = INFO,
        count = config.count,
        recipient = %config.recipient,
        "Seeded welcome messages"
    );

    Ok(config.count)
}

fn welcome(recipient: &str, n: usize) -> NewMessage {
    NewMessage::new(
        recipient,
        format!("Welcome message #{n}"),
        format!(
            "<html>\n\
             <body>\n\
             <h2>Welcome, user #{n}!</h2>\n\
             <p>This is a test message with <strong>HTML</strong> content.</p>\n\
             <p>Thanks for trying out our notification system.</p>\n\
             <hr/>\n\
             <small>This message was sent automatically. Please do not reply.</small>\n\
             </body>\n\
             </html>\n"
        ),
    )
}
