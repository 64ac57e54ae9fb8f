//! Dry-run transport
//!
//! Logs every message instead of handing it to a relay. Recipients listed in
//! `reject` are reported back as failed, which makes the retry path
//! observable without a real mail server.

use std::collections::HashSet;

use async_trait::async_trait;
use postbag_common::tracing::{debug, info};
use postbag_dispatch::{ComposedMessage, SendReport, Transport, TransportError};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogTransportConfig {
    /// Recipients whose messages are reported as not delivered
    #[serde(default)]
    pub reject: Vec<String>,
}

#[derive(Debug, Default)]
pub struct LogTransport {
    reject: HashSet<String>,
}

impl LogTransport {
    #[must_use]
    pub fn new(config: LogTransportConfig) -> Self {
        Self {
            reject: config
                .reject
                .into_iter()
                .map(|recipient| recipient.to_ascii_lowercase())
                .collect(),
        }
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, messages: &[ComposedMessage]) -> Result<SendReport, TransportError> {
        let mut failed = HashSet::new();

        for message in messages {
            let token = message.correlation_token().ok_or_else(|| {
                TransportError::Internal(format!("Message to {} has no correlation id", message.to))
            })?;

            if self.reject.contains(&message.to.to_ascii_lowercase()) {
                debug!(message_id = %token, to = %message.to, "Rejecting message");
                failed.insert(token);
            } else {
                info!(
                    message_id = %token,
                    to = %message.to,
                    subject = %message.subject,
                    bytes = message.body.len(),
                    "Delivered message (dry run)"
                );
            }
        }

        if failed.is_empty() {
            Ok(SendReport::AllDelivered)
        } else {
            Ok(SendReport::PartialFailure(failed))
        }
    }
}
