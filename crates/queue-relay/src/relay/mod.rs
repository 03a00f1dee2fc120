//! Store-and-forward sending.
//!
//! [`DurableRelay::send`] returns once the message is in the local store;
//! forwarding to the broker happens later, one message at a time, in local
//! append order. A record leaves the store only when the broker acknowledged
//! it or rejected it permanently. Messages are delivered at least once: a
//! crash after the broker accepted a message but before the record was
//! removed resends it on the next start.

pub mod filesystem;
pub mod memory;
pub mod store;

pub use filesystem::FilesystemRelayStore;
pub use memory::InMemoryRelayStore;
pub use store::{RecordId, RelayRecord, RelayState, RelayStore, RelayStoreError};

use crate::broker::Broker;
use crate::message::{EntityPath, Message, SequenceNumber, Timestamp};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Relay errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Relay store failed: {0}")]
    Store(#[from] RelayStoreError),
}

/// Relay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Base directory of the filesystem store
    pub store_path: PathBuf,

    /// First backoff after a transient send failure
    pub initial_backoff_ms: u64,

    /// Longest backoff between sends of the same record
    pub max_backoff_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("./data/relay"),
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl RelayConfig {
    /// Backoff policy for forwarding; relays retry transient failures indefinitely
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            u32::MAX,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            2.0,
        )
    }
}

/// Result of one forwarding step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The broker accepted the oldest record; it was removed from the store
    Acknowledged(SequenceNumber),
    /// The oldest record waits for its backoff; try again after the delay
    WaitRetry(Duration),
    /// The broker rejected the oldest record; it moved to the dead-letter store
    DeadLettered,
    /// Nothing to forward
    Idle,
}

/// Durable store-and-forward sender for one destination entity
pub struct DurableRelay {
    broker: Arc<dyn Broker>,
    destination: EntityPath,
    store: Arc<dyn RelayStore>,
    retry: RetryPolicy,
    wake: Notify,
}

impl DurableRelay {
    /// Open a relay over `store`, recovering interrupted records.
    ///
    /// Records left `InFlight` or `WaitRetry` by a previous run become
    /// `Pending` again and are resent.
    #[instrument(skip_all, fields(destination = %destination))]
    pub async fn open(
        broker: Arc<dyn Broker>,
        destination: EntityPath,
        store: Arc<dyn RelayStore>,
        retry: RetryPolicy,
    ) -> Result<Self, RelayError> {
        let mut recovered = 0;
        for mut record in store.live().await? {
            if record.state != RelayState::Pending {
                record.transition(RelayState::Pending);
                store.update(&record).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(recovered, "Recovered interrupted relay records, they will be resent");
        }

        Ok(Self {
            broker,
            destination,
            store,
            retry,
            wake: Notify::new(),
        })
    }

    pub fn destination(&self) -> &EntityPath {
        &self.destination
    }

    /// Durably accept a message for forwarding
    pub async fn send(&self, message: Message) -> Result<RecordId, RelayError> {
        let record = self.store.append(&self.destination, message).await?;
        info!(
            record_id = %record.id,
            local_sequence = record.local_sequence,
            message_id = %record.message.message_id,
            "Message stored for forwarding"
        );
        self.wake.notify_one();
        Ok(record.id)
    }

    /// Try to forward the oldest live record
    pub async fn forward_next(&self) -> Result<ForwardOutcome, RelayError> {
        let Some(mut record) = self.store.oldest().await? else {
            return Ok(ForwardOutcome::Idle);
        };

        if let RelayState::WaitRetry { retry_at } = record.state {
            if retry_at > Timestamp::now() {
                return Ok(ForwardOutcome::WaitRetry(retry_at.remaining()));
            }
        }

        record.attempts = record.attempts.saturating_add(1);
        record.transition(RelayState::InFlight);
        self.store.update(&record).await?;

        match self
            .broker
            .send(&record.destination, record.message.clone())
            .await
        {
            Ok(sequence_number) => {
                self.store.remove(&record).await?;
                info!(
                    record_id = %record.id,
                    sequence_number = %sequence_number,
                    attempts = record.attempts,
                    "Relay record forwarded"
                );
                Ok(ForwardOutcome::Acknowledged(sequence_number))
            }
            Err(error) if error.is_transient() => {
                let delay = self.retry.delay_for(record.attempts - 1, &error);
                record.last_error = Some(error.to_string());
                record.transition(RelayState::WaitRetry {
                    retry_at: Timestamp::now().plus(delay),
                });
                self.store.update(&record).await?;
                warn!(
                    record_id = %record.id,
                    attempt = record.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure forwarding relay record, backing off"
                );
                Ok(ForwardOutcome::WaitRetry(delay))
            }
            Err(error) => {
                record.last_error = Some(error.to_string());
                record.transition(RelayState::DeadLettered);
                self.store.move_to_dead_letter(&record).await?;
                warn!(
                    record_id = %record.id,
                    attempts = record.attempts,
                    error = %error,
                    "Broker rejected relay record, moved to dead-letter store"
                );
                Ok(ForwardOutcome::DeadLettered)
            }
        }
    }

    /// Forward continuously until cancelled.
    ///
    /// Cancellation abandons any in-progress send without touching the
    /// store; the record is recovered when the relay is next opened.
    #[instrument(skip(self, cancel), fields(destination = %self.destination))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RelayError> {
        info!("Relay forwarder started");
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.forward_next() => outcome?,
            };

            match outcome {
                ForwardOutcome::Acknowledged(_) | ForwardOutcome::DeadLettered => {}
                ForwardOutcome::WaitRetry(delay) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                ForwardOutcome::Idle => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                    }
                }
            }
        }
        info!("Relay forwarder stopped");
        Ok(())
    }

    /// Records not yet forwarded
    pub async fn pending(&self) -> Result<Vec<RelayRecord>, RelayError> {
        Ok(self.store.live().await?)
    }

    /// Records the broker rejected
    pub async fn dead_letters(&self) -> Result<Vec<RelayRecord>, RelayError> {
        Ok(self.store.dead_letters().await?)
    }
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
