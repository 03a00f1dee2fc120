//! Deferral of out-of-order messages and their in-order resumption.
//!
//! A deferred message can only be fetched again by its sequence number, so
//! the [`DeferralLedger`] is the sole record of where each deferred message
//! is. Keys are application ordering keys (for example a workflow step
//! number); a key with no entry is either not deferred or already resumed,
//! and the [`OrderingCursor`] tells the two apart.

use crate::broker::{Broker, LockSettler};
use crate::envelope::{decode_delivery, Delivery, RawDelivery};
use crate::error::BrokerError;
use crate::message::{EntityPath, LockToken, Message, SequenceNumber};
use crate::outcome::{HandlerError, HandlerOutcome, MessageHandler, OutcomeResolver, Settlement};
use crate::pump::{settle_with_retry, PumpError};
use crate::retry::{retry_transient, RetryFailure, RetryPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::iter::FusedIterator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// Ledger
// ============================================================================

/// Errors raised by ledger mutations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Ordering key {ordering_key} is already deferred as sequence number {existing}")]
    DuplicateKey { ordering_key: u64, existing: u64 },

    #[error("Sequence number {sequence_number} is already deferred under ordering key {existing}")]
    DuplicateSequence { sequence_number: u64, existing: u64 },
}

#[derive(Default)]
struct LedgerEntries {
    by_key: BTreeMap<u64, SequenceNumber>,
    by_sequence: HashMap<SequenceNumber, u64>,
}

/// Map from ordering key to the sequence number of the deferred message
#[derive(Default)]
pub struct DeferralLedger {
    entries: Mutex<LedgerEntries>,
}

impl DeferralLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, LedgerEntries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that the message at `sequence_number` was deferred under `ordering_key`
    pub fn defer(&self, ordering_key: u64, sequence_number: SequenceNumber) -> Result<(), LedgerError> {
        let mut entries = self.entries();

        if let Some(existing) = entries.by_key.get(&ordering_key) {
            return Err(LedgerError::DuplicateKey {
                ordering_key,
                existing: existing.value(),
            });
        }
        if let Some(existing) = entries.by_sequence.get(&sequence_number) {
            return Err(LedgerError::DuplicateSequence {
                sequence_number: sequence_number.value(),
                existing: *existing,
            });
        }

        entries.by_key.insert(ordering_key, sequence_number);
        entries.by_sequence.insert(sequence_number, ordering_key);
        Ok(())
    }

    /// Drop the entry for `ordering_key` if it still points at `sequence_number`.
    ///
    /// Used when the defer settlement that the entry was written ahead of
    /// did not take effect.
    pub fn withdraw(&self, ordering_key: u64, sequence_number: SequenceNumber) -> bool {
        let mut entries = self.entries();
        if entries.by_key.get(&ordering_key) != Some(&sequence_number) {
            return false;
        }
        entries.by_key.remove(&ordering_key);
        entries.by_sequence.remove(&sequence_number);
        true
    }

    /// Remove and return the entry that directly follows `last_processed_key`
    pub fn try_resume_next(&self, last_processed_key: u64) -> Option<(u64, SequenceNumber)> {
        let next_key = last_processed_key.checked_add(1)?;
        let mut entries = self.entries();
        let sequence_number = entries.by_key.remove(&next_key)?;
        entries.by_sequence.remove(&sequence_number);
        Some((next_key, sequence_number))
    }

    /// Lazily resume consecutive keys after `start_key` until the first gap
    pub fn drain_in_order(&self, start_key: u64) -> DrainInOrder<'_> {
        DrainInOrder {
            ledger: self,
            last_key: start_key,
            finished: false,
        }
    }

    pub fn get(&self, ordering_key: u64) -> Option<SequenceNumber> {
        self.entries().by_key.get(&ordering_key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let entries = self.entries();
        LedgerSnapshot {
            entries: entries
                .by_key
                .iter()
                .map(|(ordering_key, sequence_number)| DeferredEntry {
                    ordering_key: *ordering_key,
                    sequence_number: *sequence_number,
                })
                .collect(),
        }
    }

    /// Rebuild a ledger from a snapshot, rejecting duplicate keys or sequence numbers
    pub fn restore(snapshot: &LedgerSnapshot) -> Result<Self, LedgerError> {
        let ledger = Self::new();
        for entry in &snapshot.entries {
            ledger.defer(entry.ordering_key, entry.sequence_number)?;
        }
        Ok(ledger)
    }
}

/// Iterator returned by [`DeferralLedger::drain_in_order`].
///
/// Each step removes the entry it yields. Once a key is missing the iterator
/// is exhausted for good, even if the key is deferred later.
pub struct DrainInOrder<'a> {
    ledger: &'a DeferralLedger,
    last_key: u64,
    finished: bool,
}

impl Iterator for DrainInOrder<'_> {
    type Item = (u64, SequenceNumber);

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.ledger.try_resume_next(self.last_key) {
            Some((key, sequence_number)) => {
                self.last_key = key;
                Some((key, sequence_number))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

impl FusedIterator for DrainInOrder<'_> {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredEntry {
    pub ordering_key: u64,
    pub sequence_number: SequenceNumber,
}

/// Serializable copy of a ledger, for checkpointing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub entries: Vec<DeferredEntry>,
}

// ============================================================================
// Ordering
// ============================================================================

/// Highest ordering key processed so far
#[derive(Debug, Default)]
pub struct OrderingCursor(AtomicU64);

impl OrderingCursor {
    pub fn new(last_processed: u64) -> Self {
        Self(AtomicU64::new(last_processed))
    }

    pub fn last_processed(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Move the cursor forward to `key`; it never moves backwards
    pub fn advance_to(&self, key: u64) -> bool {
        self.0.fetch_max(key, Ordering::SeqCst) < key
    }
}

/// Extracts the application ordering key of a message
pub trait OrderingKeyExtractor: Send + Sync {
    fn ordering_key(&self, message: &Message) -> Option<u64>;
}

/// Reads the ordering key from an integer application property
#[derive(Debug, Clone)]
pub struct PropertyOrderingKey {
    property: String,
}

impl PropertyOrderingKey {
    pub fn new(property: &str) -> Self {
        Self {
            property: property.to_string(),
        }
    }
}

impl OrderingKeyExtractor for PropertyOrderingKey {
    fn ordering_key(&self, message: &Message) -> Option<u64> {
        let value = message.property(&self.property)?.as_i64()?;
        u64::try_from(value).ok()
    }
}

/// Reads the ordering key from a top-level field of a JSON body
#[derive(Debug, Clone)]
pub struct JsonFieldOrderingKey {
    field: String,
}

impl JsonFieldOrderingKey {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

impl OrderingKeyExtractor for JsonFieldOrderingKey {
    fn ordering_key(&self, message: &Message) -> Option<u64> {
        let body: serde_json::Value = message.body_json().ok()?;
        body.get(&self.field)?.as_u64()
    }
}

/// Handler wrapper that enforces ordering-key order.
///
/// - key already processed: redelivery of handled work, reported as processed
/// - next key: delegated to the inner handler; the cursor advances on success
/// - later key: reported out of order so the pump defers it
/// - no key: reported unrecognized
pub struct SequencedHandler {
    inner: Arc<dyn MessageHandler>,
    extractor: Arc<dyn OrderingKeyExtractor>,
    cursor: Arc<OrderingCursor>,
}

impl SequencedHandler {
    pub fn new(
        inner: Arc<dyn MessageHandler>,
        extractor: Arc<dyn OrderingKeyExtractor>,
        cursor: Arc<OrderingCursor>,
    ) -> Self {
        Self {
            inner,
            extractor,
            cursor,
        }
    }
}

#[async_trait]
impl MessageHandler for SequencedHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        let Some(key) = self.extractor.ordering_key(delivery.message()) else {
            return Ok(HandlerOutcome::Unrecognized {
                description: "message carries no ordering key".to_string(),
            });
        };

        let last = self.cursor.last_processed();
        if key <= last {
            debug!(
                ordering_key = key,
                last_processed = last,
                "Ordering key already processed, treating redelivery as done"
            );
            return Ok(HandlerOutcome::Processed);
        }

        if key != last + 1 {
            return Ok(HandlerOutcome::OutOfOrder { ordering_key: key });
        }

        let outcome = self.inner.handle(delivery).await?;
        if outcome == HandlerOutcome::Processed {
            self.cursor.advance_to(key);
        }
        Ok(outcome)
    }
}

// ============================================================================
// Resumption
// ============================================================================

/// Where deferred messages are fetched from and settled
#[async_trait]
pub trait DeferredSource: LockSettler {
    async fn fetch_deferred(&self, sequence_number: SequenceNumber) -> Result<RawDelivery, BrokerError>;
}

/// A broker entity viewed as a [`DeferredSource`]
pub struct EntityReceiver {
    broker: Arc<dyn Broker>,
    path: EntityPath,
}

impl EntityReceiver {
    pub fn new(broker: Arc<dyn Broker>, path: EntityPath) -> Self {
        Self { broker, path }
    }
}

#[async_trait]
impl LockSettler for EntityReceiver {
    async fn complete(&self, lock_token: &LockToken) -> Result<(), BrokerError> {
        self.broker.complete(lock_token).await
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), BrokerError> {
        self.broker.abandon(lock_token).await
    }

    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError> {
        self.broker.dead_letter(lock_token, reason, description).await
    }

    async fn defer(&self, lock_token: &LockToken) -> Result<(), BrokerError> {
        self.broker.defer(lock_token).await
    }
}

#[async_trait]
impl DeferredSource for EntityReceiver {
    async fn fetch_deferred(&self, sequence_number: SequenceNumber) -> Result<RawDelivery, BrokerError> {
        self.broker.receive_deferred(&self.path, sequence_number).await
    }
}

/// Fetches, handles and settles deferred messages whose predecessors are done
pub struct DeferredResumer {
    ledger: Arc<DeferralLedger>,
    cursor: Arc<OrderingCursor>,
    handler: Arc<dyn MessageHandler>,
    resolver: OutcomeResolver,
    retry: RetryPolicy,
    /// Held for a whole drain so concurrent resumes run one after another
    drain: tokio::sync::Mutex<()>,
}

impl DeferredResumer {
    /// `handler` is the inner application handler, not a [`SequencedHandler`]
    pub fn new(
        ledger: Arc<DeferralLedger>,
        cursor: Arc<OrderingCursor>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            ledger,
            cursor,
            handler,
            resolver: OutcomeResolver::new(),
            retry: RetryPolicy::default(),
            drain: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn ledger(&self) -> &Arc<DeferralLedger> {
        &self.ledger
    }

    pub fn cursor(&self) -> &Arc<OrderingCursor> {
        &self.cursor
    }

    /// Resume every deferred message that is now in order.
    ///
    /// Returns the number of messages completed. Stops at the first gap, or
    /// at the first transient failure, in which case the entry is put back
    /// and the message stays deferred on the broker. An entry whose message
    /// is active again (its defer never took effect) is dropped and draining
    /// stops; the redelivery arrives through the normal receive path.
    pub async fn resume<S: DeferredSource + ?Sized>(&self, source: &S) -> Result<usize, PumpError> {
        let _drain = self.drain.lock().await;
        let mut resumed = 0;
        let start = self.cursor.last_processed();

        for (key, sequence_number) in self.ledger.drain_in_order(start) {
            let raw = match retry_transient(&self.retry, "receive_deferred", || {
                source.fetch_deferred(sequence_number)
            })
            .await
            {
                Ok(raw) => raw,
                Err(RetryFailure::Permanent(BrokerError::MessageNotFound { .. })) => {
                    warn!(
                        ordering_key = key,
                        sequence_number = %sequence_number,
                        "Deferred message is gone from the broker, skipping its ordering key"
                    );
                    self.cursor.advance_to(key);
                    continue;
                }
                Err(RetryFailure::Permanent(BrokerError::MessageNotDeferred { .. })) => {
                    warn!(
                        ordering_key = key,
                        sequence_number = %sequence_number,
                        "Ledger entry points at a message that is not deferred, dropping it"
                    );
                    break;
                }
                Err(failure) => {
                    self.put_back(key, sequence_number);
                    return Err(PumpError::from_retry("receive_deferred", failure));
                }
            };

            let delivery = match decode_delivery(raw) {
                Ok(delivery) => delivery,
                Err(error) => {
                    self.put_back(key, sequence_number);
                    return Err(PumpError::Envelope(error));
                }
            };

            let result = self.handler.handle(&delivery).await;
            let settlement = match self.resolver.resolve(&delivery, result) {
                Ok(Settlement::Defer { .. }) => Settlement::Abandon,
                Ok(settlement) => settlement,
                Err(error) => {
                    self.put_back(key, sequence_number);
                    return Err(error);
                }
            };

            if let Err(failure) = settle_with_retry(source, &delivery, &settlement, &self.retry).await {
                self.put_back(key, sequence_number);
                return Err(PumpError::from_retry(settlement.name(), failure));
            }

            match settlement {
                Settlement::Complete => {
                    self.cursor.advance_to(key);
                    resumed += 1;
                    info!(
                        ordering_key = key,
                        sequence_number = %sequence_number,
                        "Resumed deferred message"
                    );
                }
                Settlement::DeadLetter { .. } => {
                    warn!(
                        ordering_key = key,
                        sequence_number = %sequence_number,
                        "Deferred message was dead-lettered, skipping its ordering key"
                    );
                    self.cursor.advance_to(key);
                }
                _ => {
                    // Abandoned: the message is still deferred on the broker
                    self.put_back(key, sequence_number);
                    break;
                }
            }
        }

        Ok(resumed)
    }

    fn put_back(&self, key: u64, sequence_number: SequenceNumber) {
        if let Err(error) = self.ledger.defer(key, sequence_number) {
            warn!(ordering_key = key, error = %error, "Could not return entry to the deferral ledger");
        }
    }
}

#[cfg(test)]
#[path = "deferral_tests.rs"]
mod tests;
