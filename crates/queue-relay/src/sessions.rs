//! Ordered processing of session-enabled entities.
//!
//! A session groups related messages under one [`SessionId`]; the broker
//! locks a whole session to one receiver at a time and keeps an opaque state
//! blob with it. This module stores a [`SessionCheckpoint`] in that blob (the
//! ordering cursor plus the deferral ledger as JSON), so whichever receiver
//! accepts the session next carries on exactly where the previous one
//! stopped.
//!
//! # Checkpoint ordering
//!
//! The checkpoint is saved before a delivery is settled. A crash in between
//! redelivers a message whose key is already behind the cursor, which the
//! sequenced handler treats as done.

use crate::broker::{Broker, LockSettler, SessionHandle};
use crate::deferral::{
    DeferralLedger, DeferredResumer, DeferredSource, LedgerSnapshot, OrderingCursor,
    OrderingKeyExtractor, SequencedHandler,
};
use crate::envelope::{decode_delivery, RawDelivery};
use crate::error::BrokerError;
use crate::message::{EntityPath, LockToken, SequenceNumber, SessionId, Timestamp};
use crate::outcome::{MessageHandler, OutcomeResolver, Settlement};
use crate::pump::{settle_with_retry, PumpError};
use crate::retry::{retry_transient, RetryFailure, RetryPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "sessions_tests.rs"]
mod tests;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while processing a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session checkpoint for '{session_id}' is unreadable: {message}")]
    Checkpoint { session_id: String, message: String },

    #[error(transparent)]
    Processing(#[from] PumpError),
}

// ============================================================================
// Checkpoint
// ============================================================================

/// Ordering progress of one session, kept in the broker's session state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    /// Highest ordering key processed in this session
    pub last_processed: u64,

    /// Deferred messages waiting for their predecessors
    pub deferred: LedgerSnapshot,

    pub updated_at: Option<Timestamp>,
}

impl SessionCheckpoint {
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Read the checkpoint of a session; a session without state starts fresh
    pub async fn load(session: &dyn SessionHandle) -> Result<Self, SessionError> {
        let state = session
            .get_state()
            .await
            .map_err(|source| PumpError::Broker {
                operation: "get_state".to_string(),
                source,
            })?;

        match state {
            None => Ok(Self::default()),
            Some(bytes) => Self::from_bytes(&bytes).map_err(|e| SessionError::Checkpoint {
                session_id: session.session_id().to_string(),
                message: e.to_string(),
            }),
        }
    }

    pub async fn save(&self, session: &dyn SessionHandle) -> Result<(), SessionError> {
        let bytes = self.to_bytes().map_err(|e| SessionError::Checkpoint {
            session_id: session.session_id().to_string(),
            message: e.to_string(),
        })?;

        session
            .set_state(Some(bytes))
            .await
            .map_err(|source| PumpError::Broker {
                operation: "set_state".to_string(),
                source,
            })?;
        Ok(())
    }
}

// ============================================================================
// Session adapter
// ============================================================================

/// A locked session viewed as a [`DeferredSource`]
pub struct SessionReceiver<'a> {
    session: &'a dyn SessionHandle,
}

impl<'a> SessionReceiver<'a> {
    pub fn new(session: &'a dyn SessionHandle) -> Self {
        Self { session }
    }
}

#[async_trait]
impl LockSettler for SessionReceiver<'_> {
    async fn complete(&self, lock_token: &LockToken) -> Result<(), BrokerError> {
        self.session.complete(lock_token).await
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), BrokerError> {
        self.session.abandon(lock_token).await
    }

    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError> {
        self.session.dead_letter(lock_token, reason, description).await
    }

    async fn defer(&self, lock_token: &LockToken) -> Result<(), BrokerError> {
        self.session.defer(lock_token).await
    }
}

#[async_trait]
impl DeferredSource for SessionReceiver<'_> {
    async fn fetch_deferred(&self, sequence_number: SequenceNumber) -> Result<RawDelivery, BrokerError> {
        self.session.receive_deferred(sequence_number).await
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Session processor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long to wait for a session to become available
    pub accept_timeout_ms: u64,

    /// How long a receive inside a session waits; an empty receive ends the session pass
    pub receive_timeout_ms: u64,

    pub max_batch_size: usize,

    /// Renew the session lock when less than this remains
    pub renew_margin_ms: u64,

    /// Stop once no session is available
    pub drain_once: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            accept_timeout_ms: 5_000,
            receive_timeout_ms: 1_000,
            max_batch_size: 10,
            renew_margin_ms: 10_000,
            drain_once: false,
        }
    }
}

impl SessionConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn renew_margin(&self) -> Duration {
        Duration::from_millis(self.renew_margin_ms)
    }
}

/// What one pass over a session did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    pub resumed: u64,
    pub last_processed: u64,
    /// The session lock was lost before the pass finished
    pub lock_lost: bool,
}

impl SessionSummary {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            completed: 0,
            abandoned: 0,
            dead_lettered: 0,
            deferred: 0,
            resumed: 0,
            last_processed: 0,
            lock_lost: false,
        }
    }

    fn record(&mut self, settlement: &Settlement) {
        match settlement {
            Settlement::Complete => self.completed += 1,
            Settlement::Abandon => self.abandoned += 1,
            Settlement::DeadLetter { .. } => self.dead_lettered += 1,
            Settlement::Defer { .. } => self.deferred += 1,
        }
    }
}

/// Processes sessions one at a time, in ordering-key order within each session
pub struct SessionProcessor {
    broker: Arc<dyn Broker>,
    path: EntityPath,
    handler: Arc<dyn MessageHandler>,
    extractor: Arc<dyn OrderingKeyExtractor>,
    config: SessionConfig,
    retry: RetryPolicy,
}

impl SessionProcessor {
    pub fn new(
        broker: Arc<dyn Broker>,
        path: EntityPath,
        handler: Arc<dyn MessageHandler>,
        extractor: Arc<dyn OrderingKeyExtractor>,
        config: SessionConfig,
    ) -> Self {
        Self {
            broker,
            path,
            handler,
            extractor,
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Process sessions until cancelled, or until none is left with `drain_once`
    #[instrument(skip(self, cancel), fields(path = %self.path))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<Vec<SessionSummary>, SessionError> {
        let mut summaries = Vec::new();
        while !cancel.is_cancelled() {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.process_next_session(&cancel) => next?,
            };

            match next {
                Some(summary) => summaries.push(summary),
                None if self.config.drain_once => break,
                None => {}
            }
        }
        Ok(summaries)
    }

    /// Accept the next available session and process it until it runs dry.
    ///
    /// Returns `None` when no session became available in time.
    pub async fn process_next_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<SessionSummary>, SessionError> {
        let accepted = retry_transient(&self.retry, "accept_session", || {
            self.broker
                .accept_session(&self.path, self.config.accept_timeout())
        })
        .await
        .map_err(|failure| PumpError::from_retry("accept_session", failure))?;

        let Some(session) = accepted else {
            return Ok(None);
        };

        let result = self.process_session(session.as_ref(), cancel).await;

        if let Err(error) = session.close().await {
            debug!(session_id = %session.session_id(), error = %error, "Session close failed");
        }
        result.map(Some)
    }

    #[instrument(skip_all, fields(session_id = %session.session_id()))]
    async fn process_session(
        &self,
        session: &dyn SessionHandle,
        cancel: &CancellationToken,
    ) -> Result<SessionSummary, SessionError> {
        let mut summary = SessionSummary::new(session.session_id().clone());
        let checkpoint = SessionCheckpoint::load(session).await?;

        let ledger = Arc::new(DeferralLedger::restore(&checkpoint.deferred).map_err(PumpError::from)?);
        let cursor = Arc::new(OrderingCursor::new(checkpoint.last_processed));
        let sequenced = SequencedHandler::new(
            Arc::clone(&self.handler),
            Arc::clone(&self.extractor),
            Arc::clone(&cursor),
        );
        let resumer = DeferredResumer::new(Arc::clone(&ledger), Arc::clone(&cursor), Arc::clone(&self.handler))
            .with_retry_policy(self.retry.clone());
        let resolver = OutcomeResolver::new();
        let receiver = SessionReceiver::new(session);

        info!(
            last_processed = checkpoint.last_processed,
            deferred = ledger.len(),
            "Session accepted"
        );

        // Work left over from a previous receiver may already be in order
        summary.resumed += resumer.resume(&receiver).await? as u64;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if session.locked_until().remaining() < self.config.renew_margin() {
                match session.renew_lock().await {
                    Ok(until) => debug!(locked_until = %until, "Session lock renewed"),
                    Err(BrokerError::SessionLockLost { .. }) => {
                        summary.lock_lost = true;
                        break;
                    }
                    Err(source) => {
                        return Err(PumpError::Broker {
                            operation: "renew_lock".to_string(),
                            source,
                        }
                        .into())
                    }
                }
            }

            let batch = match retry_transient(&self.retry, "receive", || {
                session.receive(self.config.max_batch_size.max(1), self.config.receive_timeout())
            })
            .await
            {
                Ok(batch) => batch,
                Err(RetryFailure::Permanent(BrokerError::SessionLockLost { .. })) => {
                    summary.lock_lost = true;
                    break;
                }
                Err(failure) => return Err(PumpError::from_retry("receive", failure).into()),
            };
            if batch.is_empty() {
                break;
            }

            for raw in batch {
                let delivery = decode_delivery(raw).map_err(PumpError::from)?;
                let result = sequenced.handle(&delivery).await;
                let settlement = resolver.resolve(&delivery, result)?;

                if let Settlement::Defer { ordering_key } = settlement {
                    if ledger.get(ordering_key) != Some(delivery.sequence_number()) {
                        ledger.defer(ordering_key, delivery.sequence_number()).map_err(PumpError::from)?;
                    }
                }
                if !self.checkpoint(session, &cursor, &ledger).await? {
                    summary.lock_lost = true;
                    break;
                }

                let settled = settle_with_retry(session, &delivery, &settlement, &self.retry).await;
                let withdrawn = match (&settled, &settlement) {
                    (Err(_), Settlement::Defer { ordering_key }) => {
                        ledger.withdraw(*ordering_key, delivery.sequence_number())
                    }
                    _ => false,
                };

                match settled {
                    Ok(()) => summary.record(&settlement),
                    Err(RetryFailure::Permanent(BrokerError::MessageLockLost { .. })) => {
                        warn!(
                            sequence_number = %delivery.sequence_number(),
                            "Lock lost before settlement, the broker will redeliver"
                        );
                        if withdrawn && !self.checkpoint(session, &cursor, &ledger).await? {
                            summary.lock_lost = true;
                            break;
                        }
                        continue;
                    }
                    Err(RetryFailure::Permanent(BrokerError::SessionLockLost { .. })) => {
                        summary.lock_lost = true;
                        break;
                    }
                    Err(failure) => return Err(PumpError::from_retry(settlement.name(), failure).into()),
                }

                if settlement == Settlement::Complete {
                    let resumed = resumer.resume(&receiver).await?;
                    summary.resumed += resumed as u64;
                    if resumed > 0 && !self.checkpoint(session, &cursor, &ledger).await? {
                        summary.lock_lost = true;
                        break;
                    }
                }
            }

            if summary.lock_lost {
                break;
            }
        }

        summary.last_processed = cursor.last_processed();
        if summary.lock_lost {
            warn!(last_processed = summary.last_processed, "Session lock lost, another receiver will continue");
        } else {
            info!(
                completed = summary.completed,
                resumed = summary.resumed,
                deferred = ledger.len(),
                last_processed = summary.last_processed,
                "Session pass finished"
            );
        }
        Ok(summary)
    }

    /// Save progress; `false` when the session lock is already gone
    async fn checkpoint(
        &self,
        session: &dyn SessionHandle,
        cursor: &OrderingCursor,
        ledger: &DeferralLedger,
    ) -> Result<bool, SessionError> {
        let checkpoint = SessionCheckpoint {
            last_processed: cursor.last_processed(),
            deferred: ledger.snapshot(),
            updated_at: Some(Timestamp::now()),
        };

        match checkpoint.save(session).await {
            Ok(()) => Ok(true),
            Err(SessionError::Processing(PumpError::Broker {
                source: BrokerError::SessionLockLost { .. },
                ..
            })) => Ok(false),
            Err(error) => Err(error),
        }
    }
}
