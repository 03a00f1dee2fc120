//! Receive loop: pull deliveries, dispatch them to the handler, settle the outcome.
//!
//! The pump never decides whether a message is good; the handler does and the
//! [`OutcomeResolver`] maps its answer to a settlement. What the pump owns is
//! the loop itself: bounded concurrency, retries of transient broker failures
//! on settlement, cancellation and draining, and fatal termination.

use crate::broker::{Broker, LockSettler, ReceiveMode};
use crate::deferral::{DeferralLedger, DeferredResumer, EntityReceiver, LedgerError};
use crate::envelope::{decode_delivery, Delivery, EnvelopeError, RawDelivery};
use crate::error::BrokerError;
use crate::message::{EntityPath, SequenceNumber};
use crate::outcome::{HandlerError, MessageHandler, OutcomeResolver, Settlement};
use crate::retry::{retry_transient, RetryFailure, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

// ============================================================================
// Errors
// ============================================================================

/// Errors that terminate a pump
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("Broker operation '{operation}' failed: {source}")]
    Broker {
        operation: String,
        source: BrokerError,
    },

    #[error("Broker operation '{operation}' still failing after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: BrokerError,
    },

    #[error("Handler failed permanently on sequence number {sequence_number}: {source}")]
    Handler {
        sequence_number: u64,
        source: HandlerError,
    },

    #[error("Malformed delivery: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Deferral ledger rejected entry: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Dispatch task failed: {message}")]
    TaskFailed { message: String },
}

impl PumpError {
    pub fn from_retry(operation: &str, failure: RetryFailure) -> Self {
        match failure {
            RetryFailure::Permanent(source) => Self::Broker {
                operation: operation.to_string(),
                source,
            },
            RetryFailure::Exhausted {
                attempts,
                last_error,
            } => Self::RetriesExhausted {
                operation: operation.to_string(),
                attempts,
                last_error,
            },
        }
    }
}

impl From<JoinError> for PumpError {
    fn from(error: JoinError) -> Self {
        Self::TaskFailed {
            message: error.to_string(),
        }
    }
}

// ============================================================================
// Configuration and observable state
// ============================================================================

/// Pump settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Deliveries dispatched at once; 1 preserves broker order
    pub max_concurrent_calls: usize,

    /// Most deliveries taken per receive call
    pub max_batch_size: usize,

    /// How long a receive waits for the first message
    pub receive_timeout_ms: u64,

    /// Close once a receive comes back empty with nothing in flight
    pub drain_once: bool,

    /// Broker-side delivery limit, observed for logging only
    pub max_delivery_count: Option<u32>,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            max_batch_size: 10,
            receive_timeout_ms: 1_000,
            drain_once: false,
            max_delivery_count: Some(10),
        }
    }
}

impl PumpConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn with_max_concurrent_calls(mut self, max_concurrent_calls: usize) -> Self {
        self.max_concurrent_calls = max_concurrent_calls;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_drain_once(mut self) -> Self {
        self.drain_once = true;
        self
    }

    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = Some(max_delivery_count);
        self
    }
}

/// Lifecycle of a pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Receiving,
    Dispatching,
    Draining,
    Closed,
}

/// Counters of what the pump has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub received: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    pub resumed: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
    resumed: AtomicU64,
}

impl Counters {
    fn record(&self, settlement: &Settlement) {
        let counter = match settlement {
            Settlement::Complete => &self.completed,
            Settlement::Abandon => &self.abandoned,
            Settlement::DeadLetter { .. } => &self.dead_lettered,
            Settlement::Defer { .. } => &self.deferred,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PumpStats {
        PumpStats {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Settlement
// ============================================================================

/// Apply `settlement` to a delivery, retrying transient broker failures
pub(crate) async fn settle_with_retry<S: LockSettler + ?Sized>(
    settler: &S,
    delivery: &Delivery,
    settlement: &Settlement,
    policy: &RetryPolicy,
) -> Result<(), RetryFailure> {
    let lock_token = &delivery.lock_token;
    retry_transient(policy, settlement.name(), || async move {
        match settlement {
            Settlement::Complete => settler.complete(lock_token).await,
            Settlement::Abandon => settler.abandon(lock_token).await,
            Settlement::DeadLetter {
                reason,
                description,
            } => settler.dead_letter(lock_token, reason, description).await,
            Settlement::Defer { .. } => settler.defer(lock_token).await,
        }
    })
    .await
}

// ============================================================================
// Pump
// ============================================================================

/// Everything a dispatch task needs, shared between tasks
struct Dispatcher {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn MessageHandler>,
    resolver: OutcomeResolver,
    retry: RetryPolicy,
    ledger: Arc<DeferralLedger>,
    resumer: Option<(Arc<DeferredResumer>, EntityReceiver)>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    async fn dispatch(&self, raw: RawDelivery) -> Result<(), PumpError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let delivery = decode_delivery(raw)?;

        if delivery.is_lock_expired() {
            warn!(
                sequence_number = %delivery.sequence_number(),
                "Lock expired before dispatch, leaving the message to the broker"
            );
            return Ok(());
        }

        let result = self.handler.handle(&delivery).await;
        let settlement = self.resolver.resolve(&delivery, result)?;

        if let Settlement::Defer { ordering_key } = settlement {
            self.record_deferral(ordering_key, delivery.sequence_number())?;
        }

        if let Err(failure) = settle_with_retry(&*self.broker, &delivery, &settlement, &self.retry).await {
            if let Settlement::Defer { ordering_key } = settlement {
                self.ledger.withdraw(ordering_key, delivery.sequence_number());
            }
            if matches!(failure, RetryFailure::Permanent(BrokerError::MessageLockLost { .. })) {
                warn!(
                    sequence_number = %delivery.sequence_number(),
                    settlement = settlement.name(),
                    "Lock lost before settlement, the broker will redeliver"
                );
                return Ok(());
            }
            return Err(PumpError::from_retry(settlement.name(), failure));
        }

        debug!(
            sequence_number = %delivery.sequence_number(),
            delivery_count = delivery.delivery_count(),
            settlement = settlement.name(),
            "Delivery settled"
        );
        self.counters.record(&settlement);

        // A deferral can land after a concurrent resume already passed its key
        if matches!(settlement, Settlement::Complete | Settlement::Defer { .. }) {
            if let Some((resumer, receiver)) = &self.resumer {
                let resumed = resumer.resume(receiver).await?;
                self.counters
                    .resumed
                    .fetch_add(resumed as u64, Ordering::Relaxed);
            }
        }

        Ok(())
    }

    /// Write-ahead ledger entry for a deferral.
    ///
    /// A redelivered message that was already recorded maps to the same
    /// sequence number and is accepted as is.
    fn record_deferral(&self, ordering_key: u64, sequence_number: SequenceNumber) -> Result<(), PumpError> {
        if self.ledger.get(ordering_key) == Some(sequence_number) {
            return Ok(());
        }
        self.ledger.defer(ordering_key, sequence_number)?;
        Ok(())
    }
}

/// Peek-lock receive loop over one entity
pub struct MessagePump {
    broker: Arc<dyn Broker>,
    path: EntityPath,
    handler: Arc<dyn MessageHandler>,
    config: PumpConfig,
    retry: RetryPolicy,
    ledger: Arc<DeferralLedger>,
    resumer: Option<Arc<DeferredResumer>>,
    counters: Arc<Counters>,
    state: watch::Sender<PumpState>,
}

impl MessagePump {
    pub fn new(
        broker: Arc<dyn Broker>,
        path: EntityPath,
        handler: Arc<dyn MessageHandler>,
        config: PumpConfig,
    ) -> Self {
        let (state, _) = watch::channel(PumpState::Idle);

        Self {
            broker,
            path,
            handler,
            config,
            retry: RetryPolicy::default(),
            ledger: Arc::new(DeferralLedger::new()),
            resumer: None,
            counters: Arc::new(Counters::default()),
            state,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<DeferralLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Resume in-order deferred successors after each completion.
    ///
    /// The pump records deferrals in the resumer's ledger.
    pub fn with_resumer(mut self, resumer: Arc<DeferredResumer>) -> Self {
        self.ledger = Arc::clone(resumer.ledger());
        self.resumer = Some(resumer);
        self
    }

    pub fn path(&self) -> &EntityPath {
        &self.path
    }

    pub fn ledger(&self) -> &Arc<DeferralLedger> {
        &self.ledger
    }

    pub fn state(&self) -> PumpState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PumpState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> PumpStats {
        self.counters.snapshot()
    }

    fn set_state(&self, state: PumpState) {
        self.state.send_replace(state);
    }

    fn dispatcher(&self) -> Dispatcher {
        let mut resolver = OutcomeResolver::new();
        if let Some(max) = self.config.max_delivery_count {
            resolver = resolver.with_max_delivery_count(max);
        }

        Dispatcher {
            broker: Arc::clone(&self.broker),
            handler: Arc::clone(&self.handler),
            resolver,
            retry: self.retry.clone(),
            ledger: Arc::clone(&self.ledger),
            resumer: self.resumer.as_ref().map(|resumer| {
                (
                    Arc::clone(resumer),
                    EntityReceiver::new(Arc::clone(&self.broker), self.path.clone()),
                )
            }),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Run until cancelled, drained (with `drain_once`), or a fatal error.
    ///
    /// On exit no new receive is issued and every dispatched delivery has
    /// finished settling. The first fatal error is returned.
    #[instrument(skip(self, cancel), fields(path = %self.path))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PumpError> {
        let stop = cancel.child_token();
        let dispatcher = Arc::new(self.dispatcher());
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_calls.max(1)));
        let mut tasks: JoinSet<Result<(), PumpError>> = JoinSet::new();
        let mut fatal: Option<PumpError> = None;

        info!(
            max_concurrent_calls = self.config.max_concurrent_calls,
            max_batch_size = self.config.max_batch_size,
            "Message pump started"
        );

        'receive: while !stop.is_cancelled() {
            while let Some(joined) = tasks.try_join_next() {
                Self::record_task(joined, &mut fatal, &stop);
            }
            if stop.is_cancelled() {
                break;
            }

            self.set_state(PumpState::Receiving);
            let received = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                result = self.receive_batch() => result,
            };

            let batch = match received {
                Ok(batch) => batch,
                Err(failure) => {
                    Self::keep_first(&mut fatal, PumpError::from_retry("receive", failure));
                    break;
                }
            };

            if batch.is_empty() {
                if self.config.drain_once {
                    if tasks.is_empty() {
                        break;
                    }
                    // Settlements still in flight may make messages available again
                    while let Some(joined) = tasks.join_next().await {
                        Self::record_task(joined, &mut fatal, &stop);
                    }
                    continue;
                }
                self.set_state(PumpState::Idle);
                continue;
            }

            self.set_state(PumpState::Dispatching);
            for raw in batch {
                let permit = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break 'receive,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'receive,
                    },
                };

                let dispatcher = Arc::clone(&dispatcher);
                let stop = stop.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let result = dispatcher.dispatch(raw).await;
                    if result.is_err() {
                        stop.cancel();
                    }
                    result
                });
            }
        }

        self.set_state(PumpState::Draining);
        while let Some(joined) = tasks.join_next().await {
            Self::record_task(joined, &mut fatal, &stop);
        }
        self.set_state(PumpState::Closed);

        let stats = self.stats();
        match fatal {
            Some(error) => {
                error!(error = %error, "Message pump stopped on fatal error");
                Err(error)
            }
            None => {
                info!(
                    received = stats.received,
                    completed = stats.completed,
                    "Message pump closed"
                );
                Ok(())
            }
        }
    }

    async fn receive_batch(&self) -> Result<Vec<RawDelivery>, RetryFailure> {
        retry_transient(&self.retry, "receive", || {
            self.broker.receive(
                &self.path,
                ReceiveMode::PeekLock,
                self.config.max_batch_size.max(1),
                self.config.receive_timeout(),
            )
        })
        .await
    }

    fn record_task(
        joined: Result<Result<(), PumpError>, JoinError>,
        fatal: &mut Option<PumpError>,
        stop: &CancellationToken,
    ) {
        let error = match joined {
            Ok(Ok(())) => return,
            Ok(Err(error)) => error,
            Err(join_error) => PumpError::from(join_error),
        };
        stop.cancel();
        Self::keep_first(fatal, error);
    }

    fn keep_first(fatal: &mut Option<PumpError>, error: PumpError) {
        match fatal {
            Some(_) => warn!(error = %error, "Additional fatal error while stopping"),
            None => *fatal = Some(error),
        }
    }
}

#[cfg(test)]
#[path = "pump_tests.rs"]
mod tests;
