//! Dead-letter inspection and resubmission.
//!
//! A [`DeadLetterRemediator`] drains the dead-letter sub-queue of one entity,
//! asking a [`RemediationPolicy`] what to do with each message. Resubmitted
//! messages are sent as fresh copies before the dead-lettered original is
//! completed, so a crash between the two leaves a duplicate rather than a
//! loss.

use crate::broker::{Broker, ReceiveMode};
use crate::envelope::{decode_delivery, decode_received, Delivery, ReceivedMessage};
use crate::error::BrokerError;
use crate::message::{EntityPath, Message};
use crate::outcome::Settlement;
use crate::pump::{settle_with_retry, PumpError};
use crate::retry::{retry_transient, RetryFailure, RetryPolicy};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Decision for one dead-lettered message
#[derive(Debug, Clone, PartialEq)]
pub enum Remediation {
    /// Send this message to the resubmit target, then remove the original
    Resubmit(Message),
    /// Remove the original without sending anything
    Discard,
    /// Keep the original in the dead-letter sub-queue
    Leave,
}

/// Decides what happens to each dead-lettered message
#[async_trait]
pub trait RemediationPolicy: Send + Sync {
    async fn remediate(&self, message: &ReceivedMessage) -> Remediation;
}

/// Resubmits every dead-lettered message unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct ResubmitAll;

#[async_trait]
impl RemediationPolicy for ResubmitAll {
    async fn remediate(&self, message: &ReceivedMessage) -> Remediation {
        Remediation::Resubmit(message.clone_message())
    }
}

/// Counts from one remediation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemediationReport {
    pub resubmitted: u64,
    pub discarded: u64,
    pub left: u64,
}

/// Drains and remediates the dead-letter sub-queue of one entity
pub struct DeadLetterRemediator {
    broker: Arc<dyn Broker>,
    source: EntityPath,
    resubmit_to: EntityPath,
    policy: Arc<dyn RemediationPolicy>,
    retry: RetryPolicy,
    max_batch_size: usize,
    receive_timeout: Duration,
}

impl DeadLetterRemediator {
    /// Remediator for the dead letters of `source` (a queue or a subscription).
    ///
    /// Resubmissions go back to the queue, or to the topic of a subscription.
    pub fn new(broker: Arc<dyn Broker>, source: EntityPath, policy: Arc<dyn RemediationPolicy>) -> Self {
        let source = source.parent();
        let resubmit_to = match source.subscription_name() {
            Some(_) => EntityPath::queue(source.entity_name()).unwrap_or_else(|_| source.clone()),
            None => source.clone(),
        };

        Self {
            broker,
            source,
            resubmit_to,
            policy,
            retry: RetryPolicy::default(),
            max_batch_size: 10,
            receive_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_resubmit_to(mut self, path: EntityPath) -> Self {
        self.resubmit_to = path;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn source(&self) -> &EntityPath {
        &self.source
    }

    pub fn resubmit_to(&self) -> &EntityPath {
        &self.resubmit_to
    }

    /// Inspect up to `max_count` dead letters without locking them
    pub async fn browse(&self, max_count: usize) -> Result<Vec<ReceivedMessage>, PumpError> {
        let path = self.source.dead_letter();
        let raw = retry_transient(&self.retry, "peek", || self.broker.peek(&path, max_count))
            .await
            .map_err(|failure| PumpError::from_retry("peek", failure))?;

        raw.into_iter()
            .map(|raw| decode_received(raw).map_err(PumpError::from))
            .collect()
    }

    /// Remediate every dead letter currently in the sub-queue.
    ///
    /// Messages the policy leaves stay locked until the pass ends and are
    /// then abandoned, so each message is seen at most once per pass.
    #[instrument(skip(self), fields(source = %self.source, resubmit_to = %self.resubmit_to))]
    pub async fn run_once(&self) -> Result<RemediationReport, PumpError> {
        let path = self.source.dead_letter();
        let mut report = RemediationReport::default();
        let mut held = Vec::new();

        let result = self.drain(&path, &mut report, &mut held).await;

        for delivery in &held {
            if let Err(failure) = settle_with_retry(&*self.broker, delivery, &Settlement::Abandon, &self.retry).await {
                warn!(
                    sequence_number = %delivery.sequence_number(),
                    error = %failure.into_error(),
                    "Failed to release left dead letter, its lock will lapse"
                );
            }
        }

        result?;
        info!(
            resubmitted = report.resubmitted,
            discarded = report.discarded,
            left = report.left,
            "Dead-letter remediation pass finished"
        );
        Ok(report)
    }

    async fn drain(
        &self,
        path: &EntityPath,
        report: &mut RemediationReport,
        held: &mut Vec<Delivery>,
    ) -> Result<(), PumpError> {
        loop {
            let batch = retry_transient(&self.retry, "receive", || {
                self.broker
                    .receive(path, ReceiveMode::PeekLock, self.max_batch_size, self.receive_timeout)
            })
            .await
            .map_err(|failure| PumpError::from_retry("receive", failure))?;

            if batch.is_empty() {
                return Ok(());
            }

            for raw in batch {
                let delivery = decode_delivery(raw)?;
                let received = &delivery.received;
                debug!(
                    sequence_number = %received.sequence_number,
                    reason = received.dead_letter_reason.as_deref().unwrap_or_default(),
                    "Remediating dead letter"
                );

                match self.policy.remediate(received).await {
                    Remediation::Resubmit(message) => {
                        let sequence_number = retry_transient(&self.retry, "send", || {
                            self.broker.send(&self.resubmit_to, message.clone())
                        })
                        .await
                        .map_err(|failure| PumpError::from_retry("send", failure))?;

                        self.remove(&delivery).await?;
                        info!(
                            original = %received.sequence_number,
                            resubmitted_as = %sequence_number,
                            "Dead letter resubmitted"
                        );
                        report.resubmitted += 1;
                    }
                    Remediation::Discard => {
                        self.remove(&delivery).await?;
                        info!(sequence_number = %received.sequence_number, "Dead letter discarded");
                        report.discarded += 1;
                    }
                    Remediation::Leave => {
                        report.left += 1;
                        held.push(delivery);
                    }
                }
            }
        }
    }

    async fn remove(&self, delivery: &Delivery) -> Result<(), PumpError> {
        match settle_with_retry(&*self.broker, delivery, &Settlement::Complete, &self.retry).await {
            Ok(()) => Ok(()),
            Err(RetryFailure::Permanent(BrokerError::MessageLockLost { .. })) => {
                warn!(
                    sequence_number = %delivery.sequence_number(),
                    "Lock lost on dead letter, it will be remediated again"
                );
                Ok(())
            }
            Err(failure) => Err(PumpError::from_retry("complete", failure)),
        }
    }
}

#[cfg(test)]
#[path = "remediation_tests.rs"]
mod tests;
