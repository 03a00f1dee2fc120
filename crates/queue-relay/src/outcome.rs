//! Handler outcomes and their translation into broker settlements.

use crate::envelope::Delivery;
use crate::error::{BrokerError, ErrorKind};
use crate::pump::PumpError;
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Dead-letter reason for messages the handler does not know how to process
pub const PROCESSING_ERROR: &str = "ProcessingError";

/// What the handler concluded about a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The message was processed; remove it
    Processed,
    /// The message type, shape or content is not understood
    Unrecognized { description: String },
    /// The message arrived before its predecessor; set it aside under `ordering_key`
    OutOfOrder { ordering_key: u64 },
}

/// Failure raised by a handler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Transient handler failure: {message}")]
    Transient { message: String },

    #[error("Handler failure: {message}")]
    Permanent { message: String },
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<BrokerError> for HandlerError {
    fn from(error: BrokerError) -> Self {
        match error.kind() {
            ErrorKind::Transient => Self::transient(error.to_string()),
            ErrorKind::Permanent | ErrorKind::Cancelled => Self::permanent(error.to_string()),
        }
    }
}

/// Application logic invoked for each delivery.
///
/// Handlers may be invoked more than once for the same logical message
/// (lock expiry, abandon, lost acknowledgments) and must tolerate it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError>;
}

/// Broker settlement to apply to a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Complete,
    Abandon,
    DeadLetter { reason: String, description: String },
    Defer { ordering_key: u64 },
}

impl Settlement {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::DeadLetter { .. } => "dead_letter",
            Self::Defer { .. } => "defer",
        }
    }
}

/// Decides the settlement of each delivery from the handler's result
#[derive(Debug, Clone, Default)]
pub struct OutcomeResolver {
    max_delivery_count: Option<u32>,
}

impl OutcomeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe (never enforce) the broker's delivery limit
    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = Some(max_delivery_count);
        self
    }

    pub fn resolve(
        &self,
        delivery: &Delivery,
        result: Result<HandlerOutcome, HandlerError>,
    ) -> Result<Settlement, PumpError> {
        if let Some(max) = self.max_delivery_count {
            if delivery.delivery_count() >= max {
                warn!(
                    sequence_number = %delivery.sequence_number(),
                    delivery_count = delivery.delivery_count(),
                    max_delivery_count = max,
                    "Delivery reached the maximum delivery count; the broker will dead-letter it if it is not completed"
                );
            }
        }

        match result {
            Ok(HandlerOutcome::Processed) => Ok(Settlement::Complete),
            Ok(HandlerOutcome::Unrecognized { description }) => Ok(Settlement::DeadLetter {
                reason: PROCESSING_ERROR.to_string(),
                description,
            }),
            Ok(HandlerOutcome::OutOfOrder { ordering_key }) => Ok(Settlement::Defer { ordering_key }),
            Err(error) if error.is_transient() => {
                warn!(
                    sequence_number = %delivery.sequence_number(),
                    error = %error,
                    "Handler failed transiently, abandoning for redelivery"
                );
                Ok(Settlement::Abandon)
            }
            Err(error) => Err(PumpError::Handler {
                sequence_number: delivery.sequence_number().value(),
                source: error,
            }),
        }
    }
}

#[cfg(test)]
#[path = "outcome_tests.rs"]
mod tests;
