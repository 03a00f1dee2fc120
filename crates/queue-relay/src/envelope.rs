//! Decoding of broker deliveries into typed, lock-bearing envelopes.
//!
//! Brokers hand back a [`RawDelivery`] in which every system field is
//! optional. Decoding validates that the fields required to settle the
//! delivery are present and well formed. Decoding has no side effects; a
//! delivery that fails to decode is never handed to application code.

use crate::error::ValidationError;
use crate::message::{
    bytes_serde, LockToken, Message, MessageId, PropertyValue, SequenceNumber, SessionId,
    Timestamp,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while decoding a broker delivery
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Delivery is missing required field '{field}'")]
    MissingField { field: &'static str },

    #[error("Delivery field '{field}' is invalid: {source}")]
    InvalidField {
        field: &'static str,
        #[source]
        source: ValidationError,
    },
}

// ============================================================================
// Raw Delivery
// ============================================================================

/// Broker-side shape of a delivered message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDelivery {
    pub message_id: Option<String>,
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
    pub properties: HashMap<String, PropertyValue>,
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
    pub time_to_live: Option<Duration>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub partition_key: Option<String>,
    pub reply_to: Option<String>,
    pub to: Option<String>,
    pub scheduled_enqueue_time: Option<Timestamp>,
    pub sequence_number: Option<u64>,
    pub enqueued_at: Option<Timestamp>,
    pub delivery_count: u32,
    pub lock_token: Option<String>,
    pub locked_until: Option<Timestamp>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
}

// ============================================================================
// Decoded Envelopes
// ============================================================================

/// A message as read from the broker, with its broker-assigned fields
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message: Message,
    pub sequence_number: SequenceNumber,
    pub enqueued_at: Timestamp,
    pub delivery_count: u32,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
}

impl ReceivedMessage {
    /// Absolute expiry time, if the message carries a time-to-live
    pub fn expires_at(&self) -> Option<Timestamp> {
        self.message
            .time_to_live
            .map(|ttl| self.enqueued_at.plus(ttl))
    }

    /// Create a fresh sendable copy of the message (new message ID)
    pub fn clone_message(&self) -> Message {
        let mut message = self.message.clone();
        message.message_id = MessageId::new();
        message
    }
}

/// A peek-locked delivery that can be settled through its lock token
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub received: ReceivedMessage,
    pub lock_token: LockToken,
    pub lock_expires_at: Timestamp,
}

impl Delivery {
    pub fn message(&self) -> &Message {
        &self.received.message
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.received.sequence_number
    }

    pub fn delivery_count(&self) -> u32 {
        self.received.delivery_count
    }

    /// Check whether the lock has already lapsed on the local clock
    pub fn is_lock_expired(&self) -> bool {
        self.lock_expires_at <= Timestamp::now()
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a peek-locked delivery
pub fn decode_delivery(raw: RawDelivery) -> Result<Delivery, EnvelopeError> {
    let lock_token = raw
        .lock_token
        .clone()
        .filter(|t| !t.is_empty())
        .map(LockToken::new)
        .ok_or(EnvelopeError::MissingField {
            field: "lock_token",
        })?;
    let lock_expires_at = raw.locked_until.ok_or(EnvelopeError::MissingField {
        field: "locked_until",
    })?;

    let received = decode_received(raw)?;

    Ok(Delivery {
        received,
        lock_token,
        lock_expires_at,
    })
}

/// Decode a delivery that carries no lock (peek, receive-and-delete)
pub fn decode_received(raw: RawDelivery) -> Result<ReceivedMessage, EnvelopeError> {
    let message_id = raw
        .message_id
        .ok_or(EnvelopeError::MissingField {
            field: "message_id",
        })?
        .parse::<MessageId>()
        .map_err(|source| EnvelopeError::InvalidField {
            field: "message_id",
            source,
        })?;

    let sequence_number = raw
        .sequence_number
        .map(SequenceNumber::new)
        .ok_or(EnvelopeError::MissingField {
            field: "sequence_number",
        })?;

    let enqueued_at = raw.enqueued_at.ok_or(EnvelopeError::MissingField {
        field: "enqueued_at",
    })?;

    let session_id = raw
        .session_id
        .map(SessionId::new)
        .transpose()
        .map_err(|source| EnvelopeError::InvalidField {
            field: "session_id",
            source,
        })?;

    let message = Message {
        message_id,
        body: raw.body,
        properties: raw.properties,
        session_id,
        correlation_id: raw.correlation_id,
        time_to_live: raw.time_to_live,
        content_type: raw.content_type,
        subject: raw.subject,
        partition_key: raw.partition_key,
        reply_to: raw.reply_to,
        to: raw.to,
        scheduled_enqueue_time: raw.scheduled_enqueue_time,
    };

    Ok(ReceivedMessage {
        message,
        sequence_number,
        enqueued_at,
        delivery_count: raw.delivery_count,
        dead_letter_reason: raw.dead_letter_reason,
        dead_letter_description: raw.dead_letter_description,
    })
}

impl RawDelivery {
    /// Build the broker-side shape of a message, with no system fields set
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: Some(message.message_id.as_str().to_string()),
            body: message.body.clone(),
            properties: message.properties.clone(),
            session_id: message.session_id.as_ref().map(|s| s.as_str().to_string()),
            correlation_id: message.correlation_id.clone(),
            time_to_live: message.time_to_live,
            content_type: message.content_type.clone(),
            subject: message.subject.clone(),
            partition_key: message.partition_key.clone(),
            reply_to: message.reply_to.clone(),
            to: message.to.clone(),
            scheduled_enqueue_time: message.scheduled_enqueue_time,
            ..Default::default()
        }
    }
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
