//! Broker collaborator interfaces.
//!
//! The broker owns all cross-process state: locks, redelivery, sequence
//! numbers, filter evaluation and session state. Everything in this crate
//! reaches it through the traits below, passed around as `Arc<dyn Broker>`.

use crate::envelope::RawDelivery;
use crate::error::BrokerError;
use crate::message::{EntityPath, LockToken, Message, SequenceNumber, SessionId, Timestamp};
use crate::rules::RuleDescription;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// How a receive call takes messages off the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveMode {
    /// Message stays on the entity, locked to this receiver, until settled
    #[default]
    PeekLock,
    /// Message is removed as it is delivered; no settlement possible
    ReceiveAndDelete,
}

/// Settlement operations on a peek-locked delivery
#[async_trait]
pub trait LockSettler: Send + Sync {
    /// Remove the message from the entity.
    ///
    /// Completing a lock token that was already completed succeeds.
    async fn complete(&self, lock_token: &LockToken) -> Result<(), BrokerError>;

    /// Release the lock, making the message immediately available again
    async fn abandon(&self, lock_token: &LockToken) -> Result<(), BrokerError>;

    /// Move the message to the entity's dead-letter sub-queue
    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError>;

    /// Set the message aside; it is only retrievable by sequence number afterwards
    async fn defer(&self, lock_token: &LockToken) -> Result<(), BrokerError>;
}

/// Main interface for a lock-based message broker
#[async_trait]
pub trait Broker: LockSettler {
    /// Send single message to a queue or topic
    async fn send(&self, path: &EntityPath, message: Message) -> Result<SequenceNumber, BrokerError>;

    /// Send messages as one batch, in order
    async fn send_batch(
        &self,
        path: &EntityPath,
        messages: Vec<Message>,
    ) -> Result<Vec<SequenceNumber>, BrokerError>;

    /// Receive up to `max_count` messages, waiting at most `wait` for the first
    async fn receive(
        &self,
        path: &EntityPath,
        mode: ReceiveMode,
        max_count: usize,
        wait: Duration,
    ) -> Result<Vec<RawDelivery>, BrokerError>;

    /// Fetch a deferred message by sequence number, locked to this receiver
    async fn receive_deferred(
        &self,
        path: &EntityPath,
        sequence_number: SequenceNumber,
    ) -> Result<RawDelivery, BrokerError>;

    /// Inspect messages without locking them or changing their delivery count
    async fn peek(&self, path: &EntityPath, max_count: usize) -> Result<Vec<RawDelivery>, BrokerError>;

    /// Lock the next available session, or `None` if none became available within `wait`
    async fn accept_session(
        &self,
        path: &EntityPath,
        wait: Duration,
    ) -> Result<Option<Box<dyn SessionHandle>>, BrokerError>;
}

/// Interface for session-based ordered message processing
#[async_trait]
pub trait SessionHandle: LockSettler {
    /// Get session ID
    fn session_id(&self) -> &SessionId;

    /// Time at which the session lock lapses unless renewed
    fn locked_until(&self) -> Timestamp;

    /// Receive messages from this session only, in order
    async fn receive(&self, max_count: usize, wait: Duration) -> Result<Vec<RawDelivery>, BrokerError>;

    /// Fetch a deferred message of this session by sequence number
    async fn receive_deferred(
        &self,
        sequence_number: SequenceNumber,
    ) -> Result<RawDelivery, BrokerError>;

    /// Read the opaque session state
    async fn get_state(&self) -> Result<Option<Bytes>, BrokerError>;

    /// Replace the opaque session state; `None` clears it
    async fn set_state(&self, state: Option<Bytes>) -> Result<(), BrokerError>;

    /// Renew session lock to prevent timeout
    async fn renew_lock(&self) -> Result<Timestamp, BrokerError>;

    /// Close session and release lock
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Administration of topic subscription rules
#[async_trait]
pub trait RuleManager: Send + Sync {
    async fn create_rule(
        &self,
        subscription: &EntityPath,
        rule: RuleDescription,
    ) -> Result<(), BrokerError>;

    async fn delete_rule(&self, subscription: &EntityPath, name: &str) -> Result<(), BrokerError>;

    async fn list_rules(&self, subscription: &EntityPath) -> Result<Vec<RuleDescription>, BrokerError>;
}
