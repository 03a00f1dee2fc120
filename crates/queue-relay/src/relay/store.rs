//! Durable storage for messages waiting to be forwarded.

use crate::message::{EntityPath, Message, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Local identifier of a relay record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a record is in its forwarding lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayState {
    /// Waiting to be sent
    Pending,
    /// A send was started and not yet acknowledged
    InFlight,
    /// The last send failed transiently; next attempt not before `retry_at`
    WaitRetry { retry_at: Timestamp },
    /// The broker rejected the message permanently
    DeadLettered,
}

/// A message held locally until the broker accepts it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub id: RecordId,
    /// Store-assigned, strictly increasing in append order
    pub local_sequence: u64,
    pub destination: EntityPath,
    pub message: Message,
    pub state: RelayState,
    /// Sends attempted so far
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl RelayRecord {
    pub fn new(local_sequence: u64, destination: EntityPath, message: Message) -> Self {
        let now = Timestamp::now();
        Self {
            id: RecordId::new(),
            local_sequence,
            destination,
            message,
            state: RelayState::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Change state and stamp the update time
    pub fn transition(&mut self, state: RelayState) {
        self.state = state;
        self.updated_at = Timestamp::now();
    }
}

/// Relay store errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayStoreError {
    #[error("Storage I/O failed for {path}: {message}")]
    Io { path: String, message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("Stored record is corrupt at {path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("Relay record not found: {id}")]
    NotFound { id: RecordId },
}

/// Durable record storage behind a relay.
///
/// Every method returns only once the change is durable. A single relay is
/// the only writer of a store.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Persist a new `Pending` record with the next local sequence number
    async fn append(&self, destination: &EntityPath, message: Message)
        -> Result<RelayRecord, RelayStoreError>;

    /// Overwrite a live record
    async fn update(&self, record: &RelayRecord) -> Result<(), RelayStoreError>;

    /// Delete a live record after the broker acknowledged it
    async fn remove(&self, record: &RelayRecord) -> Result<(), RelayStoreError>;

    /// Live (not dead-lettered) records in local sequence order
    async fn live(&self) -> Result<Vec<RelayRecord>, RelayStoreError>;

    /// Move a live record to the dead-letter area
    async fn move_to_dead_letter(&self, record: &RelayRecord) -> Result<(), RelayStoreError>;

    /// Dead-lettered records in local sequence order
    async fn dead_letters(&self) -> Result<Vec<RelayRecord>, RelayStoreError>;

    /// Oldest live record
    async fn oldest(&self) -> Result<Option<RelayRecord>, RelayStoreError> {
        Ok(self.live().await?.into_iter().next())
    }
}
