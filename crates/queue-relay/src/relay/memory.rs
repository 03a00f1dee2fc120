//! In-memory relay store for tests.
//!
//! Durable only for the life of the process; sharing one store between relay
//! instances simulates a restart.

use super::store::{RelayRecord, RelayStore, RelayStoreError};
use crate::message::{EntityPath, Message};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct StoreState {
    next_sequence: u64,
    live: BTreeMap<u64, RelayRecord>,
    dead_letters: BTreeMap<u64, RelayRecord>,
}

#[derive(Debug)]
pub struct InMemoryRelayStore {
    state: Mutex<StoreState>,
}

impl InMemoryRelayStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                next_sequence: 1,
                live: BTreeMap::new(),
                dead_letters: BTreeMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryRelayStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayStore for InMemoryRelayStore {
    async fn append(
        &self,
        destination: &EntityPath,
        message: Message,
    ) -> Result<RelayRecord, RelayStoreError> {
        let mut state = self.state();
        let record = RelayRecord::new(state.next_sequence, destination.clone(), message);
        state.next_sequence += 1;
        state.live.insert(record.local_sequence, record.clone());
        Ok(record)
    }

    async fn update(&self, record: &RelayRecord) -> Result<(), RelayStoreError> {
        let mut state = self.state();
        match state.live.get_mut(&record.local_sequence) {
            Some(stored) if stored.id == record.id => {
                *stored = record.clone();
                Ok(())
            }
            _ => Err(RelayStoreError::NotFound { id: record.id }),
        }
    }

    async fn remove(&self, record: &RelayRecord) -> Result<(), RelayStoreError> {
        let mut state = self.state();
        match state.live.get(&record.local_sequence) {
            Some(stored) if stored.id == record.id => {
                state.live.remove(&record.local_sequence);
                Ok(())
            }
            _ => Err(RelayStoreError::NotFound { id: record.id }),
        }
    }

    async fn live(&self) -> Result<Vec<RelayRecord>, RelayStoreError> {
        Ok(self.state().live.values().cloned().collect())
    }

    async fn move_to_dead_letter(&self, record: &RelayRecord) -> Result<(), RelayStoreError> {
        let mut state = self.state();
        if !matches!(state.live.get(&record.local_sequence), Some(stored) if stored.id == record.id) {
            return Err(RelayStoreError::NotFound { id: record.id });
        }
        state.live.remove(&record.local_sequence);
        state.dead_letters.insert(record.local_sequence, record.clone());
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<RelayRecord>, RelayStoreError> {
        Ok(self.state().dead_letters.values().cloned().collect())
    }

    async fn oldest(&self) -> Result<Option<RelayRecord>, RelayStoreError> {
        Ok(self.state().live.values().next().cloned())
    }
}
