//! Common test utilities for queue-relay integration tests
//!
//! This module provides:
//! - A recording message handler driven by a closure
//! - Entity setup on the in-memory broker
//! - Helpers for sending and inspecting messages

use async_trait::async_trait;
use queue_relay::{
    decode_received, Broker, Delivery, EntityPath, HandlerError, HandlerOutcome, InMemoryBroker,
    Message, MessageHandler, PumpConfig, QueueOptions, ReceivedMessage, RetryPolicy,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Recording Handler
// ============================================================================

/// What the handler saw for one delivery
#[derive(Debug, Clone, PartialEq)]
#[allow(dead_code)]
pub struct Seen {
    pub body: String,
    pub sequence_number: u64,
    pub delivery_count: u32,
}

type Decide = dyn Fn(&Delivery) -> Result<HandlerOutcome, HandlerError> + Send + Sync;

/// Handler that records every delivery and answers through a closure
#[derive(Clone)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<Seen>>>,
    decide: Arc<Decide>,
}

#[allow(dead_code)]
impl RecordingHandler {
    /// Handler that processes everything
    pub fn accepting() -> Self {
        Self::new(|_| Ok(HandlerOutcome::Processed))
    }

    pub fn new<F>(decide: F) -> Self
    where
        F: Fn(&Delivery) -> Result<HandlerOutcome, HandlerError> + Send + Sync + 'static,
    {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            decide: Arc::new(decide),
        }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.seen().into_iter().map(|s| s.body).collect()
    }

    pub fn call_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        self.seen.lock().unwrap().push(Seen {
            body: body_text(delivery.message()),
            sequence_number: delivery.sequence_number().value(),
            delivery_count: delivery.delivery_count(),
        });
        (self.decide)(delivery)
    }
}

// ============================================================================
// Setup Helpers
// ============================================================================

/// Create a queue with the given options
#[allow(dead_code)]
pub fn create_queue(broker: &InMemoryBroker, name: &str, options: QueueOptions) -> EntityPath {
    let path = EntityPath::queue(name).unwrap();
    broker.create_queue(&path, options).unwrap();
    path
}

/// Retry policy with millisecond delays
#[allow(dead_code)]
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0).without_jitter()
}

/// Pump settings that stop once the entity is empty
#[allow(dead_code)]
pub fn drain_config() -> PumpConfig {
    PumpConfig::default()
        .with_receive_timeout(Duration::from_millis(50))
        .with_drain_once()
}

#[allow(dead_code)]
pub async fn send_bodies(broker: &InMemoryBroker, path: &EntityPath, bodies: &[&str]) {
    for body in bodies {
        broker
            .send(path, Message::new(body.to_string()))
            .await
            .unwrap();
    }
}

// ============================================================================
// Inspection Helpers
// ============================================================================

pub fn body_text(message: &Message) -> String {
    String::from_utf8_lossy(&message.body).into_owned()
}

/// Messages currently on `path`, without locking them
#[allow(dead_code)]
pub async fn peek_all(broker: &InMemoryBroker, path: &EntityPath) -> Vec<ReceivedMessage> {
    broker
        .peek(path, 1_000)
        .await
        .unwrap()
        .into_iter()
        .map(|raw| decode_received(raw).unwrap())
        .collect()
}

#[allow(dead_code)]
pub async fn bodies_on(broker: &InMemoryBroker, path: &EntityPath) -> Vec<String> {
    peek_all(broker, path)
        .await
        .iter()
        .map(|received| body_text(&received.message))
        .collect()
}
