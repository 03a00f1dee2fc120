//! Tests for the crate-level re-exports.

use super::*;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct AcceptAll;

#[async_trait]
impl MessageHandler for AcceptAll {
    async fn handle(&self, _delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        Ok(HandlerOutcome::Processed)
    }
}

#[test]
fn test_entity_path_validation() {
    assert!(EntityPath::queue("orders").is_ok());
    assert!(EntityPath::subscription("events", "audit").is_ok());
    assert!(EntityPath::queue("").is_err());
}

#[test]
fn test_session_id_validation() {
    assert!(SessionId::new("session-123".to_string()).is_ok());
    assert!(SessionId::new("owner/repo/pull_request/123".to_string()).is_ok());

    assert!(SessionId::new("".to_string()).is_err());
    assert!(SessionId::new("a".repeat(129)).is_err());
}

#[tokio::test]
async fn test_pump_drains_queue_through_crate_root_types() {
    let broker = InMemoryBroker::default();
    let path = EntityPath::queue("orders").unwrap();
    broker.create_queue(&path, QueueOptions::default()).unwrap();
    broker.send(&path, Message::new("hello")).await.unwrap();

    let pump = MessagePump::new(
        Arc::new(broker.clone()),
        path.clone(),
        Arc::new(AcceptAll),
        PumpConfig::default()
            .with_receive_timeout(Duration::from_millis(50))
            .with_drain_once(),
    );
    pump.run(CancellationToken::new()).await.unwrap();

    assert_eq!(pump.stats().completed, 1);
    assert_eq!(pump.state(), PumpState::Closed);
    assert_eq!(broker.message_count(&path), 0);
}
