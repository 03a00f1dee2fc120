//! Tests for the receive pump.

use super::*;
use crate::deferral::{OrderingCursor, PropertyOrderingKey, SequencedHandler};
use crate::message::Message;
use crate::outcome::HandlerOutcome;
use crate::providers::{BrokerOperation, InMemoryBroker, QueueOptions};
use async_trait::async_trait;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Handler driven by a plain closure
struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Delivery) -> Result<HandlerOutcome, HandlerError> + Send + Sync,
{
    async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        (self.0)(delivery)
    }
}

fn handler<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&Delivery) -> Result<HandlerOutcome, HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0).without_jitter()
}

fn drain_config() -> PumpConfig {
    PumpConfig::default()
        .with_receive_timeout(Duration::from_millis(50))
        .with_drain_once()
}

fn queue(broker: &InMemoryBroker) -> EntityPath {
    let path = EntityPath::queue("work").unwrap();
    broker.create_queue(&path, QueueOptions::default()).unwrap();
    path
}

async fn send_bodies(broker: &InMemoryBroker, path: &EntityPath, count: usize) {
    for i in 0..count {
        broker
            .send(path, Message::new(format!("message-{}", i)))
            .await
            .unwrap();
    }
}

/// Answers out-of-order keys only after a pause, so a predecessor can finish first
struct DelayedOutOfOrder {
    inner: Arc<dyn MessageHandler>,
    delay: Duration,
}

#[async_trait]
impl MessageHandler for DelayedOutOfOrder {
    async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        let outcome = self.inner.handle(delivery).await?;
        if matches!(outcome, HandlerOutcome::OutOfOrder { .. }) {
            tokio::time::sleep(self.delay).await;
        }
        Ok(outcome)
    }
}

/// Signals when it starts, then takes a while to finish
struct SlowHandler {
    started: Arc<Notify>,
    finished: Arc<AtomicBool>,
    delay: Duration,
}

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn handle(&self, _delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(HandlerOutcome::Processed)
    }
}

async fn send_steps(broker: &InMemoryBroker, path: &EntityPath, steps: &[i64]) {
    for step in steps {
        broker
            .send(path, Message::new("step").with_property("step", *step))
            .await
            .unwrap();
    }
}

/// Inner handler recording the step of every message it processes
fn step_recorder() -> (Arc<dyn MessageHandler>, Arc<Mutex<Vec<i64>>>) {
    let order = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&order);
    let inner = handler(move |delivery| {
        let step = delivery.message().property("step").and_then(|v| v.as_i64());
        recorder.lock().unwrap().push(step.unwrap_or_default());
        Ok(HandlerOutcome::Processed)
    });
    (inner, order)
}

/// Pump over `path` that enforces step order around `inner`
fn ordered_pump(
    broker: &InMemoryBroker,
    path: &EntityPath,
    inner: Arc<dyn MessageHandler>,
    out_of_order_delay: Duration,
    config: PumpConfig,
) -> (MessagePump, Arc<OrderingCursor>) {
    let cursor = Arc::new(OrderingCursor::new(0));
    let sequenced: Arc<dyn MessageHandler> = Arc::new(DelayedOutOfOrder {
        inner: Arc::new(SequencedHandler::new(
            Arc::clone(&inner),
            Arc::new(PropertyOrderingKey::new("step")),
            Arc::clone(&cursor),
        )),
        delay: out_of_order_delay,
    });
    let resumer = Arc::new(
        DeferredResumer::new(Arc::new(DeferralLedger::new()), Arc::clone(&cursor), inner)
            .with_retry_policy(fast_retry()),
    );
    let pump = MessagePump::new(Arc::new(broker.clone()), path.clone(), sequenced, config)
        .with_retry_policy(fast_retry())
        .with_resumer(resumer);
    (pump, cursor)
}

fn pump(broker: &InMemoryBroker, path: &EntityPath, handler: Arc<dyn MessageHandler>) -> MessagePump {
    MessagePump::new(Arc::new(broker.clone()), path.clone(), handler, drain_config())
        .with_retry_policy(fast_retry())
}

// ============================================================================
// Processing Tests
// ============================================================================

mod processing {
    use super::*;

    #[tokio::test]
    async fn test_processes_messages_in_order_and_closes() {
        // Arrange
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        send_bodies(&broker, &path, 5).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let pump = pump(
            &broker,
            &path,
            handler(move |delivery| {
                recorder.lock().unwrap().push(delivery.sequence_number().value());
                Ok(HandlerOutcome::Processed)
            }),
        );

        // Act
        pump.run(CancellationToken::new()).await.unwrap();

        // Assert
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(pump.stats().completed, 5);
        assert_eq!(pump.state(), PumpState::Closed);
        assert_eq!(broker.message_count(&path), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_abandons_and_redelivers() {
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        send_bodies(&broker, &path, 1).await;
        let counts = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&counts);
        let pump = pump(
            &broker,
            &path,
            handler(move |delivery| {
                recorder.lock().unwrap().push(delivery.delivery_count());
                if delivery.delivery_count() == 1 {
                    Err(HandlerError::transient("not yet"))
                } else {
                    Ok(HandlerOutcome::Processed)
                }
            }),
        );

        pump.run(CancellationToken::new()).await.unwrap();

        assert_eq!(*counts.lock().unwrap(), vec![1, 2]);
        let stats = pump.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_unrecognized_message_dead_letters_once() {
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        send_bodies(&broker, &path, 1).await;
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let pump = pump(
            &broker,
            &path,
            handler(move |_| {
                *counter.lock().unwrap() += 1;
                Ok(HandlerOutcome::Unrecognized {
                    description: "unknown subject".to_string(),
                })
            }),
        );

        pump.run(CancellationToken::new()).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(pump.stats().dead_lettered, 1);
        assert_eq!(broker.message_count(&path.dead_letter()), 1);
        assert_eq!(broker.message_count(&path), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_messages_resume_after_predecessor() {
        // Arrange: steps arrive as 2, 3, 1
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        for step in [2i64, 3, 1] {
            broker
                .send(&path, Message::new("step").with_property("step", step))
                .await
                .unwrap();
        }
        let order = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&order);
        let inner = handler(move |delivery| {
            let step = delivery.message().property("step").and_then(|v| v.as_i64());
            recorder.lock().unwrap().push(step.unwrap_or_default());
            Ok(HandlerOutcome::Processed)
        });
        let cursor = Arc::new(OrderingCursor::new(0));
        let sequenced: Arc<dyn MessageHandler> = Arc::new(SequencedHandler::new(
            Arc::clone(&inner),
            Arc::new(PropertyOrderingKey::new("step")),
            Arc::clone(&cursor),
        ));
        let resumer = Arc::new(
            DeferredResumer::new(Arc::new(DeferralLedger::new()), Arc::clone(&cursor), inner)
                .with_retry_policy(fast_retry()),
        );
        let pump = pump(&broker, &path, sequenced).with_resumer(resumer);

        // Act
        pump.run(CancellationToken::new()).await.unwrap();

        // Assert
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(cursor.last_processed(), 3);
        assert!(pump.ledger().is_empty());
        let stats = pump.stats();
        assert_eq!(stats.deferred, 2);
        assert_eq!(stats.resumed, 2);
        assert_eq!(broker.message_count(&path), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deferral_landing_after_resume_is_not_stranded() {
        // Arrange: step 2 is judged out of order, then step 1 completes and
        // resumes before step 2's deferral is recorded
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        send_steps(&broker, &path, &[2, 1]).await;
        let (inner, order) = step_recorder();
        let (pump, cursor) = ordered_pump(
            &broker,
            &path,
            inner,
            Duration::from_millis(50),
            drain_config().with_max_concurrent_calls(2),
        );

        // Act
        pump.run(CancellationToken::new()).await.unwrap();

        // Assert
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(cursor.last_processed(), 2);
        assert!(pump.ledger().is_empty());
        assert_eq!(broker.deferred_count(&path), 0);
        assert_eq!(broker.message_count(&path), 0);
    }
}

// ============================================================================
// Settlement Retry Tests
// ============================================================================

mod settlement {
    use super::*;

    #[tokio::test]
    async fn test_transient_complete_failure_is_retried() {
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        send_bodies(&broker, &path, 1).await;
        broker.inject_fault(
            BrokerOperation::Complete,
            BrokerError::Timeout {
                duration: Duration::from_millis(1),
            },
            2,
        );
        let pump = pump(&broker, &path, handler(|_| Ok(HandlerOutcome::Processed)));

        pump.run(CancellationToken::new()).await.unwrap();

        assert_eq!(pump.stats().completed, 1);
        assert_eq!(broker.message_count(&path), 0);
    }

    #[tokio::test]
    async fn test_lost_complete_acknowledgment_is_idempotent() {
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        send_bodies(&broker, &path, 1).await;
        broker.inject_fault_after_commit(
            BrokerOperation::Complete,
            BrokerError::ConnectionFailed {
                message: "reset".to_string(),
            },
            1,
        );
        let pump = pump(&broker, &path, handler(|_| Ok(HandlerOutcome::Processed)));

        pump.run(CancellationToken::new()).await.unwrap();

        assert_eq!(pump.stats().completed, 1);
        assert_eq!(broker.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_lost_lock_on_defer_leaves_step_for_redelivery() {
        // Arrange
        let broker = InMemoryBroker::default();
        let path = EntityPath::queue("work").unwrap();
        broker
            .create_queue(
                &path,
                QueueOptions::default().with_lock_duration(Duration::from_millis(200)),
            )
            .unwrap();
        send_steps(&broker, &path, &[2, 1]).await;
        broker.inject_fault(
            BrokerOperation::Defer,
            BrokerError::MessageLockLost {
                lock_token: "expired".to_string(),
            },
            1,
        );
        let (inner, order) = step_recorder();
        let (pump, cursor) = ordered_pump(&broker, &path, inner, Duration::ZERO, drain_config());

        // Act: the first pass cannot defer step 2, the second sees it redelivered
        pump.run(CancellationToken::new()).await.unwrap();
        assert!(pump.ledger().is_empty());
        assert_eq!(broker.deferred_count(&path), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        pump.run(CancellationToken::new()).await.unwrap();

        // Assert
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(cursor.last_processed(), 2);
        assert_eq!(broker.message_count(&path), 0);
    }

    #[tokio::test]
    async fn test_exhausted_defer_retries_withdraw_ledger_entry() {
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        send_steps(&broker, &path, &[2]).await;
        broker.inject_fault(
            BrokerOperation::Defer,
            BrokerError::ServerBusy {
                message: "throttled".to_string(),
            },
            10,
        );
        let (inner, order) = step_recorder();
        let (pump, _cursor) = ordered_pump(&broker, &path, inner, Duration::ZERO, drain_config());

        let result = pump.run(CancellationToken::new()).await;

        match result {
            Err(PumpError::RetriesExhausted {
                operation,
                attempts,
                ..
            }) => {
                assert_eq!(operation, "defer");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected exhausted retries, got {:?}", other),
        }
        assert!(order.lock().unwrap().is_empty());
        assert!(pump.ledger().is_empty());
        assert_eq!(broker.deferred_count(&path), 0);
        assert_eq!(broker.message_count(&path), 1);
    }

    #[tokio::test]
    async fn test_exhausted_settlement_retries_are_fatal() {
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        send_bodies(&broker, &path, 1).await;
        broker.inject_fault(
            BrokerOperation::Complete,
            BrokerError::ServiceUnavailable {
                code: "503".to_string(),
                message: "down".to_string(),
            },
            10,
        );
        let pump = pump(&broker, &path, handler(|_| Ok(HandlerOutcome::Processed)));

        let result = pump.run(CancellationToken::new()).await;

        match result {
            Err(PumpError::RetriesExhausted {
                operation,
                attempts,
                ..
            }) => {
                assert_eq!(operation, "complete");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected exhausted retries, got {:?}", other),
        }
    }
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_permanent_handler_error_stops_pump() {
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        send_bodies(&broker, &path, 3).await;
        let pump = pump(
            &broker,
            &path,
            handler(|_| Err(HandlerError::permanent("schema mismatch"))),
        );

        let result = pump.run(CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(PumpError::Handler {
                sequence_number: 1,
                ..
            })
        ));
        assert_eq!(pump.state(), PumpState::Closed);
        assert_eq!(pump.stats().received, 1);
    }

    #[tokio::test]
    async fn test_permanent_receive_error_is_fatal() {
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        broker.inject_fault(
            BrokerOperation::Receive,
            BrokerError::AuthenticationFailed {
                message: "token expired".to_string(),
            },
            1,
        );
        let pump = pump(&broker, &path, handler(|_| Ok(HandlerOutcome::Processed)));

        let result = pump.run(CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(PumpError::Broker { ref operation, .. }) if operation == "receive"
        ));
    }

    #[tokio::test]
    async fn test_cancellation_closes_idle_pump() {
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        let pump = Arc::new(MessagePump::new(
            Arc::new(broker.clone()),
            path.clone(),
            handler(|_| Ok(HandlerOutcome::Processed)),
            PumpConfig::default().with_receive_timeout(Duration::from_secs(30)),
        ));
        let mut states = pump.subscribe();
        let cancel = CancellationToken::new();

        let running = tokio::spawn({
            let pump = Arc::clone(&pump);
            let cancel = cancel.clone();
            async move { pump.run(cancel).await }
        });
        states
            .wait_for(|state| *state == PumpState::Receiving)
            .await
            .unwrap();
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(pump.state(), PumpState::Closed);
    }

    #[tokio::test]
    async fn test_cancellation_lets_in_flight_delivery_settle() {
        // Arrange
        let broker = InMemoryBroker::default();
        let path = queue(&broker);
        send_bodies(&broker, &path, 1).await;
        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let slow: Arc<dyn MessageHandler> = Arc::new(SlowHandler {
            started: Arc::clone(&started),
            finished: Arc::clone(&finished),
            delay: Duration::from_millis(200),
        });
        let pump = Arc::new(
            MessagePump::new(
                Arc::new(broker.clone()),
                path.clone(),
                slow,
                PumpConfig::default().with_receive_timeout(Duration::from_secs(30)),
            )
            .with_retry_policy(fast_retry()),
        );
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let pump = Arc::clone(&pump);
            let cancel = cancel.clone();
            async move { pump.run(cancel).await }
        });

        // Act: cancel while the handler is still working, then make more work available
        started.notified().await;
        cancel.cancel();
        broker.send(&path, Message::new("late")).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();

        // Assert
        assert!(result.is_ok());
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(pump.state(), PumpState::Closed);
        assert_eq!(pump.stats().completed, 1);
        assert_eq!(broker.stats().received, 1);
        assert_eq!(broker.stats().completed, 1);
        assert_eq!(broker.message_count(&path), 1);
    }

    #[test]
    fn test_config_defaults() {
        let config = PumpConfig::default();

        assert_eq!(config.max_concurrent_calls, 1);
        assert_eq!(config.receive_timeout(), Duration::from_secs(1));
        assert!(!config.drain_once);
        assert_eq!(config.max_delivery_count, Some(10));
    }
}
