//! Tests for the deferral ledger and in-order resumption.

use super::*;
use crate::broker::ReceiveMode;
use crate::envelope::decode_delivery;
use crate::providers::{BrokerOperation, InMemoryBroker, QueueOptions};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

fn seq(value: u64) -> SequenceNumber {
    SequenceNumber::new(value)
}

/// Records the ordering key of every message it sees
#[derive(Default)]
struct RecordingHandler {
    seen: StdMutex<Vec<u64>>,
    fail_transiently: bool,
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        if self.fail_transiently {
            return Err(HandlerError::transient("downstream unavailable"));
        }
        let key = PropertyOrderingKey::new("step").ordering_key(delivery.message());
        self.seen.lock().unwrap().push(key.unwrap_or_default());
        Ok(HandlerOutcome::Processed)
    }
}

impl RecordingHandler {
    fn seen(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }
}

fn step_delivery(step: i64) -> Delivery {
    decode_delivery(RawDelivery {
        sequence_number: Some(step as u64 + 100),
        enqueued_at: Some(crate::message::Timestamp::now()),
        delivery_count: 1,
        lock_token: Some(format!("lock-{}", step)),
        locked_until: Some(crate::message::Timestamp::now().plus(Duration::from_secs(30))),
        ..RawDelivery::from_message(&Message::new("step").with_property("step", step))
    })
    .unwrap()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5), 2.0).without_jitter()
}

// ============================================================================
// Ledger Tests
// ============================================================================

mod ledger {
    use super::*;

    #[test]
    fn test_defer_and_resume_next() {
        let ledger = DeferralLedger::new();
        ledger.defer(2, seq(20)).unwrap();

        assert_eq!(ledger.try_resume_next(0), None);
        assert_eq!(ledger.try_resume_next(1), Some((2, seq(20))));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let ledger = DeferralLedger::new();
        ledger.defer(2, seq(20)).unwrap();

        let result = ledger.defer(2, seq(21));

        assert_eq!(
            result,
            Err(LedgerError::DuplicateKey {
                ordering_key: 2,
                existing: 20
            })
        );
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let ledger = DeferralLedger::new();
        ledger.defer(2, seq(20)).unwrap();

        let result = ledger.defer(3, seq(20));

        assert_eq!(
            result,
            Err(LedgerError::DuplicateSequence {
                sequence_number: 20,
                existing: 2
            })
        );
    }

    #[test]
    fn test_withdraw_removes_only_matching_entry() {
        let ledger = DeferralLedger::new();
        ledger.defer(4, seq(40)).unwrap();

        assert!(!ledger.withdraw(4, seq(41)));
        assert!(!ledger.withdraw(5, seq(40)));
        assert_eq!(ledger.get(4), Some(seq(40)));

        assert!(ledger.withdraw(4, seq(40)));
        assert!(ledger.is_empty());
        ledger.defer(6, seq(40)).unwrap();
    }

    #[test]
    fn test_resumed_sequence_can_be_deferred_again() {
        let ledger = DeferralLedger::new();
        ledger.defer(2, seq(20)).unwrap();
        ledger.try_resume_next(1);

        assert!(ledger.defer(2, seq(20)).is_ok());
        assert_eq!(ledger.get(2), Some(seq(20)));
    }

    #[test]
    fn test_drain_in_order_regardless_of_insertion_order() {
        let ledger = DeferralLedger::new();
        for key in [4, 1, 5, 3, 2] {
            ledger.defer(key, seq(key * 10)).unwrap();
        }

        let drained: Vec<u64> = ledger.drain_in_order(0).map(|(key, _)| key).collect();

        assert_eq!(drained, vec![1, 2, 3, 4, 5]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_drain_stops_at_first_gap_and_stays_finished() {
        let ledger = DeferralLedger::new();
        ledger.defer(1, seq(10)).unwrap();
        ledger.defer(3, seq(30)).unwrap();

        let mut drain = ledger.drain_in_order(0);
        assert_eq!(drain.next(), Some((1, seq(10))));
        assert_eq!(drain.next(), None);

        // Filling the gap later does not revive the iterator
        ledger.defer(2, seq(20)).unwrap();
        assert_eq!(drain.next(), None);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_resume_after_max_key_is_none() {
        let ledger = DeferralLedger::new();

        assert_eq!(ledger.try_resume_next(u64::MAX), None);
    }

    #[test]
    fn test_snapshot_and_restore() {
        let ledger = DeferralLedger::new();
        ledger.defer(3, seq(30)).unwrap();
        ledger.defer(2, seq(20)).unwrap();

        let json = serde_json::to_string(&ledger.snapshot()).unwrap();
        let snapshot: LedgerSnapshot = serde_json::from_str(&json).unwrap();
        let restored = DeferralLedger::restore(&snapshot).unwrap();

        assert_eq!(restored.snapshot(), ledger.snapshot());
        assert_eq!(snapshot.entries[0].ordering_key, 2);
    }

    #[test]
    fn test_restore_rejects_inconsistent_snapshot() {
        let snapshot = LedgerSnapshot {
            entries: vec![
                DeferredEntry {
                    ordering_key: 2,
                    sequence_number: seq(20),
                },
                DeferredEntry {
                    ordering_key: 3,
                    sequence_number: seq(20),
                },
            ],
        };

        assert!(matches!(
            DeferralLedger::restore(&snapshot),
            Err(LedgerError::DuplicateSequence { .. })
        ));
    }
}

// ============================================================================
// Ordering Tests
// ============================================================================

mod ordering {
    use super::*;

    #[test]
    fn test_cursor_never_moves_backwards() {
        let cursor = OrderingCursor::new(3);

        assert!(!cursor.advance_to(2));
        assert_eq!(cursor.last_processed(), 3);
        assert!(cursor.advance_to(4));
        assert_eq!(cursor.last_processed(), 4);
    }

    #[test]
    fn test_property_ordering_key() {
        let extractor = PropertyOrderingKey::new("step");

        assert_eq!(
            extractor.ordering_key(&Message::new("x").with_property("step", 3i64)),
            Some(3)
        );
        assert_eq!(
            extractor.ordering_key(&Message::new("x").with_property("step", "7")),
            Some(7)
        );
        assert_eq!(
            extractor.ordering_key(&Message::new("x").with_property("step", -1i64)),
            None
        );
        assert_eq!(extractor.ordering_key(&Message::new("x")), None);
    }

    #[test]
    fn test_json_field_ordering_key() {
        let extractor = JsonFieldOrderingKey::new("step");
        let message = Message::from_json(&serde_json::json!({ "step": 4, "title": "whisk" })).unwrap();

        assert_eq!(extractor.ordering_key(&message), Some(4));
        assert_eq!(extractor.ordering_key(&Message::new("not json")), None);
    }

    fn sequenced(cursor: &Arc<OrderingCursor>) -> (SequencedHandler, Arc<RecordingHandler>) {
        let inner = Arc::new(RecordingHandler::default());
        let handler = SequencedHandler::new(
            inner.clone(),
            Arc::new(PropertyOrderingKey::new("step")),
            Arc::clone(cursor),
        );
        (handler, inner)
    }

    #[tokio::test]
    async fn test_in_order_message_is_delegated_and_advances() {
        let cursor = Arc::new(OrderingCursor::new(0));
        let (handler, inner) = sequenced(&cursor);

        let outcome = handler.handle(&step_delivery(1)).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Processed);
        assert_eq!(inner.seen(), vec![1]);
        assert_eq!(cursor.last_processed(), 1);
    }

    #[tokio::test]
    async fn test_future_message_is_out_of_order() {
        let cursor = Arc::new(OrderingCursor::new(0));
        let (handler, inner) = sequenced(&cursor);

        let outcome = handler.handle(&step_delivery(3)).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::OutOfOrder { ordering_key: 3 });
        assert!(inner.seen().is_empty());
        assert_eq!(cursor.last_processed(), 0);
    }

    #[tokio::test]
    async fn test_already_processed_message_is_not_redelivered_to_inner() {
        let cursor = Arc::new(OrderingCursor::new(2));
        let (handler, inner) = sequenced(&cursor);

        let outcome = handler.handle(&step_delivery(2)).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Processed);
        assert!(inner.seen().is_empty());
    }

    #[tokio::test]
    async fn test_message_without_key_is_unrecognized() {
        let cursor = Arc::new(OrderingCursor::new(0));
        let (handler, _) = sequenced(&cursor);
        let mut delivery = step_delivery(1);
        delivery.received.message.properties.clear();

        let outcome = handler.handle(&delivery).await.unwrap();

        assert!(matches!(outcome, HandlerOutcome::Unrecognized { .. }));
    }

    #[tokio::test]
    async fn test_transient_inner_failure_does_not_advance() {
        let cursor = Arc::new(OrderingCursor::new(0));
        let handler = SequencedHandler::new(
            Arc::new(RecordingHandler {
                fail_transiently: true,
                ..Default::default()
            }),
            Arc::new(PropertyOrderingKey::new("step")),
            Arc::clone(&cursor),
        );

        let result = handler.handle(&step_delivery(1)).await;

        assert!(matches!(result, Err(HandlerError::Transient { .. })));
        assert_eq!(cursor.last_processed(), 0);
    }
}

// ============================================================================
// Resumer Tests
// ============================================================================

mod resumer {
    use super::*;

    /// Send steps, defer every one of them, and record them in a ledger
    async fn deferred_steps(steps: &[i64]) -> (InMemoryBroker, EntityPath, Arc<DeferralLedger>) {
        let broker = InMemoryBroker::default();
        let path = EntityPath::queue("workflow").unwrap();
        broker.create_queue(&path, QueueOptions::default()).unwrap();
        let ledger = Arc::new(DeferralLedger::new());

        for step in steps {
            broker
                .send(&path, Message::new("step").with_property("step", *step))
                .await
                .unwrap();
        }
        let raw = broker
            .receive(&path, ReceiveMode::PeekLock, steps.len(), Duration::from_millis(100))
            .await
            .unwrap();
        for raw in raw {
            let delivery = decode_delivery(raw).unwrap();
            let key = PropertyOrderingKey::new("step")
                .ordering_key(delivery.message())
                .unwrap();
            ledger.defer(key, delivery.sequence_number()).unwrap();
            broker.defer(&delivery.lock_token).await.unwrap();
        }

        (broker, path, ledger)
    }

    #[tokio::test]
    async fn test_resume_processes_successors_in_order() {
        // Arrange: 2 and 3 deferred, 1 already processed
        let (broker, path, ledger) = deferred_steps(&[3, 2]).await;
        let cursor = Arc::new(OrderingCursor::new(1));
        let handler = Arc::new(RecordingHandler::default());
        let resumer = DeferredResumer::new(Arc::clone(&ledger), Arc::clone(&cursor), handler.clone())
            .with_retry_policy(fast_retry());
        let source = EntityReceiver::new(Arc::new(broker.clone()), path.clone());

        // Act
        let resumed = resumer.resume(&source).await.unwrap();

        // Assert
        assert_eq!(resumed, 2);
        assert_eq!(handler.seen(), vec![2, 3]);
        assert_eq!(cursor.last_processed(), 3);
        assert!(ledger.is_empty());
        assert_eq!(broker.message_count(&path), 0);
    }

    #[tokio::test]
    async fn test_resume_stops_at_gap() {
        let (broker, path, ledger) = deferred_steps(&[3]).await;
        let cursor = Arc::new(OrderingCursor::new(1));
        let handler = Arc::new(RecordingHandler::default());
        let resumer = DeferredResumer::new(Arc::clone(&ledger), Arc::clone(&cursor), handler.clone());
        let source = EntityReceiver::new(Arc::new(broker.clone()), path.clone());

        let resumed = resumer.resume(&source).await.unwrap();

        assert_eq!(resumed, 0);
        assert!(handler.seen().is_empty());
        assert_eq!(ledger.len(), 1);
        assert_eq!(broker.deferred_count(&path), 1);
    }

    #[tokio::test]
    async fn test_transient_handler_failure_puts_entry_back() {
        let (broker, path, ledger) = deferred_steps(&[2]).await;
        let cursor = Arc::new(OrderingCursor::new(1));
        let handler = Arc::new(RecordingHandler {
            fail_transiently: true,
            ..Default::default()
        });
        let resumer = DeferredResumer::new(Arc::clone(&ledger), Arc::clone(&cursor), handler)
            .with_retry_policy(fast_retry());
        let source = EntityReceiver::new(Arc::new(broker.clone()), path.clone());

        let resumed = resumer.resume(&source).await.unwrap();

        assert_eq!(resumed, 0);
        assert_eq!(cursor.last_processed(), 1);
        assert_eq!(ledger.get(2), Some(seq(1)));
        assert_eq!(broker.deferred_count(&path), 1);
    }

    #[tokio::test]
    async fn test_missing_deferred_message_is_skipped() {
        let broker = InMemoryBroker::default();
        let path = EntityPath::queue("workflow").unwrap();
        broker.create_queue(&path, QueueOptions::default()).unwrap();
        let ledger = Arc::new(DeferralLedger::new());
        ledger.defer(2, seq(99)).unwrap();
        let cursor = Arc::new(OrderingCursor::new(1));
        let resumer = DeferredResumer::new(
            Arc::clone(&ledger),
            Arc::clone(&cursor),
            Arc::new(RecordingHandler::default()),
        );
        let source = EntityReceiver::new(Arc::new(broker), path);

        let resumed = resumer.resume(&source).await.unwrap();

        assert_eq!(resumed, 0);
        assert_eq!(cursor.last_processed(), 2);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_entry_for_active_message_is_dropped_without_skipping() {
        // Arrange: step 2 is recorded but its defer never reached the broker
        let broker = InMemoryBroker::default();
        let path = EntityPath::queue("workflow").unwrap();
        broker.create_queue(&path, QueueOptions::default()).unwrap();
        let active = broker
            .send(&path, Message::new("step").with_property("step", 2i64))
            .await
            .unwrap();
        let ledger = Arc::new(DeferralLedger::new());
        ledger.defer(2, active).unwrap();
        let cursor = Arc::new(OrderingCursor::new(1));
        let handler = Arc::new(RecordingHandler::default());
        let resumer = DeferredResumer::new(Arc::clone(&ledger), Arc::clone(&cursor), handler.clone())
            .with_retry_policy(fast_retry());
        let source = EntityReceiver::new(Arc::new(broker.clone()), path.clone());

        // Act
        let resumed = resumer.resume(&source).await.unwrap();

        // Assert: step 2 stays due and is still receivable
        assert_eq!(resumed, 0);
        assert!(handler.seen().is_empty());
        assert_eq!(cursor.last_processed(), 1);
        assert!(ledger.is_empty());
        assert_eq!(broker.message_count(&path), 1);
        assert_eq!(broker.deferred_count(&path), 0);
    }

    #[tokio::test]
    async fn test_locked_deferred_message_is_retried_then_kept() {
        let (broker, path, ledger) = deferred_steps(&[2]).await;
        broker.inject_fault(
            BrokerOperation::ReceiveDeferred,
            BrokerError::MessageLocked { sequence_number: 1 },
            10,
        );
        let cursor = Arc::new(OrderingCursor::new(1));
        let resumer = DeferredResumer::new(
            Arc::clone(&ledger),
            Arc::clone(&cursor),
            Arc::new(RecordingHandler::default()),
        )
        .with_retry_policy(fast_retry());
        let source = EntityReceiver::new(Arc::new(broker.clone()), path.clone());

        let result = resumer.resume(&source).await;

        assert!(matches!(result, Err(PumpError::RetriesExhausted { .. })));
        assert_eq!(ledger.get(2), Some(seq(1)));
        assert_eq!(cursor.last_processed(), 1);
        assert_eq!(broker.deferred_count(&path), 1);
    }

    #[tokio::test]
    async fn test_permanent_fetch_failure_is_fatal_and_keeps_entry() {
        let (broker, path, ledger) = deferred_steps(&[2]).await;
        broker.inject_fault(
            BrokerOperation::ReceiveDeferred,
            BrokerError::PermissionDenied {
                operation: "receive".to_string(),
            },
            1,
        );
        let cursor = Arc::new(OrderingCursor::new(1));
        let resumer = DeferredResumer::new(
            Arc::clone(&ledger),
            Arc::clone(&cursor),
            Arc::new(RecordingHandler::default()),
        );
        let source = EntityReceiver::new(Arc::new(broker), path);

        let result = resumer.resume(&source).await;

        assert!(matches!(result, Err(PumpError::Broker { .. })));
        assert_eq!(ledger.len(), 1);
    }
}
