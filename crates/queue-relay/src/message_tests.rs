//! Tests for message types.

use super::*;

// ============================================================================
// EntityPath Tests
// ============================================================================

mod entity_path {
    use super::*;

    #[test]
    fn test_queue_path_is_valid() {
        let path = EntityPath::queue("orders").unwrap();

        assert_eq!(path.as_str(), "orders");
        assert_eq!(path.entity_name(), "orders");
        assert_eq!(path.subscription_name(), None);
        assert!(!path.is_dead_letter());
    }

    #[test]
    fn test_subscription_path_is_valid() {
        let path = EntityPath::subscription("events", "audit").unwrap();

        assert_eq!(path.as_str(), "events/subscriptions/audit");
        assert_eq!(path.entity_name(), "events");
        assert_eq!(path.subscription_name(), Some("audit"));
    }

    #[test]
    fn test_dead_letter_path_round_trips_to_parent() {
        let path = EntityPath::subscription("events", "audit").unwrap();
        let dlq = path.dead_letter();

        assert_eq!(dlq.as_str(), "events/subscriptions/audit/$deadletterqueue");
        assert!(dlq.is_dead_letter());
        assert_eq!(dlq.parent(), path);
        assert_eq!(dlq.dead_letter(), dlq);
    }

    #[test]
    fn test_dead_letter_path_parses() {
        let path: EntityPath = "orders/$deadletterqueue".parse().unwrap();
        assert!(path.is_dead_letter());
        assert_eq!(path.entity_name(), "orders");
    }

    #[test]
    fn test_invalid_paths_rejected() {
        assert!(EntityPath::queue("").is_err());
        assert!(EntityPath::queue("has space").is_err());
        assert!(EntityPath::queue("-leading").is_err());
        assert!(EntityPath::queue("double--hyphen").is_err());
        assert!(EntityPath::new("a/b".to_string()).is_err());
        assert!(EntityPath::new("t/other/s".to_string()).is_err());
        assert!(EntityPath::queue(&"a".repeat(261)).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let json = serde_json::to_string(&EntityPath::queue("orders").unwrap()).unwrap();
        assert_eq!(json, "\"orders\"");

        let bad: Result<EntityPath, _> = serde_json::from_str("\"bad path\"");
        assert!(bad.is_err());
    }
}

// ============================================================================
// Identifier Tests
// ============================================================================

mod identifiers {
    use super::*;

    #[test]
    fn test_message_ids_are_unique() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_message_id_parse_limits() {
        assert!("".parse::<MessageId>().is_err());
        assert!("a".repeat(129).parse::<MessageId>().is_err());
        assert_eq!("order-1".parse::<MessageId>().unwrap().as_str(), "order-1");
    }

    #[test]
    fn test_session_id_validation() {
        assert!(SessionId::new("session-1".to_string()).is_ok());
        assert!(SessionId::new(String::new()).is_err());
        assert!(SessionId::new("bad\nid".to_string()).is_err());
    }

    #[test]
    fn test_sequence_numbers_order() {
        assert!(SequenceNumber::new(1) < SequenceNumber::new(2));
        assert_eq!(SequenceNumber::new(7).value(), 7);
    }

    #[test]
    fn test_timestamp_plus_and_remaining() {
        let later = Timestamp::now().plus(Duration::from_secs(60));
        let remaining = later.remaining();

        assert!(remaining > Duration::from_secs(58));
        assert!(remaining <= Duration::from_secs(60));
    }

    #[test]
    fn test_timestamp_remaining_is_zero_when_passed() {
        let earlier = Timestamp::from_datetime(Utc::now() - chrono::Duration::seconds(5));
        assert_eq!(earlier.remaining(), Duration::ZERO);
    }
}

// ============================================================================
// Message Tests
// ============================================================================

mod message {
    use super::*;

    #[test]
    fn test_message_builder() {
        let session_id = SessionId::new("test-session".to_string()).unwrap();
        let message = Message::new("test body")
            .with_session_id(session_id.clone())
            .with_property("color", "Red")
            .with_property("quantity", 10i64)
            .with_correlation_id("corr-123")
            .with_subject("RecipeStep")
            .with_ttl(Duration::from_secs(1800));

        assert_eq!(message.session_id, Some(session_id));
        assert_eq!(
            message.property("color"),
            Some(&PropertyValue::String("Red".to_string()))
        );
        assert_eq!(message.property("quantity"), Some(&PropertyValue::Int(10)));
        assert_eq!(message.correlation_id.as_deref(), Some("corr-123"));
        assert_eq!(message.subject.as_deref(), Some("RecipeStep"));
        assert_eq!(message.time_to_live, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_from_json_sets_content_type() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Step {
            step: u32,
        }

        let message = Message::from_json(&Step { step: 3 }).unwrap();

        assert_eq!(message.content_type.as_deref(), Some("application/json"));
        assert_eq!(message.body_json::<Step>().unwrap(), Step { step: 3 });
    }

    #[test]
    fn test_message_survives_json_persistence() {
        let message = Message::new(vec![0u8, 159, 146, 150])
            .with_property("flag", true)
            .with_property("ratio", 0.5f64)
            .with_ttl(Duration::from_millis(1500));

        let json = serde_json::to_string(&message).unwrap();
        let restored: Message = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, message);
    }

    #[test]
    fn test_property_value_accessors() {
        assert_eq!(PropertyValue::from("10").as_i64(), Some(10));
        assert_eq!(PropertyValue::from(4i64).as_f64(), Some(4.0));
        assert_eq!(PropertyValue::from(true).as_bool(), Some(true));
        assert_eq!(PropertyValue::from(1.5f64).as_str(), None);
    }

    #[test]
    fn test_bytes_property_survives_json_persistence() {
        let payload = Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]);
        let message = Message::new("blob").with_property("checksum", payload.clone());

        let json = serde_json::to_string(&message).unwrap();
        let restored: Message = serde_json::from_str(&json).unwrap();

        assert!(json.contains("3q2+7w=="));
        assert_eq!(restored.properties["checksum"].as_bytes(), Some(&payload));
        assert_eq!(restored.properties["checksum"].to_string(), "<4 bytes>");
    }
}
