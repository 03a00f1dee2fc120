//! # Queue Relay
//!
//! Reliable message processing and store-and-forward sending for lock-based
//! brokers with peek-lock receives, dead-letter sub-queues, deferral and
//! sessions.
//!
//! This library provides:
//! - A receive pump that dispatches peek-locked deliveries to a handler and
//!   settles each one exactly once
//! - Ordered processing of out-of-order arrivals through a deferral ledger
//! - Session processing with checkpoints kept in broker session state
//! - A durable local relay that forwards messages after the broker recovers
//! - Dead-letter inspection and resubmission
//! - Subscription filter rules and an in-memory broker for tests
//!
//! ## Module Organization
//!
//! - [`broker`] - Broker, session and rule-management traits
//! - [`message`] - Message and identifier types
//! - [`envelope`] - Decoding broker deliveries into lock-token envelopes
//! - [`outcome`] - Handler outcomes and settlement resolution
//! - [`pump`] - The receive loop
//! - [`deferral`] - Deferral ledger, ordering cursor and resumption
//! - [`sessions`] - Session processing and checkpoints
//! - [`relay`] - Store-and-forward sending
//! - [`remediation`] - Dead-letter remediation
//! - [`rules`] - Subscription filters and rule actions
//! - [`providers`] - Broker implementations
//! - [`retry`] - Backoff policies
//! - [`config`] - Runtime configuration
//! - [`telemetry`] - Logging setup

pub mod broker;
pub mod config;
pub mod deferral;
pub mod envelope;
pub mod error;
pub mod message;
pub mod outcome;
pub mod providers;
pub mod pump;
pub mod relay;
pub mod remediation;
pub mod retry;
pub mod rules;
pub mod sessions;
pub mod telemetry;

pub use broker::{Broker, LockSettler, ReceiveMode, RuleManager, SessionHandle};
pub use config::{ConfigError, LoggingConfig, RemediationConfig, RetryConfig, RuntimeConfig};
pub use deferral::{
    DeferralLedger, DeferredResumer, EntityReceiver, JsonFieldOrderingKey, LedgerError,
    LedgerSnapshot, OrderingCursor, OrderingKeyExtractor, PropertyOrderingKey, SequencedHandler,
};
pub use envelope::{decode_delivery, decode_received, Delivery, EnvelopeError, RawDelivery, ReceivedMessage};
pub use error::{BrokerError, ErrorKind, ValidationError};
pub use message::{
    BinaryValue, EntityPath, LockToken, Message, MessageId, PropertyValue, SequenceNumber, SessionId,
    Timestamp,
};
pub use outcome::{HandlerError, HandlerOutcome, MessageHandler, OutcomeResolver, Settlement};
pub use providers::{InMemoryBroker, QueueOptions};
pub use pump::{MessagePump, PumpConfig, PumpError, PumpState, PumpStats};
pub use relay::{
    DurableRelay, FilesystemRelayStore, ForwardOutcome, InMemoryRelayStore, RelayConfig, RelayError,
    RelayStore,
};
pub use remediation::{
    DeadLetterRemediator, Remediation, RemediationPolicy, RemediationReport, ResubmitAll,
};
pub use retry::RetryPolicy;
pub use rules::{CorrelationFilter, Filter, RuleAction, RuleDescription, SqlFilter};
pub use sessions::{SessionCheckpoint, SessionConfig, SessionError, SessionProcessor, SessionSummary};
pub use telemetry::{init_logging, TelemetryError};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
