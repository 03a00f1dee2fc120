//! Broker implementations.
//!
//! This module contains concrete implementations of the
//! [`Broker`](crate::broker::Broker) and
//! [`RuleManager`](crate::broker::RuleManager) traits.

pub mod memory;
mod memory_filter;

pub use memory::{
    BrokerOperation, BrokerStats, InMemoryBroker, InMemoryBrokerConfig, InMemorySession,
    QueueOptions, MAX_DELIVERY_COUNT_EXCEEDED, TTL_EXPIRED,
};
