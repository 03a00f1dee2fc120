//! In-memory broker implementation for testing and development.
//!
//! This module provides a fully functional in-memory broker that:
//! - Implements peek-lock delivery with lock expiry and redelivery
//! - Auto-dead-letters after a configurable maximum delivery count
//! - Supports deferral, receive-by-sequence-number and non-locking peek
//! - Evaluates topic subscription rules (see [`memory_filter`](super::memory_filter))
//! - Supports sessions with session state
//! - Detects duplicate sends by message ID on queues that ask for it
//! - Holds back scheduled messages until their enqueue time
//! - Injects faults on demand, including "committed but acknowledgment lost"
//!
//! All state lives behind one `std::sync::Mutex`; no lock is held across an
//! await. Waiting receivers are woken through a `tokio::sync::Notify` and
//! additionally re-check on a short interval so that lock and TTL expiry are
//! observed without an explicit wake-up.

use super::memory_filter::{CompiledAction, CompiledFilter};
use crate::broker::{Broker, LockSettler, ReceiveMode, RuleManager, SessionHandle};
use crate::envelope::RawDelivery;
use crate::error::BrokerError;
use crate::message::{
    EntityPath, LockToken, Message, MessageId, SequenceNumber, SessionId, Timestamp,
};
use crate::rules::{CorrelationFilter, Filter, RuleAction, RuleDescription};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Dead-letter reason used when a message runs out of delivery attempts
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// Dead-letter reason used when a message expires on an entity that keeps expired messages
pub const TTL_EXPIRED: &str = "TTLExpiredException";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Configuration
// ============================================================================

/// Broker-wide limits
#[derive(Debug, Clone, PartialEq)]
pub struct InMemoryBrokerConfig {
    pub max_message_size: usize,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            max_message_size: 256 * 1024,
        }
    }
}

/// Per-entity behavior of a queue or subscription
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    pub requires_session: bool,
    pub max_delivery_count: u32,
    pub lock_duration: Duration,
    pub dead_letter_on_expiration: bool,
    pub default_ttl: Option<Duration>,
    /// Drop sends that repeat a message ID seen within the window
    pub requires_duplicate_detection: bool,
    pub duplicate_detection_window: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            requires_session: false,
            max_delivery_count: 10,
            lock_duration: Duration::from_secs(30),
            dead_letter_on_expiration: false,
            default_ttl: None,
            requires_duplicate_detection: false,
            duplicate_detection_window: Duration::from_secs(600),
        }
    }
}

impl QueueOptions {
    pub fn with_sessions(mut self) -> Self {
        self.requires_session = true;
        self
    }

    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_dead_letter_on_expiration(mut self) -> Self {
        self.dead_letter_on_expiration = true;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Only honored on queues; topics and subscriptions ignore it
    pub fn with_duplicate_detection(mut self, window: Duration) -> Self {
        self.requires_duplicate_detection = true;
        self.duplicate_detection_window = window;
        self
    }
}

/// Broker calls that faults can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOperation {
    Send,
    Receive,
    Complete,
    Abandon,
    DeadLetter,
    Defer,
    ReceiveDeferred,
    Peek,
    AcceptSession,
    GetState,
    SetState,
    RenewLock,
}

/// Counters of broker-side activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub sent: u64,
    pub received: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

struct MessageLock {
    token: LockToken,
    until: Timestamp,
}

/// A message stored on an entity with its broker-side metadata
struct StoredMessage {
    message: Message,
    sequence_number: u64,
    enqueued_at: Timestamp,
    expires_at: Option<Timestamp>,
    delivery_count: u32,
    deferred: bool,
    lock: Option<MessageLock>,
    dead_letter_reason: Option<String>,
    dead_letter_description: Option<String>,
}

impl StoredMessage {
    fn is_available(&self, now: Timestamp) -> bool {
        !self.deferred && self.lock.is_none() && self.enqueued_at <= now
    }

    fn to_raw(&self, include_lock: bool) -> RawDelivery {
        let lock = self.lock.as_ref().filter(|_| include_lock);
        RawDelivery {
            sequence_number: Some(self.sequence_number),
            enqueued_at: Some(self.enqueued_at),
            delivery_count: self.delivery_count,
            lock_token: lock.map(|l| l.token.as_str().to_string()),
            locked_until: lock.map(|l| l.until),
            dead_letter_reason: self.dead_letter_reason.clone(),
            dead_letter_description: self.dead_letter_description.clone(),
            ..RawDelivery::from_message(&self.message)
        }
    }

    fn acquire_lock(&mut self, lock_duration: Duration) -> MessageLock {
        self.delivery_count += 1;
        let token = LockToken::new(uuid::Uuid::new_v4().to_string());
        let until = Timestamp::now().plus(lock_duration);
        self.lock = Some(MessageLock {
            token: token.clone(),
            until,
        });
        MessageLock { token, until }
    }
}

#[derive(Default)]
struct SessionRecord {
    state: Option<Bytes>,
    lock: Option<(u64, Timestamp)>,
}

impl SessionRecord {
    fn is_locked(&self, now: Timestamp) -> bool {
        matches!(self.lock, Some((_, until)) if until > now)
    }
}

enum CompiledPredicate {
    Sql(CompiledFilter),
    Correlation(CorrelationFilter),
    Constant(bool),
}

struct CompiledRule {
    description: RuleDescription,
    predicate: CompiledPredicate,
    action: Option<CompiledAction>,
}

impl CompiledRule {
    fn compile(description: RuleDescription) -> Result<Self, BrokerError> {
        let predicate = match &description.filter {
            Filter::Sql(sql) => CompiledPredicate::Sql(
                CompiledFilter::parse(&sql.expression).map_err(|e| {
                    BrokerError::InvalidArgument {
                        argument: "filter".to_string(),
                        message: format!("'{}': {}", sql.expression, e),
                    }
                })?,
            ),
            Filter::Correlation(correlation) => CompiledPredicate::Correlation(correlation.clone()),
            Filter::True => CompiledPredicate::Constant(true),
            Filter::False => CompiledPredicate::Constant(false),
        };

        let action = match &description.action {
            Some(RuleAction::Sql(sql)) => Some(CompiledAction::parse(&sql.expression).map_err(
                |e| BrokerError::InvalidArgument {
                    argument: "action".to_string(),
                    message: format!("'{}': {}", sql.expression, e),
                },
            )?),
            None => None,
        };

        Ok(Self {
            description,
            predicate,
            action,
        })
    }

    fn matches(&self, message: &Message) -> bool {
        match &self.predicate {
            CompiledPredicate::Sql(filter) => filter.matches(message),
            CompiledPredicate::Correlation(filter) => filter.matches(message),
            CompiledPredicate::Constant(value) => *value,
        }
    }
}

/// A receivable entity: a queue or a topic subscription
struct Entity {
    options: QueueOptions,
    next_sequence: u64,
    active: BTreeMap<u64, StoredMessage>,
    dead_letter: BTreeMap<u64, StoredMessage>,
    sessions: HashMap<SessionId, SessionRecord>,
    rules: Option<Vec<CompiledRule>>,
    /// Message IDs accepted inside the duplicate detection window
    recent_sends: HashMap<MessageId, (SequenceNumber, Timestamp)>,
}

impl Entity {
    fn new(options: QueueOptions, rules: Option<Vec<CompiledRule>>) -> Self {
        Self {
            options,
            next_sequence: 0,
            active: BTreeMap::new(),
            dead_letter: BTreeMap::new(),
            sessions: HashMap::new(),
            rules,
            recent_sends: HashMap::new(),
        }
    }

    fn enqueue(&mut self, mut message: Message) -> SequenceNumber {
        self.next_sequence += 1;
        let sequence_number = self.next_sequence;
        let now = Timestamp::now();
        let enqueued_at = match message.scheduled_enqueue_time {
            Some(at) if at > now => at,
            _ => now,
        };

        if message.time_to_live.is_none() {
            message.time_to_live = self.options.default_ttl;
        }
        let expires_at = message.time_to_live.map(|ttl| enqueued_at.plus(ttl));

        self.active.insert(
            sequence_number,
            StoredMessage {
                message,
                sequence_number,
                enqueued_at,
                expires_at,
                delivery_count: 0,
                deferred: false,
                lock: None,
                dead_letter_reason: None,
                dead_letter_description: None,
            },
        );

        SequenceNumber::new(sequence_number)
    }

    /// Sequence number of an earlier send of the same message ID, if still in the window
    fn find_duplicate(&mut self, message_id: &MessageId) -> Option<SequenceNumber> {
        if !self.options.requires_duplicate_detection {
            return None;
        }
        let now = Timestamp::now();
        let window = self.options.duplicate_detection_window;
        self.recent_sends
            .retain(|_, (_, accepted_at)| accepted_at.plus(window) > now);
        self.recent_sends.get(message_id).map(|(seq, _)| *seq)
    }

    fn remember_send(&mut self, message_id: MessageId, sequence_number: SequenceNumber) {
        if self.options.requires_duplicate_detection {
            self.recent_sends
                .insert(message_id, (sequence_number, Timestamp::now()));
        }
    }

    /// Copies of `message` this subscription receives.
    ///
    /// All matching rules without an action share one copy; each matching
    /// rule with an action produces its own copy with the action applied.
    fn route(&self, message: &Message) -> Vec<Message> {
        let Some(rules) = &self.rules else {
            return vec![message.clone()];
        };

        let mut plain_match = false;
        let mut copies = Vec::new();
        for rule in rules.iter().filter(|r| r.matches(message)) {
            match &rule.action {
                Some(action) => {
                    let mut copy = message.clone();
                    action.apply(&mut copy);
                    copies.push(copy);
                }
                None => plain_match = true,
            }
        }

        if plain_match {
            copies.insert(0, message.clone());
        }
        copies
    }

    fn log_mut(&mut self, dead_letter: bool) -> &mut BTreeMap<u64, StoredMessage> {
        if dead_letter {
            &mut self.dead_letter
        } else {
            &mut self.active
        }
    }

    fn move_to_dead_letter(&mut self, sequence_number: u64, reason: &str, description: &str) {
        if let Some(mut stored) = self.active.remove(&sequence_number) {
            stored.lock = None;
            stored.deferred = false;
            stored.dead_letter_reason = Some(reason.to_string());
            stored.dead_letter_description = Some(description.to_string());
            self.dead_letter.insert(sequence_number, stored);
        }
    }
}

struct Topic {
    next_sequence: u64,
    subscriptions: Vec<EntityPath>,
}

#[derive(Clone)]
struct LockRef {
    entity: EntityPath,
    dead_letter: bool,
    sequence_number: u64,
}

struct Fault {
    operation: BrokerOperation,
    error: BrokerError,
    remaining: usize,
    after_commit: bool,
}

/// Kind of a settlement that removed a lock, kept so a repeat of it can succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettledKind {
    Completed,
    Deferred,
}

/// A lock released by a settlement, remembered until the lock would have expired
struct SettledLock {
    kind: SettledKind,
    lock_until: Timestamp,
}

#[derive(Clone, Copy)]
enum SettleAction<'a> {
    Complete,
    Abandon,
    DeadLetter {
        reason: &'a str,
        description: &'a str,
    },
    Defer,
}

#[derive(Default)]
struct BrokerState {
    entities: HashMap<EntityPath, Entity>,
    topics: HashMap<EntityPath, Topic>,
    locks: HashMap<LockToken, LockRef>,
    settled: HashMap<LockToken, SettledLock>,
    faults: Vec<Fault>,
    stats: BrokerStats,
    next_session_owner: u64,
}

impl BrokerState {
    fn take_fault(&mut self, operation: BrokerOperation, after_commit: bool) -> Option<BrokerError> {
        let index = self
            .faults
            .iter()
            .position(|f| f.operation == operation && f.after_commit == after_commit)?;
        let fault = &mut self.faults[index];
        let error = fault.error.clone();
        fault.remaining = fault.remaining.saturating_sub(1);
        if fault.remaining == 0 {
            self.faults.remove(index);
        }
        Some(error)
    }

    fn entity_mut(&mut self, path: &EntityPath) -> Result<&mut Entity, BrokerError> {
        entity_in(&mut self.entities, path)
    }

    /// Release expired locks and expire messages past their time-to-live
    fn sweep(&mut self, path: &EntityPath) {
        let now = Timestamp::now();
        let Some(entity) = self.entities.get_mut(&path.parent()) else {
            return;
        };
        let max_delivery_count = entity.options.max_delivery_count;
        let dead_letter_on_expiration = entity.options.dead_letter_on_expiration;

        for stored in entity.dead_letter.values_mut() {
            if matches!(&stored.lock, Some(lock) if lock.until <= now) {
                if let Some(lock) = stored.lock.take() {
                    self.locks.remove(&lock.token);
                }
            }
        }

        let mut exhausted = Vec::new();
        let mut expired = Vec::new();
        for (sequence_number, stored) in entity.active.iter_mut() {
            if matches!(&stored.lock, Some(lock) if lock.until <= now) {
                if let Some(lock) = stored.lock.take() {
                    self.locks.remove(&lock.token);
                }
                if stored.delivery_count >= max_delivery_count {
                    exhausted.push(*sequence_number);
                    continue;
                }
            }

            if stored.lock.is_none() && matches!(stored.expires_at, Some(at) if at <= now) {
                expired.push(*sequence_number);
            }
        }

        for sequence_number in exhausted {
            debug!(sequence_number, "Lock expired on last delivery attempt");
            entity.move_to_dead_letter(
                sequence_number,
                MAX_DELIVERY_COUNT_EXCEEDED,
                &format!("Message could not be consumed after {} delivery attempts", max_delivery_count),
            );
            self.stats.dead_lettered += 1;
        }

        for sequence_number in expired {
            if dead_letter_on_expiration {
                entity.move_to_dead_letter(
                    sequence_number,
                    TTL_EXPIRED,
                    "The message expired and was dead lettered",
                );
                self.stats.dead_lettered += 1;
            } else {
                entity.active.remove(&sequence_number);
            }
        }
    }

    fn send(
        &mut self,
        path: &EntityPath,
        message: Message,
        max_message_size: usize,
    ) -> Result<SequenceNumber, BrokerError> {
        if path.is_dead_letter() || path.subscription_name().is_some() {
            return Err(BrokerError::InvalidArgument {
                argument: "path".to_string(),
                message: format!("cannot send directly to '{}'", path),
            });
        }

        if message.size() > max_message_size {
            return Err(BrokerError::MessageTooLarge {
                size: message.size(),
                max_size: max_message_size,
            });
        }

        if let Some(topic) = self.topics.get_mut(path) {
            topic.next_sequence += 1;
            let sequence_number = SequenceNumber::new(topic.next_sequence);

            for subscription in &topic.subscriptions {
                let Some(entity) = self.entities.get_mut(subscription) else {
                    continue;
                };
                if entity.options.requires_session && message.session_id.is_none() {
                    warn!(
                        subscription = %subscription,
                        message_id = %message.message_id,
                        "Skipping session-enabled subscription for message without a session ID"
                    );
                    continue;
                }
                for copy in entity.route(&message) {
                    entity.enqueue(copy);
                }
            }

            self.stats.sent += 1;
            return Ok(sequence_number);
        }

        let entity = self
            .entities
            .get_mut(path)
            .ok_or_else(|| BrokerError::EntityNotFound {
                path: path.to_string(),
            })?;

        if entity.options.requires_session && message.session_id.is_none() {
            return Err(BrokerError::InvalidArgument {
                argument: "session_id".to_string(),
                message: format!("entity '{}' requires a session ID on every message", path),
            });
        }

        if let Some(original) = entity.find_duplicate(&message.message_id) {
            debug!(
                path = %path,
                message_id = %message.message_id,
                sequence_number = original.value(),
                "Dropping duplicate send"
            );
            return Ok(original);
        }

        let message_id = message.message_id.clone();
        let sequence_number = entity.enqueue(message);
        entity.remember_send(message_id, sequence_number);
        self.stats.sent += 1;
        Ok(sequence_number)
    }

    fn take_available(
        &mut self,
        path: &EntityPath,
        mode: ReceiveMode,
        max_count: usize,
        session: Option<&SessionId>,
    ) -> Result<Vec<RawDelivery>, BrokerError> {
        self.sweep(path);

        let dead_letter = path.is_dead_letter();
        let base = path.parent();
        let entity = entity_in(&mut self.entities, path)?;

        if entity.options.requires_session && session.is_none() && !dead_letter {
            return Err(BrokerError::SessionRequired {
                path: path.to_string(),
            });
        }

        let lock_duration = entity.options.lock_duration;
        let now = Timestamp::now();
        let log = entity.log_mut(dead_letter);
        let candidates: Vec<u64> = log
            .values()
            .filter(|m| m.is_available(now))
            .filter(|m| session.is_none() || m.message.session_id.as_ref() == session)
            .map(|m| m.sequence_number)
            .take(max_count)
            .collect();

        let mut deliveries = Vec::with_capacity(candidates.len());
        for sequence_number in candidates {
            match mode {
                ReceiveMode::PeekLock => {
                    let Some(stored) = log.get_mut(&sequence_number) else {
                        continue;
                    };
                    let lock = stored.acquire_lock(lock_duration);
                    self.locks.insert(
                        lock.token,
                        LockRef {
                            entity: base.clone(),
                            dead_letter,
                            sequence_number,
                        },
                    );
                    deliveries.push(stored.to_raw(true));
                }
                ReceiveMode::ReceiveAndDelete => {
                    let Some(mut stored) = log.remove(&sequence_number) else {
                        continue;
                    };
                    stored.delivery_count += 1;
                    deliveries.push(stored.to_raw(false));
                }
            }
        }

        self.stats.received += deliveries.len() as u64;
        Ok(deliveries)
    }

    fn receive_deferred(
        &mut self,
        path: &EntityPath,
        sequence_number: SequenceNumber,
        session: Option<&SessionId>,
    ) -> Result<RawDelivery, BrokerError> {
        self.sweep(path);

        let dead_letter = path.is_dead_letter();
        let base = path.parent();
        let entity = entity_in(&mut self.entities, path)?;

        if entity.options.requires_session && session.is_none() && !dead_letter {
            return Err(BrokerError::SessionRequired {
                path: path.to_string(),
            });
        }

        let lock_duration = entity.options.lock_duration;
        let not_found = BrokerError::MessageNotFound {
            sequence_number: sequence_number.value(),
        };
        let stored = entity
            .log_mut(dead_letter)
            .get_mut(&sequence_number.value())
            .filter(|m| session.is_none() || m.message.session_id.as_ref() == session)
            .ok_or(not_found)?;

        if !stored.deferred {
            return Err(BrokerError::MessageNotDeferred {
                sequence_number: sequence_number.value(),
            });
        }
        if stored.lock.is_some() {
            return Err(BrokerError::MessageLocked {
                sequence_number: sequence_number.value(),
            });
        }

        let lock = stored.acquire_lock(lock_duration);
        let raw = stored.to_raw(true);
        self.locks.insert(
            lock.token,
            LockRef {
                entity: base,
                dead_letter,
                sequence_number: sequence_number.value(),
            },
        );
        self.stats.received += 1;
        Ok(raw)
    }

    fn settle(&mut self, lock_token: &LockToken, action: SettleAction<'_>) -> Result<(), BrokerError> {
        let lock_lost = || BrokerError::MessageLockLost {
            lock_token: lock_token.to_string(),
        };

        let now = Timestamp::now();
        self.settled.retain(|_, settled| settled.lock_until > now);
        if let Some(settled) = self.settled.get(lock_token) {
            let repeated = matches!(
                (action, settled.kind),
                (SettleAction::Complete, SettledKind::Completed)
                    | (SettleAction::Defer, SettledKind::Deferred)
            );
            return if repeated { Ok(()) } else { Err(lock_lost()) };
        }

        let lock_ref = self.locks.get(lock_token).cloned().ok_or_else(lock_lost)?;
        self.sweep(&lock_ref.entity);
        if !self.locks.contains_key(lock_token) {
            return Err(lock_lost());
        }

        let entity = entity_in(&mut self.entities, &lock_ref.entity)?;
        let max_delivery_count = entity.options.max_delivery_count;
        let sequence_number = lock_ref.sequence_number;
        let stored = entity
            .log_mut(lock_ref.dead_letter)
            .get_mut(&sequence_number)
            .ok_or_else(lock_lost)?;
        let lock_until = stored.lock.as_ref().map_or(now, |lock| lock.until);

        match action {
            SettleAction::Complete => {
                entity.log_mut(lock_ref.dead_letter).remove(&sequence_number);
                self.settled.insert(
                    lock_token.clone(),
                    SettledLock {
                        kind: SettledKind::Completed,
                        lock_until,
                    },
                );
                self.stats.completed += 1;
            }
            SettleAction::Abandon => {
                stored.lock = None;
                if !lock_ref.dead_letter && stored.delivery_count >= max_delivery_count {
                    entity.move_to_dead_letter(
                        sequence_number,
                        MAX_DELIVERY_COUNT_EXCEEDED,
                        &format!(
                            "Message could not be consumed after {} delivery attempts",
                            max_delivery_count
                        ),
                    );
                    self.stats.dead_lettered += 1;
                }
                self.stats.abandoned += 1;
            }
            SettleAction::DeadLetter {
                reason,
                description,
            } => {
                if lock_ref.dead_letter {
                    return Err(BrokerError::InvalidArgument {
                        argument: "lock_token".to_string(),
                        message: "messages in a dead-letter queue cannot be dead-lettered again"
                            .to_string(),
                    });
                }
                entity.move_to_dead_letter(sequence_number, reason, description);
                self.stats.dead_lettered += 1;
            }
            SettleAction::Defer => {
                stored.lock = None;
                stored.deferred = true;
                self.settled.insert(
                    lock_token.clone(),
                    SettledLock {
                        kind: SettledKind::Deferred,
                        lock_until,
                    },
                );
                self.stats.deferred += 1;
            }
        }

        self.locks.remove(lock_token);
        Ok(())
    }

    fn peek(&mut self, path: &EntityPath, max_count: usize) -> Result<Vec<RawDelivery>, BrokerError> {
        self.sweep(path);
        let dead_letter = path.is_dead_letter();
        let entity = self.entity_mut(path)?;
        Ok(entity
            .log_mut(dead_letter)
            .values()
            .take(max_count)
            .map(|m| m.to_raw(false))
            .collect())
    }

    fn accept_session(&mut self, path: &EntityPath) -> Result<Option<(SessionId, u64, Timestamp)>, BrokerError> {
        self.sweep(path);
        let now = Timestamp::now();
        self.next_session_owner += 1;
        let owner = self.next_session_owner;
        let entity = self.entity_mut(path)?;

        if !entity.options.requires_session || path.is_dead_letter() {
            return Err(BrokerError::InvalidArgument {
                argument: "path".to_string(),
                message: format!("entity '{}' does not require sessions", path),
            });
        }

        let sessions = &entity.sessions;
        let candidate = entity
            .active
            .values()
            .filter(|m| m.is_available(now))
            .filter_map(|m| m.message.session_id.clone())
            .find(|id| sessions.get(id).map_or(true, |s| !s.is_locked(now)));

        let Some(session_id) = candidate else {
            return Ok(None);
        };

        let until = now.plus(entity.options.lock_duration);
        entity.sessions.entry(session_id.clone()).or_default().lock = Some((owner, until));
        Ok(Some((session_id, owner, until)))
    }

    fn session_mut(
        &mut self,
        path: &EntityPath,
        session_id: &SessionId,
        owner: u64,
    ) -> Result<&mut SessionRecord, BrokerError> {
        let now = Timestamp::now();
        let entity = self.entity_mut(path)?;
        let lost = |lost_at| BrokerError::SessionLockLost {
            session_id: session_id.to_string(),
            lost_at,
        };

        let record = entity
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| lost(now))?;
        let lock = record.lock;
        match lock {
            Some((holder, until)) if holder == owner && until > now => Ok(record),
            Some((holder, until)) if holder == owner => Err(lost(until)),
            _ => Err(lost(now)),
        }
    }
}

// ============================================================================
// Shared Broker Core
// ============================================================================

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    config: InMemoryBrokerConfig,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the state lock, surfacing any injected fault for `operation`
    fn call<T>(
        &self,
        operation: BrokerOperation,
        f: impl FnOnce(&mut BrokerState) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        let mut state = self.state();
        if let Some(error) = state.take_fault(operation, false) {
            return Err(error);
        }
        let value = f(&mut *state)?;
        if let Some(error) = state.take_fault(operation, true) {
            return Err(error);
        }
        Ok(value)
    }

    fn wake(&self) {
        self.notify.notify_waiters();
    }

    async fn receive_until(
        &self,
        path: &EntityPath,
        mode: ReceiveMode,
        max_count: usize,
        wait: Duration,
        session: Option<&SessionId>,
    ) -> Result<Vec<RawDelivery>, BrokerError> {
        if max_count == 0 {
            return Err(BrokerError::InvalidArgument {
                argument: "max_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let deliveries = self.call(BrokerOperation::Receive, |state| {
                state.take_available(path, mode, max_count, session)
            })?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout((deadline - now).min(POLL_INTERVAL), notified).await;
        }
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker implementation
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Create new in-memory broker with configuration
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                config,
            }),
        }
    }

    /// Create a queue
    pub fn create_queue(&self, path: &EntityPath, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.shared.state();
        if path.is_dead_letter() || path.subscription_name().is_some() {
            return Err(BrokerError::InvalidArgument {
                argument: "path".to_string(),
                message: format!("'{}' is not a queue path", path),
            });
        }
        if state.entities.contains_key(path) || state.topics.contains_key(path) {
            return Err(already_exists(path));
        }
        state.entities.insert(path.clone(), Entity::new(options, None));
        Ok(())
    }

    /// Create a topic with no subscriptions
    pub fn create_topic(&self, path: &EntityPath) -> Result<(), BrokerError> {
        let mut state = self.shared.state();
        if path.is_dead_letter() || path.subscription_name().is_some() {
            return Err(BrokerError::InvalidArgument {
                argument: "path".to_string(),
                message: format!("'{}' is not a topic path", path),
            });
        }
        if state.entities.contains_key(path) || state.topics.contains_key(path) {
            return Err(already_exists(path));
        }
        state.topics.insert(
            path.clone(),
            Topic {
                next_sequence: 0,
                subscriptions: Vec::new(),
            },
        );
        Ok(())
    }

    /// Create a subscription starting with the `$Default` match-everything rule
    pub fn create_subscription(
        &self,
        path: &EntityPath,
        options: QueueOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.shared.state();
        if path.is_dead_letter() || path.subscription_name().is_none() {
            return Err(BrokerError::InvalidArgument {
                argument: "path".to_string(),
                message: format!("'{}' is not a subscription path", path),
            });
        }
        if state.entities.contains_key(path) {
            return Err(already_exists(path));
        }

        let topic_path = EntityPath::queue(path.entity_name())?;
        let topic = state
            .topics
            .get_mut(&topic_path)
            .ok_or_else(|| BrokerError::EntityNotFound {
                path: topic_path.to_string(),
            })?;
        topic.subscriptions.push(path.clone());

        let default_rule = CompiledRule::compile(RuleDescription::default_rule())?;
        state
            .entities
            .insert(path.clone(), Entity::new(options, Some(vec![default_rule])));
        Ok(())
    }

    /// Fail the next `times` calls of `operation` before they take effect
    pub fn inject_fault(&self, operation: BrokerOperation, error: BrokerError, times: usize) {
        self.push_fault(operation, error, times, false);
    }

    /// Fail the next `times` calls of `operation` after they took effect.
    ///
    /// Simulates an acknowledgment lost after the broker committed the call.
    pub fn inject_fault_after_commit(
        &self,
        operation: BrokerOperation,
        error: BrokerError,
        times: usize,
    ) {
        self.push_fault(operation, error, times, true);
    }

    fn push_fault(&self, operation: BrokerOperation, error: BrokerError, times: usize, after_commit: bool) {
        if times == 0 {
            return;
        }
        self.shared.state().faults.push(Fault {
            operation,
            error,
            remaining: times,
            after_commit,
        });
    }

    pub fn clear_faults(&self) {
        self.shared.state().faults.clear();
    }

    pub fn stats(&self) -> BrokerStats {
        self.shared.state().stats.clone()
    }

    /// Number of messages held by an entity (or its dead-letter sub-queue), in any state
    pub fn message_count(&self, path: &EntityPath) -> usize {
        let mut state = self.shared.state();
        state.sweep(path);
        let dead_letter = path.is_dead_letter();
        state
            .entity_mut(path)
            .map(|e| e.log_mut(dead_letter).len())
            .unwrap_or(0)
    }

    /// Number of deferred messages held by an entity
    pub fn deferred_count(&self, path: &EntityPath) -> usize {
        let mut state = self.shared.state();
        let dead_letter = path.is_dead_letter();
        state
            .entity_mut(path)
            .map(|e| e.log_mut(dead_letter).values().filter(|m| m.deferred).count())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

fn entity_in<'a>(
    entities: &'a mut HashMap<EntityPath, Entity>,
    path: &EntityPath,
) -> Result<&'a mut Entity, BrokerError> {
    entities
        .get_mut(&path.parent())
        .ok_or_else(|| BrokerError::EntityNotFound {
            path: path.to_string(),
        })
}

fn already_exists(path: &EntityPath) -> BrokerError {
    BrokerError::InvalidArgument {
        argument: "path".to_string(),
        message: format!("entity '{}' already exists", path),
    }
}

#[async_trait]
impl LockSettler for InMemoryBroker {
    async fn complete(&self, lock_token: &LockToken) -> Result<(), BrokerError> {
        self.shared.call(BrokerOperation::Complete, |state| {
            state.settle(lock_token, SettleAction::Complete)
        })
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), BrokerError> {
        let result = self.shared.call(BrokerOperation::Abandon, |state| {
            state.settle(lock_token, SettleAction::Abandon)
        });
        self.shared.wake();
        result
    }

    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError> {
        let result = self.shared.call(BrokerOperation::DeadLetter, |state| {
            state.settle(
                lock_token,
                SettleAction::DeadLetter {
                    reason,
                    description,
                },
            )
        });
        self.shared.wake();
        result
    }

    async fn defer(&self, lock_token: &LockToken) -> Result<(), BrokerError> {
        self.shared.call(BrokerOperation::Defer, |state| {
            state.settle(lock_token, SettleAction::Defer)
        })
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn send(&self, path: &EntityPath, message: Message) -> Result<SequenceNumber, BrokerError> {
        let max_message_size = self.shared.config.max_message_size;
        let result = self.shared.call(BrokerOperation::Send, |state| {
            state.send(path, message, max_message_size)
        });
        self.shared.wake();
        result
    }

    async fn send_batch(
        &self,
        path: &EntityPath,
        messages: Vec<Message>,
    ) -> Result<Vec<SequenceNumber>, BrokerError> {
        let max_message_size = self.shared.config.max_message_size;
        if let Some(oversized) = messages.iter().find(|m| m.size() > max_message_size) {
            return Err(BrokerError::MessageTooLarge {
                size: oversized.size(),
                max_size: max_message_size,
            });
        }

        let result = self.shared.call(BrokerOperation::Send, |state| {
            messages
                .into_iter()
                .map(|message| state.send(path, message, max_message_size))
                .collect()
        });
        self.shared.wake();
        result
    }

    async fn receive(
        &self,
        path: &EntityPath,
        mode: ReceiveMode,
        max_count: usize,
        wait: Duration,
    ) -> Result<Vec<RawDelivery>, BrokerError> {
        self.shared
            .receive_until(path, mode, max_count, wait, None)
            .await
    }

    async fn receive_deferred(
        &self,
        path: &EntityPath,
        sequence_number: SequenceNumber,
    ) -> Result<RawDelivery, BrokerError> {
        self.shared.call(BrokerOperation::ReceiveDeferred, |state| {
            state.receive_deferred(path, sequence_number, None)
        })
    }

    async fn peek(&self, path: &EntityPath, max_count: usize) -> Result<Vec<RawDelivery>, BrokerError> {
        self.shared
            .call(BrokerOperation::Peek, |state| state.peek(path, max_count))
    }

    async fn accept_session(
        &self,
        path: &EntityPath,
        wait: Duration,
    ) -> Result<Option<Box<dyn SessionHandle>>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.shared.notify.notified();
            let accepted = self
                .shared
                .call(BrokerOperation::AcceptSession, |state| state.accept_session(path))?;

            if let Some((session_id, owner, locked_until)) = accepted {
                debug!(path = %path, session_id = %session_id, "Session accepted");
                let session: Box<dyn SessionHandle> = Box::new(InMemorySession {
                    shared: Arc::clone(&self.shared),
                    path: path.parent(),
                    session_id,
                    owner,
                    locked_until: Mutex::new(locked_until),
                });
                return Ok(Some(session));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout((deadline - now).min(POLL_INTERVAL), notified).await;
        }
    }
}

#[async_trait]
impl RuleManager for InMemoryBroker {
    async fn create_rule(
        &self,
        subscription: &EntityPath,
        rule: RuleDescription,
    ) -> Result<(), BrokerError> {
        let compiled = CompiledRule::compile(rule)?;
        let mut state = self.shared.state();
        let rules = subscription_rules(&mut *state, subscription)?;

        if rules.iter().any(|r| r.description.name == compiled.description.name) {
            return Err(BrokerError::InvalidArgument {
                argument: "rule".to_string(),
                message: format!(
                    "rule '{}' already exists on '{}'",
                    compiled.description.name, subscription
                ),
            });
        }

        rules.push(compiled);
        Ok(())
    }

    async fn delete_rule(&self, subscription: &EntityPath, name: &str) -> Result<(), BrokerError> {
        let mut state = self.shared.state();
        let rules = subscription_rules(&mut *state, subscription)?;
        let index = rules
            .iter()
            .position(|r| r.description.name == name)
            .ok_or_else(|| BrokerError::EntityNotFound {
                path: format!("{}/rules/{}", subscription, name),
            })?;
        rules.remove(index);
        Ok(())
    }

    async fn list_rules(&self, subscription: &EntityPath) -> Result<Vec<RuleDescription>, BrokerError> {
        let mut state = self.shared.state();
        let rules = subscription_rules(&mut *state, subscription)?;
        Ok(rules.iter().map(|r| r.description.clone()).collect())
    }
}

fn subscription_rules<'a>(
    state: &'a mut BrokerState,
    subscription: &EntityPath,
) -> Result<&'a mut Vec<CompiledRule>, BrokerError> {
    let path = subscription.to_string();
    state
        .entities
        .get_mut(subscription)
        .and_then(|e| e.rules.as_mut())
        .ok_or(BrokerError::EntityNotFound { path })
}

// ============================================================================
// InMemorySession
// ============================================================================

/// A session of an in-memory entity, locked to one receiver
pub struct InMemorySession {
    shared: Arc<Shared>,
    path: EntityPath,
    session_id: SessionId,
    owner: u64,
    locked_until: Mutex<Timestamp>,
}

impl InMemorySession {
    fn call<T>(
        &self,
        operation: BrokerOperation,
        f: impl FnOnce(&mut BrokerState) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        self.shared.call(operation, |state| {
            state.session_mut(&self.path, &self.session_id, self.owner)?;
            f(state)
        })
    }
}

#[async_trait]
impl LockSettler for InMemorySession {
    async fn complete(&self, lock_token: &LockToken) -> Result<(), BrokerError> {
        self.call(BrokerOperation::Complete, |state| {
            state.settle(lock_token, SettleAction::Complete)
        })
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), BrokerError> {
        let result = self.call(BrokerOperation::Abandon, |state| {
            state.settle(lock_token, SettleAction::Abandon)
        });
        self.shared.wake();
        result
    }

    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError> {
        let result = self.call(BrokerOperation::DeadLetter, |state| {
            state.settle(
                lock_token,
                SettleAction::DeadLetter {
                    reason,
                    description,
                },
            )
        });
        self.shared.wake();
        result
    }

    async fn defer(&self, lock_token: &LockToken) -> Result<(), BrokerError> {
        self.call(BrokerOperation::Defer, |state| {
            state.settle(lock_token, SettleAction::Defer)
        })
    }
}

#[async_trait]
impl SessionHandle for InMemorySession {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn locked_until(&self) -> Timestamp {
        *self.locked_until.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn receive(&self, max_count: usize, wait: Duration) -> Result<Vec<RawDelivery>, BrokerError> {
        self.shared
            .state()
            .session_mut(&self.path, &self.session_id, self.owner)?;
        self.shared
            .receive_until(
                &self.path,
                ReceiveMode::PeekLock,
                max_count,
                wait,
                Some(&self.session_id),
            )
            .await
    }

    async fn receive_deferred(
        &self,
        sequence_number: SequenceNumber,
    ) -> Result<RawDelivery, BrokerError> {
        self.call(BrokerOperation::ReceiveDeferred, |state| {
            state.receive_deferred(&self.path, sequence_number, Some(&self.session_id))
        })
    }

    async fn get_state(&self) -> Result<Option<Bytes>, BrokerError> {
        self.shared.call(BrokerOperation::GetState, |state| {
            let record = state.session_mut(&self.path, &self.session_id, self.owner)?;
            Ok(record.state.clone())
        })
    }

    async fn set_state(&self, new_state: Option<Bytes>) -> Result<(), BrokerError> {
        self.shared.call(BrokerOperation::SetState, |state| {
            let record = state.session_mut(&self.path, &self.session_id, self.owner)?;
            record.state = new_state;
            Ok(())
        })
    }

    async fn renew_lock(&self) -> Result<Timestamp, BrokerError> {
        let until = self.shared.call(BrokerOperation::RenewLock, |state| {
            let lock_duration = state.entity_mut(&self.path)?.options.lock_duration;
            let record = state.session_mut(&self.path, &self.session_id, self.owner)?;
            let until = Timestamp::now().plus(lock_duration);
            record.lock = Some((self.owner, until));
            Ok(until)
        })?;
        *self.locked_until.lock().unwrap_or_else(PoisonError::into_inner) = until;
        Ok(until)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.state();
            let record = state.session_mut(&self.path, &self.session_id, self.owner)?;
            record.lock = None;
        }
        debug!(session_id = %self.session_id, "Session closed");
        self.shared.wake();
        Ok(())
    }
}
