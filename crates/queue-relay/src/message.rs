//! Message types and core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Suffix segment addressing the dead-letter sub-queue of an entity.
pub const DEAD_LETTER_SEGMENT: &str = "$deadletterqueue";

const SUBSCRIPTIONS_SEGMENT: &str = "subscriptions";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated path of a receivable or sendable messaging entity.
///
/// Supported shapes:
/// - `orders` (queue or topic)
/// - `orders/$deadletterqueue`
/// - `events/subscriptions/audit`
/// - `events/subscriptions/audit/$deadletterqueue`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityPath(String);

impl EntityPath {
    /// Parse and validate an entity path
    pub fn new(path: String) -> Result<Self, ValidationError> {
        let segments: Vec<&str> = path.split('/').collect();

        let base = match segments.last() {
            Some(&DEAD_LETTER_SEGMENT) => &segments[..segments.len() - 1],
            _ => &segments[..],
        };

        match base {
            [name] => validate_segment("entity_path", name)?,
            [topic, subs, sub] if *subs == SUBSCRIPTIONS_SEGMENT => {
                validate_segment("entity_path", topic)?;
                validate_segment("entity_path", sub)?;
            }
            _ => {
                return Err(ValidationError::InvalidFormat {
                    field: "entity_path".to_string(),
                    message: format!(
                        "expected 'name' or 'topic/subscriptions/name', got '{}'",
                        path
                    ),
                })
            }
        }

        Ok(Self(path))
    }

    /// Path of a queue or topic
    pub fn queue(name: &str) -> Result<Self, ValidationError> {
        Self::new(name.to_string())
    }

    /// Path of a topic subscription
    pub fn subscription(topic: &str, subscription: &str) -> Result<Self, ValidationError> {
        Self::new(format!("{}/{}/{}", topic, SUBSCRIPTIONS_SEGMENT, subscription))
    }

    /// Path of this entity's dead-letter sub-queue
    pub fn dead_letter(&self) -> Self {
        if self.is_dead_letter() {
            return self.clone();
        }
        Self(format!("{}/{}", self.0, DEAD_LETTER_SEGMENT))
    }

    /// Path with any dead-letter suffix removed
    pub fn parent(&self) -> Self {
        match self.0.strip_suffix(&format!("/{}", DEAD_LETTER_SEGMENT)) {
            Some(base) => Self(base.to_string()),
            None => self.clone(),
        }
    }

    /// Check whether this path addresses a dead-letter sub-queue
    pub fn is_dead_letter(&self) -> bool {
        self.0.ends_with(DEAD_LETTER_SEGMENT)
    }

    /// Top-level queue or topic name
    pub fn entity_name(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// Subscription name when this path addresses a subscription
    pub fn subscription_name(&self) -> Option<&str> {
        let mut segments = self.0.split('/');
        segments.next();
        match (segments.next(), segments.next()) {
            (Some(SUBSCRIPTIONS_SEGMENT), Some(name)) => Some(name),
            _ => None,
        }
    }

    /// Get path as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_segment(field: &str, segment: &str) -> Result<(), ValidationError> {
    if segment.is_empty() || segment.len() > 260 {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            message: "each segment must be 1-260 characters".to_string(),
        });
    }

    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: format!(
                "segment '{}' may only contain ASCII alphanumerics, '-', '_' and '.'",
                segment
            ),
        });
    }

    if segment.starts_with('-') || segment.ends_with('-') || segment.contains("--") {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: "no leading/trailing hyphens or consecutive hyphens".to_string(),
        });
    }

    Ok(())
}

impl std::fmt::Display for EntityPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityPath {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for EntityPath {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityPath> for String {
    fn from(path: EntityPath) -> Self {
        path.0
    }
}

/// Caller-assigned identifier, unique per logical message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Fresh UUID v4 identifier
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        if s.len() > 128 {
            return Err(ValidationError::OutOfRange {
                field: "message_id".to_string(),
                message: "maximum 128 characters".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Groups messages that are locked and processed together, in order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Validate a session ID: 1-128 printable ASCII characters
    pub fn new(id: String) -> Result<Self, ValidationError> {
        if id.is_empty() {
            return Err(ValidationError::Required {
                field: "session_id".to_string(),
            });
        }

        if id.len() > 128 {
            return Err(ValidationError::OutOfRange {
                field: "session_id".to_string(),
                message: "maximum 128 characters".to_string(),
            });
        }

        if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            return Err(ValidationError::InvalidFormat {
                field: "session_id".to_string(),
                message: "only ASCII printable characters allowed".to_string(),
            });
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Broker-assigned, monotonically increasing position of a message in its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle for settling a peek-locked delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: String) -> Self {
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// UTC instant used for enqueue times, lock expiry and checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp shifted forward by `duration`, saturating on overflow
    pub fn plus(&self, duration: Duration) -> Self {
        chrono::Duration::from_std(duration)
            .ok()
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map(Self)
            .unwrap_or(Self(DateTime::<Utc>::MAX_UTC))
    }

    /// Time remaining until this timestamp, zero if already passed
    pub fn remaining(&self) -> Duration {
        (self.0 - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Property Values
// ============================================================================

/// Typed value of an application property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(Timestamp),
    Bytes(BinaryValue),
}

/// Binary property payload, base64 in JSON like message bodies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryValue(Bytes);

impl BinaryValue {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for BinaryValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        bytes_serde::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for BinaryValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        bytes_serde::deserialize(deserializer).map(Self)
    }
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b.as_bytes()),
            _ => None,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Timestamp(t) => write!(f, "{}", t),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Timestamp> for PropertyValue {
    fn from(value: Timestamp) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Bytes> for PropertyValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(BinaryValue::new(value))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be sent through the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
    pub properties: HashMap<String, PropertyValue>,
    pub session_id: Option<SessionId>,
    pub correlation_id: Option<String>,
    pub time_to_live: Option<Duration>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub partition_key: Option<String>,
    pub reply_to: Option<String>,
    pub to: Option<String>,
    /// Hidden from receivers until this time
    #[serde(default)]
    pub scheduled_enqueue_time: Option<Timestamp>,
}

/// Message bodies are base64 strings in JSON
pub(crate) mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl Message {
    /// Create new message with body and a fresh message ID
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            message_id: MessageId::new(),
            body: body.into(),
            properties: HashMap::new(),
            session_id: None,
            correlation_id: None,
            time_to_live: None,
            content_type: None,
            subject: None,
            partition_key: None,
            reply_to: None,
            to: None,
            scheduled_enqueue_time: None,
        }
    }

    /// Create a JSON message from a serializable value
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(body).with_content_type("application/json"))
    }

    /// Set caller-assigned message ID
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Add application property
    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    /// Expire the message `ttl` after the broker accepts it
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    /// Set the subject (label) used as the message type discriminator
    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn with_partition_key(mut self, partition_key: &str) -> Self {
        self.partition_key = Some(partition_key.to_string());
        self
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_string());
        self
    }

    pub fn with_to(mut self, to: &str) -> Self {
        self.to = Some(to.to_string());
        self
    }

    /// Deliver no earlier than `at`
    pub fn with_scheduled_enqueue_time(mut self, at: Timestamp) -> Self {
        self.scheduled_enqueue_time = Some(at);
        self
    }

    /// Look up an application property
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Deserialize the body as JSON
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Size of the body in bytes
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
