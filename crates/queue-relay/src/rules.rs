//! Topic subscription rules.
//!
//! Rules are configuration handed to the broker through
//! [`RuleManager`](crate::broker::RuleManager). A subscription receives a
//! message when any of its rules match. Rules are evaluated by the broker;
//! the only local evaluation is [`CorrelationFilter::matches`], which is plain
//! field equality.

use crate::error::ValidationError;
use crate::message::{Message, PropertyValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name of the rule every new subscription starts with
pub const DEFAULT_RULE_NAME: &str = "$Default";

const MAX_RULE_NAME_LENGTH: usize = 50;

/// A named filter with an optional action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDescription {
    pub name: String,
    pub filter: Filter,
    pub action: Option<RuleAction>,
}

impl RuleDescription {
    /// Create a rule after validating its name
    pub fn new(name: &str, filter: Filter) -> Result<Self, ValidationError> {
        validate_rule_name(name)?;
        Ok(Self {
            name: name.to_string(),
            filter,
            action: None,
        })
    }

    /// The match-everything rule a subscription is created with
    pub fn default_rule() -> Self {
        Self {
            name: DEFAULT_RULE_NAME.to_string(),
            filter: Filter::True,
            action: None,
        }
    }

    pub fn with_action(mut self, action: RuleAction) -> Self {
        self.action = Some(action);
        self
    }
}

fn validate_rule_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "rule_name".to_string(),
        });
    }

    if name.len() > MAX_RULE_NAME_LENGTH {
        return Err(ValidationError::OutOfRange {
            field: "rule_name".to_string(),
            message: format!("maximum {} characters", MAX_RULE_NAME_LENGTH),
        });
    }

    if name.contains('/') || name.contains('\\') || name.contains('?') || name.contains('#') {
        return Err(ValidationError::InvalidFormat {
            field: "rule_name".to_string(),
            message: "'/', '\\', '?' and '#' are not allowed".to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// Filters
// ============================================================================

/// Predicate deciding whether a message is copied into a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    Sql(SqlFilter),
    Correlation(CorrelationFilter),
    True,
    False,
}

impl Filter {
    /// SQL-like boolean expression over system and user properties
    pub fn sql(expression: &str) -> Self {
        Self::Sql(SqlFilter {
            expression: expression.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlFilter {
    pub expression: String,
}

/// Equality match on system fields and user properties.
///
/// Every field that is set must match; unset fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationFilter {
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub subject: Option<String>,
    pub session_id: Option<String>,
    pub content_type: Option<String>,
    pub properties: HashMap<String, PropertyValue>,
}

impl CorrelationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn with_to(mut self, to: &str) -> Self {
        self.to = Some(to.to_string());
        self
    }

    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// Check whether `message` carries every value this filter specifies
    pub fn matches(&self, message: &Message) -> bool {
        fn field_matches(expected: &Option<String>, actual: Option<&str>) -> bool {
            match expected {
                Some(expected) => actual == Some(expected.as_str()),
                None => true,
            }
        }

        field_matches(&self.correlation_id, message.correlation_id.as_deref())
            && field_matches(&self.message_id, Some(message.message_id.as_str()))
            && field_matches(&self.to, message.to.as_deref())
            && field_matches(&self.reply_to, message.reply_to.as_deref())
            && field_matches(&self.subject, message.subject.as_deref())
            && field_matches(
                &self.session_id,
                message.session_id.as_ref().map(|s| s.as_str()),
            )
            && field_matches(&self.content_type, message.content_type.as_deref())
            && self
                .properties
                .iter()
                .all(|(key, value)| message.properties.get(key) == Some(value))
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Property mutation applied to the copy delivered through a matching rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    Sql(SqlRuleAction),
}

impl RuleAction {
    /// `SET name = value` / `REMOVE name` statements separated by `;`
    pub fn sql(expression: &str) -> Self {
        Self::Sql(SqlRuleAction {
            expression: expression.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlRuleAction {
    pub expression: String,
}

#[cfg(test)]
#[path = "rules_tests.rs"]
mod tests;
