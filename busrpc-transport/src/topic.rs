//! Topic formatting.

use crate::error::TransportError;
use busrpc_protocol::DEFAULT_TOPIC_PREFIX;

/// Maps logical topics onto broker subjects by prefixing them.
///
/// The prefix is always prepended, so distinct topics map to distinct
/// subjects. Callers pass logical topics, never formatted subjects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFormatter {
    prefix: String,
}

impl TopicFormatter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the broker subject for a logical topic.
    pub fn format(&self, topic: &str) -> Result<String, TransportError> {
        if topic.is_empty() {
            return Err(TransportError::InvalidTopic);
        }
        Ok(format!("{}{}", self.prefix, topic))
    }
}

impl Default for TopicFormatter {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_PREFIX)
    }
}
