//! Topic name and topic filter rules.
//!
//! ```text
//! sport/tennis/player1      topic name: no wildcards
//! sport/+/player1           '+' matches exactly one level
//! sport/#                   '#' matches the parent and every level below
//! $SYS/broker/uptime        '$' topics are never matched by a leading wildcard
//! ```

use crate::error::{ProtocolError, ProtocolResult};

/// Longest string an MQTT length prefix can describe.
const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// A topic name used in PUBLISH or a last will.
pub fn valid_topic_name(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && !topic.contains(['+', '#', '\0'])
}

/// A topic filter used in SUBSCRIBE / UNSUBSCRIBE.
pub fn valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > MAX_TOPIC_LEN || filter.contains('\0') {
        return false;
    }
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return false;
        }
        if level.contains('+') && level != "+" {
            return false;
        }
    }
    true
}

pub fn validate_topic_name(topic: &str) -> ProtocolResult<()> {
    if !valid_topic_name(topic) {
        return Err(ProtocolError::InvalidTopicName(topic.to_string()));
    }
    Ok(())
}

pub fn validate_topic_filter(filter: &str) -> ProtocolResult<()> {
    if !valid_topic_filter(filter) {
        return Err(ProtocolError::InvalidTopicFilter(filter.to_string()));
    }
    Ok(())
}

/// Whether `topic` is delivered to a subscription on `filter`.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
