// src/topic.rs

use std::fmt;

use regex::Regex;
use thiserror::Error;

/// Segment that marks reply frames in `{deviceId}/reply/{requestId}`.
pub const REPLY_SEGMENT: &str = "reply";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// The address did not split into exactly `targetDeviceId.action`.
    #[error("invalid topic format `{0}`, use \"targetDeviceId.action\"")]
    InvalidTopicFormat(String),

    /// A subscription filter that cannot be compiled into a matcher.
    #[error("invalid topic filter `{0}`: {1}")]
    InvalidFilter(String, String),
}

/// A parsed `targetDeviceId.action` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub device_id: String,
    pub action: String,
}

impl Target {
    pub fn parse(address: &str) -> Result<Self, TopicError> {
        let mut parts = address.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(device), Some(action), None) if !device.is_empty() && !action.is_empty() => {
                Ok(Target {
                    device_id: device.to_string(),
                    action: action.to_string(),
                })
            }
            _ => Err(TopicError::InvalidTopicFormat(address.to_string())),
        }
    }

    /// Wire topic the request is published on.
    pub fn request_topic(&self) -> String {
        request_topic(&self.device_id, &self.action)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device_id, self.action)
    }
}

pub fn request_topic(device_id: &str, action: &str) -> String {
    format!("{}/{}", device_id, action)
}

pub fn reply_topic(device_id: &str, request_id: &str) -> String {
    format!("{}/{}/{}", device_id, REPLY_SEGMENT, request_id)
}

/// The two subscriptions every device holds while connected.
pub fn device_filters(device_id: &str) -> [String; 2] {
    [
        format!("{}/+", device_id),
        format!("{}/{}/+", device_id, REPLY_SEGMENT),
    ]
}

/// Shape of an inbound topic as seen by one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic<'a> {
    Request { action: &'a str },
    Reply { request_id: &'a str },
    /// Not addressed to this device, or not one of the two known shapes.
    Foreign,
}

pub fn classify<'a>(device_id: &str, topic: &'a str) -> InboundTopic<'a> {
    let parts: Vec<&'a str> = topic.split('/').collect();
    if parts.first().copied() != Some(device_id) {
        return InboundTopic::Foreign;
    }
    match parts[..] {
        [_, REPLY_SEGMENT, request_id] if !request_id.is_empty() => InboundTopic::Reply { request_id },
        [_, action] if !action.is_empty() => InboundTopic::Request { action },
        _ => InboundTopic::Foreign,
    }
}

/// MQTT-style subscription filter with `+` (one level) and `#` (any remaining levels).
#[derive(Debug, Clone)]
pub struct TopicFilter {
    filter: String,
    matcher: Regex,
}

impl TopicFilter {
    pub fn new(filter: &str) -> Result<Self, TopicError> {
        if filter.is_empty() {
            return Err(TopicError::InvalidFilter(filter.into(), "empty filter".into()));
        }
        let levels: Vec<&str> = filter.split('/').collect();
        let last = levels.len() - 1;
        let mut pattern = String::from("^");
        for (i, level) in levels.iter().enumerate() {
            match *level {
                "#" if i == last => {
                    if i == 0 {
                        pattern.push_str(".*");
                    } else {
                        // `a/#` also matches the parent level `a`
                        pattern.push_str("(?:/.*)?");
                    }
                    break;
                }
                "#" => {
                    return Err(TopicError::InvalidFilter(
                        filter.into(),
                        "`#` must be the last level".into(),
                    ));
                }
                _ => {
                    if i > 0 {
                        pattern.push('/');
                    }
                    if *level == "+" {
                        pattern.push_str("[^/]*");
                    } else if level.contains('+') || level.contains('#') {
                        return Err(TopicError::InvalidFilter(
                            filter.into(),
                            "wildcards must occupy a whole level".into(),
                        ));
                    } else {
                        pattern.push_str(&regex::escape(level));
                    }
                }
            }
        }
        pattern.push('$');
        let matcher = Regex::new(&pattern)
            .map_err(|e| TopicError::InvalidFilter(filter.into(), e.to_string()))?;
        Ok(TopicFilter {
            filter: filter.to_string(),
            matcher,
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.matcher.is_match(topic)
    }

    pub fn as_str(&self) -> &str {
        &self.filter
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filter)
    }
}
