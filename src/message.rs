use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Placeholder id/sender used when a request arrives without an envelope.
pub const UNKNOWN: &str = "unknown";

/// Wire wrapper carried by every request and reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub request_id: String,
    pub from: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// A fresh request from `from`, with a newly generated request id.
    pub fn request(from: &str, payload: Value) -> Self {
        Envelope {
            request_id: Uuid::new_v4().to_string(),
            from: from.to_string(),
            payload,
        }
    }

    pub fn reply(request_id: &str, from: &str, payload: Value) -> Self {
        Envelope {
            request_id: request_id.to_string(),
            from: from.to_string(),
            payload,
        }
    }

    /// Decode an inbound request body.
    ///
    /// Anything that is not an object carrying non-empty string `requestId` and
    /// `from` fields is wrapped whole as the payload of an envelope addressed
    /// from `unknown`, so the responder still has something to reply to.
    pub fn from_request_body(body: &[u8]) -> Self {
        let value: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => Value::String(String::from_utf8_lossy(body).into_owned()),
        };
        let has_header = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty())
        };
        if has_header("requestId") && has_header("from") {
            if let Ok(env) = serde_json::from_value::<Envelope>(value.clone()) {
                return env;
            }
        }
        Envelope {
            request_id: UNKNOWN.to_string(),
            from: UNKNOWN.to_string(),
            payload: value,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // an Envelope only holds strings and a Value, which always serialize
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// The `error` string of an error reply, if this payload is one.
    pub fn error_message(&self) -> Option<String> {
        match self.payload.get("error") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Reply payload reporting a failure to the requester.
pub fn error_payload(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}
