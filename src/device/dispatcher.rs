// src/device/dispatcher.rs

use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    handler::HandlerError,
    message::{Envelope, error_payload},
    topic::reply_topic,
};

/// Answers requests for one action on one device.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, request: Envelope) -> Result<Value, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Envelope) -> Result<Value, HandlerError> {
        (self.0)(request).await
    }
}

/// Wrap an async closure as an [`ActionHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("invalid registration for action `{action}`: {reason}")]
    InvalidRegistration { action: String, reason: String },
}

/// Per-device table of action handlers.
///
/// Registration is a single map insert, so it is atomic with respect to the
/// lookups done for inbound requests. The last registration for an action wins.
#[derive(Default)]
pub struct ActionDispatcher {
    handlers: DashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handler this registration replaced, if any.
    pub fn register(
        &self,
        action: &str,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<Option<Arc<dyn ActionHandler>>, RegistrationError> {
        let invalid = |reason: &str| RegistrationError::InvalidRegistration {
            action: action.to_string(),
            reason: reason.to_string(),
        };
        if action.is_empty() {
            return Err(invalid("action must be a non-empty string"));
        }
        // an action is one topic level and the part after the dot of an address
        if action.contains(['/', '+', '#', '.']) {
            return Err(invalid("action may not contain '/', '+', '#' or '.'"));
        }
        let previous = self.handlers.insert(action.to_string(), handler);
        if previous.is_some() {
            debug!(%action, "handler replaced");
        }
        Ok(previous)
    }

    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        actions.sort();
        actions
    }

    /// Decode an inbound request and resolve its handler now, so handlers are
    /// picked in delivery order even though they complete independently.
    pub fn begin(&self, action: &str, body: &[u8]) -> Dispatch {
        Dispatch {
            action: action.to_string(),
            request: Envelope::from_request_body(body),
            handler: self.handlers.get(action).map(|h| h.value().clone()),
        }
    }
}

/// One inbound request bound to the handler that will answer it.
pub struct Dispatch {
    action: String,
    request: Envelope,
    handler: Option<Arc<dyn ActionHandler>>,
}

/// The single reply produced for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub topic: String,
    pub envelope: Envelope,
}

impl Dispatch {
    pub fn request(&self) -> &Envelope {
        &self.request
    }

    /// Run the handler and build the reply. Never fails: every outcome,
    /// including a panicking handler, becomes a reply payload.
    pub async fn run(self, device_id: &str) -> Reply {
        let Dispatch {
            action,
            request,
            handler,
        } = self;
        let request_id = request.request_id.clone();
        let requester = request.from.clone();

        let payload = match handler {
            None => error_payload(format!("No handler for action: {}", action)),
            Some(handler) => match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
                Ok(Ok(value)) => value,
                Ok(Err(err)) => {
                    debug!(%action, error = %err, "handler failed");
                    error_payload(err.to_string())
                }
                Err(_) => {
                    warn!(%action, "handler panicked");
                    error_payload(format!("handler for action `{}` panicked", action))
                }
            },
        };

        Reply {
            topic: reply_topic(&requester, &request_id),
            envelope: Envelope::reply(&request_id, device_id, payload),
        }
    }
}
