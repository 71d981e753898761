// src/device/correlator.rs

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::oneshot, time::timeout};
use tracing::{debug, warn};

use crate::{
    broker::{BrokerError, BrokerSession, QoS},
    message::Envelope,
    topic::{Target, TopicError},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error("request `{request_id}` to `{target}` timed out after {timeout_ms} ms")]
    Timeout {
        request_id: String,
        target: String,
        timeout_ms: u64,
    },

    /// The far end answered with an `error` payload.
    #[error("{0}")]
    Remote(String),

    #[error("request `{0}` cancelled: {1}")]
    Cancelled(String, String),

    #[error("device `{0}` is not connected")]
    NotConnected(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

type Completion = oneshot::Sender<Result<Value, RequestError>>;

/// Keeps a request's table entry alive for as long as its caller waits.
/// Dropping it removes the entry, so a caller that gives up (or whose future
/// is dropped) never leaves a stale completion behind.
struct PendingEntry<'a> {
    pending: &'a DashMap<String, Completion>,
    request_id: String,
}

impl<'a> PendingEntry<'a> {
    fn insert(pending: &'a DashMap<String, Completion>, request_id: String, completion: Completion) -> Self {
        pending.insert(request_id.clone(), completion);
        PendingEntry { pending, request_id }
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

/// Per-device table of in-flight requests.
///
/// Removing an entry from the table is what completes it: whichever of reply,
/// timeout or cancellation removes the entry first decides the outcome, and the
/// others find nothing to do.
pub struct RequestCorrelator {
    device_id: String,
    pending: DashMap<String, Completion>,
}

impl RequestCorrelator {
    pub fn new(device_id: impl Into<String>) -> Self {
        RequestCorrelator {
            device_id: device_id.into(),
            pending: DashMap::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Publish a request and forget about it.
    pub async fn publish_fire_and_forget(
        &self,
        session: &dyn BrokerSession,
        address: &str,
        payload: Value,
        qos: QoS,
    ) -> Result<(), RequestError> {
        let target = Target::parse(address)?;
        let envelope = Envelope::request(&self.device_id, payload);
        session
            .publish(&target.request_topic(), envelope.to_bytes(), qos)
            .await?;
        debug!(device = %self.device_id, %target, request_id = %envelope.request_id, "request published");
        Ok(())
    }

    /// Publish a request and wait for the matching reply.
    #[tracing::instrument(skip(self, session, payload), fields(device = %self.device_id))]
    pub async fn publish_and_await_reply(
        &self,
        session: &dyn BrokerSession,
        address: &str,
        payload: Value,
        wait: Duration,
        qos: QoS,
    ) -> Result<Value, RequestError> {
        let target = Target::parse(address)?;
        let envelope = Envelope::request(&self.device_id, payload);
        let request_id = envelope.request_id.clone();
        let started = Instant::now();

        // the entry must exist before the request can possibly be answered
        let (tx, mut rx) = oneshot::channel();
        let _entry = PendingEntry::insert(&self.pending, request_id.clone(), tx);

        session
            .publish(&target.request_topic(), envelope.to_bytes(), qos)
            .await?;

        let result = match timeout(wait, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Cancelled(
                request_id.clone(),
                "correlator dropped".into(),
            )),
            Err(_) => {
                if self.pending.remove(&request_id).is_some() {
                    Err(RequestError::Timeout {
                        request_id: request_id.clone(),
                        target: target.to_string(),
                        timeout_ms: wait.as_millis() as u64,
                    })
                } else {
                    // a reply claimed the entry just as the deadline passed and
                    // is being handed over right now
                    rx.await.unwrap_or_else(|_| {
                        Err(RequestError::Cancelled(request_id.clone(), "correlator dropped".into()))
                    })
                }
            }
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            device = %self.device_id,
            request = %target,
            request_id = %request_id,
            latency_ms = latency_ms,
            status = if result.is_ok() { "ok" } else { "error" },
        );
        result
    }

    /// Complete the pending request a reply belongs to. Returns false when no
    /// one is waiting any more (late or unknown reply), which is not an error.
    pub fn resolve(&self, reply: Envelope) -> bool {
        match self.pending.remove(&reply.request_id) {
            Some((request_id, completion)) => {
                let outcome = match reply.error_message() {
                    Some(message) => Err(RequestError::Remote(message)),
                    None => Ok(reply.payload),
                };
                if completion.send(outcome).is_err() {
                    debug!(device = %self.device_id, %request_id, "requester gone before reply");
                }
                true
            }
            None => {
                debug!(device = %self.device_id, request_id = %reply.request_id, "dropping reply nobody waits for");
                false
            }
        }
    }

    /// Fail every in-flight request. Returns how many were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((id, completion)) = self.pending.remove(&id) {
                let _ = completion.send(Err(RequestError::Cancelled(id, reason.to_string())));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!(device = %self.device_id, cancelled, %reason, "cancelled pending requests");
        } else {
            debug!(device = %self.device_id, "no pending requests to cancel");
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConnector, BrokerOptions, InboundMessage, MemoryBroker};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn session(broker: &MemoryBroker, id: &str) -> (Arc<dyn BrokerSession>, UnboundedReceiver<InboundMessage>) {
        broker.connect(&BrokerOptions::new("mem://", id)).await.unwrap()
    }

    #[tokio::test]
    async fn malformed_address_publishes_nothing() {
        let broker = MemoryBroker::new();
        let (s, _rx) = session(&broker, "B").await;
        let c = RequestCorrelator::new("B");

        for bad in ["A", "A.", ".ping", "A.b.c"] {
            let err = c
                .publish_and_await_reply(s.as_ref(), bad, json!({}), Duration::from_millis(50), QoS::AtMostOnce)
                .await
                .unwrap_err();
            assert!(matches!(err, RequestError::Topic(TopicError::InvalidTopicFormat(_))));
            let err = c
                .publish_fire_and_forget(s.as_ref(), bad, json!({}), QoS::AtMostOnce)
                .await
                .unwrap_err();
            assert!(matches!(err, RequestError::Topic(_)));
        }
        assert!(broker.published().is_empty());
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn fire_and_forget_sends_an_envelope() {
        let broker = MemoryBroker::new();
        let (s, _rx) = session(&broker, "B").await;
        let c = RequestCorrelator::new("B");
        c.publish_fire_and_forget(s.as_ref(), "A.led", json!({"on": true}), QoS::AtLeastOnce)
            .await
            .unwrap();

        let sent = broker.published();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "A/led");
        let env: Envelope = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(env.from, "B");
        assert_eq!(env.payload, json!({"on": true}));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_entry_and_late_reply_is_dropped() {
        let broker = MemoryBroker::new();
        let (s, _rx) = session(&broker, "B").await;
        let c = RequestCorrelator::new("B");

        let err = c
            .publish_and_await_reply(s.as_ref(), "ghost.ping", json!({}), Duration::from_millis(30), QoS::AtMostOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Timeout { .. }));
        assert_eq!(c.pending_count(), 0);

        let sent: Envelope = serde_json::from_slice(&broker.published()[0].payload).unwrap();
        assert!(!c.resolve(Envelope::reply(&sent.request_id, "ghost", json!({"pong": true}))));
    }

    #[tokio::test]
    async fn reply_resolves_waiting_request() {
        let broker = MemoryBroker::new();
        let (s, _rx) = session(&broker, "B").await;
        let c = Arc::new(RequestCorrelator::new("B"));

        let waiter = {
            let c = c.clone();
            let s = s.clone();
            tokio::spawn(async move {
                c.publish_and_await_reply(s.as_ref(), "A.ping", json!({}), Duration::from_secs(2), QoS::AtMostOnce)
                    .await
            })
        };
        while broker.published().is_empty() {
            tokio::task::yield_now().await;
        }
        let sent: Envelope = serde_json::from_slice(&broker.published()[0].payload).unwrap();
        assert!(c.resolve(Envelope::reply(&sent.request_id, "A", json!({"pong": true}))));
        // second delivery of the same reply finds nothing
        assert!(!c.resolve(Envelope::reply(&sent.request_id, "A", json!({"pong": true}))));

        assert_eq!(waiter.await.unwrap().unwrap(), json!({"pong": true}));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_reply_rejects_with_remote_message() {
        let broker = MemoryBroker::new();
        let (s, _rx) = session(&broker, "B").await;
        let c = Arc::new(RequestCorrelator::new("B"));

        let waiter = {
            let c = c.clone();
            tokio::spawn(async move {
                c.publish_and_await_reply(s.as_ref(), "A.x", json!({}), Duration::from_secs(2), QoS::AtMostOnce)
                    .await
            })
        };
        while broker.published().is_empty() {
            tokio::task::yield_now().await;
        }
        let sent: Envelope = serde_json::from_slice(&broker.published()[0].payload).unwrap();
        c.resolve(Envelope::reply(&sent.request_id, "A", json!({"error": "No handler for action: x"})));

        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            RequestError::Remote("No handler for action: x".into())
        );
    }

    #[tokio::test]
    async fn cancel_all_fails_waiters() {
        let broker = MemoryBroker::new();
        let (s, _rx) = session(&broker, "B").await;
        let c = Arc::new(RequestCorrelator::new("B"));

        let waiter = {
            let c = c.clone();
            tokio::spawn(async move {
                c.publish_and_await_reply(s.as_ref(), "A.slow", json!({}), Duration::from_secs(5), QoS::AtMostOnce)
                    .await
            })
        };
        while c.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(c.cancel_all("device stopping"), 1);
        assert!(matches!(waiter.await.unwrap(), Err(RequestError::Cancelled(_, _))));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_wait_leaves_no_entry() {
        let broker = MemoryBroker::new();
        let (s, _rx) = session(&broker, "B").await;
        let c = RequestCorrelator::new("B");

        // the outer deadline drops the request future long before its own
        let outer = tokio::time::timeout(
            Duration::from_millis(30),
            c.publish_and_await_reply(s.as_ref(), "A.slow", json!({}), Duration::from_secs(10), QoS::AtMostOnce),
        )
        .await;
        assert!(outer.is_err());
        assert_eq!(broker.published().len(), 1);
        assert_eq!(c.pending_count(), 0);

        let sent: Envelope = serde_json::from_slice(&broker.published()[0].payload).unwrap();
        assert!(!c.resolve(Envelope::reply(&sent.request_id, "A", json!("late"))));
    }
}
