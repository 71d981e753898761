// src/broker/memory.rs

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{BrokerConnector, BrokerError, BrokerOptions, BrokerSession, InboundMessage, QoS};
use crate::topic::TopicFilter;

struct SessionEntry {
    token: String,
    tx: UnboundedSender<InboundMessage>,
    filters: Vec<TopicFilter>,
}

#[derive(Default)]
struct Hub {
    sessions: DashMap<String, SessionEntry>,
    refused_users: Mutex<HashSet<String>>,
    history: Mutex<Vec<InboundMessage>>,
}

/// In-process broker routing every publish to each session with a matching
/// subscription. Delivery is immediate and in publish order per session.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    hub: Arc<Hub>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject future handshakes that present `username`.
    pub fn refuse_username(&self, username: &str) {
        if let Ok(mut refused) = self.hub.refused_users.lock() {
            refused.insert(username.to_string());
        }
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<InboundMessage> {
        self.hub
            .history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.hub.sessions.contains_key(client_id)
    }

    pub fn session_count(&self) -> usize {
        self.hub.sessions.len()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(
        &self,
        options: &BrokerOptions,
    ) -> Result<(Arc<dyn BrokerSession>, UnboundedReceiver<InboundMessage>), BrokerError> {
        if options.client_id.is_empty() {
            return Err(BrokerError::Connect("client id must not be empty".into()));
        }
        if let Some(user) = &options.username {
            let refused = self
                .hub
                .refused_users
                .lock()
                .map(|r| r.contains(user))
                .unwrap_or(false);
            if refused {
                return Err(BrokerError::Connect(format!("not authorized: {}", user)));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let token = Uuid::new_v4().to_string();
        match self.hub.sessions.entry(options.client_id.clone()) {
            Entry::Occupied(_) => {
                return Err(BrokerError::Connect(format!(
                    "client id `{}` already has a live session",
                    options.client_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(SessionEntry {
                    token: token.clone(),
                    tx,
                    filters: Vec::new(),
                });
            }
        }
        debug!(client_id = %options.client_id, "memory broker session opened");

        let session = MemorySession {
            client_id: options.client_id.clone(),
            token,
            hub: self.hub.clone(),
            open: AtomicBool::new(true),
        };
        Ok((Arc::new(session), rx))
    }
}

struct MemorySession {
    client_id: String,
    token: String,
    hub: Arc<Hub>,
    open: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let compiled = TopicFilter::new(filter)
            .map_err(|e| BrokerError::Subscribe(filter.to_string(), e.to_string()))?;
        match self.hub.sessions.get_mut(&self.client_id) {
            Some(mut entry) if entry.token == self.token => {
                if !entry.filters.iter().any(|f| f.as_str() == filter) {
                    entry.filters.push(compiled);
                }
                Ok(())
            }
            _ => Err(BrokerError::NotConnected),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let message = InboundMessage {
            topic: topic.to_string(),
            payload,
        };
        if let Ok(mut history) = self.hub.history.lock() {
            history.push(message.clone());
        }

        let targets: Vec<UnboundedSender<InboundMessage>> = self
            .hub
            .sessions
            .iter()
            .filter(|entry| entry.filters.iter().any(|f| f.matches(topic)))
            .map(|entry| entry.tx.clone())
            .collect();
        trace!(%topic, receivers = targets.len(), "memory broker publish");
        for tx in targets {
            // a closed receiver means that session is going away
            let _ = tx.send(message.clone());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.hub
                .sessions
                .remove_if(&self.client_id, |_, entry| entry.token == self.token);
            debug!(client_id = %self.client_id, "memory broker session closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_subscription() {
        let broker = MemoryBroker::new();
        let (a, mut a_rx) = broker.connect(&BrokerOptions::new("mem://", "a")).await.unwrap();
        let (b, mut b_rx) = broker.connect(&BrokerOptions::new("mem://", "b")).await.unwrap();
        a.subscribe("a/+", QoS::AtMostOnce).await.unwrap();
        b.subscribe("sensors/#", QoS::AtMostOnce).await.unwrap();

        b.publish("a/ping", b"hi".to_vec(), QoS::AtMostOnce).await.unwrap();
        a.publish("sensors/t/data", b"20".to_vec(), QoS::AtMostOnce).await.unwrap();

        let got = a_rx.recv().await.unwrap();
        assert_eq!(got.topic, "a/ping");
        assert_eq!(got.payload, b"hi");
        let got = b_rx.recv().await.unwrap();
        assert_eq!(got.topic, "sensors/t/data");
        assert!(a_rx.try_recv().is_err());
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_client_id_is_rejected_until_disconnect() {
        let broker = MemoryBroker::new();
        let opts = BrokerOptions::new("mem://", "dup");
        let (first, _rx) = broker.connect(&opts).await.unwrap();
        assert!(matches!(broker.connect(&opts).await, Err(BrokerError::Connect(_))));

        first.disconnect().await.unwrap();
        assert!(!broker.is_connected("dup"));
        assert!(broker.connect(&opts).await.is_ok());
    }

    #[tokio::test]
    async fn refused_credentials_fail_the_handshake() {
        let broker = MemoryBroker::new();
        broker.refuse_username("mallory");
        let opts = BrokerOptions::new("mem://", "m").with_credentials(Some("mallory".into()), None);
        assert!(matches!(broker.connect(&opts).await, Err(BrokerError::Connect(_))));
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn closed_session_cannot_publish() {
        let broker = MemoryBroker::new();
        let (s, _rx) = broker.connect(&BrokerOptions::new("mem://", "x")).await.unwrap();
        s.disconnect().await.unwrap();
        s.disconnect().await.unwrap();
        assert_eq!(
            s.publish("t", vec![], QoS::AtMostOnce).await,
            Err(BrokerError::NotConnected)
        );
    }
}
