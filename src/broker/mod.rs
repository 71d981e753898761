// src/broker/mod.rs

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

pub mod memory;
pub mod mqtt;

pub use memory::MemoryBroker;
pub use mqtt::MqttConnector;

/// Delivery guarantee requested for a single publish or subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid qos level {other}, expected 0, 1 or 2")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl schemars::JsonSchema for QoS {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "QoS".into()
    }

    fn json_schema(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
        schemars::json_schema!({
            "type": "integer",
            "enum": [0, 1, 2]
        })
    }
}

/// Largest packet a session sends or accepts unless configured otherwise.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Session parameters for one device.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    pub url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub max_packet_size: usize,
}

impl BrokerOptions {
    pub fn new(url: impl Into<String>, client_id: impl Into<String>) -> Self {
        BrokerOptions {
            url: url.into(),
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username.filter(|u| !u.is_empty());
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn with_keep_alive(mut self, secs: u64) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_max_packet_size(mut self, bytes: usize) -> Self {
        self.max_packet_size = bytes;
        self
    }
}

impl fmt::Debug for BrokerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerOptions")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

/// One message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("invalid broker url `{0}`: {1}")]
    InvalidUrl(String, String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscribe to `{0}` failed: {1}")]
    Subscribe(String, String),

    #[error("publish to `{0}` failed: {1}")]
    Publish(String, String),

    #[error("disconnect failed: {0}")]
    Disconnect(String),

    #[error("session is not connected")]
    NotConnected,
}

/// A live transport session. Exclusively owned by one device.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), BrokerError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), BrokerError>;
    async fn disconnect(&self) -> Result<(), BrokerError>;
}

/// Opens broker sessions; the pluggable transport capability.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Completes once the handshake is acknowledged. Every message matching a
    /// later subscription is pushed into the returned receiver.
    async fn connect(
        &self,
        options: &BrokerOptions,
    ) -> Result<(Arc<dyn BrokerSession>, UnboundedReceiver<InboundMessage>), BrokerError>;
}
