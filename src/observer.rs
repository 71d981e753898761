// src/observer.rs

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

/// State changes reported while a flow runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    RunStarted { devices: usize },
    RunStopped { devices: usize },
    DeviceConnected { node_id: String, device_id: String },
    DeviceFailed { node_id: String, device_id: String, reason: String },
    DeviceSkipped { node_id: String, reason: String },
    DeviceDisconnected { device_id: String },
    DisconnectFailed { device_id: String, reason: String },
    HandlerRegistered { device_id: String, action: String, function: String },
    FunctionInvoked { device_id: String, action: String, function: String },
    FunctionFailed { device_id: String, action: String, function: String, reason: String },
    Subscribed { node_id: String, device_id: String, filter: String },
    SubscribeFailed { node_id: String, filter: String, reason: String },
    SubscriptionHandled { node_id: String, topic: String },
    SubscriptionHandlerFailed { node_id: String, topic: String, reason: String },
    PublishFired { node_id: String, target: String, reply: Option<Value> },
}

impl FlowEvent {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            FlowEvent::DeviceFailed { .. }
                | FlowEvent::DisconnectFailed { .. }
                | FlowEvent::FunctionFailed { .. }
                | FlowEvent::SubscribeFailed { .. }
                | FlowEvent::SubscriptionHandlerFailed { .. }
        )
    }
}

pub trait FlowObserver: Send + Sync {
    fn notify(&self, event: &FlowEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl FlowObserver for TracingObserver {
    fn notify(&self, event: &FlowEvent) {
        match event {
            FlowEvent::RunStarted { devices } => info!(devices, "flow started"),
            FlowEvent::RunStopped { devices } => info!(devices, "flow stopped"),
            FlowEvent::DeviceConnected { node_id, device_id } => {
                info!(%node_id, %device_id, "device connected")
            }
            FlowEvent::DeviceFailed { node_id, device_id, reason } => {
                error!(%node_id, %device_id, %reason, "device failed to connect")
            }
            FlowEvent::DeviceSkipped { node_id, reason } => warn!(%node_id, %reason, "device node skipped"),
            FlowEvent::DeviceDisconnected { device_id } => info!(%device_id, "device disconnected"),
            FlowEvent::DisconnectFailed { device_id, reason } => {
                error!(%device_id, %reason, "device failed to disconnect")
            }
            FlowEvent::HandlerRegistered { device_id, action, function } => {
                info!(%device_id, %action, %function, "handler registered")
            }
            FlowEvent::FunctionInvoked { device_id, action, function } => {
                debug!(%device_id, %action, %function, "function finished")
            }
            FlowEvent::FunctionFailed { device_id, action, function, reason } => {
                error!(%device_id, %action, %function, %reason, "function failed")
            }
            FlowEvent::Subscribed { node_id, device_id, filter } => {
                info!(%node_id, %device_id, %filter, "subscribed")
            }
            FlowEvent::SubscribeFailed { node_id, filter, reason } => {
                error!(%node_id, %filter, %reason, "subscribe failed")
            }
            FlowEvent::SubscriptionHandled { node_id, topic } => debug!(%node_id, %topic, "subscription handled"),
            FlowEvent::SubscriptionHandlerFailed { node_id, topic, reason } => {
                error!(%node_id, %topic, %reason, "subscription handler failed")
            }
            FlowEvent::PublishFired { node_id, target, reply } => match reply {
                Some(reply) => info!(%node_id, %target, %reply, "publish answered"),
                None => info!(%node_id, %target, "publish sent"),
            },
        }
    }
}

/// Forwards events into a channel, e.g. for a UI or a test.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: UnboundedSender<FlowEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, UnboundedReceiver<FlowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelObserver { tx }, rx)
    }
}

impl FlowObserver for ChannelObserver {
    fn notify(&self, event: &FlowEvent) {
        // nobody listening any more
        let _ = self.tx.send(event.clone());
    }
}

/// Sends each event to every inner observer in turn.
#[derive(Default)]
pub struct Fanout(pub Vec<std::sync::Arc<dyn FlowObserver>>);

impl FlowObserver for Fanout {
    fn notify(&self, event: &FlowEvent) {
        for observer in &self.0 {
            observer.notify(event);
        }
    }
}
