// src/orchestrator.rs

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    broker::{BrokerConnector, BrokerOptions, InboundMessage, QoS},
    config::RuntimeConfig,
    device::{ActionHandler, DeviceConnection, InboundHandler, RequestError},
    graph::{DeviceConfig, Flow, FunctionConfig, GraphError, Mode, NodeKind},
    handler::{Compiler, HandlerError, SourceKind, Transform, invoke_blocking},
    message::Envelope,
    observer::{FlowEvent, FlowObserver, TracingObserver},
    topic::TopicFilter,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("a flow is already running")]
    AlreadyRunning,

    #[error("no flow is running")]
    NotRunning,

    #[error("no node with id `{0}`")]
    UnknownNode(String),

    #[error("node `{0}` is not a publish node")]
    NotPublish(String),

    #[error("no device is connected")]
    NoConnectedDevice,

    #[error("payload template of node `{0}` failed: {1}")]
    Template(String, String),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeIssue {
    pub node_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredAction {
    pub device_id: String,
    pub action: String,
    pub function: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSubscription {
    pub node_id: String,
    pub device_id: String,
    pub filter: String,
}

/// What a start actually managed to wire up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub connected: Vec<String>,
    pub failed: Vec<NodeIssue>,
    pub skipped: Vec<NodeIssue>,
    pub actions: Vec<RegisteredAction>,
    pub subscriptions: Vec<ActiveSubscription>,
    pub subscribe_failures: Vec<NodeIssue>,
}

/// The devices owned by one run of a flow.
pub struct RunSession {
    flow: Flow,
    started_at: DateTime<Utc>,
    /// Connected devices in flow node order.
    devices: Vec<DeviceConnection>,
    by_id: HashMap<String, DeviceConnection>,
}

impl RunSession {
    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceConnection> {
        self.by_id.get(device_id).cloned()
    }

    pub fn devices(&self) -> &[DeviceConnection] {
        &self.devices
    }

    fn first_connected(&self) -> Option<&DeviceConnection> {
        self.devices.iter().find(|d| d.is_connected())
    }
}

enum RunState {
    Idle,
    Running(Arc<RunSession>),
}

/// Compiles a [`Flow`] into connected devices, registered handlers and
/// subscriptions, and tears them down again.
pub struct FlowOrchestrator {
    connector: Arc<dyn BrokerConnector>,
    compiler: Arc<dyn Compiler>,
    observer: Arc<dyn FlowObserver>,
    config: RuntimeConfig,
    state: Mutex<RunState>,
}

impl FlowOrchestrator {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        compiler: Arc<dyn Compiler>,
        config: RuntimeConfig,
    ) -> Self {
        FlowOrchestrator {
            connector,
            compiler,
            observer: Arc::new(TracingObserver),
            config,
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn FlowObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, RunState::Running(_))
    }

    pub async fn session(&self) -> Option<Arc<RunSession>> {
        match &*self.state.lock().await {
            RunState::Running(session) => Some(session.clone()),
            RunState::Idle => None,
        }
    }

    /// A connected device of the running flow.
    pub async fn device(&self, device_id: &str) -> Option<DeviceConnection> {
        self.session().await?.device(device_id)
    }

    fn notify(&self, event: FlowEvent) {
        self.observer.notify(&event);
    }

    fn broker_options(&self, device: &DeviceConfig) -> BrokerOptions {
        let pick = |own: &str, fallback: &Option<String>| {
            if own.is_empty() {
                fallback.clone()
            } else {
                Some(own.to_string())
            }
        };
        let url = if device.broker_url.trim().is_empty() {
            self.config.broker_url.clone()
        } else {
            device.broker_url.trim().to_string()
        };
        BrokerOptions::new(url, device.device_id.trim())
            .with_credentials(
                pick(&device.username, &self.config.username),
                pick(&device.password, &self.config.password),
            )
            .with_keep_alive(self.config.keep_alive_secs)
            .with_max_packet_size(self.config.max_packet_size)
    }

    /// Connect every device node, register function-backed actions and wire
    /// subscribe nodes. Per-device failures are reported, not returned.
    #[tracing::instrument(skip_all, fields(nodes = flow.node_count(), edges = flow.edge_count()))]
    pub async fn start(&self, flow: Flow) -> Result<RunReport, OrchestratorError> {
        let mut state = self.state.lock().await;
        if matches!(*state, RunState::Running(_)) {
            return Err(OrchestratorError::AlreadyRunning);
        }

        let mut report = RunReport::default();
        let mut devices: Vec<(String, DeviceConnection)> = Vec::new();
        let mut claimed: HashSet<String> = HashSet::new();

        for node in flow.nodes() {
            let NodeKind::Device(cfg) = &node.kind else {
                continue;
            };
            let device_id = cfg.device_id.trim();
            let skip_reason = if device_id.is_empty() {
                Some("device node has no deviceId")
            } else if claimed.contains(device_id) {
                Some("deviceId already used by another device node")
            } else {
                None
            };
            if let Some(reason) = skip_reason {
                self.notify(FlowEvent::DeviceSkipped {
                    node_id: node.id.clone(),
                    reason: reason.into(),
                });
                report.skipped.push(NodeIssue {
                    node_id: node.id.clone(),
                    reason: reason.into(),
                });
                continue;
            }
            claimed.insert(device_id.to_string());

            let device = DeviceConnection::with_default_timeout(
                self.broker_options(cfg),
                self.connector.clone(),
                self.config.request_timeout,
            );
            match device.connect().await {
                Ok(()) => {
                    self.notify(FlowEvent::DeviceConnected {
                        node_id: node.id.clone(),
                        device_id: device_id.to_string(),
                    });
                    report.connected.push(device_id.to_string());
                    devices.push((node.id.clone(), device));
                }
                Err(e) => {
                    self.notify(FlowEvent::DeviceFailed {
                        node_id: node.id.clone(),
                        device_id: device_id.to_string(),
                        reason: e.to_string(),
                    });
                    report.failed.push(NodeIssue {
                        node_id: node.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        for (node_id, device) in &devices {
            for (edge, source) in flow.inbound_edges(node_id) {
                let NodeKind::Function(function) = &source.kind else {
                    continue;
                };
                let handler = FunctionHandler::new(
                    self.compiler.as_ref(),
                    function,
                    device.device_id(),
                    &edge.action,
                    self.observer.clone(),
                );
                match device.register(&edge.action, Arc::new(handler)) {
                    Ok(()) => {
                        self.notify(FlowEvent::HandlerRegistered {
                            device_id: device.device_id().to_string(),
                            action: edge.action.clone(),
                            function: function.name.clone(),
                        });
                        report.actions.push(RegisteredAction {
                            device_id: device.device_id().to_string(),
                            action: edge.action.clone(),
                            function: function.name.clone(),
                        });
                    }
                    Err(e) => self.notify(FlowEvent::FunctionFailed {
                        device_id: device.device_id().to_string(),
                        action: edge.action.clone(),
                        function: function.name.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
        }

        // subscriptions are not bound to a device by the graph; use the first one
        let host = devices.first().map(|(_, d)| d.clone());
        for node in flow.nodes() {
            let NodeKind::Subscribe(cfg) = &node.kind else {
                continue;
            };
            if cfg.topic.trim().is_empty() {
                continue;
            }
            match self.wire_subscription(&node.id, &cfg.topic, &cfg.handler, host.as_ref()).await {
                Ok(device_id) => report.subscriptions.push(ActiveSubscription {
                    node_id: node.id.clone(),
                    device_id,
                    filter: cfg.topic.clone(),
                }),
                Err(reason) => {
                    self.notify(FlowEvent::SubscribeFailed {
                        node_id: node.id.clone(),
                        filter: cfg.topic.clone(),
                        reason: reason.clone(),
                    });
                    report.subscribe_failures.push(NodeIssue {
                        node_id: node.id.clone(),
                        reason,
                    });
                }
            }
        }

        let devices: Vec<DeviceConnection> = devices.into_iter().map(|(_, d)| d).collect();
        let by_id = devices
            .iter()
            .map(|d| (d.device_id().to_string(), d.clone()))
            .collect();
        self.notify(FlowEvent::RunStarted {
            devices: devices.len(),
        });
        *state = RunState::Running(Arc::new(RunSession {
            flow,
            started_at: Utc::now(),
            devices,
            by_id,
        }));
        Ok(report)
    }

    async fn wire_subscription(
        &self,
        node_id: &str,
        filter: &str,
        source: &str,
        host: Option<&DeviceConnection>,
    ) -> Result<String, String> {
        let device = host.ok_or_else(|| "no connected device to subscribe with".to_string())?;
        let matcher = TopicFilter::new(filter).map_err(|e| e.to_string())?;
        let transform = self
            .compiler
            .compile(source, SourceKind::Subscription)
            .map_err(|e| e.to_string())?;
        device
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| e.to_string())?;
        device.add_observer(Arc::new(SubscriptionHandler {
            node_id: node_id.to_string(),
            filter: matcher,
            transform,
            observer: self.observer.clone(),
        }));
        self.notify(FlowEvent::Subscribed {
            node_id: node_id.to_string(),
            device_id: device.device_id().to_string(),
            filter: filter.to_string(),
        });
        Ok(device.device_id().to_string())
    }

    /// Fail every in-flight request, then disconnect every device of the run.
    /// Returns how many devices were stopped; zero when nothing was running.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> usize {
        let mut state = self.state.lock().await;
        let session = match std::mem::replace(&mut *state, RunState::Idle) {
            RunState::Running(session) => session,
            RunState::Idle => {
                debug!("stop requested with no running flow");
                return 0;
            }
        };

        for device in session.devices() {
            device.cancel_pending("flow stopped");
        }
        for device in session.devices() {
            match device.disconnect().await {
                Ok(()) => self.notify(FlowEvent::DeviceDisconnected {
                    device_id: device.device_id().to_string(),
                }),
                Err(e) => self.notify(FlowEvent::DisconnectFailed {
                    device_id: device.device_id().to_string(),
                    reason: e.to_string(),
                }),
            }
        }
        let stopped = session.devices().len();
        self.notify(FlowEvent::RunStopped { devices: stopped });
        stopped
    }

    /// Send the payload of a publish node from the first connected device.
    /// Returns the reply for `sync` nodes and `None` for `async` ones.
    #[tracing::instrument(skip(self))]
    pub async fn fire_publish(&self, node_id: &str) -> Result<Option<Value>, OrchestratorError> {
        let session = self.session().await.ok_or(OrchestratorError::NotRunning)?;
        let node = session
            .flow()
            .node(node_id)
            .ok_or_else(|| OrchestratorError::UnknownNode(node_id.to_string()))?;
        let NodeKind::Publish(publish) = &node.kind else {
            return Err(OrchestratorError::NotPublish(node_id.to_string()));
        };
        let device = session
            .first_connected()
            .ok_or(OrchestratorError::NoConnectedDevice)?;

        let payload = render_payload(node_id, device.device_id(), &publish.payload)?;
        let reply = match publish.mode {
            Mode::Sync => Some(
                device
                    .request(&publish.topic, payload, None, publish.qos)
                    .await?,
            ),
            Mode::Async => {
                device.publish(&publish.topic, payload, publish.qos).await?;
                None
            }
        };
        self.notify(FlowEvent::PublishFired {
            node_id: node_id.to_string(),
            target: publish.topic.clone(),
            reply: reply.clone(),
        });
        Ok(reply)
    }
}

/// Render a publish payload. Strings are handlebars templates whose output is
/// parsed as JSON when possible; other values are sent unchanged.
fn render_payload(node_id: &str, device_id: &str, payload: &Value) -> Result<Value, OrchestratorError> {
    let Value::String(template) = payload else {
        return Ok(payload.clone());
    };
    let mut hbs = Handlebars::new();
    hbs.register_escape_fn(handlebars::no_escape);
    let data = json!({
        "now": Utc::now().to_rfc3339(),
        "node": node_id,
        "device": device_id,
    });
    let rendered = hbs
        .render_template(template, &data)
        .map_err(|e| OrchestratorError::Template(node_id.to_string(), e.to_string()))?;
    Ok(serde_json::from_str(&rendered).unwrap_or(Value::String(rendered)))
}

/// Answers an action with a function node's transform applied to the request
/// payload.
struct FunctionHandler {
    function: String,
    device_id: String,
    action: String,
    compiled: Result<Arc<dyn Transform>, HandlerError>,
    observer: Arc<dyn FlowObserver>,
}

impl FunctionHandler {
    fn new(
        compiler: &dyn Compiler,
        function: &FunctionConfig,
        device_id: &str,
        action: &str,
        observer: Arc<dyn FlowObserver>,
    ) -> Self {
        let compiled = compiler.compile(&function.code, SourceKind::Function);
        if let Err(e) = &compiled {
            warn!(function = %function.name, %action, error = %e, "function does not compile; requests will get an error reply");
        }
        FunctionHandler {
            function: function.name.clone(),
            device_id: device_id.to_string(),
            action: action.to_string(),
            compiled,
            observer,
        }
    }
}

#[async_trait]
impl ActionHandler for FunctionHandler {
    async fn handle(&self, request: Envelope) -> Result<Value, HandlerError> {
        let result = match &self.compiled {
            Ok(transform) => invoke_blocking(transform.clone(), request.payload).await,
            Err(e) => Err(e.clone()),
        };
        let event = match &result {
            Ok(_) => FlowEvent::FunctionInvoked {
                device_id: self.device_id.clone(),
                action: self.action.clone(),
                function: self.function.clone(),
            },
            Err(e) => FlowEvent::FunctionFailed {
                device_id: self.device_id.clone(),
                action: self.action.clone(),
                function: self.function.clone(),
                reason: e.to_string(),
            },
        };
        self.observer.notify(&event);
        result
    }
}

/// Passes `{topic, payload}` of every matching message to a subscribe node's
/// handler. Failures are reported to the observer only.
struct SubscriptionHandler {
    node_id: String,
    filter: TopicFilter,
    transform: Arc<dyn Transform>,
    observer: Arc<dyn FlowObserver>,
}

#[async_trait]
impl InboundHandler for SubscriptionHandler {
    async fn handle_inbound(&self, _device_id: &str, message: &InboundMessage) {
        if !self.filter.matches(&message.topic) {
            return;
        }
        let payload = serde_json::from_slice::<Value>(&message.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&message.payload).into_owned()));
        let input = json!({ "topic": message.topic, "payload": payload });

        let transform = self.transform.clone();
        let observer = self.observer.clone();
        let node_id = self.node_id.clone();
        let topic = message.topic.clone();
        // run off the device's inbound task so slow handlers do not stall it
        tokio::spawn(async move {
            let event = match invoke_blocking(transform, input).await {
                Ok(_) => FlowEvent::SubscriptionHandled { node_id, topic },
                Err(e) => FlowEvent::SubscriptionHandlerFailed {
                    node_id,
                    topic,
                    reason: e.to_string(),
                },
            };
            observer.notify(&event);
        });
    }
}
