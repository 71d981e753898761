// src/graph.rs

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use petgraph::{
    Direction::Incoming,
    stable_graph::{EdgeIndex, NodeIndex, StableDiGraph},
    visit::EdgeRef,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::broker::QoS;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("edge `{edge}` has an invalid endpoint: {reason}")]
    InvalidEndpoint { edge: String, reason: String },

    #[error("node id `{0}` is already used")]
    DuplicateNode(String),

    #[error("edge id `{0}` is already used")]
    DuplicateEdge(String),

    #[error("no node with id `{0}`")]
    UnknownNode(String),

    #[error("no edge with id `{0}`")]
    UnknownEdge(String),

    #[error("flow JSON error: {0}")]
    Serialization(String),
}

/// Whether a send waits for the reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Sync,
    #[default]
    Async,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Topic namespace and broker client id.
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub broker_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Kept for the editor, unused at run time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublishConfig {
    /// `device.action` address.
    #[serde(default, alias = "target")]
    pub topic: String,
    /// JSON text (as the editor stores it) or an inline JSON value. Strings
    /// are rendered as handlebars templates before sending.
    #[serde(default = "PublishConfig::default_payload")]
    pub payload: Value,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub mode: Mode,
}

impl PublishConfig {
    fn default_payload() -> Value {
        Value::String("{}".into())
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        PublishConfig {
            topic: String::new(),
            payload: Self::default_payload(),
            qos: QoS::default(),
            mode: Mode::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeConfig {
    /// Topic filter, `+` and `#` wildcards allowed.
    #[serde(default, alias = "topicFilter")]
    pub topic: String,
    #[serde(default, alias = "handlerSource")]
    pub handler: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionConfig {
    #[serde(default)]
    pub name: String,
    /// Must define `fn process(input)`.
    #[serde(default, alias = "sourceCode")]
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum NodeKind {
    Device(DeviceConfig),
    Publish(PublishConfig),
    Subscribe(SubscribeConfig),
    Function(FunctionConfig),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Device(_) => "device",
            NodeKind::Publish(_) => "publish",
            NodeKind::Subscribe(_) => "subscribe",
            NodeKind::Function(_) => "function",
        }
    }

    /// Publish nodes have no input port.
    pub fn accepts_input(&self) -> bool {
        !matches!(self, NodeKind::Publish(_))
    }

    /// Subscribe nodes have no output port.
    pub fn has_output(&self) -> bool {
        !matches!(self, NodeKind::Subscribe(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowNode {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Editor position, unused at run time.
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        FlowNode {
            id: id.into(),
            kind,
            x: 0.0,
            y: 0.0,
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    pub fn device(id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Device(DeviceConfig {
                device_id: device_id.into(),
                ..Default::default()
            }),
        )
    }

    pub fn function(id: impl Into<String>, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Function(FunctionConfig {
                name: name.into(),
                code: code.into(),
            }),
        )
    }

    pub fn subscribe(id: impl Into<String>, topic: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Subscribe(SubscribeConfig {
                topic: topic.into(),
                handler: handler.into(),
            }),
        )
    }

    pub fn publish(id: impl Into<String>, topic: impl Into<String>, payload: Value, mode: Mode) -> Self {
        Self::new(
            id,
            NodeKind::Publish(PublishConfig {
                topic: topic.into(),
                payload,
                qos: QoS::default(),
                mode,
            }),
        )
    }
}

fn default_action() -> String {
    "trigger".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default)]
    pub mode: Mode,
}

impl FlowEdge {
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        FlowEdge {
            id: id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            action: action.into(),
            mode: Mode::Async,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}

/// The JSON document exchanged with the flow editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PersistedFlow {
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Validated node/edge graph.
///
/// Every edge references two existing nodes, never targets a Publish node and
/// never leaves a Subscribe node. Node and edge ids are unique. Iteration
/// follows insertion order.
#[derive(Debug, Clone, Default)]
pub struct Flow {
    graph: StableDiGraph<FlowNode, FlowEdge>,
    index_of: HashMap<String, NodeIndex>,
    edge_of: HashMap<String, EdgeIndex>,
    node_order: Vec<String>,
    edge_order: Vec<String>,
}

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: FlowNode) -> Result<(), GraphError> {
        if self.index_of.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }
        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.index_of.insert(id.clone(), idx);
        self.node_order.push(id);
        Ok(())
    }

    /// Removes the node and every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> Result<FlowNode, GraphError> {
        let idx = self
            .index_of
            .remove(id)
            .ok_or_else(|| GraphError::UnknownNode(id.to_string()))?;
        let touching: Vec<String> = self
            .graph
            .edges_directed(idx, Incoming)
            .chain(self.graph.edges_directed(idx, petgraph::Direction::Outgoing))
            .map(|e| e.weight().id.clone())
            .collect();
        for edge in touching {
            self.edge_of.remove(&edge);
            self.edge_order.retain(|e| e != &edge);
        }
        self.node_order.retain(|n| n != id);
        // StableGraph drops the node's edges with it
        self.graph
            .remove_node(idx)
            .ok_or_else(|| GraphError::UnknownNode(id.to_string()))
    }

    pub fn add_edge(&mut self, edge: FlowEdge) -> Result<(), GraphError> {
        if self.edge_of.contains_key(&edge.id) {
            return Err(GraphError::DuplicateEdge(edge.id));
        }
        let invalid = |reason: String| GraphError::InvalidEndpoint {
            edge: edge.id.clone(),
            reason,
        };
        let source = *self
            .index_of
            .get(&edge.source_id)
            .ok_or_else(|| invalid(format!("unknown source node `{}`", edge.source_id)))?;
        let target = *self
            .index_of
            .get(&edge.target_id)
            .ok_or_else(|| invalid(format!("unknown target node `{}`", edge.target_id)))?;
        if source == target {
            return Err(invalid("an edge cannot connect a node to itself".into()));
        }
        if !self.graph[source].kind.has_output() {
            return Err(invalid(format!(
                "source `{}` is a {} node without an output port",
                edge.source_id,
                self.graph[source].kind.name()
            )));
        }
        if !self.graph[target].kind.accepts_input() {
            return Err(invalid(format!(
                "target `{}` is a {} node without an input port",
                edge.target_id,
                self.graph[target].kind.name()
            )));
        }

        let id = edge.id.clone();
        let idx = self.graph.add_edge(source, target, edge);
        self.edge_of.insert(id.clone(), idx);
        self.edge_order.push(id);
        Ok(())
    }

    pub fn remove_edge(&mut self, id: &str) -> Result<FlowEdge, GraphError> {
        let idx = self
            .edge_of
            .remove(id)
            .ok_or_else(|| GraphError::UnknownEdge(id.to_string()))?;
        self.edge_order.retain(|e| e != id);
        self.graph
            .remove_edge(idx)
            .ok_or_else(|| GraphError::UnknownEdge(id.to_string()))
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.index_of.get(id).map(|&idx| &self.graph[idx])
    }

    pub fn edge(&self, id: &str) -> Option<&FlowEdge> {
        self.edge_of.get(id).map(|&idx| &self.graph[idx])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.node_order.iter().filter_map(|id| self.node(id))
    }

    pub fn edges(&self) -> impl Iterator<Item = &FlowEdge> {
        self.edge_order.iter().filter_map(|id| self.edge(id))
    }

    pub fn node_count(&self) -> usize {
        self.index_of.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_of.len()
    }

    /// Edges ending at `id`, each with its source node, in insertion order.
    pub fn inbound_edges(&self, id: &str) -> Vec<(&FlowEdge, &FlowNode)> {
        let Some(&idx) = self.index_of.get(id) else {
            return Vec::new();
        };
        let mut inbound: Vec<(&FlowEdge, &FlowNode)> = self
            .graph
            .edges_directed(idx, Incoming)
            .map(|e| (e.weight(), &self.graph[e.source()]))
            .collect();
        let position = |edge: &FlowEdge| self.edge_order.iter().position(|e| e == &edge.id);
        inbound.sort_by_key(|(edge, _)| position(edge));
        inbound
    }

    /// Next free `n{N}` id, counting node and edge ids alike.
    pub fn next_id(&self) -> String {
        let highest = self
            .index_of
            .keys()
            .chain(self.edge_of.keys())
            .filter_map(|id| id.strip_prefix('n')?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        format!("n{}", highest + 1)
    }

    pub fn from_persisted(persisted: PersistedFlow) -> Result<Self, GraphError> {
        let mut flow = Flow::new();
        for node in persisted.nodes {
            flow.add_node(node)?;
        }
        for edge in persisted.edges {
            flow.add_edge(edge)?;
        }
        Ok(flow)
    }

    pub fn to_persisted(&self) -> PersistedFlow {
        PersistedFlow {
            nodes: self.nodes().cloned().collect(),
            edges: self.edges().cloned().collect(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let persisted: PersistedFlow =
            serde_json::from_str(json).map_err(|e| GraphError::Serialization(e.to_string()))?;
        Self::from_persisted(persisted)
    }

    pub fn to_json(&self) -> Result<String, GraphError> {
        serde_json::to_string_pretty(&self.to_persisted())
            .map_err(|e| GraphError::Serialization(e.to_string()))
    }
}

/// Two flows are equal when they hold the same nodes and edges, whatever the
/// insertion order.
impl PartialEq for Flow {
    fn eq(&self, other: &Self) -> bool {
        if self.node_count() != other.node_count() || self.edge_count() != other.edge_count() {
            return false;
        }
        let same_nodes = self.nodes().all(|n| other.node(&n.id) == Some(n));
        let same_edges = self.edges().all(|e| other.edge(&e.id) == Some(e));
        same_nodes && same_edges
    }
}

impl Flow {
    /// Ids of nodes that appear more than once in a raw document, for
    /// diagnostics before [`Flow::from_persisted`] rejects them.
    pub fn duplicate_ids(persisted: &PersistedFlow) -> Vec<String> {
        let mut seen = HashSet::new();
        persisted
            .nodes
            .iter()
            .map(|n| &n.id)
            .chain(persisted.edges.iter().map(|e| &e.id))
            .filter(|id| !seen.insert(id.as_str()))
            .cloned()
            .collect()
    }
}
