//! Correlated request/reply between IoT devices over a publish/subscribe
//! broker, and an orchestrator that turns a device/function/publish/subscribe
//! graph into live handler wiring.

pub mod broker;
pub mod config;
pub mod device;
pub mod flow_commands;
pub mod graph;
pub mod handler;
pub mod logger;
pub mod message;
pub mod observer;
pub mod orchestrator;
pub mod topic;
pub mod watcher;

pub use device::{DeviceConnection, DeviceError, DeviceState, RequestError};
pub use graph::{Flow, FlowEdge, FlowNode, GraphError, NodeKind};
pub use orchestrator::{FlowOrchestrator, OrchestratorError, RunReport};
