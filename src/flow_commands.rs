// src/flow_commands.rs

use std::{
    collections::HashSet,
    fs,
    path::Path,
    str::FromStr,
};

use anyhow::{Context, Result, bail};
use schemars::schema_for;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::{
    graph::{Flow, FlowEdge, FlowNode, Mode, NodeKind, PersistedFlow},
    handler::{Compiler, ScriptCompiler, SourceKind},
    topic::{Target, TopicFilter},
};

pub fn load_flow(path: &Path) -> Result<Flow> {
    let json = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let persisted: PersistedFlow =
        serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?;
    let duplicates = Flow::duplicate_ids(&persisted);
    if !duplicates.is_empty() {
        bail!("{}: duplicate ids {}", path.display(), duplicates.join(", "));
    }
    Flow::from_persisted(persisted).with_context(|| format!("loading {}", path.display()))
}

pub fn save_flow(path: &Path, flow: &Flow) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = flow.to_json()?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    info!("flow written to {}", path.display());
    Ok(())
}

/// Counts and problems found in a flow that loads but would not run cleanly.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FlowSummary {
    pub devices: usize,
    pub functions: usize,
    pub publishes: usize,
    pub subscribes: usize,
    pub edges: usize,
    pub warnings: Vec<String>,
}

/// Load a flow and check what the graph invariants cannot: device ids,
/// addresses, topic filters and whether transforms compile.
pub fn validate_flow_file(path: &Path, compiler: &dyn Compiler) -> Result<FlowSummary> {
    let flow = load_flow(path)?;
    let mut summary = FlowSummary {
        edges: flow.edge_count(),
        ..Default::default()
    };
    let mut device_ids = HashSet::new();

    for node in flow.nodes() {
        let id = &node.id;
        match &node.kind {
            NodeKind::Device(d) => {
                summary.devices += 1;
                let device_id = d.device_id.trim();
                if device_id.is_empty() {
                    summary.warnings.push(format!("{id}: device has no deviceId and will be skipped"));
                } else if !device_ids.insert(device_id.to_string()) {
                    summary.warnings.push(format!("{id}: deviceId `{device_id}` is used twice"));
                }
            }
            NodeKind::Function(f) => {
                summary.functions += 1;
                if let Err(e) = compiler.compile(&f.code, SourceKind::Function) {
                    summary.warnings.push(format!("{id}: function `{}`: {e}", f.name));
                }
            }
            NodeKind::Publish(p) => {
                summary.publishes += 1;
                if let Err(e) = Target::parse(&p.topic) {
                    summary.warnings.push(format!("{id}: {e}"));
                }
            }
            NodeKind::Subscribe(s) => {
                summary.subscribes += 1;
                if s.topic.trim().is_empty() {
                    summary.warnings.push(format!("{id}: subscribe node has no topic and is ignored"));
                } else if let Err(e) = TopicFilter::new(&s.topic) {
                    summary.warnings.push(format!("{id}: {e}"));
                }
                if let Err(e) = compiler.compile(&s.handler, SourceKind::Subscription) {
                    summary.warnings.push(format!("{id}: subscribe handler: {e}"));
                }
            }
        }
    }

    for edge in flow.edges() {
        let target_is_device = matches!(
            flow.node(&edge.target_id).map(|n| &n.kind),
            Some(NodeKind::Device(_))
        );
        let source_is_function = matches!(
            flow.node(&edge.source_id).map(|n| &n.kind),
            Some(NodeKind::Function(_))
        );
        if source_is_function && !target_is_device {
            summary.warnings.push(format!(
                "{}: function output only becomes an action when wired into a device",
                edge.id
            ));
        }
    }
    Ok(summary)
}

pub fn validate_flow_file_default(path: &Path) -> Result<FlowSummary> {
    validate_flow_file(path, &ScriptCompiler::default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demo {
    /// sensor → processor → controller
    Basic,
    /// two sensors → aggregator → alert system, plus a `sensors/+/data` logger
    Sensor,
}

impl FromStr for Demo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Demo::Basic),
            "sensor" => Ok(Demo::Sensor),
            other => Err(format!("unknown demo `{other}`, expected basic or sensor")),
        }
    }
}

const PROCESSOR: &str = r#"fn process(input) {
    let data = input;
    if type_of(data) == "map" && "payload" in data {
        data = data.payload;
    }
    #{
        temperature: data.temperature * 1.8 + 32.0,
        humidity: data.humidity,
        status: if data.temperature > 25 { "HOT" } else { "NORMAL" }
    }
}"#;

const AGGREGATOR: &str = r#"fn process(input) {
    let alert = "NORMAL";
    if type_of(input) == "map" && "value" in input && input.value > 30 {
        alert = "HIGH_VALUE_ALERT";
    }
    #{
        sensorData: input,
        aggregatedBy: "dataAggregator",
        alert: alert
    }
}"#;

const SENSOR_LOGGER: &str = r#"print(`sensor data on ${message.topic}: ${message.payload}`);"#;

pub fn demo_flow(demo: Demo) -> Result<Flow> {
    let mut flow = Flow::new();
    match demo {
        Demo::Basic => {
            flow.add_node(FlowNode::device("n1", "sensor01").at(100.0, 150.0))?;
            flow.add_node(FlowNode::function("n2", "dataProcessor", PROCESSOR).at(350.0, 150.0))?;
            flow.add_node(FlowNode::device("n3", "controller01").at(600.0, 150.0))?;
            flow.add_node(
                FlowNode::publish(
                    "n4",
                    "controller01.control",
                    json!("{\"temperature\": 30, \"humidity\": 60, \"sentBy\": \"{{device}}\"}"),
                    Mode::Sync,
                )
                .at(100.0, 300.0),
            )?;
            flow.add_edge(FlowEdge::new("n5", "n1", "n2", "process"))?;
            flow.add_edge(FlowEdge::new("n6", "n2", "n3", "control"))?;
        }
        Demo::Sensor => {
            flow.add_node(FlowNode::device("n1", "tempSensor").at(80.0, 100.0))?;
            flow.add_node(FlowNode::device("n2", "humiditySensor").at(80.0, 250.0))?;
            flow.add_node(FlowNode::function("n3", "dataAggregator", AGGREGATOR).at(350.0, 175.0))?;
            flow.add_node(FlowNode::subscribe("n4", "sensors/+/data", SENSOR_LOGGER).at(600.0, 100.0))?;
            flow.add_node(FlowNode::device("n5", "alertSystem").at(600.0, 250.0))?;
            flow.add_edge(FlowEdge::new("n6", "n1", "n3", "aggregate"))?;
            flow.add_edge(FlowEdge::new("n7", "n2", "n3", "aggregate"))?;
            flow.add_edge(FlowEdge::new("n8", "n3", "n5", "alert"))?;
        }
    }
    Ok(flow)
}

pub fn write_demo(demo: Demo, out: &Path) -> Result<()> {
    save_flow(out, &demo_flow(demo)?)
}

/// JSON-Schema of the persisted flow document.
pub fn write_schema(out: &Path) -> Result<()> {
    let schema = schema_for!(PersistedFlow);
    let json = serde_json::to_string_pretty(&schema)?;
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(out, json).with_context(|| format!("writing {}", out.display()))?;
    info!("schema written to {}", out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Transform;
    use tempfile::tempdir;

    #[test]
    fn demos_round_trip_through_files() {
        let dir = tempdir().unwrap();
        for demo in [Demo::Basic, Demo::Sensor] {
            let path = dir.path().join("flows").join(format!("{demo:?}.json"));
            write_demo(demo, &path).unwrap();
            let loaded = load_flow(&path).unwrap();
            assert_eq!(loaded, demo_flow(demo).unwrap());

            let summary = validate_flow_file_default(&path).unwrap();
            assert!(summary.warnings.is_empty(), "{:?}", summary.warnings);
        }
    }

    #[test]
    fn demo_transforms_behave() {
        let compiler = ScriptCompiler::default();
        let processor = compiler.compile(PROCESSOR, SourceKind::Function).unwrap();
        let out = processor
            .invoke(json!({"payload": {"temperature": 30, "humidity": 60}}))
            .unwrap();
        assert_eq!(out["status"], "HOT");
        assert_eq!(out["humidity"], 60);

        let aggregator = compiler.compile(AGGREGATOR, SourceKind::Function).unwrap();
        assert_eq!(aggregator.invoke(json!({"value": 31})).unwrap()["alert"], "HIGH_VALUE_ALERT");
        assert_eq!(aggregator.invoke(json!(5)).unwrap()["alert"], "NORMAL");
    }

    #[test]
    fn validation_reports_runtime_problems() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let mut flow = Flow::new();
        flow.add_node(FlowNode::device("n1", "")).unwrap();
        flow.add_node(FlowNode::function("n2", "broken", "fn nope(x) { x }")).unwrap();
        flow.add_node(FlowNode::publish("n3", "nodot", json!({}), Mode::Async)).unwrap();
        flow.add_node(FlowNode::subscribe("n4", "a/#/b", "message")).unwrap();
        save_flow(&path, &flow).unwrap();

        let summary = validate_flow_file_default(&path).unwrap();
        assert_eq!(summary.devices, 1);
        assert_eq!(summary.warnings.len(), 4, "{:?}", summary.warnings);
    }

    #[test]
    fn duplicate_ids_fail_loading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dup.json");
        fs::write(
            &path,
            r#"{"nodes": [{"id": "n1", "type": "device", "data": {}}, {"id": "n1", "type": "device", "data": {}}], "edges": []}"#,
        )
        .unwrap();
        let err = load_flow(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn schema_is_written() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("schemas").join("flow.schema.json");
        write_schema(&out).unwrap();
        let schema: serde_json::Value = serde_json::from_str(&fs::read_to_string(out).unwrap()).unwrap();
        assert!(schema.get("properties").is_some());
    }

    #[test]
    fn demo_names_parse() {
        assert_eq!("sensor".parse::<Demo>(), Ok(Demo::Sensor));
        assert!("other".parse::<Demo>().is_err());
    }
}
