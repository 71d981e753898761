use std::{sync::Arc, time::Duration};

use iotflow::{
    DeviceConnection, Flow, FlowEdge, FlowNode, FlowOrchestrator, OrchestratorError, RequestError,
    broker::{BrokerConnector, BrokerOptions, MemoryBroker, QoS},
    config::RuntimeConfig,
    flow_commands::{load_flow, save_flow},
    graph::{DeviceConfig, Mode, NodeKind},
    handler::ScriptCompiler,
    observer::{ChannelObserver, FlowEvent},
};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

fn orchestrator(broker: &MemoryBroker) -> (FlowOrchestrator, UnboundedReceiver<FlowEvent>) {
    let config = RuntimeConfig {
        broker_url: "mem://".into(),
        request_timeout: Duration::from_secs(2),
        ..RuntimeConfig::default()
    };
    let (observer, events) = ChannelObserver::new();
    let orch = FlowOrchestrator::new(
        Arc::new(broker.clone()),
        Arc::new(ScriptCompiler::default()),
        config,
    )
    .with_observer(Arc::new(observer));
    (orch, events)
}

fn doubling_flow() -> Flow {
    let mut flow = Flow::new();
    flow.add_node(FlowNode::function("n1", "double", "fn process(x) { x * 2 }"))
        .unwrap();
    flow.add_node(FlowNode::device("n2", "calculator")).unwrap();
    flow.add_edge(FlowEdge::new("n3", "n1", "n2", "calc")).unwrap();
    flow
}

async fn caller(broker: &MemoryBroker) -> DeviceConnection {
    let device = DeviceConnection::new(BrokerOptions::new("mem://", "caller"), Arc::new(broker.clone()));
    device.connect().await.unwrap();
    device
}

async fn wait_for<F>(events: &mut UnboundedReceiver<FlowEvent>, mut pred: F) -> FlowEvent
where
    F: FnMut(&FlowEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn function_edge_becomes_a_callable_action() {
    let broker = MemoryBroker::new();
    let (orch, _events) = orchestrator(&broker);
    let report = orch.start(doubling_flow()).await.unwrap();
    assert_eq!(report.connected, vec!["calculator".to_string()]);
    assert_eq!(report.actions.len(), 1);
    assert_eq!(report.actions[0].action, "calc");

    let caller = caller(&broker).await;
    let reply = caller
        .request("calculator.calc", json!(21), None, QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(reply, json!(42));

    let err = caller
        .request("calculator.other", json!(21), None, QoS::AtMostOnce)
        .await
        .unwrap_err();
    assert_eq!(err, RequestError::Remote("No handler for action: other".into()));

    caller.disconnect().await.unwrap();
    assert_eq!(orch.stop().await, 1);
    assert!(!broker.is_connected("calculator"));
}

#[tokio::test]
async fn starting_twice_is_rejected_and_stop_is_idempotent() {
    let broker = MemoryBroker::new();
    let (orch, _events) = orchestrator(&broker);
    orch.start(doubling_flow()).await.unwrap();
    assert_eq!(
        orch.start(doubling_flow()).await.unwrap_err(),
        OrchestratorError::AlreadyRunning
    );
    assert!(orch.is_running().await);

    assert_eq!(orch.stop().await, 1);
    assert_eq!(orch.stop().await, 0);
    assert!(!orch.is_running().await);

    // a stopped orchestrator can run again
    orch.start(doubling_flow()).await.unwrap();
    assert!(orch.device("calculator").await.is_some());
    orch.stop().await;
}

#[tokio::test]
async fn failed_device_does_not_stop_the_others() {
    let broker = MemoryBroker::new();
    broker.refuse_username("intruder");
    let (orch, mut events) = orchestrator(&broker);

    let mut flow = doubling_flow();
    let refused = DeviceConfig {
        device_id: "locked".into(),
        username: "intruder".into(),
        ..Default::default()
    };
    flow.add_node(FlowNode::new("n4", NodeKind::Device(refused))).unwrap();

    let report = orch.start(flow).await.unwrap();
    assert_eq!(report.connected, vec!["calculator".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].node_id, "n4");

    let failed = wait_for(&mut events, |e| matches!(e, FlowEvent::DeviceFailed { .. })).await;
    assert!(failed.is_failure());

    let caller = caller(&broker).await;
    let reply = caller
        .request("calculator.calc", json!(5), None, QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(reply, json!(10));
    caller.disconnect().await.unwrap();
    orch.stop().await;
}

#[tokio::test]
async fn subscribe_node_sees_wildcard_topics() {
    let broker = MemoryBroker::new();
    let (orch, mut events) = orchestrator(&broker);
    let mut flow = Flow::new();
    flow.add_node(FlowNode::device("n1", "hub")).unwrap();
    flow.add_node(FlowNode::subscribe("n2", "sensors/+/data", "message.payload.value"))
        .unwrap();
    let report = orch.start(flow).await.unwrap();
    assert_eq!(report.subscriptions.len(), 1);
    assert_eq!(report.subscriptions[0].device_id, "hub");

    // `sensors/t1/data` is not a `device.action` address, so publish it raw
    let (raw, _rx) = broker.connect(&BrokerOptions::new("mem://", "t1")).await.unwrap();
    raw
        .publish("sensors/t1/data", br#"{"value": 23}"#.to_vec(), QoS::AtMostOnce)
        .await
        .unwrap();

    let handled = wait_for(&mut events, |e| matches!(e, FlowEvent::SubscriptionHandled { .. })).await;
    assert_eq!(
        handled,
        FlowEvent::SubscriptionHandled {
            node_id: "n2".into(),
            topic: "sensors/t1/data".into(),
        }
    );

    raw.disconnect().await.unwrap();
    orch.stop().await;
}

#[tokio::test]
async fn throwing_subscribe_handler_is_reported() {
    let broker = MemoryBroker::new();
    let (orch, mut events) = orchestrator(&broker);
    let mut flow = Flow::new();
    flow.add_node(FlowNode::device("n1", "hub")).unwrap();
    flow.add_node(FlowNode::subscribe(
        "n2",
        "alarms/#",
        r#"if message.payload.level > 3 { throw "level too high"; }"#,
    ))
    .unwrap();
    orch.start(flow).await.unwrap();

    let (raw, _rx) = broker.connect(&BrokerOptions::new("mem://", "siren")).await.unwrap();
    raw.publish("alarms/kitchen", br#"{"level": 5}"#.to_vec(), QoS::AtMostOnce)
        .await
        .unwrap();

    let failed = wait_for(&mut events, |e| {
        matches!(e, FlowEvent::SubscriptionHandlerFailed { .. } | FlowEvent::SubscriptionHandled { .. })
    })
    .await;
    assert_eq!(
        failed,
        FlowEvent::SubscriptionHandlerFailed {
            node_id: "n2".into(),
            topic: "alarms/kitchen".into(),
            reason: "level too high".into(),
        }
    );
    assert!(failed.is_failure());

    // the subscription keeps working after a failure
    raw.publish("alarms/hall", br#"{"level": 1}"#.to_vec(), QoS::AtMostOnce)
        .await
        .unwrap();
    let handled = wait_for(&mut events, |e| matches!(e, FlowEvent::SubscriptionHandled { .. })).await;
    assert!(matches!(handled, FlowEvent::SubscriptionHandled { ref topic, .. } if topic == "alarms/hall"));

    raw.disconnect().await.unwrap();
    orch.stop().await;
}

#[tokio::test]
async fn publish_node_fires_from_the_first_device() {
    let broker = MemoryBroker::new();
    let (orch, mut events) = orchestrator(&broker);
    let mut flow = doubling_flow();
    flow.add_node(FlowNode::publish("n4", "calculator.calc", json!(8), Mode::Sync))
        .unwrap();
    flow.add_node(FlowNode::publish(
        "n5",
        "calculator.log",
        json!("{\"from\": \"{{device}}\"}"),
        Mode::Async,
    ))
    .unwrap();
    orch.start(flow).await.unwrap();

    assert_eq!(orch.fire_publish("n4").await.unwrap(), Some(json!(16)));
    assert_eq!(orch.fire_publish("n5").await.unwrap(), None);

    let fired = wait_for(&mut events, |e| {
        matches!(e, FlowEvent::PublishFired { node_id, .. } if node_id == "n5")
    })
    .await;
    assert!(matches!(fired, FlowEvent::PublishFired { reply: None, .. }));
    let sent = broker
        .published()
        .into_iter()
        .find(|m| m.topic == "calculator/log")
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&sent.payload).unwrap();
    assert_eq!(body["payload"], json!({"from": "calculator"}));
    assert_eq!(body["from"], "calculator");
    orch.stop().await;
}

#[tokio::test]
async fn stop_fails_requests_still_in_flight() {
    let broker = MemoryBroker::new();
    let (orch, _events) = orchestrator(&broker);
    let mut flow = Flow::new();
    flow.add_node(FlowNode::device("n1", "asker")).unwrap();
    orch.start(flow).await.unwrap();

    let asker = orch.device("asker").await.unwrap();
    let waiting = tokio::spawn(async move {
        asker
            .request("nobody.home", json!({}), Some(Duration::from_secs(10)), QoS::AtMostOnce)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    orch.stop().await;

    let err = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RequestError::Cancelled(_, ref reason) if reason == "flow stopped"));
}

#[test]
fn persisted_flow_keeps_editor_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.json");
    let mut flow = doubling_flow();
    flow.add_node(FlowNode::subscribe("n4", "sensors/#", "message").at(10.0, 20.0))
        .unwrap();
    save_flow(&path, &flow).unwrap();

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(raw["timestamp"].is_string());
    let edge = &raw["edges"][0];
    assert_eq!(edge["sourceId"], "n1");
    assert_eq!(edge["targetId"], "n2");
    assert_eq!(edge["action"], "calc");

    let loaded = load_flow(&path).unwrap();
    assert_eq!(loaded, flow);
    assert_eq!(loaded.node("n4").unwrap().x, 10.0);
}
