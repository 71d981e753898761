use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use iotflow::{
    DeviceConnection, RequestError,
    broker::{BrokerConnector, BrokerOptions, MemoryBroker, QoS},
    device::handler_fn,
    handler::HandlerError,
    message::Envelope,
};
use serde_json::{Value, json};

async fn device(broker: &MemoryBroker, id: &str) -> DeviceConnection {
    let device = DeviceConnection::new(BrokerOptions::new("mem://", id), Arc::new(broker.clone()));
    device.connect().await.unwrap();
    device
}

#[tokio::test]
async fn concurrent_requests_get_their_own_replies() {
    let broker = MemoryBroker::new();
    let echo = device(&broker, "echo").await;
    echo.register(
        "slow",
        handler_fn(|req: Envelope| async move {
            let ms = req.payload["delay"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(req.payload)
        }),
    )
    .unwrap();
    let caller = device(&broker, "caller").await;

    let first = caller.request("echo.slow", json!({"delay": 200, "n": 1}), None, QoS::AtMostOnce);
    let second = caller.request("echo.slow", json!({"delay": 10, "n": 2}), None, QoS::AtMostOnce);
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap()["n"], 1);
    assert_eq!(second.unwrap()["n"], 2);
    assert_eq!(caller.pending_count(), 0);

    caller.disconnect().await.unwrap();
    echo.disconnect().await.unwrap();
}

#[tokio::test]
async fn late_reply_after_timeout_is_dropped() {
    let broker = MemoryBroker::new();
    let caller = device(&broker, "caller").await;
    let (ghost, _rx) = broker.connect(&BrokerOptions::new("mem://", "ghost")).await.unwrap();

    let err = caller
        .request("ghost.ping", json!({}), Some(Duration::from_millis(100)), QoS::AtMostOnce)
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Timeout { ref target, timeout_ms: 100, .. } if target == "ghost.ping"));
    assert_eq!(caller.pending_count(), 0);

    let sent = broker
        .published()
        .into_iter()
        .find(|m| m.topic == "ghost/ping")
        .unwrap();
    let request: Envelope = serde_json::from_slice(&sent.payload).unwrap();
    assert_eq!(request.from, "caller");
    let reply = Envelope::reply(&request.request_id, "ghost", json!("pong"));
    ghost
        .publish(
            &format!("caller/reply/{}", request.request_id),
            reply.to_bytes(),
            QoS::AtMostOnce,
        )
        .await
        .unwrap();

    // still usable afterwards
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(caller.is_connected());
    assert_eq!(caller.pending_count(), 0);
    caller.disconnect().await.unwrap();
}

#[tokio::test]
async fn malformed_address_publishes_nothing() {
    let broker = MemoryBroker::new();
    let caller = device(&broker, "caller").await;
    for address in ["nodot", "a.b.c", ".x", "x."] {
        let err = caller
            .request(address, json!(1), Some(Duration::from_millis(50)), QoS::AtMostOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Topic(_)), "{address}: {err}");
        assert!(caller.publish(address, json!(1), QoS::AtMostOnce).await.is_err());
    }
    assert!(broker.published().is_empty());
    caller.disconnect().await.unwrap();
}

#[tokio::test]
async fn handler_failure_and_missing_action_reach_the_requester() {
    let broker = MemoryBroker::new();
    let target = device(&broker, "target").await;
    target
        .register(
            "explode",
            handler_fn(|_req: Envelope| async move {
                Err::<Value, _>(HandlerError::Invocation("sensor offline".into()))
            }),
        )
        .unwrap();
    let caller = device(&broker, "caller").await;

    let err = caller
        .request("target.explode", json!({}), None, QoS::AtMostOnce)
        .await
        .unwrap_err();
    assert_eq!(err, RequestError::Remote("sensor offline".into()));

    let err = caller
        .request("target.nothing", json!({}), None, QoS::AtMostOnce)
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Remote(ref m) if m.contains("nothing")));

    caller.disconnect().await.unwrap();
    target.disconnect().await.unwrap();
}

#[tokio::test]
async fn raw_request_bodies_are_still_answered() {
    let broker = MemoryBroker::new();
    let target = device(&broker, "target").await;
    target
        .register("echo", handler_fn(|req: Envelope| async move { Ok(req.payload) }))
        .unwrap();
    let (raw, _rx) = broker.connect(&BrokerOptions::new("mem://", "raw")).await.unwrap();

    raw.publish("target/echo", b"21".to_vec(), QoS::AtMostOnce).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reply = broker
        .published()
        .into_iter()
        .find(|m| m.topic.starts_with("unknown/reply/"))
        .unwrap();
    let envelope: Envelope = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(envelope.from, "target");
    assert_eq!(envelope.payload, json!(21));
    target.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn handlers_start_in_delivery_order() {
    let broker = MemoryBroker::new();
    let target = device(&broker, "target").await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    target
        .register(
            "record",
            handler_fn(move |req: Envelope| {
                if let Some(n) = req.payload["n"].as_u64() {
                    record.lock().unwrap().push(n);
                }
                async move { Ok(Value::Null) }
            }),
        )
        .unwrap();
    let (raw, _rx) = broker.connect(&BrokerOptions::new("mem://", "raw")).await.unwrap();

    for n in 0..20u64 {
        let request = Envelope::request("raw", json!({ "n": n }));
        raw.publish("target/record", request.to_bytes(), QoS::AtMostOnce)
            .await
            .unwrap();
    }
    tokio::time::timeout(Duration::from_secs(2), async {
        while seen.lock().unwrap().len() < 20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<u64>>());
    target.disconnect().await.unwrap();
}

#[tokio::test]
async fn aborted_caller_frees_its_pending_entry() {
    let broker = MemoryBroker::new();
    let caller = device(&broker, "caller").await;
    let waiting = {
        let caller = caller.clone();
        tokio::spawn(async move {
            caller
                .request("nobody.home", json!({}), Some(Duration::from_secs(10)), QoS::AtMostOnce)
                .await
        })
    };
    while caller.pending_count() == 0 {
        tokio::task::yield_now().await;
    }

    waiting.abort();
    assert!(waiting.await.unwrap_err().is_cancelled());
    assert_eq!(caller.pending_count(), 0);
    caller.disconnect().await.unwrap();
}
