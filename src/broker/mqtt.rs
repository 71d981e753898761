// src/broker/mqtt.rs

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode, Transport,
};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
    time::{Instant, sleep, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{BrokerConnector, BrokerError, BrokerOptions, BrokerSession, InboundMessage, QoS};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_PERIOD: Duration = Duration::from_secs(1);
const SEND_RETRY: Duration = Duration::from_millis(20);
const REQUEST_CAPACITY: usize = 64;

type AckSender = oneshot::Sender<Result<(), String>>;

/// MQTT 3.1.1 transport over TCP, TLS and websockets.
#[derive(Clone, Debug, Default)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        MqttConnector
    }
}

/// Translate a broker url into client options.
///
/// `mqtt://` and `tcp://` default to port 1883, `mqtts://` and `ssl://` to 8883,
/// `ws://` to 80 and `wss://` to 443.
pub fn mqtt_options(options: &BrokerOptions) -> Result<MqttOptions, BrokerError> {
    let invalid = |reason: &str| BrokerError::InvalidUrl(options.url.clone(), reason.to_string());
    let url = Url::parse(&options.url).map_err(|e| invalid(&e.to_string()))?;
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?.to_string();

    let (transport, default_port, websocket) = match url.scheme() {
        "mqtt" | "tcp" => (Transport::Tcp, 1883, false),
        "mqtts" | "ssl" => (Transport::tls_with_default_config(), 8883, false),
        "ws" => (Transport::Ws, 80, true),
        "wss" => (Transport::wss_with_default_config(), 443, true),
        other => return Err(invalid(&format!("unsupported scheme `{other}`"))),
    };
    let port = url.port().unwrap_or(default_port);
    // websocket transports take the whole url as the broker address
    let address = if websocket { options.url.clone() } else { host };

    let mut mqtt = MqttOptions::new(options.client_id.clone(), address, port);
    mqtt.set_keep_alive(Duration::from_secs(options.keep_alive_secs.max(5)));
    mqtt.set_clean_session(true);
    mqtt.set_transport(transport);
    mqtt.set_max_packet_size(options.max_packet_size, options.max_packet_size);
    if let Some(user) = &options.username {
        mqtt.set_credentials(user.clone(), options.password.clone().unwrap_or_default());
    }
    Ok(mqtt)
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    #[tracing::instrument(skip(self), fields(client_id = %options.client_id))]
    async fn connect(
        &self,
        options: &BrokerOptions,
    ) -> Result<(Arc<dyn BrokerSession>, UnboundedReceiver<InboundMessage>), BrokerError> {
        let mqtt = mqtt_options(options)?;
        let (client, mut eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);

        match timeout(HANDSHAKE_TIMEOUT, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => info!(url = %options.url, "🔌 connected to broker"),
            Ok(Err(e)) => return Err(BrokerError::Connect(e)),
            Err(_) => {
                return Err(BrokerError::Connect(format!(
                    "no CONNACK within {} s",
                    HANDSHAKE_TIMEOUT.as_secs()
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let acks = Arc::new(SubAcks::default());
        let filters = Arc::new(Mutex::new(Vec::<(String, QoS)>::new()));
        let stop = CancellationToken::new();

        let driver = EventDriver {
            client_id: options.client_id.clone(),
            client: client.clone(),
            inbound: tx,
            acks: acks.clone(),
            filters: filters.clone(),
            stop: stop.clone(),
        };
        let handle = tokio::spawn(driver.run(eventloop));

        let session = MqttSession {
            client,
            acks,
            filters,
            stop,
            driver: Mutex::new(Some(handle)),
        };
        Ok((Arc::new(session), rx))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == rumqttc::ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("connection refused: {:?}", ack.code))
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Outstanding SUBSCRIBE requests awaiting their SUBACK.
#[derive(Default)]
struct SubAcks {
    /// One slot per SUBSCRIBE handed to the client, in send order, until the
    /// event loop reports its packet id. Resubscribes hold `None`.
    queued: Mutex<VecDeque<Option<AckSender>>>,
    by_pkid: DashMap<u16, AckSender>,
}

impl SubAcks {
    /// Queue a SUBSCRIBE without waiting for room in the request channel.
    /// The slot is recorded under the same lock as the send, so slots stay in
    /// the order the event loop emits packets. `ack` is only taken on success.
    fn send(
        &self,
        client: &AsyncClient,
        filter: &str,
        qos: QoS,
        ack: &mut Option<AckSender>,
    ) -> Result<(), ClientError> {
        let mut queued = self.queued.lock().unwrap_or_else(PoisonError::into_inner);
        client.try_subscribe(filter.to_string(), to_mqtt_qos(qos))?;
        queued.push_back(ack.take());
        Ok(())
    }

    fn assign(&self, pkid: u16) {
        let next = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .flatten();
        if let Some(tx) = next {
            self.by_pkid.insert(pkid, tx);
        }
    }

    fn complete(&self, pkid: u16, result: Result<(), String>) {
        if let Some((_, tx)) = self.by_pkid.remove(&pkid) {
            let _ = tx.send(result);
        }
    }

    fn fail_all(&self, reason: &str) {
        {
            // the slots stay so later packet ids still line up
            let mut queued = self.queued.lock().unwrap_or_else(PoisonError::into_inner);
            for tx in queued.iter_mut().filter_map(Option::take) {
                let _ = tx.send(Err(reason.to_string()));
            }
        }
        let pending: Vec<u16> = self.by_pkid.iter().map(|e| *e.key()).collect();
        for pkid in pending {
            self.complete(pkid, Err(reason.to_string()));
        }
    }
}

struct EventDriver {
    client_id: String,
    client: AsyncClient,
    inbound: UnboundedSender<InboundMessage>,
    acks: Arc<SubAcks>,
    filters: Arc<Mutex<Vec<(String, QoS)>>>,
    stop: CancellationToken,
}

impl EventDriver {
    async fn run(self, mut eventloop: EventLoop) {
        let mut backlog: VecDeque<(String, QoS)> = VecDeque::new();
        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => break,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    if self.inbound.send(message).is_err() {
                        debug!(client_id = %self.client_id, "inbound receiver dropped");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let failed = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    let result = if failed {
                        Err("broker rejected the subscription".to_string())
                    } else {
                        Ok(())
                    };
                    self.acks.complete(ack.pkid, result);
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // clean sessions lose their subscriptions on reconnect
                    backlog = self.filters.lock().map(|f| f.iter().cloned().collect()).unwrap_or_default();
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => self.acks.assign(pkid),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(ConnectionError::RequestsDone) => break,
                Err(e) => {
                    warn!(client_id = %self.client_id, error = %e, "broker connection lost, retrying");
                    self.acks.fail_all(&e.to_string());
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = sleep(RECONNECT_PERIOD) => {}
                    }
                }
            }
            self.resubscribe(&mut backlog);
        }
        self.acks.fail_all("session closed");
        debug!(client_id = %self.client_id, "event loop stopped");
    }

    /// Queue as much of the backlog as the request channel takes right now.
    /// The rest waits for the next turn of the loop, which drains the channel.
    fn resubscribe(&self, backlog: &mut VecDeque<(String, QoS)>) {
        while let Some((filter, qos)) = backlog.front() {
            if let Err(e) = self.acks.send(&self.client, filter, *qos, &mut None) {
                debug!(client_id = %self.client_id, %filter, error = %e, left = backlog.len(), "resubscribe deferred");
                return;
            }
            backlog.pop_front();
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    acks: Arc<SubAcks>,
    filters: Arc<Mutex<Vec<(String, QoS)>>>,
    stop: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), BrokerError> {
        if self.stop.is_cancelled() {
            return Err(BrokerError::NotConnected);
        }
        let fail = |reason: String| BrokerError::Subscribe(filter.to_string(), reason);
        let (tx, rx) = oneshot::channel();
        let mut ack = Some(tx);
        let deadline = Instant::now() + SUBACK_TIMEOUT;
        while let Err(e) = self.acks.send(&self.client, filter, qos, &mut ack) {
            if self.stop.is_cancelled() || Instant::now() >= deadline {
                return Err(fail(e.to_string()));
            }
            sleep(SEND_RETRY).await;
        }
        match timeout_at(deadline, rx).await {
            Ok(Ok(Ok(()))) => {
                if let Ok(mut filters) = self.filters.lock() {
                    filters.push((filter.to_string(), qos));
                }
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(fail(reason)),
            Ok(Err(_)) => Err(fail("session closed".into())),
            Err(_) => Err(fail("no SUBACK received".into())),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), BrokerError> {
        if self.stop.is_cancelled() {
            return Err(BrokerError::NotConnected);
        }
        self.client
            .publish(topic.to_string(), to_mqtt_qos(qos), false, payload)
            .await
            .map_err(|e| BrokerError::Publish(topic.to_string(), e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let handle = self.driver.lock().ok().and_then(|mut d| d.take());
        let Some(handle) = handle else {
            return Ok(());
        };
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Disconnect(e.to_string()));
        // give the driver a moment to flush DISCONNECT before tearing it down
        if timeout(Duration::from_secs(2), handle).await.is_err() {
            debug!("event loop did not stop in time");
        }
        self.stop.cancel();
        result
    }
}
