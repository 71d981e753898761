// src/device/mod.rs

use std::{
    fmt,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, stream::FuturesUnordered};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{
        Mutex as AsyncMutex,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    broker::{BrokerConnector, BrokerError, BrokerOptions, BrokerSession, InboundMessage, QoS},
    message::Envelope,
    topic::{InboundTopic, classify, device_filters},
};

pub mod correlator;
pub mod dispatcher;

pub use correlator::{RequestCorrelator, RequestError};
pub use dispatcher::{ActionDispatcher, ActionHandler, Dispatch, RegistrationError, handler_fn};

/// Default wait for `publish_and_await_reply` when the caller passes none.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connecting => "connecting",
            DeviceState::Connected => "connected",
            DeviceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("device `{device}` could not connect: {source}")]
    Connection {
        device: String,
        #[source]
        source: BrokerError,
    },

    #[error("device `{0}` is not connected")]
    NotConnected(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Gets every message delivered to a device, after the device's own request
/// and reply handling. Observers run in the order they were added.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_inbound(&self, device_id: &str, message: &InboundMessage);
}

struct Live {
    session: Arc<dyn BrokerSession>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    worker: JoinHandle<()>,
}

struct DeviceInner {
    options: BrokerOptions,
    connector: Arc<dyn BrokerConnector>,
    default_timeout: Duration,
    state: RwLock<DeviceState>,
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
    live: AsyncMutex<Option<Live>>,
    correlator: RequestCorrelator,
    dispatcher: ActionDispatcher,
    observers: Mutex<Vec<Arc<dyn InboundHandler>>>,
}

/// One device's session with the broker.
///
/// Cheap to clone; every clone drives the same session, correlator and
/// dispatcher. The device id doubles as the broker client id and as the
/// namespace of the topics it answers on.
#[derive(Clone)]
pub struct DeviceConnection {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("device_id", &self.device_id())
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .field("actions", &self.inner.dispatcher.actions())
            .finish()
    }
}

impl DeviceConnection {
    pub fn new(options: BrokerOptions, connector: Arc<dyn BrokerConnector>) -> Self {
        Self::with_default_timeout(options, connector, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Like [`DeviceConnection::new`], with the wait used by requests that
    /// pass no timeout of their own.
    pub fn with_default_timeout(
        options: BrokerOptions,
        connector: Arc<dyn BrokerConnector>,
        default_timeout: Duration,
    ) -> Self {
        let correlator = RequestCorrelator::new(options.client_id.clone());
        DeviceConnection {
            inner: Arc::new(DeviceInner {
                options,
                connector,
                default_timeout,
                state: RwLock::new(DeviceState::Disconnected),
                session: RwLock::new(None),
                live: AsyncMutex::new(None),
                correlator,
                dispatcher: ActionDispatcher::new(),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.options.client_id
    }

    pub fn state(&self) -> DeviceState {
        self.inner
            .state
            .read()
            .map(|s| *s)
            .unwrap_or(DeviceState::Failed)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == DeviceState::Connected
    }

    pub fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Fail every in-flight request of this device without disconnecting.
    pub fn cancel_pending(&self, reason: &str) -> usize {
        self.inner.correlator.cancel_all(reason)
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.inner.dispatcher
    }

    fn set_state(&self, state: DeviceState) {
        match self.inner.state.write() {
            Ok(mut s) => *s = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    fn session(&self) -> Result<Arc<dyn BrokerSession>, DeviceError> {
        self.inner
            .session
            .read()
            .ok()
            .and_then(|s| s.clone())
            .ok_or_else(|| DeviceError::NotConnected(self.device_id().to_string()))
    }

    /// Open the broker session and subscribe to this device's request and
    /// reply topics. Connecting an already connected device is a no-op.
    #[tracing::instrument(skip(self), fields(device = %self.device_id(), url = %self.inner.options.url))]
    pub async fn connect(&self) -> Result<(), DeviceError> {
        let mut live = self.inner.live.lock().await;
        if live.is_some() {
            debug!("already connected");
            return Ok(());
        }
        self.set_state(DeviceState::Connecting);

        let fail = |source: BrokerError| DeviceError::Connection {
            device: self.device_id().to_string(),
            source,
        };

        let (session, inbound) = match self.inner.connector.connect(&self.inner.options).await {
            Ok(pair) => pair,
            Err(e) => {
                self.set_state(DeviceState::Failed);
                error!(error = %e, "broker handshake failed");
                return Err(fail(e));
            }
        };

        for filter in device_filters(self.device_id()) {
            if let Err(e) = session.subscribe(&filter, QoS::AtMostOnce).await {
                self.set_state(DeviceState::Failed);
                error!(%filter, error = %e, "subscription failed");
                if let Err(close) = session.disconnect().await {
                    debug!(error = %close, "closing half-open session failed");
                }
                return Err(fail(e));
            }
        }

        let cancel = CancellationToken::new();
        let (queue, dispatches) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_dispatches(
            self.device_id().to_string(),
            session.clone(),
            dispatches,
            cancel.clone(),
        ));
        let pump = tokio::spawn(run_inbound(self.clone(), queue, inbound, cancel.clone()));
        if let Ok(mut slot) = self.inner.session.write() {
            *slot = Some(session.clone());
        }
        *live = Some(Live {
            session,
            cancel,
            pump,
            worker,
        });
        self.set_state(DeviceState::Connected);
        info!("device connected");
        Ok(())
    }

    /// Close the session. Pending requests fail with
    /// [`RequestError::Cancelled`]. Succeeds when there is nothing to close.
    #[tracing::instrument(skip(self), fields(device = %self.device_id()))]
    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        let mut live = self.inner.live.lock().await;
        let Some(Live {
            session,
            cancel,
            pump,
            worker,
        }) = live.take()
        else {
            debug!("nothing to disconnect");
            return Ok(());
        };

        if let Ok(mut slot) = self.inner.session.write() {
            *slot = None;
        }
        self.inner.correlator.cancel_all("device disconnected");
        cancel.cancel();
        let closed = session.disconnect().await;
        if let Err(e) = pump.await {
            warn!(error = %e, "inbound task ended abnormally");
        }
        if let Err(e) = worker.await {
            warn!(error = %e, "dispatch task ended abnormally");
        }
        self.set_state(DeviceState::Disconnected);
        match closed {
            Ok(()) => {
                info!("device disconnected");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "broker did not close cleanly");
                Err(e.into())
            }
        }
    }

    /// Subscribe to an additional topic filter; matching messages reach the
    /// inbound observers.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), DeviceError> {
        self.session()?.subscribe(filter, qos).await?;
        debug!(device = %self.device_id(), %filter, "subscribed");
        Ok(())
    }

    pub fn add_observer(&self, observer: Arc<dyn InboundHandler>) {
        match self.inner.observers.lock() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    /// Register the handler answering requests for `action` on this device.
    pub fn register(
        &self,
        action: &str,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<(), RegistrationError> {
        self.inner.dispatcher.register(action, handler)?;
        debug!(device = %self.device_id(), %action, "handler registered");
        Ok(())
    }

    /// `pub`: send `payload` to `address` (`device.action`) without waiting.
    pub async fn publish(&self, address: &str, payload: Value, qos: QoS) -> Result<(), RequestError> {
        let session = self.request_session()?;
        self.inner
            .correlator
            .publish_fire_and_forget(session.as_ref(), address, payload, qos)
            .await
    }

    /// `pubSync`: send `payload` to `address` and wait for the reply payload.
    pub async fn request(
        &self,
        address: &str,
        payload: Value,
        timeout: Option<Duration>,
        qos: QoS,
    ) -> Result<Value, RequestError> {
        let session = self.request_session()?;
        self.inner
            .correlator
            .publish_and_await_reply(
                session.as_ref(),
                address,
                payload,
                timeout.unwrap_or(self.inner.default_timeout),
                qos,
            )
            .await
    }

    fn request_session(&self) -> Result<Arc<dyn BrokerSession>, RequestError> {
        self.session()
            .map_err(|_| RequestError::NotConnected(self.device_id().to_string()))
    }

    fn observers(&self) -> Vec<Arc<dyn InboundHandler>> {
        match self.inner.observers.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn on_message(&self, queue: &UnboundedSender<Dispatch>, message: InboundMessage) {
        let device_id = self.device_id();
        match classify(device_id, &message.topic) {
            InboundTopic::Reply { request_id } => match serde_json::from_slice::<Envelope>(&message.payload) {
                Ok(reply) => {
                    trace!(device = %device_id, %request_id, "reply received");
                    self.inner.correlator.resolve(reply);
                }
                Err(e) => debug!(device = %device_id, %request_id, error = %e, "undecodable reply dropped"),
            },
            InboundTopic::Request { action } => {
                let dispatch = self.inner.dispatcher.begin(action, &message.payload);
                if queue.send(dispatch).is_err() {
                    debug!(device = %device_id, %action, "dispatch worker gone, request dropped");
                }
            }
            InboundTopic::Foreign => {
                trace!(device = %device_id, topic = %message.topic, "message outside device namespace");
            }
        }

        for observer in self.observers() {
            observer.handle_inbound(device_id, &message).await;
        }
    }
}

async fn run_inbound(
    device: DeviceConnection,
    queue: UnboundedSender<Dispatch>,
    mut inbound: UnboundedReceiver<InboundMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = inbound.recv() => match next {
                Some(message) => device.on_message(&queue, message).await,
                None => {
                    debug!(device = %device.device_id(), "inbound stream closed");
                    break;
                }
            },
        }
    }
}

/// Runs the device's handlers. Dispatches are queued in delivery order and
/// each is first polled in that order; slow handlers overlap without holding
/// up the ones behind them.
async fn run_dispatches(
    device_id: String,
    session: Arc<dyn BrokerSession>,
    mut queue: UnboundedReceiver<Dispatch>,
    cancel: CancellationToken,
) {
    let mut running = FuturesUnordered::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(dispatch) => running.push(answer(device_id.clone(), session.clone(), dispatch)),
                None => break,
            },
            Some(()) = running.next(), if !running.is_empty() => {}
        }
    }
    if !running.is_empty() {
        debug!(device = %device_id, abandoned = running.len(), "dispatch worker stopped with handlers running");
    }
}

async fn answer(device_id: String, session: Arc<dyn BrokerSession>, dispatch: Dispatch) {
    let reply = dispatch.run(&device_id).await;
    if let Err(e) = session
        .publish(&reply.topic, reply.envelope.to_bytes(), QoS::AtMostOnce)
        .await
    {
        warn!(device = %device_id, topic = %reply.topic, error = %e, "reply not sent");
    }
}
