//! Proxied transport: a remote radio relays BLE over MQTT.
//!
//! The remote radio scans on its own and publishes results; GATT sessions
//! are driven by request topics (`connect`, `write/{uuid}`, `read/{uuid}`,
//! `disconnect`) and answered on event topics (`connected`,
//! `notify/{uuid}`, `read/{uuid}/response`, `disconnected`, `error`). All
//! topics live under `{topic_prefix}/{device_id}`.
//!
//! One task polls the MQTT event loop and routes every inbound message to
//! whichever channel is waiting for it.
//!
//! # Example
//!
//! ```ignore
//! use blescale_core::proxy::{ProxiedTransport, ProxyConfig};
//!
//! let config = ProxyConfig::new("mqtt://broker.lan", "bridge-hallway");
//! let transport = ProxiedTransport::connect(&config).await?;
//! ```

pub mod broker;
pub mod wire;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use blescale_types::uuids;

use crate::advertisement::Advertisement;
use crate::error::{Error, Result};
use crate::guard::PendingRelease;
use crate::transport::{
    Beep, DisplayReading, DisplayResult, GattSession, RemoteConfig, RemoteFeedback, Transport,
    TransportKind,
};

use self::broker::ClientSettings;
use self::wire::{ConnectRequest, Connected, Inbound, parse_scan_results};

/// Default topic prefix.
pub const DEFAULT_TOPIC_PREFIX: &str = "blescale";

/// Default MQTT keep-alive, in seconds.
pub const DEFAULT_KEEP_ALIVE: u64 = 30;

/// How long to wait for the broker to accept the connection.
pub const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the remote radio to report `online`.
pub const ONLINE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an `offline` status is tolerated before failing.
pub const OFFLINE_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for `connected` or a read response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const TRANSPORT: &str = "proxied";

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_keep_alive() -> u64 {
    DEFAULT_KEEP_ALIVE
}

/// Connection parameters for the remote radio's broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Broker URL (`mqtt://host:port` or `mqtts://host:port`).
    pub broker: String,
    /// The remote radio's device id.
    pub device_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Client id; a random one is generated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
}

impl ProxyConfig {
    pub fn new(broker: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            device_id: device_id.into(),
            topic_prefix: default_topic_prefix(),
            username: None,
            password: None,
            client_id: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }

    /// `{topic_prefix}/{device_id}`.
    pub fn base_topic(&self) -> String {
        format!("{}/{}", self.topic_prefix.trim_end_matches('/'), self.device_id)
    }

    fn client_id(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("blescale-{}", &suffix[..8])
        })
    }
}

/// Last status the remote radio published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoteStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

/// Session events relayed to whoever is waiting on them.
#[derive(Debug, Clone)]
enum Control {
    Connected(Connected),
    Disconnected,
    ReadResponse(Uuid, Vec<u8>),
    Error(String),
}

/// Liveness of one relayed GATT session, plus the remote error that ended
/// it, if any.
struct Link {
    down: watch::Sender<bool>,
    error: Mutex<Option<String>>,
}

impl Link {
    fn new() -> Self {
        Self {
            down: watch::Sender::new(false),
            error: Mutex::new(None),
        }
    }
}

/// State the event-loop task writes and the transport reads.
struct Shared {
    base: String,
    status: watch::Sender<RemoteStatus>,
    broker_up: watch::Sender<bool>,
    last_error: Mutex<Option<String>>,
    adverts: Mutex<Option<mpsc::Sender<Vec<Advertisement>>>>,
    control: broadcast::Sender<Control>,
    notify: Mutex<HashMap<Uuid, mpsc::Sender<Vec<u8>>>>,
    link: Mutex<Option<Arc<Link>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn new(base: String) -> Self {
        Self {
            base,
            status: watch::Sender::new(RemoteStatus::Unknown),
            broker_up: watch::Sender::new(false),
            last_error: Mutex::new(None),
            adverts: Mutex::new(None),
            control: broadcast::channel(16).0,
            notify: Mutex::new(HashMap::new()),
            link: Mutex::new(None),
        }
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.base, suffix)
    }

    /// Mark the current GATT session down and drop its notification routes.
    fn link_down(&self) {
        if let Some(link) = lock(&self.link).take() {
            link.down.send_replace(true);
        }
        lock(&self.notify).clear();
    }

    /// End the current GATT session because the remote radio reported
    /// `text`. Without a session this does nothing.
    fn fail_session(&self, text: &str) {
        let Some(link) = lock(&self.link).take() else {
            return;
        };
        lock(&link.error).get_or_insert_with(|| text.to_string());
        link.down.send_replace(true);
        lock(&self.notify).clear();
    }

    fn route(&self, topic: &str, payload: &[u8]) {
        let Some(inbound) = Inbound::parse(&self.base, topic) else {
            trace!(topic, "Ignoring message");
            return;
        };

        match inbound {
            Inbound::Status => {
                let status = match payload {
                    b"online" => RemoteStatus::Online,
                    b"offline" => RemoteStatus::Offline,
                    other => {
                        debug!("Unknown status {:?}", String::from_utf8_lossy(other));
                        return;
                    }
                };
                if self.status.send_replace(status) != status {
                    info!("Remote radio is {:?}", status);
                }
                if status == RemoteStatus::Offline {
                    self.link_down();
                }
            }
            Inbound::ScanResults => match parse_scan_results(payload) {
                Ok(batch) => {
                    trace!("Scan results: {} devices", batch.len());
                    let mut adverts = lock(&self.adverts);
                    if let Some(tx) = adverts.as_ref() {
                        match tx.try_send(batch) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                debug!("Advertisement consumer lagging, dropping batch");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => *adverts = None,
                        }
                    }
                }
                Err(e) => warn!("{}", Error::MalformedAdvertisement(e.to_string())),
            },
            Inbound::Connected => match serde_json::from_slice::<Connected>(payload) {
                Ok(connected) => {
                    let _ = self.control.send(Control::Connected(connected));
                }
                Err(e) => warn!("Malformed connected message: {}", e),
            },
            Inbound::Disconnected => {
                debug!("Remote radio reports disconnected");
                self.link_down();
                let _ = self.control.send(Control::Disconnected);
            }
            Inbound::Notify(uuid) => {
                let tx = lock(&self.notify).get(&uuid).cloned();
                match tx {
                    Some(tx) => {
                        if tx.try_send(payload.to_vec()).is_err() {
                            debug!(%uuid, "Notification dropped");
                        }
                    }
                    None => trace!(%uuid, "Notification without subscriber"),
                }
            }
            Inbound::ReadResponse(uuid) => {
                let _ = self
                    .control
                    .send(Control::ReadResponse(uuid, payload.to_vec()));
            }
            Inbound::Error => {
                let text = String::from_utf8_lossy(payload).into_owned();
                warn!("Remote radio error: {}", text);
                self.fail_session(&text);
                let _ = self.control.send(Control::Error(text));
            }
        }
    }
}

async fn run_event_loop(client: AsyncClient, mut eventloop: EventLoop, shared: Arc<Shared>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("MQTT connected: {:?}", ack);
                for filter in Inbound::filters(&shared.base) {
                    if let Err(e) = client.try_subscribe(&filter, QoS::AtLeastOnce) {
                        warn!("Failed to subscribe to {}: {}", filter, e);
                    }
                }
                shared.broker_up.send_replace(true);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                shared.route(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                if shared.broker_up.send_replace(false) {
                    warn!("Broker connection lost: {}", e);
                    shared.link_down();
                    lock(&shared.adverts).take();
                } else {
                    debug!("Broker connection failed: {}", e);
                }
                *lock(&shared.last_error) = Some(e.to_string());
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Transport over a remote radio reached through an MQTT broker.
pub struct ProxiedTransport {
    client: AsyncClient,
    shared: Arc<Shared>,
    device_id: String,
    event_loop: Option<JoinHandle<()>>,
    online_timeout: Duration,
    offline_grace: Duration,
    response_timeout: Duration,
}

impl std::fmt::Debug for ProxiedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxiedTransport")
            .field("base", &self.shared.base)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ProxiedTransport {
    /// Connect to the broker and wait for it to accept the session.
    ///
    /// The remote radio does not need to be online yet; every operation
    /// waits for it separately.
    #[tracing::instrument(level = "info", skip_all, fields(broker = %config.broker, device_id = %config.device_id))]
    pub async fn connect(config: &ProxyConfig) -> Result<Self> {
        let client_id = config.client_id();
        let options = broker::mqtt_options(&ClientSettings {
            broker: &config.broker,
            client_id: &client_id,
            keep_alive: Duration::from_secs(config.keep_alive),
            username: config.username.as_deref(),
            password: config.password.as_deref(),
        })
        .map_err(|e| Error::invalid_config(format!("transport.proxy.broker: {e}")))?;

        let (client, eventloop) = AsyncClient::new(options, 100);
        let mut transport = Self::from_parts(client.clone(), config);
        let shared = Arc::clone(&transport.shared);
        let mut up = shared.broker_up.subscribe();
        transport.event_loop = Some(tokio::spawn(run_event_loop(
            client,
            eventloop,
            Arc::clone(&shared),
        )));

        let ready = timeout(BROKER_CONNECT_TIMEOUT, async {
            up.wait_for(|up| *up).await.map(|_| ())
        })
        .await;
        if !matches!(ready, Ok(Ok(()))) {
            let reason = lock(&shared.last_error)
                .clone()
                .unwrap_or_else(|| format!("no answer within {:?}", BROKER_CONNECT_TIMEOUT));
            return Err(Error::unreachable(
                TRANSPORT,
                format!("broker {}: {}", config.broker, reason),
            ));
        }

        info!("Connected to broker, topics under {}", shared.base);
        Ok(transport)
    }

    fn from_parts(client: AsyncClient, config: &ProxyConfig) -> Self {
        Self {
            client,
            shared: Arc::new(Shared::new(config.base_topic())),
            device_id: config.device_id.clone(),
            event_loop: None,
            online_timeout: ONLINE_TIMEOUT,
            offline_grace: OFFLINE_GRACE,
            response_timeout: RESPONSE_TIMEOUT,
        }
    }

    /// Last status the remote radio published.
    pub fn status(&self) -> RemoteStatus {
        *self.shared.status.borrow()
    }

    /// Whether the broker connection is currently up.
    pub fn is_broker_connected(&self) -> bool {
        *self.shared.broker_up.borrow()
    }

    /// Wait for the remote radio to report `online`.
    ///
    /// An `offline` status fails after [`OFFLINE_GRACE`] instead of the
    /// full timeout; the radio may still come back within the grace window.
    pub async fn wait_online(&self) -> Result<()> {
        let mut status = self.shared.status.subscribe();
        let deadline = Instant::now() + self.online_timeout;
        let mut offline_since: Option<Instant> = None;

        loop {
            let now = Instant::now();
            let current = *status.borrow_and_update();
            match current {
                RemoteStatus::Online => return Ok(()),
                RemoteStatus::Offline => {
                    let since = *offline_since.get_or_insert(now);
                    if now >= since + self.offline_grace {
                        return Err(Error::RemoteRadioOffline {
                            device_id: self.device_id.clone(),
                        });
                    }
                }
                RemoteStatus::Unknown => offline_since = None,
            }
            if now >= deadline {
                return Err(Error::timeout(
                    format!("waiting for remote radio '{}' to come online", self.device_id),
                    self.online_timeout,
                ));
            }

            let wake = offline_since.map_or(deadline, |since| (since + self.offline_grace).min(deadline));
            tokio::select! {
                _ = status.changed() => {}
                _ = sleep_until(wake) => {}
            }
        }
    }

    async fn publish(&self, suffix: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        publish(&self.client, self.shared.topic(suffix), payload, qos, retain).await
    }
}

async fn publish(
    client: &AsyncClient,
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
) -> Result<()> {
    trace!(%topic, "Publishing {} bytes", payload.len());
    client
        .publish(topic, qos, retain, payload)
        .await
        .map_err(|e| Error::unreachable(TRANSPORT, e))
}

/// Wait on `control` for the first event `pick` accepts. A relayed error
/// ends the wait with [`Error::RemoteRadioError`].
async fn await_control<T>(
    control: &mut broadcast::Receiver<Control>,
    mut pick: impl FnMut(Control) -> Option<Result<T>>,
) -> Result<T> {
    loop {
        match control.recv().await {
            Ok(Control::Error(text)) => return Err(Error::RemoteRadioError(text)),
            Ok(event) => {
                if let Some(result) = pick(event) {
                    return result;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => debug!("Missed {} control events", n),
            Err(broadcast::error::RecvError::Closed) => {
                return Err(Error::unreachable(TRANSPORT, "event loop stopped"));
            }
        }
    }
}

impl Drop for ProxiedTransport {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for ProxiedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Proxied
    }

    async fn advertisements(&self) -> Result<mpsc::Receiver<Vec<Advertisement>>> {
        self.wait_online().await?;
        let (tx, rx) = mpsc::channel(32);
        // A newer subscriber replaces the old one, whose stream then ends.
        *lock(&self.shared.adverts) = Some(tx);
        info!("Listening for scan results");
        Ok(rx)
    }

    #[tracing::instrument(level = "info", skip_all, fields(address = %advertisement.address))]
    async fn connect(&self, advertisement: &Advertisement) -> Result<Box<dyn GattSession>> {
        self.wait_online().await?;

        let mut control = self.shared.control.subscribe();
        let request = ConnectRequest {
            address: &advertisement.address,
            addr_type: advertisement.address_type.unwrap_or_default().as_wire(),
        };
        self.publish("connect", serde_json::to_vec(&request)?, QoS::AtLeastOnce, false)
            .await?;

        // The remote radio may connect even if `connected` never arrives.
        let mut pending = PendingRelease::new({
            let client = self.client.clone();
            let topic = self.shared.topic("disconnect");
            async move {
                match publish(&client, topic, Vec::new(), QoS::AtLeastOnce, false).await {
                    Ok(()) => debug!("Withdrew unanswered connect request"),
                    Err(e) => debug!("Failed to withdraw connect request: {}", e),
                }
            }
        });

        let connected = pending
            .attempt(async {
                timeout(
                    self.response_timeout,
                    await_control(&mut control, |event| match event {
                        Control::Connected(connected) => Some(Ok(connected)),
                        _ => None,
                    }),
                )
                .await
                .map_err(|_| Error::timeout("GATT connect via remote radio", self.response_timeout))?
            })
            .await?;
        pending.disarm();

        let characteristics: HashSet<Uuid> = connected.uuids().into_iter().collect();
        debug!("Remote radio discovered {} characteristics", characteristics.len());

        let link = Arc::new(Link::new());
        lock(&self.shared.notify).clear();
        *lock(&self.shared.link) = Some(Arc::clone(&link));

        Ok(Box::new(ProxySession {
            client: self.client.clone(),
            shared: Arc::clone(&self.shared),
            address: advertisement.address.clone(),
            characteristics,
            link,
            response_timeout: self.response_timeout,
        }))
    }

    fn feedback(&self) -> Option<&dyn RemoteFeedback> {
        Some(self)
    }
}

#[async_trait]
impl RemoteFeedback for ProxiedTransport {
    async fn publish_config(&self, config: &RemoteConfig) -> Result<()> {
        self.publish("config", serde_json::to_vec(config)?, QoS::AtLeastOnce, true)
            .await
    }

    async fn beep(&self, beep: Beep) -> Result<()> {
        self.publish("beep", serde_json::to_vec(&beep)?, QoS::AtMostOnce, false)
            .await
    }

    async fn display_reading(&self, reading: &DisplayReading) -> Result<()> {
        self.publish("display/reading", serde_json::to_vec(reading)?, QoS::AtMostOnce, false)
            .await
    }

    async fn display_result(&self, result: &DisplayResult) -> Result<()> {
        self.publish("display/result", serde_json::to_vec(result)?, QoS::AtMostOnce, false)
            .await
    }
}

/// GATT session relayed through the remote radio.
pub struct ProxySession {
    client: AsyncClient,
    shared: Arc<Shared>,
    address: String,
    characteristics: HashSet<Uuid>,
    link: Arc<Link>,
    response_timeout: Duration,
}

impl ProxySession {
    fn require(&self, uuid: Uuid) -> Result<()> {
        if self.characteristics.contains(&uuid) {
            Ok(())
        } else {
            Err(Error::CharacteristicNotFound {
                uuid,
                address: self.address.clone(),
            })
        }
    }
}

#[async_trait]
impl GattSession for ProxySession {
    fn address(&self) -> &str {
        &self.address
    }

    fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.contains(uuid)
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.require(uuid)?;
        // The remote radio already forwards every notify characteristic.
        let (tx, rx) = mpsc::channel(32);
        lock(&self.shared.notify).insert(uuid, tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<()> {
        lock(&self.shared.notify).remove(&uuid);
        Ok(())
    }

    /// The remote radio picks the write type from the characteristic's
    /// properties, so `with_response` is not relayed.
    async fn write(&self, uuid: Uuid, data: &[u8], _with_response: bool) -> Result<()> {
        self.require(uuid)?;
        let topic = self.shared.topic(&format!("write/{}", uuids::to_wire(&uuid)));
        publish(&self.client, topic, data.to_vec(), QoS::AtMostOnce, false).await
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        self.require(uuid)?;
        let mut control = self.shared.control.subscribe();
        let topic = self.shared.topic(&format!("read/{}", uuids::to_wire(&uuid)));
        publish(&self.client, topic, Vec::new(), QoS::AtMostOnce, false).await?;

        let address = self.address.clone();
        timeout(
            self.response_timeout,
            await_control(&mut control, |event| match event {
                Control::ReadResponse(id, value) if id == uuid => Some(Ok(value)),
                Control::Disconnected => Some(Err(Error::DeviceDisconnectedUnexpectedly {
                    address: address.clone(),
                })),
                _ => None,
            }),
        )
        .await
        .map_err(|_| Error::timeout(format!("GATT read of {uuid} via remote radio"), self.response_timeout))?
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.link.down.subscribe()
    }

    fn failure(&self) -> Option<Error> {
        lock(&self.link.error).clone().map(Error::RemoteRadioError)
    }

    async fn disconnect(&self) -> Result<()> {
        self.link.down.send_replace(true);
        {
            let mut current = lock(&self.shared.link);
            if current.as_ref().is_some_and(|link| Arc::ptr_eq(link, &self.link)) {
                *current = None;
            }
        }
        lock(&self.shared.notify).clear();
        publish(
            &self.client,
            self.shared.topic("disconnect"),
            Vec::new(),
            QoS::AtLeastOnce,
            false,
        )
        .await?;
        debug!(address = %self.address, "Disconnect requested");
        Ok(())
    }
}
