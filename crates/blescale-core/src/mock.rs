//! Scripted transport for tests.
//!
//! [`MockTransport`] replays advertisement batches and hands out
//! [`MockSession`]s that replay notification frames. Both record what was
//! done to them so tests can assert on side effects.
//!
//! # Features
//!
//! - **Scripted discovery**: batches with per-batch delays, optionally ending the stream
//! - **Scripted GATT**: frames per characteristic, with an optional inter-frame delay
//! - **Failure injection**: failing connects, unexpected disconnects
//! - **Accounting**: subscribe/unsubscribe/disconnect counters and a write log

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::advertisement::Advertisement;
use crate::error::{Error, Result};
use crate::transport::{
    Beep, DisplayReading, DisplayResult, GattSession, RemoteConfig, RemoteFeedback, Transport,
    TransportKind,
};

/// Counters shared by every session built from one [`MockSessionBuilder`].
#[derive(Debug, Default)]
pub struct MockStats {
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    disconnects: AtomicUsize,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
}

impl MockStats {
    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Every write, in order.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

/// Builder for [`MockSession`]. Cloning shares the [`MockStats`].
#[derive(Debug, Clone)]
pub struct MockSessionBuilder {
    address: String,
    characteristics: HashSet<Uuid>,
    frames: Vec<(Uuid, Vec<u8>)>,
    frame_delay: Duration,
    drop_after: Option<usize>,
    reads: HashMap<Uuid, Vec<u8>>,
    stats: Arc<MockStats>,
}

impl MockSessionBuilder {
    /// Add a characteristic to the discovered set.
    #[must_use]
    pub fn characteristic(mut self, uuid: Uuid) -> Self {
        self.characteristics.insert(uuid);
        self
    }

    /// Queue a notification frame for `uuid`, sent after subscribing.
    #[must_use]
    pub fn frame(mut self, uuid: Uuid, data: impl Into<Vec<u8>>) -> Self {
        self.characteristics.insert(uuid);
        self.frames.push((uuid, data.into()));
        self
    }

    /// Sleep this long before each frame.
    #[must_use]
    pub fn frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Drop the link after sending `count` frames.
    #[must_use]
    pub fn disconnect_after(mut self, count: usize) -> Self {
        self.drop_after = Some(count);
        self
    }

    /// Value returned by `read(uuid)`.
    #[must_use]
    pub fn read_value(mut self, uuid: Uuid, data: impl Into<Vec<u8>>) -> Self {
        self.characteristics.insert(uuid);
        self.reads.insert(uuid, data.into());
        self
    }

    /// Counters for sessions built from this builder.
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }

    pub fn build(self) -> MockSession {
        let (disconnected, _) = watch::channel(false);
        MockSession {
            address: self.address,
            characteristics: self.characteristics,
            frames: self.frames,
            frame_delay: self.frame_delay,
            drop_after: self.drop_after,
            reads: self.reads,
            stats: self.stats,
            senders: Arc::new(Mutex::new(HashMap::new())),
            disconnected: Arc::new(disconnected),
        }
    }
}

/// Scripted GATT session.
pub struct MockSession {
    address: String,
    characteristics: HashSet<Uuid>,
    frames: Vec<(Uuid, Vec<u8>)>,
    frame_delay: Duration,
    drop_after: Option<usize>,
    reads: HashMap<Uuid, Vec<u8>>,
    stats: Arc<MockStats>,
    senders: Arc<Mutex<HashMap<Uuid, mpsc::Sender<Vec<u8>>>>>,
    disconnected: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for MockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSession")
            .field("address", &self.address)
            .field("frames", &self.frames.len())
            .finish()
    }
}

impl MockSession {
    pub fn builder(address: impl Into<String>) -> MockSessionBuilder {
        MockSessionBuilder {
            address: address.into(),
            characteristics: HashSet::new(),
            frames: Vec::new(),
            frame_delay: Duration::ZERO,
            drop_after: None,
            reads: HashMap::new(),
            stats: Arc::new(MockStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }

    fn not_found(&self, uuid: Uuid) -> Error {
        Error::CharacteristicNotFound {
            uuid,
            address: self.address.clone(),
        }
    }
}

#[async_trait]
impl GattSession for MockSession {
    fn address(&self) -> &str {
        &self.address
    }

    fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.contains(uuid)
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<mpsc::Receiver<Vec<u8>>> {
        if !self.has_characteristic(&uuid) {
            return Err(self.not_found(uuid));
        }
        self.stats.subscribes.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(32);
        if let Ok(mut senders) = self.senders.lock() {
            senders.insert(uuid, tx.clone());
        }

        let frames: Vec<Vec<u8>> = self
            .frames
            .iter()
            .filter(|(u, _)| *u == uuid)
            .map(|(_, data)| data.clone())
            .collect();
        let delay = self.frame_delay;
        let drop_after = self.drop_after;
        let disconnected = Arc::clone(&self.disconnected);
        tokio::spawn(async move {
            for (sent, frame) in frames.into_iter().enumerate() {
                if drop_after == Some(sent) {
                    disconnected.send_replace(true);
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
            if drop_after.is_some() {
                disconnected.send_replace(true);
            }
        });
        Ok(rx)
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<()> {
        self.stats.unsubscribes.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut senders) = self.senders.lock() {
            senders.remove(&uuid);
        }
        Ok(())
    }

    async fn write(&self, uuid: Uuid, data: &[u8], _with_response: bool) -> Result<()> {
        if !self.has_characteristic(&uuid) {
            return Err(self.not_found(uuid));
        }
        if let Ok(mut writes) = self.stats.writes.lock() {
            writes.push((uuid, data.to_vec()));
        }
        Ok(())
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        self.reads
            .get(&uuid)
            .cloned()
            .ok_or_else(|| self.not_found(uuid))
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.subscribe()
    }

    async fn disconnect(&self) -> Result<()> {
        self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut senders) = self.senders.lock() {
            senders.clear();
        }
        Ok(())
    }
}

/// Records what a service pushed to the "remote radio".
#[derive(Debug, Default)]
pub struct MockFeedback {
    events: Mutex<Vec<String>>,
}

impl MockFeedback {
    /// Topic-like names of every call, in order (`config`, `beep`, ...).
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn record(&self, event: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.to_string());
        }
    }
}

#[async_trait]
impl RemoteFeedback for MockFeedback {
    async fn publish_config(&self, _config: &RemoteConfig) -> Result<()> {
        self.record("config");
        Ok(())
    }

    async fn beep(&self, _beep: Beep) -> Result<()> {
        self.record("beep");
        Ok(())
    }

    async fn display_reading(&self, _reading: &DisplayReading) -> Result<()> {
        self.record("display/reading");
        Ok(())
    }

    async fn display_result(&self, _result: &DisplayResult) -> Result<()> {
        self.record("display/result");
        Ok(())
    }
}

/// Builder for [`MockTransport`].
#[derive(Debug, Default)]
pub struct MockTransportBuilder {
    batches: Vec<(Duration, Vec<Advertisement>)>,
    end_stream: bool,
    sessions: HashMap<String, MockSessionBuilder>,
    connect_failures: u32,
    connect_delay: Duration,
    feedback: bool,
    kind: TransportKind,
}

impl MockTransportBuilder {
    /// Emit `batch` immediately after the previous one.
    #[must_use]
    pub fn batch(self, batch: Vec<Advertisement>) -> Self {
        self.batch_after(Duration::ZERO, batch)
    }

    /// Emit `batch` `delay` after the previous one.
    #[must_use]
    pub fn batch_after(mut self, delay: Duration, batch: Vec<Advertisement>) -> Self {
        self.batches.push((delay, batch));
        self
    }

    /// Close the advertisement stream after the last batch instead of
    /// keeping it open.
    #[must_use]
    pub fn end_stream(mut self) -> Self {
        self.end_stream = true;
        self
    }

    /// Serve a fresh session built from `session` on every connect to its address.
    #[must_use]
    pub fn session(mut self, session: MockSessionBuilder) -> Self {
        self.sessions.insert(session.address.clone(), session);
        self
    }

    /// Fail the first `count` connects.
    #[must_use]
    pub fn fail_connects(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    #[must_use]
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Report as a proxied transport with a [`MockFeedback`] sink.
    #[must_use]
    pub fn with_feedback(mut self) -> Self {
        self.feedback = true;
        self.kind = TransportKind::Proxied;
        self
    }

    pub fn build(self) -> MockTransport {
        MockTransport {
            batches: self.batches,
            end_stream: self.end_stream,
            sessions: self.sessions,
            remaining_failures: AtomicU32::new(self.connect_failures),
            connect_delay: self.connect_delay,
            connects: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
            feedback: self.feedback.then(MockFeedback::default),
            kind: self.kind,
        }
    }
}

/// Scripted [`Transport`].
///
/// # Example
///
/// ```
/// use blescale_core::mock::{MockSession, MockTransport};
/// use blescale_core::Advertisement;
/// use blescale_types::{uuids, DeviceInfo};
///
/// let transport = MockTransport::builder()
///     .batch(vec![Advertisement::new(
///         "AA:BB:CC:DD:EE:01",
///         DeviceInfo::new().with_name("QN-Scale"),
///     )])
///     .session(MockSession::builder("AA:BB:CC:DD:EE:01").characteristic(uuids::QN_NOTIFY))
///     .build();
/// assert_eq!(transport.connects(), 0);
/// ```
#[derive(Debug)]
pub struct MockTransport {
    batches: Vec<(Duration, Vec<Advertisement>)>,
    end_stream: bool,
    sessions: HashMap<String, MockSessionBuilder>,
    remaining_failures: AtomicU32,
    connect_delay: Duration,
    connects: AtomicUsize,
    subscriptions: AtomicUsize,
    feedback: Option<MockFeedback>,
    kind: TransportKind,
}

impl MockTransport {
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    /// Number of connect attempts, failed ones included.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of `advertisements()` calls.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn mock_feedback(&self) -> Option<&MockFeedback> {
        self.feedback.as_ref()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn advertisements(&self) -> Result<mpsc::Receiver<Vec<Advertisement>>> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        let batches = self.batches.clone();
        let end_stream = self.end_stream;
        tokio::spawn(async move {
            for (delay, batch) in batches {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(batch).await.is_err() {
                    return;
                }
            }
            if !end_stream {
                tx.closed().await;
            }
        });
        Ok(rx)
    }

    async fn connect(&self, advertisement: &Advertisement) -> Result<Box<dyn GattSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::unreachable("mock", "injected connect failure"));
        }
        let builder = self
            .sessions
            .get(&advertisement.address)
            .ok_or_else(|| Error::device_not_found(advertisement.address.clone()))?;
        Ok(Box::new(builder.clone().build()))
    }

    fn feedback(&self) -> Option<&dyn RemoteFeedback> {
        self.feedback.as_ref().map(|f| f as &dyn RemoteFeedback)
    }
}
