//! Always-on acquisition.
//!
//! [`ContinuousWatcher`] holds one advertisement subscription for its whole
//! life. Broadcast readings are decoded inline and queued; GATT scales are
//! read by a detached task so the subscription never stalls behind a
//! multi-second session. At most one such task runs at a time.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use blescale_core::{AdapterRegistry, ContinuousWatcher, LocalTransport, WatcherOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let transport = Arc::new(LocalTransport::new().await?);
//! let watcher = Arc::new(ContinuousWatcher::new(transport, AdapterRegistry::new(), WatcherOptions::default()));
//! let cancel = CancellationToken::new();
//! let handle = watcher.start(cancel.clone());
//!
//! while let Ok(raw) = watcher.next(&cancel).await {
//!     println!("{} from {}", raw.reading, raw.address);
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blescale_types::WeightUnit;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::adapter::AdapterRegistry;
use crate::advertisement::Advertisement;
use crate::dedup::{DEDUP_WINDOW, DedupWindow};
use crate::error::{Error, Result};
use crate::extract::{ExtractOptions, ProgressFn, RawReading, normalize, read_via_gatt};
use crate::queue::{QUEUE_CAPACITY, ReadingQueue};
use crate::retry::Backoff;
use crate::transport::Transport;

/// Options for [`ContinuousWatcher`].
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Only consider this address.
    pub address: Option<String>,
    /// Bound on one background GATT session.
    pub gatt_timeout: Duration,
    /// Repeated `(address, weight)` pairs inside this window are dropped.
    pub dedup_window: Duration,
    /// A GATT session still marked busy after this long is presumed lost.
    pub stale_after: Duration,
    /// Maximum queued results.
    pub queue_capacity: usize,
    /// First delay before resubscribing after the advertisement stream fails.
    pub resubscribe_delay: Duration,
    /// Unit override for adapters that do not normalize.
    pub unit: Option<WeightUnit>,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            address: None,
            gatt_timeout: Duration::from_secs(60),
            dedup_window: DEDUP_WINDOW,
            stale_after: Duration::from_secs(90),
            queue_capacity: QUEUE_CAPACITY,
            resubscribe_delay: Duration::from_secs(5),
            unit: None,
        }
    }
}

impl WatcherOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    #[must_use]
    pub fn gatt_timeout(mut self, timeout: Duration) -> Self {
        self.gatt_timeout = timeout;
        self
    }

    #[must_use]
    pub fn unit(mut self, unit: WeightUnit) -> Self {
        self.unit = Some(unit);
        self
    }
}

/// Busy flag for the one permitted GATT session.
///
/// A flag older than `stale_after` is taken over, so a session whose
/// completion was somehow lost cannot lock the watcher out forever.
#[derive(Debug)]
pub struct SingleFlight {
    current: Mutex<Option<(u64, Instant)>>,
    next_id: AtomicU64,
    stale_after: Duration,
}

impl SingleFlight {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
            stale_after,
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<(u64, Instant)>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claim the flag, or `None` if a fresh session holds it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<FlightPermit> {
        let mut slot = self.slot();
        let now = Instant::now();
        if let Some((_, started)) = *slot {
            if now.duration_since(started) < self.stale_after {
                return None;
            }
            warn!(
                "GATT session busy for over {:?}, clearing stale flag",
                self.stale_after
            );
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *slot = Some((id, now));
        Some(FlightPermit {
            flight: Arc::clone(self),
            id,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.slot().is_some()
    }
}

/// Held for the duration of one GATT session; clears the flag on drop
/// unless a staleness takeover already replaced it.
#[derive(Debug)]
pub struct FlightPermit {
    flight: Arc<SingleFlight>,
    id: u64,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        let mut slot = self.flight.slot();
        if matches!(*slot, Some((id, _)) if id == self.id) {
            *slot = None;
        }
    }
}

/// Long-lived, event-driven reader.
pub struct ContinuousWatcher {
    transport: Arc<dyn Transport>,
    registry: AdapterRegistry,
    options: WatcherOptions,
    queue: ReadingQueue<Result<RawReading>>,
    flight: Arc<SingleFlight>,
    dedup: Mutex<DedupWindow>,
    progress: Option<ProgressFn>,
}

impl std::fmt::Debug for ContinuousWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuousWatcher")
            .field("transport", &self.transport.kind())
            .field("options", &self.options)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl ContinuousWatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: AdapterRegistry,
        options: WatcherOptions,
    ) -> Self {
        Self {
            transport,
            registry,
            queue: ReadingQueue::with_capacity(options.queue_capacity),
            flight: Arc::new(SingleFlight::new(options.stale_after)),
            dedup: Mutex::new(DedupWindow::new(options.dedup_window)),
            options,
            progress: None,
        }
    }

    /// Report intermediate GATT readings.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Start watching in the background until `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move { watcher.run(cancel).await })
    }

    /// Next reading or failure, in arrival order.
    ///
    /// Returns [`Error::Cancelled`] once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Result<RawReading> {
        self.queue.pop(cancel).await?
    }

    /// Whether a GATT session is in flight.
    pub fn is_busy(&self) -> bool {
        self.flight.is_busy()
    }

    /// Results waiting to be consumed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.options.resubscribe_delay, Duration::from_secs(60));
        loop {
            let subscribed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                subscribed = self.transport.advertisements() => subscribed,
            };

            match subscribed {
                Ok(mut adverts) => {
                    info!(transport = %self.transport.kind(), "Watching for scales");
                    loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            batch = adverts.recv() => match batch {
                                Some(batch) => {
                                    backoff.reset();
                                    self.handle_batch(batch, &cancel);
                                }
                                None => break,
                            },
                        }
                    }
                    warn!("Advertisement stream ended, resubscribing");
                    self.queue.push(Err(Error::unreachable(
                        self.transport.kind().to_string(),
                        "advertisement stream ended",
                    )));
                }
                Err(e) => {
                    warn!("Advertisement subscription failed: {}", e);
                    self.queue.push(Err(e));
                }
            }

            let delay = backoff.fail();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Watcher stopped");
    }

    fn accept(&self, raw: &RawReading) -> bool {
        self.dedup
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .accept(&raw.address, raw.reading.weight)
    }

    fn handle_batch(self: &Arc<Self>, batch: Vec<Advertisement>, cancel: &CancellationToken) {
        for advertisement in batch {
            if let Some(address) = &self.options.address
                && !advertisement.address_matches(address)
            {
                continue;
            }
            let Some(adapter) = self.registry.match_device(&advertisement.info) else {
                continue;
            };

            if let Some(reading) = adapter.parse_broadcast(&advertisement.info) {
                let raw = RawReading {
                    reading: normalize(adapter.as_ref(), reading, self.options.unit),
                    adapter,
                    address: advertisement.address,
                };
                if self.accept(&raw) {
                    info!(address = %raw.address, adapter = raw.adapter.name(), "Broadcast reading: {}", raw.reading);
                    self.queue.push(Ok(raw));
                } else {
                    trace!(address = %raw.address, "Duplicate broadcast suppressed");
                }
                continue;
            }

            if adapter.gatt().is_none() {
                continue;
            }
            let Some(permit) = self.flight.try_acquire() else {
                trace!(address = %advertisement.address, "GATT session in progress, skipping");
                continue;
            };

            debug!(address = %advertisement.address, adapter = adapter.name(), "Starting background GATT session");
            let watcher = Arc::clone(self);
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                let options = ExtractOptions {
                    address: None,
                    scan_timeout: watcher.options.gatt_timeout,
                    gatt_timeout: watcher.options.gatt_timeout,
                    unit: watcher.options.unit,
                };
                let result = read_via_gatt(
                    watcher.transport.as_ref(),
                    &advertisement,
                    adapter,
                    &options,
                    &cancel,
                    watcher.progress.clone(),
                )
                .await;
                match result {
                    Ok(raw) if watcher.accept(&raw) => watcher.queue.push(Ok(raw)),
                    Ok(raw) => trace!(address = %raw.address, "Duplicate GATT reading suppressed"),
                    Err(Error::Cancelled) => {}
                    Err(e) => {
                        warn!(address = %advertisement.address, "GATT session failed: {}", e);
                        watcher.queue.push(Err(e));
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_exclusive() {
        let flight = Arc::new(SingleFlight::new(Duration::from_secs(90)));
        let permit = flight.try_acquire().unwrap();
        assert!(flight.is_busy());
        assert!(flight.try_acquire().is_none());
        drop(permit);
        assert!(!flight.is_busy());
        assert!(flight.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_stale_takeover() {
        let flight = Arc::new(SingleFlight::new(Duration::from_secs(90)));
        let lost = flight.try_acquire().unwrap();

        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(flight.try_acquire().is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = flight.try_acquire().unwrap();

        // The old permit must not clear the new owner's flag.
        drop(lost);
        assert!(flight.is_busy());
        drop(fresh);
        assert!(!flight.is_busy());
    }
}
