//! Extraction: from advertisements to one finished [`Reading`].
//!
//! [`acquire_reading`] scans until a registered adapter recognizes a device,
//! then either decodes the advertisement directly or drives a GATT session
//! through [`read_via_gatt`]: subscribe, write the unlock command (repeating
//! it if the adapter asks), feed every frame to the adapter, and stop at the
//! first complete reading. The session is released on every exit path.

use std::sync::Arc;
use std::time::Duration;

use blescale_types::{Reading, WeightUnit};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterRegistry, ScaleAdapter};
use crate::advertisement::Advertisement;
use crate::error::{Error, Result};
use crate::guard::SessionGuard;
use crate::transport::{GattSession, Transport};

/// Default discovery window.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on one GATT session, connect included.
pub const DEFAULT_GATT_TIMEOUT: Duration = Duration::from_secs(60);

/// Called with every intermediate reading (already in kilograms).
pub type ProgressFn = Arc<dyn Fn(&Reading) + Send + Sync>;

/// Knobs for one acquisition.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Only consider this address.
    pub address: Option<String>,
    /// How long to wait for a recognized device.
    pub scan_timeout: Duration,
    /// Bound on connect plus the whole GATT exchange.
    pub gatt_timeout: Duration,
    /// Unit to assume for adapters that do not normalize, instead of the
    /// unit the adapter reports.
    pub unit: Option<WeightUnit>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            address: None,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            gatt_timeout: DEFAULT_GATT_TIMEOUT,
            unit: None,
        }
    }
}

impl ExtractOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    #[must_use]
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
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

    fn wants(&self, advertisement: &Advertisement) -> bool {
        self.address
            .as_deref()
            .is_none_or(|a| advertisement.address_matches(a))
    }
}

/// A finished reading plus the adapter that produced it.
#[derive(Debug)]
pub struct RawReading {
    /// Weight in kilograms and impedance.
    pub reading: Reading,
    /// Adapter instance, kept for [`ScaleAdapter::compute_metrics`].
    pub adapter: Box<dyn ScaleAdapter>,
    /// Device address.
    pub address: String,
}

/// Convert `reading` to kilograms unless the adapter already did.
pub(crate) fn normalize(
    adapter: &dyn ScaleAdapter,
    reading: Reading,
    unit: Option<WeightUnit>,
) -> Reading {
    if adapter.normalizes_weight() {
        reading
    } else {
        reading.normalized_from(unit.unwrap_or_else(|| adapter.unit()))
    }
}

/// Remembers what discovery saw, to pick the right error when it times out.
#[derive(Debug, Default)]
struct ScanOutcome {
    settling: Option<(String, &'static str)>,
    unrecognized: Option<(String, Option<String>)>,
}

impl ScanOutcome {
    fn into_error(self, options: &ExtractOptions) -> Error {
        if let Some((address, adapter)) = self.settling {
            return Error::timeout(
                format!("waiting for a stable {adapter} broadcast from {address}"),
                options.scan_timeout,
            );
        }
        if let Some((address, name)) = self.unrecognized {
            return Error::AdapterNotMatched { address, name };
        }
        match &options.address {
            Some(address) => Error::device_not_found(address.clone()),
            None => Error::DeviceNotFound(crate::error::DeviceNotFoundReason::ScanTimeout {
                duration: options.scan_timeout,
            }),
        }
    }
}

/// Scan for a recognized scale and return its next complete reading.
///
/// Broadcast scales are decoded straight from their advertisements; no
/// connection is made. GATT scales are read through [`read_via_gatt`].
#[tracing::instrument(
    level = "info",
    skip_all,
    fields(transport = %transport.kind(), address = options.address.as_deref().unwrap_or("any"))
)]
pub async fn acquire_reading(
    transport: &dyn Transport,
    registry: &AdapterRegistry,
    options: &ExtractOptions,
    cancel: &CancellationToken,
    progress: Option<ProgressFn>,
) -> Result<RawReading> {
    let mut adverts = transport.advertisements().await?;
    let deadline = Instant::now() + options.scan_timeout;
    let mut outcome = ScanOutcome::default();

    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep_until(deadline) => return Err(outcome.into_error(options)),
            batch = adverts.recv() => match batch {
                Some(batch) => batch,
                None => {
                    return Err(Error::unreachable(
                        transport.kind().to_string(),
                        "advertisement stream ended",
                    ));
                }
            },
        };

        for advertisement in batch {
            if !options.wants(&advertisement) {
                continue;
            }
            let Some(adapter) = registry.match_device(&advertisement.info) else {
                if options.address.is_some() {
                    outcome.unrecognized = Some((
                        advertisement.address.clone(),
                        advertisement.info.name.clone(),
                    ));
                }
                continue;
            };

            if let Some(reading) = adapter.parse_broadcast(&advertisement.info) {
                let reading = normalize(adapter.as_ref(), reading, options.unit);
                if let Some(progress) = &progress {
                    progress(&reading);
                }
                info!(
                    address = %advertisement.address,
                    adapter = adapter.name(),
                    "Broadcast reading: {}",
                    reading
                );
                return Ok(RawReading {
                    reading,
                    adapter,
                    address: advertisement.address,
                });
            }

            if adapter.gatt().is_some() {
                // Stop scanning before connecting; some stacks refuse both at once.
                drop(adverts);
                return read_via_gatt(transport, &advertisement, adapter, options, cancel, progress)
                    .await;
            }

            debug!(
                address = %advertisement.address,
                adapter = adapter.name(),
                "Broadcast scale seen, waiting for a stable reading"
            );
            outcome.settling = Some((advertisement.address.clone(), adapter.name()));
        }
    }
}

/// Connect to `advertisement` and drive `adapter` to a complete reading.
///
/// Connect and the whole exchange share `options.gatt_timeout`. The session
/// is released exactly once whatever the outcome.
#[tracing::instrument(
    level = "info",
    skip_all,
    fields(address = %advertisement.address, adapter = adapter.name())
)]
pub async fn read_via_gatt(
    transport: &dyn Transport,
    advertisement: &Advertisement,
    mut adapter: Box<dyn ScaleAdapter>,
    options: &ExtractOptions,
    cancel: &CancellationToken,
    progress: Option<ProgressFn>,
) -> Result<RawReading> {
    let deadline = Instant::now() + options.gatt_timeout;
    let address = advertisement.address.clone();

    let session = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        connected = timeout_at(deadline, transport.connect(advertisement)) => connected
            .map_err(|_| Error::timeout(format!("GATT connect to {address}"), options.gatt_timeout))??,
    };
    info!("Connected");

    let guard = SessionGuard::new(session);
    let result = timeout_at(
        deadline,
        run_session(&guard, adapter.as_mut(), options.unit, cancel, progress.as_ref()),
    )
    .await
    .map_err(|_| Error::timeout(format!("GATT session with {address}"), options.gatt_timeout))
    .and_then(|r| r);
    guard.release().await;

    let reading = result?;
    info!("GATT reading: {}", reading);
    Ok(RawReading {
        reading,
        adapter,
        address,
    })
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn link_lost(link: &mut watch::Receiver<bool>) {
    loop {
        if *link.borrow_and_update() {
            return;
        }
        if link.changed().await.is_err() {
            return;
        }
    }
}

/// Why a session ended early: the radio's own error, or a plain drop.
fn link_error(session: &dyn GattSession, address: String) -> Error {
    session
        .failure()
        .unwrap_or(Error::DeviceDisconnectedUnexpectedly { address })
}

async fn run_session(
    guard: &SessionGuard,
    adapter: &mut dyn ScaleAdapter,
    unit: Option<WeightUnit>,
    cancel: &CancellationToken,
    progress: Option<&ProgressFn>,
) -> Result<Reading> {
    adapter.reset();
    let session = guard.session();
    let address = session.address().to_string();

    let profile = adapter.gatt().ok_or_else(|| Error::AdapterCharacteristicsMissing {
        adapter: adapter.name().to_string(),
        address: address.clone(),
        wanted: Vec::new(),
    })?;
    let resolved = profile
        .resolve(|uuid| session.has_characteristic(uuid))
        .ok_or_else(|| Error::AdapterCharacteristicsMissing {
            adapter: adapter.name().to_string(),
            address: address.clone(),
            wanted: profile.notify_candidates(),
        })?;

    let mut frames = guard.subscribe(resolved.notify).await?;
    let mut link = session.disconnected();

    let unlock = match (&profile.unlock, resolved.write) {
        (Some(command), Some(write)) => Some((command.as_slice(), write)),
        (Some(_), None) => {
            warn!(
                adapter = adapter.name(),
                "No write characteristic for the unlock command, continuing without it"
            );
            None
        }
        _ => None,
    };

    if let Some((command, write)) = unlock {
        session
            .write(write, command, profile.write_with_response)
            .await?;
    }
    let mut ticker = match (unlock, profile.unlock_interval) {
        (Some(_), Some(period)) => {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(ticker)
        }
        _ => None,
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    return Err(link_error(session, address));
                };
                debug!(len = frame.len(), "Notification frame");
                let Some(reading) = adapter.parse_notification(resolved.notify, &frame) else {
                    continue;
                };
                let reading = normalize(adapter, reading, unit);
                if let Some(progress) = progress {
                    progress(&reading);
                }
                if adapter.is_complete(&reading) {
                    return Ok(reading);
                }
            }
            _ = link_lost(&mut link) => {
                return Err(link_error(session, address));
            }
            _ = tick(&mut ticker) => {
                if let Some((command, write)) = unlock
                    && let Err(e) = session.write(write, command, profile.write_with_response).await
                {
                    debug!("Unlock write failed: {}", e);
                }
            }
        }
    }
}
