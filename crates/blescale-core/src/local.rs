//! Local radio transport backed by `btleplug`.
//!
//! Advertisements come from the adapter's central event stream; each event
//! re-reads the peripheral's properties and emits a one-item batch. Sessions
//! connect and discover services under their own timeouts and cache the
//! characteristics for lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use blescale_types::DeviceInfo;

use crate::advertisement::Advertisement;
use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::guard::PendingRelease;
use crate::retry::{RetryConfig, with_retry};
use crate::transport::{GattSession, Transport, TransportKind};
use crate::util::{create_identifier, format_peripheral_id};

/// Default timeout for connect and service discovery.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for characteristic reads and writes.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

/// Build an [`Advertisement`] from a peripheral's current properties.
async fn advertisement_for(adapter: &Adapter, id: &PeripheralId) -> Result<Option<Advertisement>> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(props) = peripheral.properties().await? else {
        return Ok(None);
    };

    let mut info = DeviceInfo::new();
    if let Some(name) = props.local_name {
        info = info.with_name(name);
    }
    for uuid in props.services {
        info = info.with_service(uuid);
    }
    for (uuid, data) in props.service_data {
        info = info.with_service_data(uuid, data);
    }
    if let Some((&company_id, data)) = props.manufacturer_data.iter().min_by_key(|(id, _)| **id) {
        info = info.with_manufacturer(company_id, data.clone());
    }

    let address = create_identifier(&props.address.to_string(), id);
    let mut advertisement = Advertisement::new(address, info);
    if let Some(rssi) = props.rssi {
        advertisement = advertisement.with_rssi(rssi);
    }
    Ok(Some(advertisement))
}

/// Best-effort disconnect of a peripheral that never became a session.
async fn release(peripheral: Peripheral) {
    match timeout(DEFAULT_IO_TIMEOUT, peripheral.disconnect()).await {
        Ok(Ok(())) => debug!("Abandoned connection closed"),
        Ok(Err(e)) => debug!("Disconnect after failed connect: {}", e),
        Err(_) => debug!("Disconnect after failed connect timed out"),
    }
}

/// Transport over a Bluetooth adapter attached to this host.
pub struct LocalTransport {
    adapter: Adapter,
    known: Arc<Mutex<HashMap<String, PeripheralId>>>,
    connect_timeout: Duration,
    io_timeout: Duration,
    retry: RetryConfig,
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("connect_timeout", &self.connect_timeout)
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

impl LocalTransport {
    /// Use the first Bluetooth adapter.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_adapter(get_adapter().await?))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            known: Arc::new(Mutex::new(HashMap::new())),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            retry: RetryConfig::for_connect(),
        }
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn peripheral_id(&self, address: &str) -> Option<PeripheralId> {
        self.known
            .lock()
            .ok()
            .and_then(|known| known.get(address).cloned())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    async fn advertisements(&self) -> Result<mpsc::Receiver<Vec<Advertisement>>> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning");

        let (tx, rx) = mpsc::channel(32);
        let adapter = self.adapter.clone();
        let known = Arc::clone(&self.known);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServiceDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };
                match advertisement_for(&adapter, &id).await {
                    Ok(Some(advertisement)) => {
                        if let Ok(mut known) = known.lock() {
                            known.insert(advertisement.address.clone(), id);
                        }
                        if tx.send(vec![advertisement]).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!(
                        id = %format_peripheral_id(&id),
                        "Skipping advertisement: {}",
                        e
                    ),
                }
            }
            if let Err(e) = adapter.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            }
            debug!("Scan stopped");
        });
        Ok(rx)
    }

    #[tracing::instrument(level = "info", skip_all, fields(address = %advertisement.address))]
    async fn connect(&self, advertisement: &Advertisement) -> Result<Box<dyn GattSession>> {
        let id = self
            .peripheral_id(&advertisement.address)
            .ok_or_else(|| Error::device_not_found(advertisement.address.clone()))?;
        let peripheral = self.adapter.peripheral(&id).await?;

        // Subscribe before connecting so an early drop is not missed.
        let mut events = self.adapter.events().await?;

        let mut pending = PendingRelease::new(release(peripheral.clone()));
        let connect_timeout = self.connect_timeout;
        pending
            .attempt(with_retry(&self.retry, "GATT connect", || async {
                match timeout(connect_timeout, peripheral.connect()).await {
                    Ok(result) => Ok(result?),
                    Err(_) => {
                        // The stack may still finish a timed-out attempt.
                        release(peripheral.clone()).await;
                        Err(Error::timeout("GATT connect", connect_timeout))
                    }
                }
            }))
            .await?;
        pending
            .attempt(async {
                timeout(connect_timeout, peripheral.discover_services())
                    .await
                    .map_err(|_| Error::timeout("GATT characteristic discovery", connect_timeout))??;
                Ok(())
            })
            .await?;
        pending.disarm();

        let characteristics: HashMap<Uuid, Characteristic> = peripheral
            .services()
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .map(|c| (c.uuid, c.clone()))
            .collect();
        debug!("Cached {} characteristics", characteristics.len());

        let (down_tx, _) = watch::channel(false);
        let down_tx = Arc::new(down_tx);
        let link_watch = {
            let down_tx = Arc::clone(&down_tx);
            let id = id.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if matches!(&event, CentralEvent::DeviceDisconnected(gone) if *gone == id) {
                        down_tx.send_replace(true);
                        break;
                    }
                }
            })
        };

        Ok(Box::new(LocalSession {
            peripheral,
            address: advertisement.address.clone(),
            characteristics,
            disconnected: down_tx,
            io_timeout: self.io_timeout,
            tasks: Mutex::new(vec![link_watch]),
        }))
    }
}

/// GATT session on the local radio.
pub struct LocalSession {
    peripheral: Peripheral,
    address: String,
    characteristics: HashMap<Uuid, Characteristic>,
    disconnected: Arc<watch::Sender<bool>>,
    io_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalSession {
    fn find(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid,
                address: self.address.clone(),
            })
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl GattSession for LocalSession {
    fn address(&self) -> &str {
        &self.address
    }

    fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.contains_key(uuid)
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<mpsc::Receiver<Vec<u8>>> {
        let characteristic = self.find(uuid)?;
        let mut stream = self.peripheral.notifications().await?;
        self.peripheral.subscribe(characteristic).await?;

        let (tx, rx) = mpsc::channel(32);
        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == uuid && tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<()> {
        let characteristic = self.find(uuid)?;
        self.peripheral.unsubscribe(characteristic).await?;
        Ok(())
    }

    async fn write(&self, uuid: Uuid, data: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.find(uuid)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        timeout(
            self.io_timeout,
            self.peripheral.write(characteristic, data, write_type),
        )
        .await
        .map_err(|_| Error::timeout(format!("GATT write to {uuid}"), self.io_timeout))??;
        Ok(())
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.find(uuid)?;
        let value = timeout(self.io_timeout, self.peripheral.read(characteristic))
            .await
            .map_err(|_| Error::timeout(format!("GATT read of {uuid}"), self.io_timeout))??;
        Ok(value)
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.subscribe()
    }

    async fn disconnect(&self) -> Result<()> {
        self.abort_tasks();
        self.disconnected.send_replace(true);
        timeout(self.io_timeout, self.peripheral.disconnect())
            .await
            .map_err(|_| Error::timeout("GATT disconnect", self.io_timeout))??;
        debug!(address = %self.address, "Disconnected");
        Ok(())
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        let leaked = self.tasks.lock().map(|t| !t.is_empty()).unwrap_or(false);
        self.abort_tasks();
        if leaked {
            warn!(address = %self.address, "GATT session dropped without disconnect");
        }
    }
}
