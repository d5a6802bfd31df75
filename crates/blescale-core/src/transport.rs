//! Transport abstraction shared by the local radio and the proxied radio.
//!
//! A [`Transport`] produces batches of [`Advertisement`]s and opens
//! [`GattSession`]s on demand. Everything above this module (extraction,
//! the watcher) is written against these traits only.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::advertisement::Advertisement;
use crate::error::{Error, Result};

/// Which radio a transport drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Bluetooth adapter attached to this host.
    #[default]
    Local,
    /// Remote radio relayed over an MQTT broker.
    Proxied,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Local => write!(f, "local"),
            TransportKind::Proxied => write!(f, "proxied"),
        }
    }
}

/// Source of advertisements and GATT sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which radio this is.
    fn kind(&self) -> TransportKind;

    /// Start discovery. Batches arrive in order; dropping the receiver
    /// stops the scan.
    async fn advertisements(&self) -> Result<mpsc::Receiver<Vec<Advertisement>>>;

    /// Open a GATT session to the advertised device.
    async fn connect(&self, advertisement: &Advertisement) -> Result<Box<dyn GattSession>>;

    /// Device-local feedback channel, when the radio has one.
    fn feedback(&self) -> Option<&dyn RemoteFeedback> {
        None
    }
}

/// A connected GATT session.
///
/// Callers must finish with [`GattSession::disconnect`]; [`SessionGuard`]
/// does that on every exit path.
///
/// [`SessionGuard`]: crate::guard::SessionGuard
#[async_trait]
pub trait GattSession: Send + Sync {
    /// Address of the connected device.
    fn address(&self) -> &str;

    /// Whether service discovery found `uuid`.
    fn has_characteristic(&self, uuid: &Uuid) -> bool;

    /// Subscribe to notifications on `uuid`. Each frame arrives as one item.
    async fn subscribe(&self, uuid: Uuid) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Stop notifications on `uuid`.
    async fn unsubscribe(&self, uuid: Uuid) -> Result<()>;

    /// Write `data` to `uuid`.
    async fn write(&self, uuid: Uuid, data: &[u8], with_response: bool) -> Result<()>;

    /// Read the current value of `uuid`.
    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>>;

    /// Flips to `true` once the link drops, for any reason.
    fn disconnected(&self) -> watch::Receiver<bool>;

    /// The error that ended the session, when the radio reported one.
    fn failure(&self) -> Option<Error> {
        None
    }

    /// Close the link.
    async fn disconnect(&self) -> Result<()>;
}

/// Tone played by the remote radio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Beep {
    pub freq: u32,
    pub duration: u32,
    pub repeat: u32,
}

impl Default for Beep {
    fn default() -> Self {
        Self {
            freq: 1000,
            duration: 100,
            repeat: 1,
        }
    }
}

/// Summary of a roster entry pushed to the remote radio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub slug: String,
    pub name: String,
    pub min_weight: f64,
    pub max_weight: f64,
}

/// Retained configuration for the remote radio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Known scale addresses.
    pub scales: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<RemoteUser>,
}

/// Shown when a reading has been attributed, before export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayReading {
    pub slug: String,
    pub name: String,
    pub weight: f64,
    pub impedance: u32,
    pub exporters: Vec<String>,
}

/// Outcome of one exporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStatus {
    pub name: String,
    pub ok: bool,
}

/// Shown after export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayResult {
    pub slug: String,
    pub name: String,
    pub weight: f64,
    pub exports: Vec<ExportStatus>,
}

/// Feedback published to a remote radio that has a speaker or display.
#[async_trait]
pub trait RemoteFeedback: Send + Sync {
    async fn publish_config(&self, config: &RemoteConfig) -> Result<()>;
    async fn beep(&self, beep: Beep) -> Result<()>;
    async fn display_reading(&self, reading: &DisplayReading) -> Result<()>;
    async fn display_result(&self, result: &DisplayResult) -> Result<()>;
}
