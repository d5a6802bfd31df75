//! Acquisition engine for BLE smart scales.
//!
//! This crate finds a scale, picks the protocol decoder that recognizes it,
//! and turns its broadcasts or GATT notifications into a [`Reading`]. The
//! radio sits behind the [`Transport`] trait, with two implementations:
//!
//! - [`LocalTransport`]: a Bluetooth adapter attached to this host (`btleplug`)
//! - [`ProxiedTransport`]: a remote radio relaying BLE over MQTT (feature `proxy`)
//!
//! # Supported Scales
//!
//! | Adapter | Protocol |
//! |---------|----------|
//! | `mi-scale-2` | Xiaomi body composition scale, broadcast |
//! | `mi-scale` | Xiaomi weight scale v1, broadcast |
//! | `qn-scale` | QN / Renpho family, GATT with periodic unlock |
//! | `yunmai` | Yunmai family, GATT |
//! | `es-cs20m` | ES-CS20M start/data/stop protocol, GATT |
//! | `standard-weight` | Bluetooth SIG Weight Scale service, GATT |
//!
//! # Modes
//!
//! - **Single shot**: [`acquire_reading`] scans until a recognized scale
//!   produces one complete reading.
//! - **Always on**: [`ContinuousWatcher`] keeps one advertisement
//!   subscription and queues every new reading.
//!
//! After a reading, [`match_user`] attributes it to a configured user and
//! [`composition::compute`] derives body composition.
//!
//! # Quick Start
//!
//! ```no_run
//! use blescale_core::{AdapterRegistry, ExtractOptions, LocalTransport, acquire_reading};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = LocalTransport::new().await?;
//!     let raw = acquire_reading(
//!         &transport,
//!         &AdapterRegistry::new(),
//!         &ExtractOptions::default(),
//!         &CancellationToken::new(),
//!         None,
//!     )
//!     .await?;
//!     println!("{} from {} ({})", raw.reading, raw.address, raw.adapter.name());
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod advertisement;
pub mod composition;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod guard;
pub mod identify;
pub mod local;
pub mod mock;
#[cfg(feature = "proxy")]
pub mod proxy;
pub mod queue;
pub mod retry;
pub mod transport;
pub mod util;
pub mod watcher;

pub use adapter::{AdapterRegistry, GattProfile, ScaleAdapter};
pub use advertisement::{AddressType, Advertisement};
pub use dedup::DedupWindow;
pub use error::{DeviceNotFoundReason, Error, Result};
pub use extract::{ExtractOptions, ProgressFn, RawReading, acquire_reading, read_via_gatt};
pub use guard::{PendingRelease, SessionGuard};
pub use identify::{MatchResult, MatchTier, UnknownUserStrategy, detect_drift, match_user};
pub use local::LocalTransport;
#[cfg(feature = "proxy")]
pub use proxy::{ProxiedTransport, ProxyConfig, RemoteStatus};
pub use queue::ReadingQueue;
pub use retry::{Backoff, RetryConfig, with_retry};
pub use transport::{
    Beep, DisplayReading, DisplayResult, ExportStatus, GattSession, RemoteConfig,
    RemoteFeedback, RemoteUser, Transport, TransportKind,
};
pub use watcher::{ContinuousWatcher, SingleFlight, WatcherOptions};

pub use blescale_types;
pub use blescale_types::{
    BodyComposition, DeviceInfo, Gender, Reading, UserProfile, WeightUnit, uuids,
};
