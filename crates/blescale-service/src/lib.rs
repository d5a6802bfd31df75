//! Control loop, exporters, and configuration for BLE smart scales.
//!
//! This crate provides a service that:
//! - Acquires readings through a local Bluetooth adapter or a remote radio
//!   reached over MQTT
//! - Attributes each reading to a household member by weight range
//! - Computes body composition and flags readings drifting toward the edge
//!   of a user's range
//! - Hands the result to every configured exporter in parallel
//! - Shows the reading and export outcome on the remote radio, when it has
//!   a display
//!
//! # Modes
//!
//! - `blescale --once`: take one reading and exit non-zero on failure
//! - `blescale --poll`: repeat single readings with `runtime.cooldown_secs`
//!   between them
//! - `blescale --continuous` (or `runtime.continuous = true`): keep one
//!   advertisement subscription open and process every reading
//!
//! # Configuration
//!
//! The service reads `~/.config/blescale/config.toml` (see [`config`] for a
//! full example). Sending `SIGHUP` reloads it; an invalid file is rejected
//! and the running configuration stays in place.
//!
//! # Exporters
//!
//! | Name | Section | Delivery |
//! |------|---------|----------|
//! | `webhook` | `[exporters.webhook]` | JSON POST |
//! | `mqtt` | `[exporters.mqtt]` | `{prefix}/{slug}/...` topics, retained |

pub mod config;
pub mod exporters;
pub mod runner;
pub mod state;

pub use config::{
    Config, ConfigError, ExportersConfig, MqttConfig, RuntimeConfig, ScaleConfig, TransportConfig,
    UserConfig, ValidationError, WebhookConfig, default_config_path,
};
pub use exporters::{
    DispatchReport, ExportContext, ExportError, ExportPayload, ExportResult, Exporter, dispatch,
};
pub use runner::{CycleError, Outcome, RunMode, Runner, open_transport};
pub use state::{AppState, StateError, TargetCache};
