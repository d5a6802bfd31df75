//! Error types for blescale-core.
//!
//! Every variant names the step that failed and, where it applies, the
//! device address and adapter involved, so an operator can tell "wrong
//! protocol assumed" apart from "radio unreachable" and "scale out of range".
//!
//! # Recovery
//!
//! | Error | Strategy |
//! |-------|----------|
//! | [`Error::Timeout`] | Retry with backoff |
//! | [`Error::Bluetooth`] | Retry with backoff |
//! | [`Error::DeviceNotFound`] | Retry (scale idle or out of range), except `NoAdapter` |
//! | [`Error::DeviceDisconnectedUnexpectedly`] | Retry; the user may step on again |
//! | [`Error::TransportUnreachable`] | Retry; broker or radio may come back |
//! | [`Error::RemoteRadioOffline`] | Retry; the remote radio reconnects on its own |
//! | [`Error::RemoteRadioError`] | Retry; the text is relayed verbatim from the remote side |
//! | [`Error::AdapterNotMatched`] | Do not retry; no decoder for this device |
//! | [`Error::AdapterCharacteristicsMissing`] | Do not retry; protocol variant unsupported |
//! | [`Error::MalformedAdvertisement`] | Skip the advertisement and keep listening |
//! | [`Error::InvalidConfig`] | Fatal at startup |
//! | [`Error::Cancelled`] | Stop; never retried |

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while acquiring a reading from a scale.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error from the local radio stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No advertisement matched within the discovery window.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// A device was seen but no registered adapter recognizes it.
    #[error("No adapter recognizes device {address} (name: {})", .name.as_deref().unwrap_or("<none>"))]
    AdapterNotMatched {
        /// Address of the unrecognized device.
        address: String,
        /// Advertised name, if any.
        name: Option<String>,
    },

    /// The GATT session lacks the characteristics the adapter requires.
    #[error("Adapter '{adapter}' found no usable characteristic on {address} (looked for {})", format_uuids(.wanted))]
    AdapterCharacteristicsMissing {
        /// Adapter name.
        adapter: String,
        /// Device address.
        address: String,
        /// Characteristics that were looked for.
        wanted: Vec<Uuid>,
    },

    /// A characteristic used by a session operation does not exist.
    #[error("Characteristic {uuid} not found on {address}")]
    CharacteristicNotFound {
        /// The characteristic UUID.
        uuid: Uuid,
        /// Device address.
        address: String,
    },

    /// The device dropped the connection before the reading completed.
    #[error("Device {address} disconnected before the measurement completed")]
    DeviceDisconnectedUnexpectedly {
        /// Device address.
        address: String,
    },

    /// The broker or radio could not be reached.
    #[error("{transport} transport unreachable: {reason}")]
    TransportUnreachable {
        /// Transport name (`local` or `proxied`).
        transport: String,
        /// Why it is unreachable.
        reason: String,
    },

    /// The remote radio reported itself offline.
    #[error("Remote radio '{device_id}' is offline")]
    RemoteRadioOffline {
        /// Remote radio device id.
        device_id: String,
    },

    /// Failure text relayed from the remote radio.
    #[error("Remote radio error: {0}")]
    RemoteRadioError(String),

    /// A step did not finish in time.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The step that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// An advertisement or frame could not be decoded.
    #[error("Malformed advertisement: {0}")]
    MalformedAdvertisement(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A message for the remote radio could not be encoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reason why no device was found.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// No Bluetooth adapter available.
    NoAdapter,
    /// Device with the configured address not seen.
    NotFound { identifier: String },
    /// Discovery window elapsed without a recognized scale.
    ScanTimeout { duration: Duration },
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::ScanTimeout { duration } => {
                write!(f, "no recognized scale advertised within {:?}", duration)
            }
        }
    }
}

fn format_uuids(uuids: &[Uuid]) -> String {
    uuids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a transport-unreachable error.
    pub fn unreachable(transport: impl Into<String>, reason: impl ToString) -> Self {
        Self::TransportUnreachable {
            transport: transport.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether the control loop should retry after this error.
    ///
    /// Cancellation and configuration errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Bluetooth(_) => true,
            Error::DeviceNotFound(reason) => {
                !matches!(reason, DeviceNotFoundReason::NoAdapter)
            }
            Error::DeviceDisconnectedUnexpectedly { .. } => true,
            Error::TransportUnreachable { .. } => true,
            Error::RemoteRadioOffline { .. } => true,
            Error::RemoteRadioError(_) => true,
            Error::Io(_) => true,
            Error::AdapterNotMatched { .. } => false,
            Error::AdapterCharacteristicsMissing { .. } => false,
            Error::CharacteristicNotFound { .. } => false,
            Error::MalformedAdvertisement(_) => false,
            Error::InvalidConfig(_) => false,
            Error::Json(_) => false,
            Error::Cancelled => false,
        }
    }
}

impl From<blescale_types::ParseError> for Error {
    fn from(err: blescale_types::ParseError) -> Self {
        Error::MalformedAdvertisement(err.to_string())
    }
}

/// Result type alias using blescale-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use blescale_types::uuids;

    #[test]
    fn test_error_display_names_step_and_device() {
        let err = Error::timeout("GATT connect", Duration::from_secs(30));
        assert_eq!(err.to_string(), "Operation 'GATT connect' timed out after 30s");

        let err = Error::AdapterCharacteristicsMissing {
            adapter: "qn-scale".into(),
            address: "AA:BB:CC:DD:EE:FF".into(),
            wanted: vec![uuids::QN_NOTIFY, uuids::QN_ALT_NOTIFY],
        };
        let msg = err.to_string();
        assert!(msg.contains("qn-scale"));
        assert!(msg.contains("AA:BB:CC:DD:EE:FF"));
        assert!(msg.contains("0000ffe1-0000-1000-8000-00805f9b34fb"));

        let err = Error::AdapterNotMatched {
            address: "11:22:33:44:55:66".into(),
            name: None,
        };
        assert!(err.to_string().contains("<none>"));
    }

    #[test]
    fn test_remote_error_is_verbatim() {
        let err = Error::RemoteRadioError("Busy: another BLE operation is in progress".into());
        assert_eq!(
            err.to_string(),
            "Remote radio error: Busy: another BLE operation is in progress"
        );
    }

    #[test]
    fn test_device_not_found_reasons() {
        let err = Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter);
        assert!(err.to_string().contains("no Bluetooth adapter"));

        let err = Error::DeviceNotFound(DeviceNotFoundReason::ScanTimeout {
            duration: Duration::from_secs(30),
        });
        assert!(err.to_string().contains("30s"));

        let err = Error::device_not_found("AA:BB");
        assert!(err.to_string().contains("AA:BB"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::timeout("scan", Duration::from_secs(1)).is_retryable());
        assert!(Error::unreachable("proxied", "connection refused").is_retryable());
        assert!(
            Error::DeviceNotFound(DeviceNotFoundReason::ScanTimeout {
                duration: Duration::from_secs(1)
            })
            .is_retryable()
        );
        assert!(!Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::invalid_config("bad").is_retryable());
        assert!(
            !Error::AdapterNotMatched {
                address: "x".into(),
                name: None
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: Error = blescale_types::ParseError::InsufficientBytes {
            expected: 13,
            actual: 4,
        }
        .into();
        assert!(matches!(err, Error::MalformedAdvertisement(_)));
        assert!(err.to_string().contains("13"));
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
