//! Service configuration.
//!
//! ```toml
//! unknown_user = "nearest"
//!
//! [scale]
//! address = "5C:CA:D3:00:00:01"
//! unit = "kg"
//!
//! [transport]
//! kind = "proxied"
//!
//! [transport.proxy]
//! broker = "mqtt://broker.lan:1883"
//! device_id = "esp32-hall"
//!
//! [runtime]
//! continuous = true
//!
//! [exporters.webhook]
//! url = "https://example.org/hooks/weight"
//!
//! [[users]]
//! name = "Dad"
//! slug = "dad"
//! height = 180.0
//! birth_date = "1980-04-12"
//! gender = "male"
//! min_weight = 75.0
//! max_weight = 95.0
//! exporters = ["webhook"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use blescale_core::proxy::broker::BrokerUrl;
use blescale_core::{ExtractOptions, ProxyConfig, TransportKind, UnknownUserStrategy, WatcherOptions};
use blescale_types::{Gender, UserProfile, WeightUnit};
use serde::{Deserialize, Serialize};
use time::Date;
use time::macros::format_description;

/// Exporter names accepted in a user's `exporters` list.
pub const EXPORTER_NAMES: &[&str] = &["webhook", "mqtt"];

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// What to do with a weight no user's range contains.
    pub unknown_user: UnknownUserStrategy,
    /// Scale selection and timeouts.
    pub scale: ScaleConfig,
    /// Which radio to use.
    pub transport: TransportConfig,
    /// Control loop settings.
    pub runtime: RuntimeConfig,
    /// Delivery targets.
    pub exporters: ExportersConfig,
    /// Household roster.
    pub users: Vec<UserConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(default_config_path())
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration, collecting every violation.
    ///
    /// This checks:
    /// - At least one user, with unique slugs
    /// - Each user's height, birth date and weight range
    /// - Exporter names in per-user allow-lists
    /// - The proxied transport's broker URL and device id
    /// - Exporter settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.scale.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.exporters.validate());

        if self.users.is_empty() {
            errors.push(ValidationError::new("users", "at least one user must be configured"));
        }
        let mut seen_slugs = HashSet::new();
        for (i, user) in self.users.iter().enumerate() {
            let prefix = format!("users[{}]", i);
            errors.extend(user.validate(&prefix));

            if !seen_slugs.insert(user.slug.to_lowercase()) {
                errors.push(ValidationError::new(
                    format!("{}.slug", prefix),
                    format!("duplicate user slug '{}'", user.slug),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Roster as profiles, skipping entries that fail validation.
    pub fn profiles(&self) -> Vec<UserProfile> {
        self.users.iter().filter_map(UserConfig::to_profile).collect()
    }

    /// Roster entry with `slug`.
    pub fn user(&self, slug: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.slug == slug)
    }

    /// Mutable roster entry with `slug`.
    pub fn user_mut(&mut self, slug: &str) -> Option<&mut UserConfig> {
        self.users.iter_mut().find(|u| u.slug == slug)
    }

    /// Options for a single acquisition.
    pub fn extract_options(&self) -> ExtractOptions {
        let mut options = ExtractOptions::new()
            .scan_timeout(self.scale.scan_timeout())
            .gatt_timeout(self.scale.gatt_timeout());
        if let Some(address) = &self.scale.address {
            options = options.address(address.clone());
        }
        if let Some(unit) = self.scale.unit {
            options = options.unit(unit);
        }
        options
    }

    /// Options for the continuous watcher.
    pub fn watcher_options(&self) -> WatcherOptions {
        let mut options = WatcherOptions::new().gatt_timeout(self.scale.gatt_timeout());
        if let Some(address) = &self.scale.address {
            options = options.address(address.clone());
        }
        if let Some(unit) = self.scale.unit {
            options = options.unit(unit);
        }
        options
    }
}

/// Scale selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleConfig {
    /// Only read from this address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Unit the scale displays, for decoders that cannot tell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<WeightUnit>,
    /// How long to wait for a recognized scale, seconds.
    pub scan_timeout_secs: u64,
    /// Bound on one GATT session, seconds.
    pub gatt_timeout_secs: u64,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            address: None,
            unit: None,
            scan_timeout_secs: 60,
            gatt_timeout_secs: 60,
        }
    }
}

impl ScaleConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn gatt_timeout(&self) -> Duration {
        Duration::from_secs(self.gatt_timeout_secs)
    }

    /// Validate scale configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(address) = &self.address
            && address.trim().is_empty()
        {
            errors.push(ValidationError::new(
                "scale.address",
                "address cannot be empty string (omit it instead)",
            ));
        }
        if self.scan_timeout_secs == 0 {
            errors.push(ValidationError::new("scale.scan_timeout_secs", "must be at least 1"));
        }
        if self.gatt_timeout_secs == 0 {
            errors.push(ValidationError::new("scale.gatt_timeout_secs", "must be at least 1"));
        }

        errors
    }
}

/// Radio selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Required when `kind = "proxied"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
}

impl TransportConfig {
    /// Validate transport configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        match (&self.kind, &self.proxy) {
            (TransportKind::Proxied, None) => {
                errors.push(ValidationError::new(
                    "transport.proxy",
                    "proxied transport requires a [transport.proxy] section",
                ));
            }
            (_, Some(proxy)) => {
                if let Err(e) = BrokerUrl::parse(&proxy.broker) {
                    errors.push(ValidationError::new(
                        "transport.proxy.broker",
                        format!("invalid broker URL '{}': {}", proxy.broker, e),
                    ));
                }
                if proxy.device_id.trim().is_empty() {
                    errors.push(ValidationError::new(
                        "transport.proxy.device_id",
                        "device id cannot be empty",
                    ));
                }
                if proxy.topic_prefix.is_empty() {
                    errors.push(ValidationError::new(
                        "transport.proxy.topic_prefix",
                        "topic prefix cannot be empty",
                    ));
                }
            }
            (TransportKind::Local, None) => {}
        }

        errors
    }
}

/// Control loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Keep one advertisement subscription open and process every reading.
    pub continuous: bool,
    /// Pause between polling cycles, seconds.
    pub cooldown_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            continuous: false,
            cooldown_secs: 30,
        }
    }
}

impl RuntimeConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Delivery targets. A missing section disables that exporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportersConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<MqttConfig>,
}

impl ExportersConfig {
    /// Names of the configured exporters.
    pub fn enabled(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.webhook.is_some() {
            names.push("webhook");
        }
        if self.mqtt.is_some() {
            names.push("mqtt");
        }
        names
    }

    /// Validate exporter configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if let Some(webhook) = &self.webhook {
            errors.extend(webhook.validate());
        }
        if let Some(mqtt) = &self.mqtt {
            errors.extend(mqtt.validate());
        }
        errors
    }
}

/// Webhook exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Endpoint receiving a JSON POST per reading.
    pub url: String,
    /// Extra request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Request timeout, seconds.
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            timeout_secs: default_webhook_timeout(),
        }
    }

    /// Validate webhook configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            errors.push(ValidationError::new(
                "exporters.webhook.url",
                format!("invalid URL '{}': must start with http:// or https://", self.url),
            ));
        }
        if self.timeout_secs == 0 {
            errors.push(ValidationError::new(
                "exporters.webhook.timeout_secs",
                "must be at least 1",
            ));
        }

        errors
    }
}

/// MQTT exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker URL (`mqtt://` or `mqtts://`).
    pub broker: String,
    /// Topics are `{topic_prefix}/{slug}/...`.
    #[serde(default = "default_mqtt_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default = "default_mqtt_qos")]
    pub qos: u8,
    #[serde(default = "default_true")]
    pub retain: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Keep-alive interval, seconds.
    #[serde(default = "default_mqtt_keep_alive")]
    pub keep_alive: u64,
}

fn default_mqtt_prefix() -> String {
    "blescale".to_string()
}

fn default_mqtt_client_id() -> String {
    "blescale-exporter".to_string()
}

fn default_mqtt_qos() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

fn default_mqtt_keep_alive() -> u64 {
    30
}

impl MqttConfig {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            topic_prefix: default_mqtt_prefix(),
            client_id: default_mqtt_client_id(),
            qos: default_mqtt_qos(),
            retain: true,
            username: None,
            password: None,
            keep_alive: default_mqtt_keep_alive(),
        }
    }

    /// Validate MQTT exporter configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = BrokerUrl::parse(&self.broker) {
            errors.push(ValidationError::new(
                "exporters.mqtt.broker",
                format!("invalid broker URL '{}': {}", self.broker, e),
            ));
        }
        if self.topic_prefix.is_empty() {
            errors.push(ValidationError::new(
                "exporters.mqtt.topic_prefix",
                "topic prefix cannot be empty",
            ));
        }
        if self.qos > 2 {
            errors.push(ValidationError::new(
                "exporters.mqtt.qos",
                format!("invalid QoS {}: must be 0, 1 or 2", self.qos),
            ));
        }
        if self.client_id.is_empty() {
            errors.push(ValidationError::new(
                "exporters.mqtt.client_id",
                "client id cannot be empty",
            ));
        }

        errors
    }
}

/// One household member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub slug: String,
    /// Centimeters.
    pub height: f64,
    /// `YYYY-MM-DD`.
    pub birth_date: String,
    pub gender: Gender,
    #[serde(default)]
    pub athlete: bool,
    pub min_weight: f64,
    pub max_weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_weight: Option<f64>,
    /// Exporters this user's readings go to; all configured ones when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exporters: Option<Vec<String>>,
}

impl UserConfig {
    /// Parsed birth date.
    pub fn birth_date(&self) -> Result<Date, time::error::Parse> {
        Date::parse(&self.birth_date, format_description!("[year]-[month]-[day]"))
    }

    /// Profile for identification and composition, `None` if the birth
    /// date does not parse.
    pub fn to_profile(&self) -> Option<UserProfile> {
        Some(UserProfile {
            name: self.name.clone(),
            slug: self.slug.clone(),
            height: self.height,
            birth_date: self.birth_date().ok()?,
            gender: self.gender,
            athlete: self.athlete,
            min_weight: self.min_weight,
            max_weight: self.max_weight,
            last_known_weight: self.last_known_weight,
        })
    }

    /// Whether readings for this user go to exporter `name`.
    pub fn allows(&self, name: &str) -> bool {
        self.exporters
            .as_ref()
            .is_none_or(|list| list.iter().any(|n| n == name))
    }

    /// Validate one roster entry.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("{}.name", prefix),
                "name cannot be empty",
            ));
        }
        if self.slug.is_empty() {
            errors.push(ValidationError::new(
                format!("{}.slug", prefix),
                "slug cannot be empty",
            ));
        } else if !self
            .slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            errors.push(ValidationError::new(
                format!("{}.slug", prefix),
                format!(
                    "slug '{}' may only contain letters, digits, '-' and '_'",
                    self.slug
                ),
            ));
        }
        if self.height <= 0.0 || !self.height.is_finite() {
            errors.push(ValidationError::new(
                format!("{}.height", prefix),
                format!("height {} must be positive", self.height),
            ));
        }
        if let Err(e) = self.birth_date() {
            errors.push(ValidationError::new(
                format!("{}.birth_date", prefix),
                format!(
                    "invalid birth date '{}' (expected YYYY-MM-DD): {}",
                    self.birth_date, e
                ),
            ));
        }
        if self.min_weight >= self.max_weight {
            errors.push(ValidationError::new(
                format!("{}.min_weight", prefix),
                format!(
                    "min_weight {} must be less than max_weight {}",
                    self.min_weight, self.max_weight
                ),
            ));
        }
        if let Some(list) = &self.exporters {
            for name in list {
                if !EXPORTER_NAMES.contains(&name.as_str()) {
                    errors.push(ValidationError::new(
                        format!("{}.exporters", prefix),
                        format!(
                            "unknown exporter '{}' (expected one of: {})",
                            name,
                            EXPORTER_NAMES.join(", ")
                        ),
                    ));
                }
            }
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `users[0].slug` or `transport.proxy.broker`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blescale")
        .join("config.toml")
}
