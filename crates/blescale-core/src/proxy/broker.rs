//! Broker connection helpers shared by the proxied transport and the
//! service's MQTT exporter.

use std::time::Duration;

use rumqttc::{MqttOptions, QoS};

/// A parsed `mqtt://` or `mqtts://` broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerUrl {
    /// Parse a broker URL, defaulting the port to 1883 (8883 for TLS).
    pub fn parse(url: &str) -> Result<Self, String> {
        let (tls, rest) = if let Some(stripped) = url.strip_prefix("mqtt://") {
            (false, stripped)
        } else if let Some(stripped) = url.strip_prefix("mqtts://") {
            (true, stripped)
        } else {
            return Err("Invalid scheme: URL must start with mqtt:// or mqtts://".to_string());
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((h, p)) => {
                let port = p.parse::<u16>().map_err(|_| format!("Invalid port: {}", p))?;
                (h.to_string(), port)
            }
            None => (rest.to_string(), if tls { 8883 } else { 1883 }),
        };

        if host.is_empty() {
            return Err("Host cannot be empty".to_string());
        }
        Ok(Self { host, port, tls })
    }
}

/// Client settings common to every broker connection.
#[derive(Debug, Clone)]
pub struct ClientSettings<'a> {
    pub broker: &'a str,
    pub client_id: &'a str,
    pub keep_alive: Duration,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
}

/// Build [`MqttOptions`] for `settings`.
pub fn mqtt_options(settings: &ClientSettings<'_>) -> Result<MqttOptions, String> {
    let url = BrokerUrl::parse(settings.broker)?;
    let mut options = MqttOptions::new(settings.client_id, url.host, url.port);
    options.set_keep_alive(settings.keep_alive);
    if let (Some(username), Some(password)) = (settings.username, settings.password) {
        options.set_credentials(username, password);
    }
    if url.tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }
    Ok(options)
}

/// Map a numeric QoS level; anything above 1 is exactly-once.
pub fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Make `s` safe as a single topic level.
pub fn sanitize_topic_segment(s: &str) -> String {
    s.replace(['#', '+', ' ', '/'], "_")
}
