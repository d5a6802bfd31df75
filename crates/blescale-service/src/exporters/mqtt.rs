//! MQTT exporter.
//!
//! # Topic Structure
//!
//! - `{prefix}/{slug}/json` - Payload plus user context as JSON
//! - `{prefix}/{slug}/weight` - Weight (kg)
//! - `{prefix}/{slug}/impedance` - Impedance (ohm), when measured
//! - `{prefix}/{slug}/bmi`, `body_fat`, `water`, `muscle_mass`, `bone_mass`,
//!   `lean_mass`, `visceral_fat`, `physique_rating`, `bmr`, `metabolic_age`
//!
//! `{slug}` is the matched user's slug, or the scale address when the
//! reading has no user. All messages honor the configured QoS and retain
//! flag.
//!
//! # Reconnection
//!
//! The event loop reconnects on its own. Publishing while the broker is
//! down queues the messages in the client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use blescale_core::proxy::broker::{self, ClientSettings};
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ExportContext, ExportError, ExportPayload, ExportResult, Exporter};
use crate::config::MqttConfig;

/// Messages queued in the client before `publish` waits.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Serialize)]
struct JsonMessage<'a> {
    #[serde(flatten)]
    payload: &'a ExportPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a ExportContext>,
}

/// MQTT delivery target.
pub struct MqttExporter {
    client: AsyncClient,
    config: MqttConfig,
    qos: QoS,
    connected: Arc<AtomicBool>,
    event_loop: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MqttExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttExporter")
            .field("broker", &self.config.broker)
            .field("topic_prefix", &self.config.topic_prefix)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl MqttExporter {
    /// Create the client and start its event loop. Must be called inside a
    /// Tokio runtime.
    pub fn connect(config: MqttConfig) -> Result<Self, ExportError> {
        let options = broker::mqtt_options(&ClientSettings {
            broker: &config.broker,
            client_id: &config.client_id,
            keep_alive: Duration::from_secs(config.keep_alive),
            username: config.username.as_deref(),
            password: config.password.as_deref(),
        })
        .map_err(ExportError::Mqtt)?;

        info!(broker = %config.broker, prefix = %config.topic_prefix, "Starting MQTT exporter");
        let (client, eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_event_loop(eventloop, Arc::clone(&connected)));

        let mut exporter = Self::from_client(client, config);
        exporter.connected = connected;
        exporter.event_loop = Some(handle);
        Ok(exporter)
    }

    /// Wrap an existing client whose event loop is driven elsewhere.
    pub fn from_client(client: AsyncClient, config: MqttConfig) -> Self {
        Self {
            client,
            qos: broker::qos(config.qos),
            config,
            connected: Arc::new(AtomicBool::new(false)),
            event_loop: None,
        }
    }

    async fn publish_all(
        &self,
        payload: &ExportPayload,
        context: Option<&ExportContext>,
    ) -> Result<usize, ExportError> {
        let messages = messages(&self.config.topic_prefix, payload, context)?;
        let count = messages.len();
        for (topic, body) in messages {
            self.client
                .publish(topic, self.qos, self.config.retain, body.into_bytes())
                .await
                .map_err(|e| ExportError::Mqtt(e.to_string()))?;
        }
        Ok(count)
    }
}

impl Drop for MqttExporter {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Exporter for MqttExporter {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn export(&self, payload: &ExportPayload, context: Option<&ExportContext>) -> ExportResult {
        match self.publish_all(payload, context).await {
            Ok(count) => {
                debug!(topics = count, "Published reading to MQTT");
                ExportResult::ok()
            }
            Err(e) => ExportResult::failed(e.to_string()),
        }
    }

    async fn healthcheck(&self) -> Result<(), ExportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ExportError::Mqtt(format!(
                "not connected to {}",
                self.config.broker
            )))
        }
    }
}

async fn run_event_loop(mut eventloop: EventLoop, connected: Arc<AtomicBool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("MQTT exporter connected: {:?}", ack.code);
                connected.store(true, Ordering::SeqCst);
            }
            Ok(Event::Incoming(Packet::PingResp)) => {
                debug!("MQTT ping response received");
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                warn!("MQTT exporter connection error: {}. Reconnecting...", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// Topic/payload pairs for one reading.
pub fn messages(
    prefix: &str,
    payload: &ExportPayload,
    context: Option<&ExportContext>,
) -> Result<Vec<(String, String)>, ExportError> {
    let subject = match context {
        Some(context) => broker::sanitize_topic_segment(&context.user_slug),
        None => broker::sanitize_topic_segment(&payload.address.replace(':', "")),
    };
    let base = format!("{}/{}", prefix.trim_end_matches('/'), subject);
    let c = &payload.composition;

    let json = serde_json::to_string(&JsonMessage {
        payload,
        user: context,
    })?;
    let mut messages = vec![
        (format!("{base}/json"), json),
        (format!("{base}/weight"), format!("{:.2}", c.weight)),
    ];
    if c.impedance > 0 {
        messages.push((format!("{base}/impedance"), c.impedance.to_string()));
    }
    messages.extend([
        (format!("{base}/bmi"), format!("{:.1}", c.bmi)),
        (format!("{base}/body_fat"), format!("{:.1}", c.body_fat_percent)),
        (format!("{base}/water"), format!("{:.1}", c.water_percent)),
        (format!("{base}/muscle_mass"), format!("{:.2}", c.muscle_mass)),
        (format!("{base}/bone_mass"), format!("{:.2}", c.bone_mass)),
        (format!("{base}/lean_mass"), format!("{:.2}", c.lean_mass)),
        (format!("{base}/visceral_fat"), format!("{:.1}", c.visceral_fat)),
        (format!("{base}/physique_rating"), c.physique_rating.to_string()),
        (format!("{base}/bmr"), format!("{:.0}", c.bmr)),
        (format!("{base}/metabolic_age"), c.metabolic_age.to_string()),
    ]);
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporters::tests::{payload, profile};
    use rumqttc::MqttOptions;

    #[test]
    fn test_topics_use_user_slug() {
        let context = ExportContext::new(profile(), None);
        let messages = messages("home/scale/", &payload(), Some(&context)).unwrap();

        let topics: Vec<&str> = messages.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(topics[0], "home/scale/dad/json");
        assert!(topics.contains(&"home/scale/dad/impedance"));
        assert!(topics.contains(&"home/scale/dad/metabolic_age"));
        assert_eq!(messages.len(), 13);

        let weight = messages.iter().find(|(t, _)| t.ends_with("/weight")).unwrap();
        assert_eq!(weight.1, "82.40");
        let json: serde_json::Value = serde_json::from_str(&messages[0].1).unwrap();
        assert_eq!(json["user"]["user_name"], "Dad");
        assert_eq!(json["address"], "5C:CA:D3:00:00:01");
    }

    #[test]
    fn test_topics_without_user_or_impedance() {
        let mut payload = payload();
        payload.composition.impedance = 0;
        let messages = messages("blescale", &payload, None).unwrap();

        assert_eq!(messages[0].0, "blescale/5CCAD3000001/json");
        assert_eq!(messages.len(), 12);
        assert!(!messages.iter().any(|(t, _)| t.ends_with("/impedance")));
        let json: serde_json::Value = serde_json::from_str(&messages[0].1).unwrap();
        assert!(json.get("user").is_none());
    }

    #[tokio::test]
    async fn test_export_queues_messages() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 32);
        let exporter = MqttExporter::from_client(client, MqttConfig::new("mqtt://localhost"));

        let context = ExportContext::new(profile(), None);
        assert_eq!(exporter.export(&payload(), Some(&context)).await, ExportResult::ok());
        assert!(exporter.healthcheck().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_broker() {
        let err = MqttExporter::connect(MqttConfig::new("broker.lan:1883")).unwrap_err();
        assert!(matches!(err, ExportError::Mqtt(_)));
    }
}
