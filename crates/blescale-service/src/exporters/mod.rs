//! Delivery targets for finished readings.
//!
//! Every configured [`Exporter`] receives each attributed reading. Targets
//! run concurrently and fail independently; see [`dispatch`].

use std::sync::Arc;

use async_trait::async_trait;
use blescale_core::ExportStatus;
use blescale_types::{BodyComposition, UserProfile};
use futures::future::join_all;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::ExportersConfig;

#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod webhook;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttExporter;
pub use webhook::WebhookExporter;

/// What every exporter receives.
#[derive(Debug, Clone, Serialize)]
pub struct ExportPayload {
    pub composition: BodyComposition,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Scale address.
    pub address: String,
    /// Adapter that decoded the reading.
    pub adapter: String,
}

/// Who the reading belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct ExportContext {
    pub user_name: String,
    pub user_slug: String,
    pub profile: UserProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift_warning: Option<String>,
}

impl ExportContext {
    pub fn new(profile: UserProfile, drift_warning: Option<String>) -> Self {
        Self {
            user_name: profile.name.clone(),
            user_slug: profile.slug.clone(),
            profile,
            drift_warning,
        }
    }
}

/// Outcome of one export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportResult {
    pub success: bool,
    pub error: Option<String>,
}

impl ExportResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Errors building or probing an exporter.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("Invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Exporter '{0}' is not available in this build")]
    Unsupported(&'static str),
}

/// A delivery target.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Name used in per-user allow-lists and remote feedback.
    fn name(&self) -> &'static str;

    /// Deliver one reading. Failures are reported, never raised.
    async fn export(&self, payload: &ExportPayload, context: Option<&ExportContext>) -> ExportResult;

    /// Check that the target is reachable.
    async fn healthcheck(&self) -> Result<(), ExportError> {
        Ok(())
    }
}

/// Per-target outcomes of one [`dispatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub statuses: Vec<ExportStatus>,
}

impl DispatchReport {
    /// True when there were targets and every one of them failed.
    pub fn all_failed(&self) -> bool {
        !self.statuses.is_empty() && self.statuses.iter().all(|s| !s.ok)
    }

    pub fn succeeded(&self) -> usize {
        self.statuses.iter().filter(|s| s.ok).count()
    }
}

/// Run every exporter concurrently and log each outcome.
pub async fn dispatch(
    exporters: &[Arc<dyn Exporter>],
    payload: &ExportPayload,
    context: Option<&ExportContext>,
) -> DispatchReport {
    if exporters.is_empty() {
        info!(
            weight = payload.composition.weight,
            "No exporters configured; reading logged only"
        );
        return DispatchReport::default();
    }

    let results = join_all(
        exporters
            .iter()
            .map(|exporter| async move { (exporter.name(), exporter.export(payload, context).await) }),
    )
    .await;

    let statuses = results
        .into_iter()
        .map(|(name, result)| {
            if result.success {
                info!(exporter = name, "Export succeeded");
            } else {
                warn!(
                    exporter = name,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Export failed"
                );
            }
            ExportStatus {
                name: name.to_string(),
                ok: result.success,
            }
        })
        .collect();

    DispatchReport { statuses }
}

/// Build every exporter configured in `config`.
pub fn build(config: &ExportersConfig) -> Result<Vec<Arc<dyn Exporter>>, ExportError> {
    let mut exporters: Vec<Arc<dyn Exporter>> = Vec::new();
    if let Some(webhook) = &config.webhook {
        exporters.push(Arc::new(WebhookExporter::new(webhook.clone())?));
    }
    if let Some(_mqtt) = &config.mqtt {
        #[cfg(feature = "mqtt")]
        exporters.push(Arc::new(MqttExporter::connect(_mqtt.clone())?));
        #[cfg(not(feature = "mqtt"))]
        return Err(ExportError::Unsupported("mqtt"));
    }
    Ok(exporters)
}
