//! POST each reading as JSON to an HTTP endpoint.
//!
//! The body is the [`ExportPayload`] with the user context under `user`:
//!
//! ```json
//! {
//!   "composition": { "weight": 82.4, "bmi": 25.4, ... },
//!   "timestamp": "2026-03-01T07:30:00Z",
//!   "address": "5C:CA:D3:00:00:01",
//!   "adapter": "mi-scale-2",
//!   "user": { "user_name": "Dad", "user_slug": "dad", ... }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tracing::debug;

use super::{ExportContext, ExportError, ExportPayload, ExportResult, Exporter};
use crate::config::WebhookConfig;

#[derive(Serialize)]
struct Body<'a> {
    #[serde(flatten)]
    payload: &'a ExportPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a ExportContext>,
}

/// Webhook delivery target.
#[derive(Debug)]
pub struct WebhookExporter {
    client: reqwest::Client,
    url: String,
}

impl WebhookExporter {
    pub fn new(config: WebhookConfig) -> Result<Self, ExportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| ExportError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| ExportError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            url: config.url,
        })
    }

    async fn post(&self, body: &Body<'_>) -> Result<(), ExportError> {
        let response = self.client.post(&self.url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExportError::Status {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }
        debug!(url = %self.url, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}

#[async_trait]
impl Exporter for WebhookExporter {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn export(&self, payload: &ExportPayload, context: Option<&ExportContext>) -> ExportResult {
        match self.post(&Body { payload, user: context }).await {
            Ok(()) => ExportResult::ok(),
            Err(e) => ExportResult::failed(e.to_string()),
        }
    }

    /// Any response below 500 counts as reachable.
    async fn healthcheck(&self) -> Result<(), ExportError> {
        let response = self.client.head(&self.url).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ExportError::Status {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporters::tests::{payload, profile};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve one request with `status` and hand back the raw request text.
    async fn serve_once(status: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
        });

        (url, rx)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + length
    }

    #[tokio::test]
    async fn test_posts_payload_with_user_and_headers() {
        let (url, request) = serve_once("200 OK").await;
        let mut config = WebhookConfig::new(url);
        config.headers.insert("X-Api-Key".into(), "secret".into());
        let exporter = WebhookExporter::new(config).unwrap();

        let context = ExportContext::new(profile(), None);
        let result = exporter.export(&payload(), Some(&context)).await;
        assert_eq!(result, ExportResult::ok());

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /hook HTTP/1.1"));
        assert!(request.to_lowercase().contains("x-api-key: secret"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["composition"]["weight"], 82.4);
        assert_eq!(json["adapter"], "mi-scale-2");
        assert_eq!(json["user"]["user_slug"], "dad");
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let (url, _request) = serve_once("500 Internal Server Error").await;
        let exporter = WebhookExporter::new(WebhookConfig::new(url)).unwrap();

        let result = exporter.export(&payload(), None).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        drop(listener);

        let exporter = WebhookExporter::new(WebhookConfig::new(url)).unwrap();
        let result = exporter.export(&payload(), None).await;
        assert!(!result.success);
        assert!(exporter.healthcheck().await.is_err());
    }

    #[tokio::test]
    async fn test_healthcheck_accepts_client_errors() {
        let (url, request) = serve_once("405 Method Not Allowed").await;
        let exporter = WebhookExporter::new(WebhookConfig::new(url)).unwrap();
        exporter.healthcheck().await.unwrap();
        assert!(request.await.unwrap().starts_with("HEAD /hook"));
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let mut config = WebhookConfig::new("http://localhost/hook");
        config.headers.insert("bad header".into(), "x".into());
        let err = WebhookExporter::new(config).unwrap_err();
        assert!(matches!(err, ExportError::InvalidHeader { .. }));
    }
}
