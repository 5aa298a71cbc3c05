//! Transport: the single network call of a dispatch

use crate::{RelayError, Result};
use async_trait::async_trait;
use bl_common::DispatchFailure;
use bl_config::DispatchConfig;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

/// Deliver a final payload to a channel target
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `payload` to `url`. `Ok` only for a 2xx response.
    async fn post(&self, url: &str, payload: String) -> std::result::Result<(), DispatchFailure>;
}

/// Configuration for [`HttpTransport`]
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 10,
        }
    }
}

impl From<&DispatchConfig> for HttpTransportConfig {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            pool_max_idle_per_host: config.pool_max_idle_per_host,
        }
    }
}

/// reqwest-backed transport. Every non-2xx status and every transport error is a failure.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| RelayError::TransportSetup(e.to_string()))?;

        info!(
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            request_timeout_ms = config.request_timeout.as_millis() as u64,
            "HTTP transport configured"
        );
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, url: &str, payload: String) -> std::result::Result<(), DispatchFailure> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connect"
                } else {
                    "request"
                };
                DispatchFailure::Transport(format!("{} error: {}", kind, e))
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(url, status = status.as_u16(), "Target accepted payload");
            Ok(())
        } else {
            Err(DispatchFailure::HttpStatus {
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> HttpTransport {
        HttpTransport::new(HttpTransportConfig {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            pool_max_idle_per_host: 1,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_post_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(header("content-type", "application/json"))
            .and(body_string("[1,2]"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let result = transport()
            .post(&format!("{}/ingest", server.uri()), "[1,2]".to_string())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_non_2xx_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let result = transport().post(&server.uri(), "{}".to_string()).await;
        assert_eq!(result, Err(DispatchFailure::HttpStatus { status: 400 }));
    }

    #[tokio::test]
    async fn test_unreachable_target_is_transport_failure() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = transport().post(&format!("http://{}/x", addr), "{}".to_string()).await;
        assert!(matches!(result, Err(DispatchFailure::Transport(_))));
    }
}
