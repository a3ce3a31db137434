//! HTTP liveness/readiness checker.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode, redirect};
use tracing::debug;

use super::{HealthChecker, HealthResult, HealthStatus};
use crate::config::EndpointConfig;
use crate::{Error, Result};

/// User agent sent with every health request
pub const USER_AGENT: &str = concat!("identity-mesh-health/", env!("CARGO_PKG_VERSION"));

/// Response bytes kept in `details.response_body`
const MAX_BODY_BYTES: usize = 1024;

/// Checks `<base_url><live_path>` and `<base_url><ready_path>`.
///
/// `200` is healthy, `503` unhealthy, anything else unknown.
#[derive(Debug, Clone)]
pub struct HttpHealthChecker {
    component: String,
    base_url: String,
    live_path: String,
    ready_path: String,
    client: Client,
}

impl HttpHealthChecker {
    /// Checker for `component` at `base_url` with default paths
    pub fn new(
        component: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Self::build(
            component.into(),
            base_url.into(),
            "/live".into(),
            "/ready".into(),
            &BTreeMap::new(),
            timeout,
        )
    }

    /// Checker for a configured endpoint
    pub fn from_endpoint(
        component: impl Into<String>,
        endpoint: &EndpointConfig,
        timeout: Duration,
    ) -> Result<Self> {
        Self::build(
            component.into(),
            endpoint.base_url(),
            endpoint.live_path.clone(),
            endpoint.ready_path.clone(),
            &endpoint.headers,
            timeout,
        )
    }

    fn build(
        component: String,
        base_url: String,
        live_path: String,
        ready_path: String,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        if component.trim().is_empty() {
            return Err(Error::validation("component_name", "must not be empty"));
        }
        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::validation("health.headers", format!("{name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::validation("health.headers", format!("{name}: {e}")))?;
            default_headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .user_agent(USER_AGENT)
            .default_headers(default_headers)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create health HTTP client: {e}")))?;

        Ok(Self {
            component,
            base_url: base_url.trim_end_matches('/').to_owned(),
            live_path,
            ready_path,
            client,
        })
    }

    /// Checked base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check_path(&self, path: &str) -> Result<HealthResult> {
        let url = format!("{}{path}", self.base_url);
        let started = Instant::now();
        let mut response = self.client.get(&url).send().await?;
        let status = response.status();
        let content_length = response.content_length();

        let mut body = Vec::new();
        while body.len() < MAX_BODY_BYTES {
            match response.chunk().await? {
                Some(chunk) => body.extend_from_slice(&chunk),
                None => break,
            }
        }
        body.truncate(MAX_BODY_BYTES);
        let elapsed = started.elapsed();

        let (health, message) = match status {
            StatusCode::OK => (HealthStatus::Healthy, "Endpoint healthy".to_owned()),
            StatusCode::SERVICE_UNAVAILABLE => {
                (HealthStatus::Unhealthy, "Endpoint unavailable".to_owned())
            }
            other => (
                HealthStatus::Unknown,
                format!("Unexpected status {}", other.as_u16()),
            ),
        };
        debug!(
            component = %self.component,
            url = %url,
            status = status.as_u16(),
            "Health endpoint answered"
        );

        let mut result = HealthResult::new(&self.component, health, message)
            .with_response_time(elapsed)
            .with_detail("url", url)
            .with_detail("status_code", status.as_u16())
            .with_detail("response_body", String::from_utf8_lossy(&body).into_owned());
        if let Some(length) = content_length {
            result = result.with_detail("content_length", length);
        }
        Ok(result)
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    fn component_name(&self) -> &str {
        &self.component
    }

    /// Liveness and readiness combined; both must be healthy
    async fn check_health(&self) -> Result<HealthResult> {
        let started = Instant::now();
        let (live, ready) = futures::join!(self.check_liveness(), self.check_readiness());
        let elapsed = started.elapsed();

        let (live, ready) = match (live, ready) {
            (Ok(live), Ok(ready)) => (live, ready),
            (live, ready) => {
                let describe = |r: &Result<HealthResult>| match r {
                    Ok(result) => result.status.to_string(),
                    Err(e) => e.to_string(),
                };
                let mut result = HealthResult::new(
                    &self.component,
                    HealthStatus::Unhealthy,
                    format!(
                        "Health check failed: liveness: {}, readiness: {}",
                        describe(&live),
                        describe(&ready)
                    ),
                )
                .with_response_time(elapsed);
                for (kind, outcome) in [("liveness", &live), ("readiness", &ready)] {
                    result = match outcome {
                        Ok(r) => result
                            .with_detail(&format!("{kind}_status"), r.status.as_str())
                            .with_detail(kind, serde_json::Value::Object(r.details.clone())),
                        Err(e) => result.with_detail(&format!("{kind}_error"), e.to_string()),
                    };
                }
                return Ok(result);
            }
        };

        let (status, message) = match (live.status, ready.status) {
            (HealthStatus::Healthy, HealthStatus::Healthy) => {
                (HealthStatus::Healthy, "Component is healthy and ready")
            }
            (HealthStatus::Unknown, _) | (_, HealthStatus::Unknown) => {
                (HealthStatus::Unknown, "Component health could not be determined")
            }
            _ => (HealthStatus::Unhealthy, "Component is not fully healthy"),
        };

        let details = |r: &HealthResult| serde_json::Value::Object(r.details.clone());
        Ok(HealthResult::new(&self.component, status, message)
            .with_response_time(elapsed)
            .with_detail("liveness", details(&live))
            .with_detail("readiness", details(&ready)))
    }

    async fn check_liveness(&self) -> Result<HealthResult> {
        self.check_path(&self.live_path).await
    }

    async fn check_readiness(&self) -> Result<HealthResult> {
        self.check_path(&self.ready_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    // ─── helpers ─────────────────────────────────────────────────────────────

    /// Minimal HTTP/1.1 responder: `path -> (status line, body)`. A `DROP`
    /// status closes the connection without answering.
    async fn serve(routes: Vec<(&'static str, &'static str, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0_u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_owned();
                    let (status, body) = routes
                        .iter()
                        .find(|(p, _, _)| *p == path)
                        .map_or(("404 Not Found", String::new()), |(_, s, b)| (*s, b.clone()));
                    if status == DROP {
                        return;
                    }
                    let response = format!(
                        "HTTP/1.1 {status}\r\ncontent-length: {}\r\n\
                         connection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    const DROP: &str = "DROP";

    fn checker(base: &str) -> HttpHealthChecker {
        HttpHealthChecker::new("agent", base, Duration::from_secs(2)).unwrap()
    }

    // ─── Status mapping ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn live_and_ready_200_is_healthy() {
        let base = serve(vec![
            ("/live", "200 OK", "ok".into()),
            ("/ready", "200 OK", "ok".into()),
        ])
        .await;
        let result = checker(&base).check_health().await.unwrap();
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.message, "Component is healthy and ready");
        assert_eq!(result.details["readiness"]["status_code"], 200);
    }

    #[tokio::test]
    async fn ready_503_is_unhealthy() {
        let base = serve(vec![
            ("/live", "200 OK", "ok".into()),
            ("/ready", "503 Service Unavailable", "warming up".into()),
        ])
        .await;
        let c = checker(&base);

        let ready = c.check_readiness().await.unwrap();
        assert_eq!(ready.status, HealthStatus::Unhealthy);
        assert_eq!(ready.details["response_body"], "warming up");

        let result = c.check_health().await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.message, "Component is not fully healthy");
    }

    #[tokio::test]
    async fn unexpected_status_is_unknown_and_body_is_truncated() {
        let base = serve(vec![("/live", "500 Internal Server Error", "x".repeat(4096))]).await;
        let live = checker(&base).check_liveness().await.unwrap();
        assert_eq!(live.status, HealthStatus::Unknown);
        assert_eq!(live.details["status_code"], 500);
        assert_eq!(
            live.details["response_body"].as_str().unwrap().len(),
            MAX_BODY_BYTES
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unhealthy_with_both_errors() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = checker(&format!("http://{addr}")).check_health().await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.message.starts_with("Health check failed: liveness: "));
        assert!(result.message.contains("readiness: "));
        assert!(result.details["liveness_error"].as_str().is_some());
        assert!(result.details["readiness_error"].as_str().is_some());
        assert!(!result.details.contains_key("liveness_status"));
    }

    #[tokio::test]
    async fn failed_readiness_keeps_liveness_details() {
        // GIVEN: /live answers, /ready hangs up without a response
        let base = serve(vec![
            ("/live", "200 OK", "alive".into()),
            ("/ready", DROP, String::new()),
        ])
        .await;

        // WHEN: the combined check runs
        let result = checker(&base).check_health().await.unwrap();

        // THEN: the answered endpoint's details survive next to the error
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.details["liveness_status"], "healthy");
        assert_eq!(result.details["liveness"]["status_code"], 200);
        assert_eq!(result.details["liveness"]["response_body"], "alive");
        assert!(result.details["readiness_error"].as_str().is_some());
        assert!(!result.details.contains_key("readiness"));
    }

    #[test]
    fn invalid_custom_header_is_rejected() {
        let endpoint = EndpointConfig {
            address: "127.0.0.1:8080".into(),
            headers: BTreeMap::from([("bad header".to_owned(), "v".to_owned())]),
            ..EndpointConfig::default()
        };
        let err = HttpHealthChecker::from_endpoint("agent", &endpoint, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "health.headers", .. }));
    }
}
