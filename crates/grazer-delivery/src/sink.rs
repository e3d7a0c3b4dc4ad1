// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The remote end of the delivery path.
//!
//! [`DeliverySink`] is the seam the pool pushes payloads through; [`HecSink`]
//! is its HTTP event collector implementation. The sink does not retry: a
//! timeout, a connection failure and a non-success status all come back as a
//! [`DeliveryOutcome::Failed`] for the caller to aggregate.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;
use tracing::{debug, error};

use crate::errors::{DeliveryFailure, DeliveryOutcome};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid collector endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("collector token cannot be used as a header value")]
    InvalidToken,
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Sends one joined batch payload.
    async fn send(&self, payload: String) -> DeliveryOutcome;
}

/// Posts payloads to an HTTP event collector with a static token.
#[derive(Debug, Clone)]
pub struct HecSink {
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    verbose: bool,
}

impl HecSink {
    pub fn new(
        endpoint: &str,
        token: &str,
        timeout: Duration,
        verify_tls: bool,
    ) -> Result<Self, SinkError> {
        collector_host(endpoint)?;
        let client = build_client(timeout, verify_tls)?;

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Splunk {token}"))
            .map_err(|_| SinkError::InvalidToken)?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(HecSink {
            client,
            endpoint: endpoint.to_string(),
            headers,
            verbose: false,
        })
    }

    /// Logs every response, successful or not, at debug level.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[async_trait]
impl DeliverySink for HecSink {
    async fn send(&self, payload: String) -> DeliveryOutcome {
        let time = Instant::now();
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .body(payload)
            .send()
            .await;
        let elapsed = time.elapsed();

        match resp {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                if status.is_success() {
                    if self.verbose {
                        debug!(
                            "Collector answered {status} in {} ms: {body}",
                            elapsed.as_millis()
                        );
                    }
                    return DeliveryOutcome::Delivered;
                }
                error!("HTTP ERROR: {status} from {}: {body}", self.endpoint);
                DeliveryOutcome::Failed(DeliveryFailure::from_response(
                    format!("HTTP {status}"),
                    &body,
                ))
            }
            Err(e) => {
                error!("CONNECTION ERROR after {} ms: {e}", elapsed.as_millis());
                DeliveryOutcome::Failed(DeliveryFailure::transport(e.to_string()))
            }
        }
    }
}

/// Host part of the collector URL, used as the default `host` of events.
pub fn collector_host(endpoint: &str) -> Result<String, SinkError> {
    let url = reqwest::Url::parse(endpoint).map_err(|e| SinkError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    url.host_str()
        .map(ToString::to_string)
        .ok_or_else(|| SinkError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: "no host".to_string(),
        })
}

fn build_client(timeout: Duration, verify_tls: bool) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(!verify_tls)
        .build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[test]
    fn collector_host_is_extracted() {
        assert_eq!(
            collector_host("https://hec.example.com:8088/services/collector").unwrap(),
            "hec.example.com"
        );
        assert!(matches!(
            collector_host("not a url"),
            Err(SinkError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn token_with_newline_is_rejected() {
        let err = HecSink::new(
            "https://hec.example.com",
            "bad\ntoken",
            Duration::from_secs(1),
            true,
        )
        .unwrap_err();
        assert!(matches!(err, SinkError::InvalidToken));
    }

    #[tokio::test]
    async fn success_status_is_delivered() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/services/collector")
            .match_header("Authorization", "Splunk mock-token")
            .match_body(Matcher::Exact("{\"a\":1} {\"b\":2}".to_string()))
            .with_status(200)
            .with_body(r#"{"text":"Success","code":0}"#)
            .create_async()
            .await;

        let sink = HecSink::new(
            &format!("{}/services/collector", server.url()),
            "mock-token",
            Duration::from_secs(5),
            true,
        )
        .unwrap();

        let outcome = sink.send("{\"a\":1} {\"b\":2}".to_string()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_captures_collector_text() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/services/collector")
            .with_status(403)
            .with_body(r#"{"text":"Invalid token","code":4}"#)
            .create_async()
            .await;

        let sink = HecSink::new(
            &format!("{}/services/collector", server.url()),
            "mock-token",
            Duration::from_secs(5),
            true,
        )
        .unwrap();

        let DeliveryOutcome::Failed(failure) = sink.send("{}".to_string()).await else {
            panic!("expected a failure");
        };
        assert_eq!(failure.text.as_deref(), Some("Invalid token"));
        assert_eq!(failure.code, Some(4));
        assert!(failure.reason.contains("403"));
    }

    #[tokio::test]
    async fn connection_failure_is_reported_not_raised() {
        // Nothing listens on the discard port.
        let sink = HecSink::new(
            "http://127.0.0.1:9/services/collector",
            "mock-token",
            Duration::from_secs(2),
            true,
        )
        .unwrap();

        let outcome = sink.send("{}".to_string()).await;
        assert!(matches!(outcome, DeliveryOutcome::Failed(_)));
    }
}
