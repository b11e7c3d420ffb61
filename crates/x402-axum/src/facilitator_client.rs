//! A [`x402_core::facilitator::Facilitator`] implementation that interacts with a _remote_ x402 facilitator over HTTP.
//!
//! This [`FacilitatorClient`] handles the `/verify`, `/settle`, and `/supported` endpoints of
//! a remote facilitator, and implements the [`x402_core::facilitator::Facilitator`] trait for
//! compatibility with x402-based middleware and logic.
//!
//! ## Example
//!
//! ```rust
//! use x402_axum::facilitator_client::FacilitatorClient;
//!
//! let facilitator = FacilitatorClient::try_from("https://facilitator.x402.rs/").unwrap();
//! ```
//! This client is cheap to clone and internally shares a connection pool via `reqwest::Client`,
//! making it safe and efficient to reuse across multiple Axum routes or concurrent tasks.
//!
//! ## Features
//!
//! - Uses `reqwest` for async HTTP requests
//! - Supports optional timeout and headers
//! - Integrates with `tracing` if the `telemetry` feature is enabled

use http::{HeaderMap, StatusCode};
use reqwest::Client;
use serde::Serialize;
use std::fmt::Display;
use std::time::Duration;
use url::Url;
use x402_core::facilitator::Facilitator;
use x402_core::proto::{PaymentRequirements, SettleResponse, SupportedResponse, VerifyResponse};

#[cfg(feature = "telemetry")]
use tracing::Span;

/// A client for communicating with a remote x402 facilitator.
///
/// Handles `/verify`, `/settle`, and `/supported` endpoints via JSON HTTP, matching the
/// wire convention of `x402-facilitator-local`'s `handlers` module.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    #[allow(dead_code)] // Public for consumption by downstream crates.
    base_url: Url,
    verify_url: Url,
    settle_url: Url,
    supported_url: Url,
    client: Client,
    headers: HeaderMap,
    timeout: Option<Duration>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyOrSettleBody<'a> {
    payment_payload: &'a serde_json::Value,
    payment_requirements: &'a PaymentRequirements,
}

#[async_trait::async_trait]
impl Facilitator for FacilitatorClient {
    type Error = FacilitatorClientError;

    #[cfg_attr(feature = "telemetry", tracing::instrument(skip_all, err))]
    async fn verify(
        &self,
        payload: &serde_json::Value,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, Self::Error> {
        let body = VerifyOrSettleBody { payment_payload: payload, payment_requirements: requirements };
        self.post_json(&self.verify_url, "POST /verify", &body).await
    }

    #[cfg_attr(feature = "telemetry", tracing::instrument(skip_all, err))]
    async fn settle(
        &self,
        payload: &serde_json::Value,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, Self::Error> {
        let body = VerifyOrSettleBody { payment_payload: payload, payment_requirements: requirements };
        self.post_json(&self.settle_url, "POST /settle", &body).await
    }

    async fn supported(&self) -> Result<SupportedResponse, Self::Error> {
        self.get_json(&self.supported_url, "GET /supported").await
    }
}

/// Errors that can occur while interacting with a remote facilitator.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("HTTP error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("Failed to read response body as text: {context}: {source}")]
    ResponseBodyRead {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

impl FacilitatorClient {
    #[allow(dead_code)] // Public for consumption by downstream crates.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[allow(dead_code)] // Public for consumption by downstream crates.
    pub fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    #[allow(dead_code)] // Public for consumption by downstream crates.
    pub fn settle_url(&self) -> &Url {
        &self.settle_url
    }

    #[allow(dead_code)] // Public for consumption by downstream crates.
    pub fn supported_url(&self) -> &Url {
        &self.supported_url
    }

    #[allow(dead_code)] // Public for consumption by downstream crates.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[allow(dead_code)] // Public for consumption by downstream crates.
    pub fn timeout(&self) -> &Option<Duration> {
        &self.timeout
    }

    /// Constructs a new [`FacilitatorClient`] from a base URL, deriving `./verify`,
    /// `./settle`, and `./supported` endpoint URLs relative to it.
    pub fn try_new(base_url: Url) -> Result<Self, FacilitatorClientError> {
        let client = Client::new();
        let verify_url = base_url.join("./verify").map_err(|e| FacilitatorClientError::UrlParse {
            context: "Failed to construct ./verify URL",
            source: e,
        })?;
        let settle_url = base_url.join("./settle").map_err(|e| FacilitatorClientError::UrlParse {
            context: "Failed to construct ./settle URL",
            source: e,
        })?;
        let supported_url = base_url.join("./supported").map_err(|e| FacilitatorClientError::UrlParse {
            context: "Failed to construct ./supported URL",
            source: e,
        })?;
        Ok(Self {
            client,
            base_url,
            verify_url,
            settle_url,
            supported_url,
            headers: HeaderMap::new(),
            timeout: None,
        })
    }

    #[allow(dead_code)] // Public for consumption by downstream crates.
    pub fn with_headers(&self, headers: HeaderMap) -> Self {
        let mut this = self.clone();
        this.headers = headers;
        this
    }

    #[allow(dead_code)] // Public for consumption by downstream crates.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut this = self.clone();
        this.timeout = Some(timeout);
        this
    }

    async fn post_json<T, R>(&self, url: &Url, context: &'static str, payload: &T) -> Result<R, FacilitatorClientError>
    where
        T: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let mut req = self.client.post(url.clone()).json(payload);
        for (key, value) in self.headers.iter() {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let http_response = req.send().await.map_err(|e| FacilitatorClientError::Http { context, source: e })?;

        let result = if http_response.status() == StatusCode::OK {
            http_response
                .json::<R>()
                .await
                .map_err(|e| FacilitatorClientError::JsonDeserialization { context, source: e })
        } else {
            let status = http_response.status();
            let body = http_response
                .text()
                .await
                .map_err(|e| FacilitatorClientError::ResponseBodyRead { context, source: e })?;
            Err(FacilitatorClientError::HttpStatus { context, status, body })
        };

        record_result_on_span(&result);
        result
    }

    async fn get_json<R>(&self, url: &Url, context: &'static str) -> Result<R, FacilitatorClientError>
    where
        R: serde::de::DeserializeOwned,
    {
        let mut req = self.client.get(url.clone());
        for (key, value) in self.headers.iter() {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let http_response = req.send().await.map_err(|e| FacilitatorClientError::Http { context, source: e })?;

        let result = if http_response.status() == StatusCode::OK {
            http_response
                .json::<R>()
                .await
                .map_err(|e| FacilitatorClientError::JsonDeserialization { context, source: e })
        } else {
            let status = http_response.status();
            let body = http_response
                .text()
                .await
                .map_err(|e| FacilitatorClientError::ResponseBodyRead { context, source: e })?;
            Err(FacilitatorClientError::HttpStatus { context, status, body })
        };

        record_result_on_span(&result);
        result
    }
}

impl TryFrom<&str> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| FacilitatorClientError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        FacilitatorClient::try_new(url)
    }
}

impl TryFrom<String> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FacilitatorClient::try_from(value.as_str())
    }
}

#[cfg(feature = "telemetry")]
fn record_result_on_span<R, E: Display>(result: &Result<R, E>) {
    let span = Span::current();
    match result {
        Ok(_) => {
            span.record("otel.status_code", "OK");
        }
        Err(err) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", tracing::field::display(err));
            tracing::event!(tracing::Level::ERROR, error = %err, "Request to facilitator failed");
        }
    }
}

#[cfg(not(feature = "telemetry"))]
fn record_result_on_span<R, E: Display>(_result: &Result<R, E>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use x402_core::proto::PaymentRequirements;

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".into(),
            network: x402_core::chain::ChainId::new("eip155", "84532"),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            amount: "10000".into(),
            pay_to: "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA9604".into(),
            max_timeout_seconds: 60,
            extra: None,
        }
    }

    #[tokio::test]
    async fn verify_posts_to_verify_endpoint_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"isValid": true})))
            .mount(&server)
            .await;
        let client = FacilitatorClient::try_from(server.uri()).unwrap();
        let result = client.verify(&serde_json::json!({}), &requirements()).await.unwrap();
        assert!(result.is_valid);
    }

    #[tokio::test]
    async fn settle_reports_failure_reason_on_unsuccessful_settlement() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "errorReason": "insufficient_funds"
            })))
            .mount(&server)
            .await;
        let client = FacilitatorClient::try_from(server.uri()).unwrap();
        let result = client.settle(&serde_json::json!({}), &requirements()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_reason.unwrap(), "insufficient_funds");
    }

    #[tokio::test]
    async fn non_ok_status_surfaces_as_http_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/supported"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        let client = FacilitatorClient::try_from(server.uri()).unwrap();
        let err = client.supported().await.unwrap_err();
        assert!(matches!(err, FacilitatorClientError::HttpStatus { status, .. } if status == StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn try_from_normalizes_missing_trailing_slash() {
        let client = FacilitatorClient::try_from("https://facilitator.example.com").unwrap();
        assert_eq!(client.verify_url().as_str(), "https://facilitator.example.com/verify");
    }
}
