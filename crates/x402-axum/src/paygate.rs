//! Payment gate: the core request-interception logic shared by [`crate::layer::X402Middleware`].
//!
//! Handles:
//! - Extracting the `PAYMENT-SIGNATURE` header from requests
//! - Verifying payments with the facilitator
//! - Settling payments on-chain
//! - Returning a `402 Payment Required` response (with a `PAYMENT-REQUIRED` header) when
//!   payment is absent, malformed, or rejected

use axum_core::body::Body;
use axum_core::extract::Request;
use axum_core::response::{IntoResponse, Response};
use http::{HeaderMap, HeaderValue, StatusCode, Uri};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tower::Service;
use url::Url;

use x402_core::codec::{self, PAYMENT_REQUIRED, PAYMENT_RESPONSE, PAYMENT_SIGNATURE};
use x402_core::facilitator::Facilitator;
use x402_core::proto::{PaymentPayload, PaymentRequired, PaymentRequirements, ResourceInfo, X402Version};

#[cfg(feature = "telemetry")]
use tracing::{Instrument, instrument};

/// Builder for the [`ResourceInfo`] attached to every `PaymentRequired` response.
#[derive(Debug, Clone)]
pub struct ResourceInfoBuilder {
    pub description: String,
    pub mime_type: String,
    /// Explicit resource URL. If unset, derived from the request's `Host` header and URI.
    pub url: Option<String>,
}

impl Default for ResourceInfoBuilder {
    fn default() -> Self {
        Self { description: String::new(), mime_type: "application/json".to_string(), url: None }
    }
}

impl ResourceInfoBuilder {
    pub fn as_resource_info(&self, base_url: Option<&Url>, req: &Request) -> ResourceInfo {
        let url = self.url.clone().unwrap_or_else(|| {
            let mut url = base_url.cloned().unwrap_or_else(|| {
                let host = req.headers().get("host").and_then(|h| h.to_str().ok()).unwrap_or("localhost");
                let origin = format!("http://{host}");
                Url::parse(&origin).unwrap_or_else(|_| Url::parse("http://localhost").unwrap())
            });
            let request_uri = req.uri();
            url.set_path(request_uri.path());
            url.set_query(request_uri.query());
            url.to_string()
        });
        ResourceInfo { description: self.description.clone(), mime_type: self.mime_type.clone(), url }
    }
}

/// Verification-stage failure, turned into a `402`/`412` response by [`Paygate`].
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("{0} header is required")]
    PaymentHeaderRequired(&'static str),
    #[error("invalid or malformed payment header")]
    InvalidPaymentHeader,
    #[error("invalid_accepted_requirements")]
    NoPaymentMatching,
    #[error("verification failed: {0}")]
    VerificationFailed(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PaygateError {
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("settlement failed: {0}")]
    Settlement(String),
}

impl PaygateError {
    fn into_response(self, accepts: &[PaymentRequirements], resource: &ResourceInfo) -> Response {
        let status = match &self {
            PaygateError::Verification(VerificationError::PreconditionFailed(_)) => StatusCode::PRECONDITION_FAILED,
            _ => StatusCode::PAYMENT_REQUIRED,
        };
        let payment_required = PaymentRequired {
            x402_version: X402Version,
            error: Some(self.to_string()),
            resource: resource.clone(),
            accepts: accepts.to_vec(),
            extensions: None,
        };
        let header_value = match codec::encode_header(&payment_required).ok().and_then(|s| HeaderValue::from_str(&s).ok()) {
            Some(header_value) => header_value,
            None => {
                return Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from("failed to encode payment-required header"))
                    .expect("failed to construct fallback response");
            }
        };
        Response::builder()
            .status(status)
            .header(PAYMENT_REQUIRED, header_value)
            .body(Body::empty())
            .expect("failed to construct response")
    }
}

/// The unified x402 payment gate: intercepts a request, verifies and settles payment against
/// a set of accepted [`PaymentRequirements`], and forwards to the wrapped service.
pub struct Paygate<F> {
    pub facilitator: Arc<F>,
    pub accepts: Arc<Vec<PaymentRequirements>>,
    pub resource: ResourceInfo,
}

impl<F> Paygate<F>
where
    F: Facilitator,
{
    async fn call_inner<ReqBody, ResBody, S>(mut inner: S, req: http::Request<ReqBody>) -> Result<http::Response<ResBody>, S::Error>
    where
        S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
        S::Future: Send,
    {
        #[cfg(feature = "telemetry")]
        {
            inner.call(req).instrument(tracing::info_span!("inner")).await
        }
        #[cfg(not(feature = "telemetry"))]
        {
            inner.call(req).await
        }
    }

    /// Handles an incoming request, turning any [`PaygateError`] into a `402`/`412` response
    /// rather than propagating it.
    #[cfg_attr(feature = "telemetry", instrument(name = "x402.handle_request", skip_all))]
    pub async fn handle_request<ReqBody, ResBody, S>(self, inner: S, req: http::Request<ReqBody>) -> Result<Response, Infallible>
    where
        S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
        S::Response: IntoResponse,
        S::Error: IntoResponse,
        S::Future: Send,
    {
        match self.handle_request_fallible(inner, req).await {
            Ok(response) => Ok(response),
            Err(err) => Ok(err.into_response(&self.accepts, &self.resource)),
        }
    }

    /// Same as [`Paygate::handle_request`] but surfaces [`PaygateError`] instead of converting
    /// it to a response, for callers that want custom error handling.
    pub async fn handle_request_fallible<ReqBody, ResBody, S>(
        &self,
        inner: S,
        req: http::Request<ReqBody>,
    ) -> Result<Response, PaygateError>
    where
        S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
        S::Response: IntoResponse,
        S::Error: IntoResponse,
        S::Future: Send,
    {
        let header = req
            .headers()
            .get(PAYMENT_SIGNATURE)
            .ok_or(VerificationError::PaymentHeaderRequired(PAYMENT_SIGNATURE))?;
        let header_str = header.to_str().map_err(|_| VerificationError::InvalidPaymentHeader)?;
        let payload: PaymentPayload<serde_json::Value> =
            codec::decode_header(header_str).map_err(|_| VerificationError::InvalidPaymentHeader)?;

        let requirements = self
            .accepts
            .iter()
            .find(|r| **r == payload.accepted)
            .ok_or(VerificationError::NoPaymentMatching)?
            .clone();

        self.verify_payment(&payload, &requirements).await?;

        let response = match Self::call_inner(inner, req).await {
            Ok(response) => response,
            Err(err) => return Ok(err.into_response()),
        };
        let response = response.into_response();
        if response.status().is_client_error() || response.status().is_server_error() {
            return Ok(response);
        }

        let settlement = self.settle_payment(&payload, &requirements).await?;
        let header_value = settlement_header_value(&settlement)?;

        let mut res = response;
        res.headers_mut().insert(PAYMENT_RESPONSE, header_value);
        Ok(res)
    }

    async fn verify_payment(
        &self,
        payload: &PaymentPayload<serde_json::Value>,
        requirements: &PaymentRequirements,
    ) -> Result<(), VerificationError> {
        let verify_response = self
            .facilitator
            .verify(&payload.payload, requirements)
            .await
            .map_err(|e| VerificationError::VerificationFailed(e.to_string()))?;
        if verify_response.is_valid {
            Ok(())
        } else {
            let reason = verify_response.invalid_reason.unwrap_or_default();
            if reason == "insufficient_permit2_allowance" {
                Err(VerificationError::PreconditionFailed(reason))
            } else {
                Err(VerificationError::VerificationFailed(reason))
            }
        }
    }

    async fn settle_payment(
        &self,
        payload: &PaymentPayload<serde_json::Value>,
        requirements: &PaymentRequirements,
    ) -> Result<x402_core::proto::SettleResponse, PaygateError> {
        let settlement = self
            .facilitator
            .settle(&payload.payload, requirements)
            .await
            .map_err(|e| PaygateError::Settlement(e.to_string()))?;
        if settlement.success {
            Ok(settlement)
        } else {
            Err(PaygateError::Settlement(settlement.error_reason.unwrap_or_default()))
        }
    }
}

fn settlement_header_value(settlement: &x402_core::proto::SettleResponse) -> Result<HeaderValue, PaygateError> {
    let encoded = codec::encode_header(settlement).map_err(|e| PaygateError::Settlement(e.to_string()))?;
    HeaderValue::from_str(&encoded).map_err(|e| PaygateError::Settlement(e.to_string()))
}

/// Resolves a set of accepted [`PaymentRequirements`] for a given request.
///
/// Abstracts over static pricing (same requirements for every request) and dynamic
/// pricing (computed per-request from headers/URI).
pub trait PriceTagSource {
    fn resolve(
        &self,
        headers: &HeaderMap,
        uri: &Uri,
        base_url: Option<&Url>,
    ) -> impl Future<Output = Vec<PaymentRequirements>> + Send;
}

/// Static price tag source: the same accepted requirements for every request.
#[derive(Clone, Debug)]
pub struct StaticPriceTags {
    tags: Arc<Vec<PaymentRequirements>>,
}

impl StaticPriceTags {
    pub fn new(tags: Vec<PaymentRequirements>) -> Self {
        Self { tags: Arc::new(tags) }
    }

    pub fn tags(&self) -> &[PaymentRequirements] {
        &self.tags
    }

    pub fn with_price_tag(mut self, tag: PaymentRequirements) -> Self {
        let mut tags = (*self.tags).clone();
        tags.push(tag);
        self.tags = Arc::new(tags);
        self
    }
}

impl PriceTagSource for StaticPriceTags {
    async fn resolve(&self, _headers: &HeaderMap, _uri: &Uri, _base_url: Option<&Url>) -> Vec<PaymentRequirements> {
        (*self.tags).clone()
    }
}

type BoxedDynamicPriceCallback =
    dyn for<'a> Fn(&'a HeaderMap, &'a Uri, Option<&'a Url>) -> Pin<Box<dyn Future<Output = Vec<PaymentRequirements>> + Send + 'a>>
        + Send
        + Sync;

/// Dynamic price tag source: accepted requirements computed per-request via callback.
pub struct DynamicPriceTags {
    callback: Arc<BoxedDynamicPriceCallback>,
}

impl Clone for DynamicPriceTags {
    fn clone(&self) -> Self {
        Self { callback: self.callback.clone() }
    }
}

impl std::fmt::Debug for DynamicPriceTags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicPriceTags").field("callback", &"<callback>").finish()
    }
}

impl DynamicPriceTags {
    pub fn new<CB, Fut>(callback: CB) -> Self
    where
        CB: Fn(&HeaderMap, &Uri, Option<&Url>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<PaymentRequirements>> + Send + 'static,
    {
        Self { callback: Arc::new(move |headers, uri, base_url| Box::pin(callback(headers, uri, base_url))) }
    }
}

impl PriceTagSource for DynamicPriceTags {
    async fn resolve(&self, headers: &HeaderMap, uri: &Uri, base_url: Option<&Url>) -> Vec<PaymentRequirements> {
        (self.callback)(headers, uri, base_url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(uri: &str, host: Option<&str>) -> Request {
        let mut builder = http::Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header("host", host);
        }
        builder.body(Body::empty()).unwrap()
    }

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

    #[test]
    fn explicit_url_overrides_derivation() {
        let builder = ResourceInfoBuilder { url: Some("https://example.com/fixed".into()), ..Default::default() };
        let resource = builder.as_resource_info(None, &req("/other", Some("ignored.example")));
        assert_eq!(resource.url, "https://example.com/fixed");
    }

    #[test]
    fn derives_url_from_base_url_and_request_path() {
        let base_url = Url::parse("https://api.example.com").unwrap();
        let builder = ResourceInfoBuilder::default();
        let resource = builder.as_resource_info(Some(&base_url), &req("/widgets?x=1", None));
        assert_eq!(resource.url, "https://api.example.com/widgets?x=1");
    }

    #[test]
    fn derives_url_from_host_header_when_no_base_url() {
        let builder = ResourceInfoBuilder::default();
        let resource = builder.as_resource_info(None, &req("/widgets", Some("api.example.com")));
        assert_eq!(resource.url, "http://api.example.com/widgets");
    }

    #[test]
    fn falls_back_to_localhost_without_host_header_or_base_url() {
        let builder = ResourceInfoBuilder::default();
        let resource = builder.as_resource_info(None, &req("/widgets", None));
        assert_eq!(resource.url, "http://localhost/widgets");
    }

    #[test]
    fn verification_failure_maps_to_402_with_payment_required_header() {
        let err = PaygateError::Verification(VerificationError::NoPaymentMatching);
        let accepts = vec![requirements()];
        let resource = ResourceInfo { description: String::new(), mime_type: "application/json".into(), url: "http://localhost/x".into() };
        let response = err.into_response(&accepts, &resource);
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert!(response.headers().get(PAYMENT_REQUIRED).is_some());
    }

    #[test]
    fn precondition_failed_maps_to_412() {
        let err = PaygateError::Verification(VerificationError::PreconditionFailed("insufficient_permit2_allowance".into()));
        let accepts = vec![requirements()];
        let resource = ResourceInfo { description: String::new(), mime_type: "application/json".into(), url: "http://localhost/x".into() };
        let response = err.into_response(&accepts, &resource);
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[test]
    fn settlement_failure_maps_to_402() {
        let err = PaygateError::Settlement("onchain revert".into());
        let accepts = vec![requirements()];
        let resource = ResourceInfo { description: String::new(), mime_type: "application/json".into(), url: "http://localhost/x".into() };
        let response = err.into_response(&accepts, &resource);
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }
}
