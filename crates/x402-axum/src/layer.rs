//! Axum middleware for enforcing [x402](https://www.x402.org) payments on protected routes.
//!
//! Validates the `PAYMENT-SIGNATURE` header using a configured x402 facilitator, forwards the
//! request, and settles the payment on-chain once the inner handler succeeds.
//!
//! Returns a `402 Payment Required` response (carrying a `PAYMENT-REQUIRED` header) if the
//! request lacks a valid payment.
//!
//! ## Example
//!
//! ```rust,no_run
//! use axum::{Router, routing::get};
//! use axum::response::IntoResponse;
//! use http::StatusCode;
//! use x402_axum::X402Middleware;
//!
//! let x402 = X402Middleware::try_from("https://facilitator.x402.rs").unwrap();
//!
//! let app: Router = Router::new().route(
//!     "/protected",
//!     get(my_handler).layer(x402),
//! );
//!
//! async fn my_handler() -> impl IntoResponse {
//!     (StatusCode::OK, "This is VIP content!")
//! }
//! ```
//!
//! ## Configuration Notes
//!
//! - **[`X402Middleware::with_price_tag`]** sets the accepted `PaymentRequirements` (static pricing).
//! - **[`X402Middleware::with_dynamic_price`]** sets a callback for per-request pricing.
//! - **[`X402Middleware::with_base_url`]** sets the base URL used to compute resource URLs when
//!   [`X402Middleware::with_resource`] is not used. Defaults to `http://localhost/` — avoid in production.

use axum_core::extract::Request;
use axum_core::response::Response;
use http::{HeaderMap, Uri};
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};
use url::Url;

use x402_core::facilitator::Facilitator;
use x402_core::proto::PaymentRequirements;

use crate::facilitator_client::{FacilitatorClient, FacilitatorClientError};
use crate::paygate::{DynamicPriceTags, Paygate, PriceTagSource, ResourceInfoBuilder, StaticPriceTags};

/// Either a fixed list of accepted requirements, or a per-request callback computing them.
#[derive(Clone)]
enum PriceSource {
    Static(StaticPriceTags),
    Dynamic(DynamicPriceTags),
}

impl PriceSource {
    async fn resolve(&self, headers: &HeaderMap, uri: &Uri, base_url: Option<&Url>) -> Vec<PaymentRequirements> {
        match self {
            PriceSource::Static(s) => s.resolve(headers, uri, base_url).await,
            PriceSource::Dynamic(d) => d.resolve(headers, uri, base_url).await,
        }
    }
}

/// Middleware layer that enforces x402 payment verification and settlement.
#[derive(Clone)]
pub struct X402Middleware<F> {
    facilitator: Arc<F>,
    resource: ResourceInfoBuilder,
    base_url: Option<Url>,
    price_source: PriceSource,
}

impl TryFrom<&str> for X402Middleware<FacilitatorClient> {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let facilitator = FacilitatorClient::try_from(value)?;
        Ok(X402Middleware::new(facilitator))
    }
}

impl TryFrom<String> for X402Middleware<FacilitatorClient> {
    type Error = FacilitatorClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        X402Middleware::try_from(value.as_str())
    }
}

impl<F> X402Middleware<F> {
    pub fn new(facilitator: F) -> Self {
        Self {
            facilitator: Arc::new(facilitator),
            resource: ResourceInfoBuilder::default(),
            base_url: None,
            price_source: PriceSource::Static(StaticPriceTags::new(Vec::new())),
        }
    }

    pub fn base_url(&self) -> Url {
        self.base_url.clone().unwrap_or_else(|| Url::parse("http://localhost/").unwrap())
    }

    pub fn with_description(&self, description: &str) -> Self {
        let mut this = self.clone();
        this.resource.description = description.to_string();
        this
    }

    pub fn with_mime_type(&self, mime: &str) -> Self {
        let mut this = self.clone();
        this.resource.mime_type = mime.to_string();
        this
    }

    /// Sets the resource URL directly, avoiding per-request auto-detection.
    pub fn with_resource(&self, resource: Url) -> Self {
        let mut this = self.clone();
        this.resource.url = Some(resource.to_string());
        this
    }

    /// Sets the base URL used to compute resource URLs dynamically when
    /// [`X402Middleware::with_resource`] is not used.
    pub fn with_base_url(&self, base_url: Url) -> Self {
        let mut this = self.clone();
        this.base_url = Some(base_url);
        this
    }

    /// Replaces all accepted requirements with the given value(s).
    pub fn with_price_tag<T: Into<Vec<PaymentRequirements>>>(&self, price_tag: T) -> Self {
        let mut this = self.clone();
        this.price_source = PriceSource::Static(StaticPriceTags::new(price_tag.into()));
        this
    }

    /// Adds requirements to the existing static list, skipping exact duplicates.
    ///
    /// Converts a dynamic price source back to a static one rooted at the given tags.
    pub fn or_price_tag<T: Into<Vec<PaymentRequirements>>>(&self, price_tag: T) -> Self {
        let mut this = self.clone();
        let mut existing = match &this.price_source {
            PriceSource::Static(s) => s.tags().to_vec(),
            PriceSource::Dynamic(_) => Vec::new(),
        };
        let mut seen: HashSet<String> = existing.iter().filter_map(|r| serde_json::to_string(r).ok()).collect();
        for tag in price_tag.into() {
            if let Ok(key) = serde_json::to_string(&tag) {
                if seen.insert(key) {
                    existing.push(tag);
                }
            }
        }
        this.price_source = PriceSource::Static(StaticPriceTags::new(existing));
        this
    }

    /// Computes accepted requirements per-request via an async callback.
    pub fn with_dynamic_price<CB, Fut>(&self, callback: CB) -> Self
    where
        CB: Fn(&HeaderMap, &Uri, Option<&Url>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<PaymentRequirements>> + Send + 'static,
    {
        let mut this = self.clone();
        this.price_source = PriceSource::Dynamic(DynamicPriceTags::new(callback));
        this
    }
}

impl X402Middleware<FacilitatorClient> {
    pub fn facilitator_url(&self) -> &Url {
        self.facilitator.base_url()
    }
}

/// Wraps a cloned inner Axum service and augments it with payment enforcement logic.
#[derive(Clone)]
pub struct X402MiddlewareService<F> {
    facilitator: Arc<F>,
    resource: ResourceInfoBuilder,
    base_url: Option<Url>,
    price_source: PriceSource,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl<S, F> Layer<S> for X402Middleware<F>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    F: Facilitator,
{
    type Service = X402MiddlewareService<F>;

    fn layer(&self, inner: S) -> Self::Service {
        if self.base_url.is_none() && self.resource.url.is_none() {
            #[cfg(feature = "telemetry")]
            tracing::warn!(
                "X402Middleware base_url is not configured; defaulting to http://localhost/ for resource resolution"
            );
        }
        X402MiddlewareService {
            facilitator: self.facilitator.clone(),
            resource: self.resource.clone(),
            base_url: self.base_url.clone(),
            price_source: self.price_source.clone(),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirements(pay_to: &str) -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".into(),
            network: x402_core::chain::ChainId::new("eip155", "84532"),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            amount: "10000".into(),
            pay_to: pay_to.into(),
            max_timeout_seconds: 60,
            extra: None,
        }
    }

    fn middleware() -> X402Middleware<()> {
        X402Middleware::new(())
    }

    fn tags(m: &X402Middleware<()>) -> Vec<PaymentRequirements> {
        match &m.price_source {
            PriceSource::Static(s) => s.tags().to_vec(),
            PriceSource::Dynamic(_) => panic!("expected static price source"),
        }
    }

    #[test]
    fn with_price_tag_replaces_existing_tags() {
        let m = middleware().with_price_tag(vec![requirements("0xaaa")]);
        let m = m.with_price_tag(vec![requirements("0xbbb")]);
        assert_eq!(tags(&m), vec![requirements("0xbbb")]);
    }

    #[test]
    fn or_price_tag_appends_without_duplicating() {
        let m = middleware().with_price_tag(vec![requirements("0xaaa")]);
        let m = m.or_price_tag(vec![requirements("0xaaa"), requirements("0xbbb")]);
        assert_eq!(tags(&m), vec![requirements("0xaaa"), requirements("0xbbb")]);
    }

    #[test]
    fn base_url_defaults_to_localhost() {
        let m = middleware();
        assert_eq!(m.base_url().as_str(), "http://localhost/");
    }

    #[test]
    fn with_base_url_overrides_default() {
        let url = Url::parse("https://api.example.com/").unwrap();
        let m = middleware().with_base_url(url.clone());
        assert_eq!(m.base_url(), url);
    }
}

impl<F> Service<Request> for X402MiddlewareService<F>
where
    F: Facilitator + Send + Sync + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let facilitator = self.facilitator.clone();
        let resource_builder = self.resource.clone();
        let base_url = self.base_url.clone();
        let price_source = self.price_source.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let resource = resource_builder.as_resource_info(base_url.as_ref(), &req);
            let accepts = price_source.resolve(req.headers(), req.uri(), base_url.as_ref()).await;
            let gate = Paygate { facilitator, accepts: Arc::new(accepts), resource };
            gate.handle_request(inner, req).await
        })
    }
}
