//! Client-side x402 payment handling for reqwest.
//!
//! This module provides the [`X402Client`] which orchestrates scheme clients
//! and payment selection for automatic payment handling.

use http::{Extensions, HeaderValue, StatusCode};
use reqwest::{Request, Response};
use reqwest_middleware as rqm;
use std::sync::Arc;

use x402_core::codec::{self, PAYMENT_REQUIRED, PAYMENT_SIGNATURE};
use x402_core::proto::{PaymentPayload, PaymentRequired, PaymentRequirements, X402Version};
use x402_core::scheme::{SchemeRegistry, X402SchemeClient, X402SchemeFacilitatorError};

#[cfg(feature = "telemetry")]
use tracing::{debug, info, instrument, trace};

/// A scheme requirement paired with the registered client willing to pay it.
pub struct PaymentCandidate {
    pub requirements: PaymentRequirements,
    pub client: Arc<dyn X402SchemeClient>,
}

/// Chooses which [`PaymentCandidate`] to pay with, given the server's
/// `accepts` list in order.
#[async_trait::async_trait]
pub trait PaymentSelector: Send + Sync {
    async fn select(&self, candidates: &[PaymentCandidate]) -> Option<usize>;
}

/// Selects the first candidate with a registered client, preserving the
/// server's `accepts` order. Does not consult balances.
#[derive(Default, Clone, Copy)]
pub struct FirstMatch;

#[async_trait::async_trait]
impl PaymentSelector for FirstMatch {
    async fn select(&self, candidates: &[PaymentCandidate]) -> Option<usize> {
        if candidates.is_empty() { None } else { Some(0) }
    }
}

/// Implements the spec's balance-aware `selectPaymentMethod` algorithm:
/// candidates are queried for balance in server order, sequentially, and
/// the first with a positive balance wins. A zero balance is not an error.
#[derive(Default, Clone, Copy)]
pub struct BalanceAware;

#[async_trait::async_trait]
impl PaymentSelector for BalanceAware {
    async fn select(&self, candidates: &[PaymentCandidate]) -> Option<usize> {
        for (index, candidate) in candidates.iter().enumerate() {
            if candidate.client.balance(&candidate.requirements).await > 0 {
                return Some(index);
            }
        }
        None
    }
}

/// The main x402 client that orchestrates scheme clients and selection.
///
/// The [`X402Client`] acts as middleware for reqwest, automatically handling
/// 402 Payment Required responses by extracting payment requirements, signing
/// payments, and retrying requests.
///
/// ## Creating an X402Client
///
/// ```rust,no_run
/// use x402_reqwest::X402Client;
///
/// let client = X402Client::new();
/// ```
///
/// ## Using with Reqwest
///
/// See the [`crate::ReqwestWithPayments`] trait for integrating with reqwest.
pub struct X402Client<TSelector> {
    schemes: ClientSchemes,
    selector: TSelector,
}

impl X402Client<FirstMatch> {
    /// Creates a new [`X402Client`] with default settings.
    ///
    /// The default client uses [`FirstMatch`] payment selection, which selects
    /// the first registered matching payment scheme, in the server's order.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for X402Client<FirstMatch> {
    fn default() -> Self {
        Self { schemes: ClientSchemes::default(), selector: FirstMatch }
    }
}

impl<TSelector> X402Client<TSelector> {
    /// Registers a scheme client for specific chains or networks.
    ///
    /// Scheme clients handle the actual payment signing for specific protocols.
    /// You can register multiple clients for different chains or schemes.
    pub fn register<S>(mut self, scheme: S) -> Self
    where
        S: X402SchemeClient + 'static,
    {
        self.schemes.push(scheme);
        self
    }

    /// Sets a custom payment selector.
    ///
    /// By default, [`FirstMatch`] is used. [`BalanceAware`] implements the
    /// full balance-checking selection algorithm instead.
    pub fn with_selector<P: PaymentSelector + 'static>(self, selector: P) -> X402Client<P> {
        X402Client { selector, schemes: self.schemes }
    }
}

impl<TSelector> X402Client<TSelector>
where
    TSelector: PaymentSelector,
{
    /// Builds the `PAYMENT-SIGNATURE` header from a `402` response.
    ///
    /// Extracts the payment requirements from the response's `PAYMENT-REQUIRED`
    /// header, runs selection against registered scheme clients, signs the
    /// chosen candidate, and returns the header to attach to a retried request.
    #[cfg_attr(feature = "telemetry", instrument(name = "x402.reqwest.make_payment_header", skip_all, err))]
    pub async fn make_payment_header(&self, res: &Response) -> Result<HeaderValue, X402Error> {
        let payment_required = parse_payment_required(res)?;
        let candidates = self.schemes.candidates(&payment_required);

        let selected = self.selector.select(&candidates).await.ok_or(X402Error::NoCompatiblePaymentMethod)?;
        let candidate = &candidates[selected];

        #[cfg(feature = "telemetry")]
        debug!(scheme = %candidate.requirements.scheme, network = %candidate.requirements.network, "Selected payment scheme");

        let signed = candidate.client.sign_payment(&candidate.requirements).await?;
        let payload = PaymentPayload {
            x402_version: X402Version,
            scheme: candidate.requirements.scheme.clone(),
            network: candidate.requirements.network.clone(),
            payload: signed,
            accepted: candidate.requirements.clone(),
        };
        let encoded = codec::encode_header(&payload)?;
        let header_value = HeaderValue::from_str(&encoded)?;
        Ok(header_value)
    }
}

/// Internal collection of registered scheme clients.
#[derive(Default)]
pub struct ClientSchemes(SchemeRegistry<dyn X402SchemeClient>);

impl ClientSchemes {
    /// Adds a scheme client to the collection.
    pub fn push<T: X402SchemeClient + 'static>(&mut self, client: T) {
        self.0.register(Arc::new(client));
    }

    /// Finds all payment candidates that can handle the given payment requirements,
    /// in the server's `accepts` order. Requirements with no registered client are
    /// silently skipped.
    pub fn candidates(&self, payment_required: &PaymentRequired) -> Vec<PaymentCandidate> {
        payment_required
            .accepts
            .iter()
            .filter_map(|requirements| {
                let client = self.0.find(&requirements.scheme, &requirements.network)?;
                Some(PaymentCandidate { requirements: requirements.clone(), client: client.clone() })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl<TSelector> rqm::Middleware for X402Client<TSelector>
where
    TSelector: PaymentSelector + Send + Sync + 'static,
{
    /// Handles a request, automatically handling 402 responses.
    ///
    /// When a 402 response is received, this middleware:
    /// 1. Extracts payment requirements from the `PAYMENT-REQUIRED` header
    /// 2. Signs a payment using registered scheme clients
    /// 3. Retries the request once with the `PAYMENT-SIGNATURE` header
    #[cfg_attr(feature = "telemetry", instrument(name = "x402.reqwest.handle", skip_all, err))]
    async fn handle(&self, req: Request, extensions: &mut Extensions, next: rqm::Next<'_>) -> rqm::Result<Response> {
        let retry_req = req.try_clone();
        let res = next.clone().run(req, extensions).await?;

        if res.status() != StatusCode::PAYMENT_REQUIRED {
            #[cfg(feature = "telemetry")]
            trace!(status = ?res.status(), "No payment required, returning response");
            return Ok(res);
        }

        #[cfg(feature = "telemetry")]
        info!(url = ?res.url(), "Received 402 Payment Required, processing payment");

        let header = self.make_payment_header(&res).await.map_err(|e| rqm::Error::Middleware(e.into()))?;

        let mut retry = retry_req.ok_or(rqm::Error::Middleware(X402Error::RequestNotCloneable.into()))?;
        retry.headers_mut().insert(PAYMENT_SIGNATURE, header);

        #[cfg(feature = "telemetry")]
        trace!(url = ?retry.url(), "Retrying request with payment header");

        let retried = next.run(retry, extensions).await?;
        if retried.status() == StatusCode::PAYMENT_REQUIRED {
            #[cfg(feature = "telemetry")]
            info!(url = ?retried.url(), "Still 402 after paying once, refusing to retry again");
            return Err(rqm::Error::Middleware(X402Error::PaymentRetryLoop.into()));
        }
        Ok(retried)
    }
}

/// Errors produced while handling an x402 payment on the client side.
#[derive(Debug, thiserror::Error)]
pub enum X402Error {
    #[error("failed to parse PAYMENT-REQUIRED header: {0}")]
    ParseError(String),
    #[error("no registered scheme client can pay any offered requirement")]
    NoCompatiblePaymentMethod,
    #[error("request body is not cloneable, cannot retry with payment")]
    RequestNotCloneable,
    #[error("still 402 Payment Required after paying once; refusing to retry indefinitely")]
    PaymentRetryLoop,
    #[error("failed to sign payment: {0}")]
    Sign(#[from] X402SchemeFacilitatorError),
    #[error("failed to encode payment header: {0}")]
    Codec(#[from] codec::CodecError),
    #[error("payment header is not a valid HTTP header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
}

/// Parses the `PAYMENT-REQUIRED` header of a `402` response.
fn parse_payment_required(response: &Response) -> Result<PaymentRequired, X402Error> {
    let header = response
        .headers()
        .get(PAYMENT_REQUIRED)
        .ok_or_else(|| X402Error::ParseError(format!("missing {PAYMENT_REQUIRED} header")))?;
    let header_str = header.to_str().map_err(|e| X402Error::ParseError(e.to_string()))?;
    codec::decode_header(header_str).map_err(|e| X402Error::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use x402_core::chain::{ChainId, ChainIdPattern};
    use x402_core::proto::ResourceInfo;

    struct FakeClient {
        scheme: &'static str,
        pattern: ChainIdPattern,
        balance: u128,
    }

    #[async_trait::async_trait]
    impl X402SchemeClient for FakeClient {
        fn scheme(&self) -> &'static str {
            self.scheme
        }
        fn network_pattern(&self) -> &ChainIdPattern {
            &self.pattern
        }
        async fn payer_address(&self, _network: &ChainId) -> Option<String> {
            Some("0xpayer".into())
        }
        async fn balance(&self, _requirements: &PaymentRequirements) -> u128 {
            self.balance
        }
        async fn sign_payment(&self, _requirements: &PaymentRequirements) -> Result<serde_json::Value, X402SchemeFacilitatorError> {
            Ok(serde_json::json!({"signed": true, "by": self.scheme}))
        }
    }

    fn requirements(scheme: &str, network: ChainId) -> PaymentRequirements {
        PaymentRequirements {
            scheme: scheme.into(),
            network,
            asset: "0xasset".into(),
            amount: "1000".into(),
            pay_to: "0xpayto".into(),
            max_timeout_seconds: 60,
            extra: None,
        }
    }

    fn payment_required(accepts: Vec<PaymentRequirements>) -> PaymentRequired {
        PaymentRequired {
            x402_version: X402Version,
            error: None,
            resource: ResourceInfo { url: "https://example.com/res".into(), description: "".into(), mime_type: "application/json".into() },
            accepts,
            extensions: None,
        }
    }

    #[test]
    fn candidates_skip_requirements_with_no_registered_client() {
        let mut schemes = ClientSchemes::default();
        schemes.push(FakeClient { scheme: "exact", pattern: ChainIdPattern::exact("eip155", "84532"), balance: 0 });

        let required = payment_required(vec![
            requirements("exact", ChainId::new("eip155", "1")),
            requirements("exact", ChainId::new("eip155", "84532")),
        ]);
        let candidates = schemes.candidates(&required);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].requirements.network, ChainId::new("eip155", "84532"));
    }

    #[tokio::test]
    async fn first_match_picks_first_candidate_regardless_of_balance() {
        let candidates = vec![
            PaymentCandidate {
                requirements: requirements("exact", ChainId::new("eip155", "1")),
                client: Arc::new(FakeClient { scheme: "exact", pattern: ChainIdPattern::wildcard("eip155"), balance: 0 }),
            },
            PaymentCandidate {
                requirements: requirements("exact", ChainId::new("eip155", "84532")),
                client: Arc::new(FakeClient { scheme: "exact", pattern: ChainIdPattern::wildcard("eip155"), balance: 500 }),
            },
        ];
        let selected = FirstMatch.select(&candidates).await;
        assert_eq!(selected, Some(0));
    }

    #[tokio::test]
    async fn balance_aware_skips_zero_balance_candidates() {
        let candidates = vec![
            PaymentCandidate {
                requirements: requirements("exact", ChainId::new("eip155", "1")),
                client: Arc::new(FakeClient { scheme: "exact", pattern: ChainIdPattern::wildcard("eip155"), balance: 0 }),
            },
            PaymentCandidate {
                requirements: requirements("exact", ChainId::new("eip155", "84532")),
                client: Arc::new(FakeClient { scheme: "exact", pattern: ChainIdPattern::wildcard("eip155"), balance: 500 }),
            },
        ];
        let selected = BalanceAware.select(&candidates).await;
        assert_eq!(selected, Some(1));
    }

    #[tokio::test]
    async fn balance_aware_returns_none_when_all_candidates_are_empty() {
        let candidates: Vec<PaymentCandidate> = vec![];
        assert_eq!(BalanceAware.select(&candidates).await, None);
        assert_eq!(FirstMatch.select(&candidates).await, None);
    }
}
