//! Local facilitator implementation for x402 payments.
//!
//! This module provides [`FacilitatorLocal`], a [`Facilitator`] implementation
//! that validates x402 payment payloads and performs on-chain settlements by
//! dispatching to whichever registered scheme handler matches the payment's
//! `(scheme, network)` pair.
//!
//! Standalone facilitators must refuse to settle a payload they have not
//! first verified: [`FacilitatorLocal`] keeps a `sha256(canonical JSON of
//! paymentPayload)` set, populated by a successful `verify` and consulted by
//! `settle`, evicted by a background task once a requirement's own timeout
//! plus a grace margin elapses.
//!
//! # Example
//!
//! ```ignore
//! use x402_facilitator_local::FacilitatorLocal;
//! use x402_core::scheme::SchemeRegistry;
//!
//! let facilitator = FacilitatorLocal::new(registry);
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use x402_core::codec::{canonical_json, sha256_hex};
use x402_core::facilitator::Facilitator;
use x402_core::proto::{PaymentRequirements, PaymentVerificationError, SettleResponse, SupportedResponse, VerifyResponse};
use x402_core::scheme::{SchemeRegistry, X402SchemeFacilitator, X402SchemeFacilitatorError};

/// Grace period added to a requirement's own `max_timeout_seconds` before a
/// verified-payload cache entry expires, absorbing the latency between a
/// client's verify and its follow-up settle call.
const VERIFIED_CACHE_GRACE: Duration = Duration::from_secs(30);

/// How often the verified-payload cache is swept for expired entries.
const EVICTION_INTERVAL: Duration = Duration::from_secs(30);

/// A local [`Facilitator`] implementation that delegates to scheme handlers.
///
/// Routes `verify`/`settle` requests to whichever registered
/// [`X402SchemeFacilitator`] matches the requirements' `(scheme, network)`
/// pair, per the longest-match rule in [`SchemeRegistry`].
pub struct FacilitatorLocal {
    registry: SchemeRegistry<dyn X402SchemeFacilitator>,
    verified: Arc<DashMap<String, Instant>>,
    cancellation_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl FacilitatorLocal {
    /// Creates a new [`FacilitatorLocal`] with the given scheme registry, and spawns
    /// the background task that evicts expired entries from the verified-payload cache.
    pub fn new(registry: SchemeRegistry<dyn X402SchemeFacilitator>) -> Self {
        let verified: Arc<DashMap<String, Instant>> = Arc::new(DashMap::new());
        let cancellation_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        let eviction_verified = Arc::clone(&verified);
        let eviction_token = cancellation_token.clone();
        task_tracker.spawn(async move {
            let mut interval = tokio::time::interval(EVICTION_INTERVAL);
            loop {
                tokio::select! {
                    _ = eviction_token.cancelled() => break,
                    _ = interval.tick() => {
                        let now = Instant::now();
                        eviction_verified.retain(|_, expires_at| *expires_at > now);
                    }
                }
            }
        });
        task_tracker.close();

        FacilitatorLocal { registry, verified, cancellation_token, task_tracker }
    }

    fn find(&self, requirements: &PaymentRequirements) -> Result<&std::sync::Arc<dyn X402SchemeFacilitator>, FacilitatorLocalError> {
        self.registry
            .find(&requirements.scheme, &requirements.network)
            .ok_or(FacilitatorLocalError::Unsupported(PaymentVerificationError::UnsupportedScheme))
    }

    /// `sha256(canonical JSON of payload)`, the verified-payload cache's key.
    fn verified_key(payload: &serde_json::Value) -> Result<String, FacilitatorLocalError> {
        let bytes = canonical_json(payload).map_err(FacilitatorLocalError::Codec)?;
        Ok(sha256_hex(&bytes))
    }

    /// Cancels the background eviction task and waits for it to finish.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.task_tracker.wait().await;
    }
}

#[async_trait::async_trait]
impl Facilitator for FacilitatorLocal {
    type Error = FacilitatorLocalError;

    async fn verify(
        &self,
        payload: &serde_json::Value,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, Self::Error> {
        let handler = self.find(requirements)?;
        let response = handler
            .verify(payload, requirements)
            .await
            .map_err(FacilitatorLocalError::Verification)?;
        if response.is_valid {
            let key = Self::verified_key(payload)?;
            let ttl = Duration::from_secs(requirements.max_timeout_seconds) + VERIFIED_CACHE_GRACE;
            self.verified.insert(key, Instant::now() + ttl);
        }
        Ok(response)
    }

    async fn settle(
        &self,
        payload: &serde_json::Value,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, Self::Error> {
        let handler = self.find(requirements)?;
        let key = Self::verified_key(payload)?;
        let verified = self.verified.get(&key).map(|expiry| *expiry > Instant::now()).unwrap_or(false);
        if !verified {
            return Err(FacilitatorLocalError::NotVerified);
        }
        handler
            .settle(payload, requirements)
            .await
            .map_err(FacilitatorLocalError::Settlement)
    }

    async fn supported(&self) -> Result<SupportedResponse, Self::Error> {
        Ok(SupportedResponse {
            kinds: self.registry.supported_kinds(),
            extensions: Vec::new(),
        })
    }
}

/// Errors that can occur during local facilitator operations.
///
/// Distinguishes between "no handler registered for this (scheme, network)"
/// and failures surfaced by a handler that did match.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorLocalError {
    #[error(transparent)]
    Unsupported(PaymentVerificationError),
    #[error(transparent)]
    Verification(X402SchemeFacilitatorError),
    #[error(transparent)]
    Settlement(X402SchemeFacilitatorError),
    #[error("Payment was not verified first")]
    NotVerified,
    #[error("failed to hash payment payload: {0}")]
    Codec(x402_core::codec::CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use x402_core::chain::{ChainId, ChainIdPattern};
    use x402_core::proto::SettleResponse;

    struct FakeScheme {
        pattern: ChainIdPattern,
        valid: bool,
    }

    #[async_trait::async_trait]
    impl X402SchemeFacilitator for FakeScheme {
        fn scheme(&self) -> &'static str {
            "exact"
        }
        fn network_pattern(&self) -> &ChainIdPattern {
            &self.pattern
        }
        async fn verify(&self, _payload: &serde_json::Value, _requirements: &PaymentRequirements) -> Result<VerifyResponse, X402SchemeFacilitatorError> {
            Ok(if self.valid { VerifyResponse::valid("0xpayer") } else { VerifyResponse::invalid("insufficient_funds") })
        }
        async fn settle(&self, _payload: &serde_json::Value, requirements: &PaymentRequirements) -> Result<SettleResponse, X402SchemeFacilitatorError> {
            Ok(SettleResponse::success(requirements.network.clone(), "0xpayer".into(), "0xtx".into()))
        }
        fn supported_kinds(&self) -> Vec<x402_core::proto::SupportedPaymentKind> {
            Vec::new()
        }
    }

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".into(),
            network: ChainId::new("eip155", "84532"),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            amount: "10000".into(),
            pay_to: "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA9604".into(),
            max_timeout_seconds: 60,
            extra: None,
        }
    }

    fn facilitator(valid: bool) -> FacilitatorLocal {
        let mut registry = SchemeRegistry::new();
        registry.register(Arc::new(FakeScheme { pattern: ChainIdPattern::wildcard("eip155"), valid }));
        FacilitatorLocal::new(registry)
    }

    #[tokio::test]
    async fn settle_without_prior_verify_is_rejected() {
        let facilitator = facilitator(true);
        let err = facilitator.settle(&serde_json::json!({"a": 1}), &requirements()).await.unwrap_err();
        assert!(matches!(err, FacilitatorLocalError::NotVerified));
    }

    #[tokio::test]
    async fn settle_after_successful_verify_is_allowed() {
        let facilitator = facilitator(true);
        let payload = serde_json::json!({"a": 1});
        let req = requirements();
        let verified = facilitator.verify(&payload, &req).await.unwrap();
        assert!(verified.is_valid);
        let settled = facilitator.settle(&payload, &req).await.unwrap();
        assert!(settled.success);
    }

    #[tokio::test]
    async fn settle_after_failed_verify_is_still_rejected() {
        let facilitator = facilitator(false);
        let payload = serde_json::json!({"a": 1});
        let req = requirements();
        let verified = facilitator.verify(&payload, &req).await.unwrap();
        assert!(!verified.is_valid);
        let err = facilitator.settle(&payload, &req).await.unwrap_err();
        assert!(matches!(err, FacilitatorLocalError::NotVerified));
    }

    #[tokio::test]
    async fn different_payload_is_not_covered_by_an_unrelated_verify() {
        let facilitator = facilitator(true);
        let req = requirements();
        facilitator.verify(&serde_json::json!({"a": 1}), &req).await.unwrap();
        let err = facilitator.settle(&serde_json::json!({"a": 2}), &req).await.unwrap_err();
        assert!(matches!(err, FacilitatorLocalError::NotVerified));
    }
}
