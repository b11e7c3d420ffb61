//! The facilitator contract: verify, settle, and advertise support.
//!
//! Implemented by [`crate::scheme::SchemeRegistry`]-backed in-process
//! coordinators (`x402-facilitator-local`) and by HTTP clients that delegate
//! to a remote facilitator (`x402-axum`'s `FacilitatorClient`).

use crate::chain::ChainId;
use crate::proto::{PaymentRequirements, SettleResponse, SupportedResponse, VerifyResponse};

/// The three operations a facilitator exposes per spec §4.4, independent of
/// whether it runs in-process or behind an HTTP boundary.
#[async_trait::async_trait]
pub trait Facilitator: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn verify(
        &self,
        payload: &serde_json::Value,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, Self::Error>;

    async fn settle(
        &self,
        payload: &serde_json::Value,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, Self::Error>;

    async fn supported(&self) -> Result<SupportedResponse, Self::Error>;
}

#[async_trait::async_trait]
impl<F: Facilitator + ?Sized> Facilitator for std::sync::Arc<F> {
    type Error = F::Error;

    async fn verify(
        &self,
        payload: &serde_json::Value,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, Self::Error> {
        (**self).verify(payload, requirements).await
    }

    async fn settle(
        &self,
        payload: &serde_json::Value,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, Self::Error> {
        (**self).settle(payload, requirements).await
    }

    async fn supported(&self) -> Result<SupportedResponse, Self::Error> {
        (**self).supported().await
    }
}

impl<F: Facilitator + ?Sized> FacilitatorExt for F {}

/// Convenience helpers layered on top of [`Facilitator`].
pub trait FacilitatorExt: Facilitator {
    /// Builds a [`SettleResponse::failure`] tagged with the given network,
    /// for call sites that short-circuit before reaching a scheme facilitator.
    fn settlement_failure(&self, network: ChainId, reason: impl Into<String>) -> SettleResponse {
        SettleResponse::failure(network, reason)
    }
}
