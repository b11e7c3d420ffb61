//! The mechanism registry: `{scheme, network-pattern} -> {client, service, facilitator}`.
//!
//! A mechanism is registered per role (spec §4.2). Lookup is longest-match:
//! an exact network beats a set, a set beats a wildcard. `x402-core` stays
//! blockchain-agnostic — concrete mechanisms (EIP-3009, Permit2, ...) are
//! implemented by chain crates and registered here by scheme name.

use std::sync::Arc;

use crate::chain::{ChainId, ChainIdPattern};
use crate::proto::{PaymentRequirements, SettleResponse, SupportedPaymentKind, VerifyResponse};

/// Errors a scheme facilitator may surface that are not a structured
/// [`crate::proto::PaymentVerificationError`]/[`crate::proto::SettlementError`]
/// — i.e. genuine programming/transport errors, not protocol outcomes.
#[derive(Debug, thiserror::Error)]
pub enum X402SchemeFacilitatorError {
    #[error(transparent)]
    Verification(#[from] crate::proto::PaymentVerificationError),
    #[error(transparent)]
    Settlement(#[from] crate::proto::SettlementError),
    #[error("rpc error: {0}")]
    Rpc(String),
}

/// Facilitator-role half of a mechanism: verify and settle a scheme-specific
/// payload against scheme-specific requirements.
#[async_trait::async_trait]
pub trait X402SchemeFacilitator: Send + Sync {
    fn scheme(&self) -> &'static str;
    fn network_pattern(&self) -> &ChainIdPattern;

    async fn verify(
        &self,
        payload: &serde_json::Value,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, X402SchemeFacilitatorError>;

    async fn settle(
        &self,
        payload: &serde_json::Value,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, X402SchemeFacilitatorError>;

    fn supported_kinds(&self) -> Vec<SupportedPaymentKind>;
}

/// Client-role half of a mechanism: build a signed payload for requirements
/// this client has agreed to satisfy.
#[async_trait::async_trait]
pub trait X402SchemeClient: Send + Sync {
    fn scheme(&self) -> &'static str;
    fn network_pattern(&self) -> &ChainIdPattern;

    /// The address this client would pay from, used by the balance-aware
    /// selector (spec §4.6) without committing to signing yet.
    async fn payer_address(&self, network: &ChainId) -> Option<String>;

    /// Queries the payer's balance of `requirements.asset`, in base units.
    /// Returning `0` (not an error) for "can't pay this way" is required by
    /// the selection algorithm's "never throw for zero balance" invariant.
    async fn balance(&self, requirements: &PaymentRequirements) -> u128;

    /// Builds and signs the scheme-specific payload for `requirements`.
    async fn sign_payment(
        &self,
        requirements: &PaymentRequirements,
    ) -> Result<serde_json::Value, X402SchemeFacilitatorError>;
}

/// Service-role half of a mechanism: price parsing and requirement
/// enrichment on the resource-server side (spec §4.3.1).
pub trait X402SchemeService: Send + Sync {
    fn scheme(&self) -> &'static str;
    fn network_pattern(&self) -> &ChainIdPattern;

    /// Resolves a human price (`"$0.01"`) or passthrough `AssetAmount` into
    /// full [`PaymentRequirements`] for `network`.
    fn parse_price(
        &self,
        price: &crate::util::money_amount::MoneyAmount,
        network: &ChainId,
        pay_to: &str,
        max_timeout_seconds: u64,
    ) -> Result<PaymentRequirements, PriceParseError>;

    /// Adds facilitator-declared capabilities (e.g. confirming a mechanism
    /// variant is actually supported) once `/supported` has been queried.
    fn enhance(&self, requirements: &mut PaymentRequirements, capabilities: &crate::proto::SupportedResponse);
}

#[derive(Debug, thiserror::Error)]
pub enum PriceParseError {
    #[error("no canonical stablecoin known for network {0}")]
    UnknownNetwork(ChainId),
    #[error(transparent)]
    Money(#[from] crate::util::money_amount::MoneyAmountParseError),
}

/// A registry of mechanisms for a single role, keyed by `(scheme, network-pattern)`.
///
/// Lookup is longest-match: for a given `(scheme, network)` query, an
/// [`ChainIdPattern::Exact`] registration wins over a
/// [`ChainIdPattern::Set`], which wins over a [`ChainIdPattern::Wildcard`].
pub struct SchemeRegistry<T: ?Sized> {
    entries: Vec<Arc<T>>,
}

impl<T: ?Sized> Default for SchemeRegistry<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T: ?Sized> SchemeRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: Arc<T>) {
        self.entries.push(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.entries.iter()
    }
}

/// Pattern specificity, used to rank candidate matches: larger is more specific.
fn specificity(pattern: &ChainIdPattern) -> u8 {
    match pattern {
        ChainIdPattern::Exact { .. } => 2,
        ChainIdPattern::Set { .. } => 1,
        ChainIdPattern::Wildcard { .. } => 0,
    }
}

impl SchemeRegistry<dyn X402SchemeFacilitator> {
    /// Finds the longest-match facilitator for `(scheme, network)`, per
    /// spec §4.2 and §4.4's routing rule. No match is `None`, surfaced by
    /// callers as `UnsupportedKind`/`UnsupportedScheme`.
    pub fn find(&self, scheme: &str, network: &ChainId) -> Option<&Arc<dyn X402SchemeFacilitator>> {
        self.entries
            .iter()
            .filter(|m| m.scheme() == scheme && m.network_pattern().matches(network))
            .max_by_key(|m| specificity(m.network_pattern()))
    }

    pub fn supported_kinds(&self) -> Vec<SupportedPaymentKind> {
        self.entries.iter().flat_map(|m| m.supported_kinds()).collect()
    }
}

impl SchemeRegistry<dyn X402SchemeClient> {
    pub fn find(&self, scheme: &str, network: &ChainId) -> Option<&Arc<dyn X402SchemeClient>> {
        self.entries
            .iter()
            .filter(|m| m.scheme() == scheme && m.network_pattern().matches(network))
            .max_by_key(|m| specificity(m.network_pattern()))
    }
}

impl SchemeRegistry<dyn X402SchemeService> {
    pub fn find(&self, scheme: &str, network: &ChainId) -> Option<&Arc<dyn X402SchemeService>> {
        self.entries
            .iter()
            .filter(|m| m.scheme() == scheme && m.network_pattern().matches(network))
            .max_by_key(|m| specificity(m.network_pattern()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        scheme: &'static str,
        pattern: ChainIdPattern,
        tag: &'static str,
    }

    #[async_trait::async_trait]
    impl X402SchemeFacilitator for Fixed {
        fn scheme(&self) -> &'static str {
            self.scheme
        }
        fn network_pattern(&self) -> &ChainIdPattern {
            &self.pattern
        }
        async fn verify(
            &self,
            _payload: &serde_json::Value,
            _requirements: &PaymentRequirements,
        ) -> Result<VerifyResponse, X402SchemeFacilitatorError> {
            Ok(VerifyResponse::valid(self.tag))
        }
        async fn settle(
            &self,
            _payload: &serde_json::Value,
            requirements: &PaymentRequirements,
        ) -> Result<SettleResponse, X402SchemeFacilitatorError> {
            Ok(SettleResponse::success(
                requirements.network.clone(),
                self.tag.into(),
                "0x0".into(),
            ))
        }
        fn supported_kinds(&self) -> Vec<SupportedPaymentKind> {
            vec![]
        }
    }

    #[test]
    fn exact_beats_wildcard() {
        let mut registry: SchemeRegistry<dyn X402SchemeFacilitator> = SchemeRegistry::new();
        registry.register(Arc::new(Fixed {
            scheme: "exact",
            pattern: ChainIdPattern::wildcard("eip155"),
            tag: "wildcard",
        }));
        registry.register(Arc::new(Fixed {
            scheme: "exact",
            pattern: ChainIdPattern::exact("eip155", "8453"),
            tag: "exact",
        }));
        let found = registry.find("exact", &ChainId::new("eip155", "8453")).unwrap();
        assert_eq!(found.network_pattern().to_string(), "eip155:8453");
    }

    #[test]
    fn no_match_returns_none() {
        let registry: SchemeRegistry<dyn X402SchemeFacilitator> = SchemeRegistry::new();
        assert!(registry.find("exact", &ChainId::new("eip155", "1")).is_none());
    }
}
