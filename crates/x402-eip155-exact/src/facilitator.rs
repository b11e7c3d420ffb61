//! [`X402SchemeFacilitator`] for the `exact` scheme on EIP-155 chains.
//!
//! Dispatches between the EIP-3009 and Permit2 asset transfer methods based on
//! `requirements.extra.assetTransferMethod` (defaulting to EIP-3009 when absent),
//! and ties the per-method verify/settle primitives to the facilitator trait's
//! loosely-typed `serde_json::Value` payload.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use x402_core::chain::{ChainId, ChainIdPattern};
use x402_core::proto::{PaymentRequirements, PaymentVerificationError, SettleResponse, SettlementError, SupportedPaymentKind, VerifyResponse};
use x402_core::scheme::{X402SchemeFacilitator, X402SchemeFacilitatorError};

use crate::chain::{Eip155ChainProvider, Eip155MetaTransactionProvider};
use crate::eip3009::{self, Eip3009PaymentPayload, Eip155ExactError, ExactEvmPayment, PaymentRequirementsExtra};
use crate::permit2::{self, Permit2PaymentPayload};

/// Facilitator for the `exact` scheme, backed by a single EVM chain provider.
pub struct Eip155ExactFacilitator {
    provider: Arc<Eip155ChainProvider>,
    network_pattern: ChainIdPattern,
    allow_smart_wallet_deployment: bool,
}

impl Eip155ExactFacilitator {
    pub fn new(provider: Arc<Eip155ChainProvider>) -> Self {
        let chain_id = provider.chain().as_chain_id();
        let network_pattern = ChainIdPattern::exact(chain_id.namespace(), chain_id.reference());
        Self { provider, network_pattern, allow_smart_wallet_deployment: false }
    }

    /// Allows EIP-6492 payers whose smart wallet is not yet deployed to verify/settle
    /// by deploying the wallet as part of settlement. Off by default: an undeployed
    /// wallet fails with `invalid_exact_evm_payload_undeployed_smart_wallet`.
    pub fn with_smart_wallet_deployment(mut self, allow: bool) -> Self {
        self.allow_smart_wallet_deployment = allow;
        self
    }

    fn assert_scheme_and_network(&self, requirements: &PaymentRequirements) -> Result<(), PaymentVerificationError> {
        if requirements.scheme != "exact" {
            return Err(PaymentVerificationError::UnsupportedScheme);
        }
        let expected: ChainId = self.provider.chain().as_chain_id();
        if requirements.network != expected {
            return Err(PaymentVerificationError::NetworkMismatch);
        }
        Ok(())
    }

    fn requirements_addresses(requirements: &PaymentRequirements) -> Result<(Address, Address, U256), PaymentVerificationError> {
        let asset: Address = requirements
            .asset
            .parse()
            .map_err(|_| PaymentVerificationError::TokenMismatch)?;
        let pay_to: Address = requirements
            .pay_to
            .parse()
            .map_err(|_| PaymentVerificationError::RecipientMismatch)?;
        let amount: U256 = requirements
            .amount
            .parse()
            .map_err(|_| PaymentVerificationError::InsufficientAmount)?;
        Ok((asset, pay_to, amount))
    }

    /// Picks the asset transfer method from `requirements.extra`. EIP-3009 is the
    /// default when `assetTransferMethod` is absent.
    fn is_permit2(requirements: &PaymentRequirements) -> bool {
        requirements
            .extra
            .as_ref()
            .and_then(|extra| extra.get("assetTransferMethod"))
            .and_then(|tag| tag.as_str())
            .map(|tag| tag == "permit2")
            .unwrap_or(false)
    }

    async fn verify_inner(&self, payload: &serde_json::Value, requirements: &PaymentRequirements) -> Result<Address, Eip155ExactError> {
        self.assert_scheme_and_network(requirements)?;
        let (asset, pay_to, amount_required) = Self::requirements_addresses(requirements)?;

        if Self::is_permit2(requirements) {
            let payload: Permit2PaymentPayload =
                serde_json::from_value(payload.clone()).map_err(|_| PaymentVerificationError::RecipientMismatch)?;
            permit2::verify_payment(self.provider.inner(), self.provider.chain(), &payload, asset, pay_to, amount_required).await
        } else {
            let wire: Eip3009PaymentPayload =
                serde_json::from_value(payload.clone()).map_err(|_| PaymentVerificationError::RecipientMismatch)?;
            let extra: Option<PaymentRequirementsExtra> = match &requirements.extra {
                Some(v) => serde_json::from_value(v.clone()).ok(),
                None => None,
            };
            let payment = ExactEvmPayment {
                from: wire.authorization.from,
                to: wire.authorization.to,
                value: wire.authorization.value,
                valid_after: wire.authorization.valid_after,
                valid_before: wire.authorization.valid_before,
                nonce: wire.authorization.nonce,
                signature: wire.signature,
            };
            if payment.to != pay_to {
                return Err(PaymentVerificationError::RecipientMismatch.into());
            }
            eip3009::assert_time(payment.valid_after, payment.valid_before)?;
            let eip3009_contract = crate::eip3009::IEIP3009::new(asset, self.provider.inner());
            let eip712_domain = eip3009::assert_domain(self.provider.chain(), &eip3009_contract, &asset, &extra).await?;
            eip3009::assert_enough_balance(&eip3009_contract, &payment.from, amount_required).await?;
            eip3009::assert_enough_value(&payment.value, &amount_required)?;
            eip3009::verify_payment(
                self.provider.inner(),
                &eip3009_contract,
                &payment,
                &eip712_domain,
                self.allow_smart_wallet_deployment,
            )
            .await
        }
    }

    async fn settle_inner(&self, payload: &serde_json::Value, requirements: &PaymentRequirements) -> Result<(alloy_primitives::TxHash, Address), Eip155ExactError> {
        // Always re-verify before settling: a stale or tampered payload must fail
        // the same way at settle time as it would at verify time.
        let payer = self.verify_inner(payload, requirements).await?;

        let tx_hash = if Self::is_permit2(requirements) {
            let payload: Permit2PaymentPayload = serde_json::from_value(payload.clone())
                .map_err(|_| Eip155ExactError::PaymentVerification(PaymentVerificationError::RecipientMismatch))?;
            permit2::settle_payment(self.provider.as_ref(), self.provider.chain(), &payload).await?
        } else {
            let wire: Eip3009PaymentPayload = serde_json::from_value(payload.clone())
                .map_err(|_| Eip155ExactError::PaymentVerification(PaymentVerificationError::RecipientMismatch))?;
            let (asset, _pay_to, _amount) = Self::requirements_addresses(requirements)?;
            let extra: Option<PaymentRequirementsExtra> = match &requirements.extra {
                Some(v) => serde_json::from_value(v.clone()).ok(),
                None => None,
            };
            let payment = ExactEvmPayment {
                from: wire.authorization.from,
                to: wire.authorization.to,
                value: wire.authorization.value,
                valid_after: wire.authorization.valid_after,
                valid_before: wire.authorization.valid_before,
                nonce: wire.authorization.nonce,
                signature: wire.signature,
            };
            let eip3009_contract = crate::eip3009::IEIP3009::new(asset, self.provider.inner());
            let eip712_domain = eip3009::assert_domain(self.provider.chain(), &eip3009_contract, &asset, &extra).await?;
            eip3009::settle_payment(
                self.provider.as_ref(),
                &eip3009_contract,
                &payment,
                &eip712_domain,
                self.allow_smart_wallet_deployment,
            )
            .await?
        };
        Ok((tx_hash, payer))
    }
}

#[async_trait]
impl X402SchemeFacilitator for Eip155ExactFacilitator {
    fn scheme(&self) -> &'static str {
        "exact"
    }

    fn network_pattern(&self) -> &ChainIdPattern {
        &self.network_pattern
    }

    /// All chain RPC calls made during verification must honor the caller-supplied
    /// deadline (`requirements.max_timeout_seconds`); past it, verification fails
    /// with the stable `rpc_timeout` reason rather than hanging.
    async fn verify(&self, payload: &serde_json::Value, requirements: &PaymentRequirements) -> Result<VerifyResponse, X402SchemeFacilitatorError> {
        let deadline = Duration::from_secs(requirements.max_timeout_seconds);
        match tokio::time::timeout(deadline, self.verify_inner(payload, requirements)).await {
            Ok(Ok(payer)) => Ok(VerifyResponse::valid(payer.to_string())),
            Ok(Err(Eip155ExactError::PaymentVerification(reason))) => Ok(VerifyResponse::invalid(reason_str(&reason))),
            Ok(Err(other)) => Err(other.into()),
            Err(_elapsed) => Ok(VerifyResponse::invalid(reason_str(&PaymentVerificationError::RpcTimeout))),
        }
    }

    /// Same caller-supplied deadline as [`Self::verify`], surfaced as `rpc_timeout`
    /// on the settlement side per spec §4.3.4.
    async fn settle(&self, payload: &serde_json::Value, requirements: &PaymentRequirements) -> Result<SettleResponse, X402SchemeFacilitatorError> {
        let network = requirements.network.clone();
        let deadline = Duration::from_secs(requirements.max_timeout_seconds);
        match tokio::time::timeout(deadline, self.settle_inner(payload, requirements)).await {
            Ok(Ok((tx_hash, payer))) => Ok(SettleResponse::success(network, payer.to_string(), tx_hash.to_string())),
            Ok(Err(Eip155ExactError::PaymentVerification(reason))) => Ok(SettleResponse::failure(network, reason_str(&reason))),
            Ok(Err(other)) => Err(other.into()),
            Err(_elapsed) => Ok(SettleResponse::failure(network, reason_str(&SettlementError::RpcTimeout))),
        }
    }

    fn supported_kinds(&self) -> Vec<SupportedPaymentKind> {
        vec![SupportedPaymentKind {
            x402_version: x402_core::proto::X402Version,
            scheme: "exact".to_string(),
            network: self.provider.chain().as_chain_id(),
            extra: None,
        }]
    }
}

fn reason_str<E: serde::Serialize + std::fmt::Display>(err: &E) -> String {
    serde_json::to_value(err)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirements(extra: Option<serde_json::Value>) -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".into(),
            network: ChainId::new("eip155", "84532"),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            amount: "10000".into(),
            pay_to: "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA9604".into(),
            max_timeout_seconds: 60,
            extra,
        }
    }

    #[test]
    fn is_permit2_defaults_to_false_without_extra() {
        assert!(!Eip155ExactFacilitator::is_permit2(&requirements(None)));
    }

    #[test]
    fn is_permit2_true_only_when_tagged() {
        let tagged = requirements(Some(serde_json::json!({"assetTransferMethod": "permit2"})));
        assert!(Eip155ExactFacilitator::is_permit2(&tagged));
        let other = requirements(Some(serde_json::json!({"assetTransferMethod": "eip3009"})));
        assert!(!Eip155ExactFacilitator::is_permit2(&other));
    }

    #[test]
    fn requirements_addresses_parses_valid_fields() {
        let req = requirements(None);
        let (asset, pay_to, amount) = Eip155ExactFacilitator::requirements_addresses(&req).unwrap();
        assert_eq!(asset, req.asset.parse::<Address>().unwrap());
        assert_eq!(pay_to, req.pay_to.parse::<Address>().unwrap());
        assert_eq!(amount, U256::from(10000u64));
    }

    #[test]
    fn requirements_addresses_rejects_malformed_asset() {
        let mut req = requirements(None);
        req.asset = "not-an-address".into();
        let err = Eip155ExactFacilitator::requirements_addresses(&req).unwrap_err();
        assert!(matches!(err, PaymentVerificationError::TokenMismatch));
    }

    #[test]
    fn reason_str_uses_serialized_variant_name() {
        let reason = reason_str(&PaymentVerificationError::RecipientMismatch);
        assert!(!reason.is_empty());
    }
}
