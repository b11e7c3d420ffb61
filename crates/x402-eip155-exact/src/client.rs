//! [`X402SchemeClient`] for the `exact` scheme: signs EIP-3009 or Permit2
//! payloads for a single configured EIP-155 chain.
//!
//! No RPC access is required (or available — the `client` feature pulls in
//! no provider) to sign a payment; [`balance`](X402SchemeClient::balance)
//! always reports zero, deferring to the facilitator's own on-chain checks.

use std::sync::Arc;

use alloy_primitives::{Address, FixedBytes, Signature, U256};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolStruct;
use async_trait::async_trait;
use rand::{Rng, rng};

use x402_core::chain::{ChainId, ChainIdPattern};
use x402_core::proto::PaymentRequirements;
use x402_core::scheme::{X402SchemeClient, X402SchemeFacilitatorError};
use x402_core::timestamp::UnixTimestamp;

use crate::chain::Eip155ChainReference;
use crate::eip3009::{Eip3009Authorization, Eip3009PaymentPayload, PaymentRequirementsExtra};
use crate::permit2::{self, Permit2PaymentPayload};

/// Abstracts signing so both owned and `Arc`-shared signers work, since
/// alloy's `Signer` trait isn't implemented for `Arc<T>`.
#[async_trait]
pub trait SignerLike: Send + Sync {
    fn address(&self) -> Address;
    async fn sign_hash(&self, hash: &FixedBytes<32>) -> Result<Signature, alloy_signer::Error>;
}

#[async_trait]
impl SignerLike for PrivateKeySigner {
    fn address(&self) -> Address {
        PrivateKeySigner::address(self)
    }

    async fn sign_hash(&self, hash: &FixedBytes<32>) -> Result<Signature, alloy_signer::Error> {
        alloy_signer::Signer::sign_hash(self, hash).await
    }
}

#[async_trait]
impl SignerLike for Arc<PrivateKeySigner> {
    fn address(&self) -> Address {
        PrivateKeySigner::address(self.as_ref())
    }

    async fn sign_hash(&self, hash: &FixedBytes<32>) -> Result<Signature, alloy_signer::Error> {
        alloy_signer::Signer::sign_hash(self.as_ref(), hash).await
    }
}

/// Client-side binding of the `exact` scheme to one EVM chain and signer.
pub struct Eip155ExactClient<S> {
    signer: S,
    chain: Eip155ChainReference,
    network_pattern: ChainIdPattern,
}

impl<S: SignerLike> Eip155ExactClient<S> {
    pub fn new(signer: S, chain: Eip155ChainReference) -> Self {
        let chain_id = chain.as_chain_id();
        let network_pattern = ChainIdPattern::exact(chain_id.namespace(), chain_id.reference());
        Self { signer, chain, network_pattern }
    }

    fn is_permit2(requirements: &PaymentRequirements) -> bool {
        requirements
            .extra
            .as_ref()
            .and_then(|extra| extra.get("assetTransferMethod"))
            .and_then(|tag| tag.as_str())
            .map(|tag| tag == "permit2")
            .unwrap_or(false)
    }

    async fn sign_eip3009(&self, requirements: &PaymentRequirements) -> Result<Eip3009PaymentPayload, X402SchemeFacilitatorError> {
        let asset_address: Address = requirements
            .asset
            .parse()
            .map_err(|_| X402SchemeFacilitatorError::Rpc("malformed asset address".into()))?;
        let pay_to: Address = requirements
            .pay_to
            .parse()
            .map_err(|_| X402SchemeFacilitatorError::Rpc("malformed pay_to address".into()))?;
        let amount: U256 = requirements
            .amount
            .parse()
            .map_err(|_| X402SchemeFacilitatorError::Rpc("malformed amount".into()))?;
        let extra: Option<PaymentRequirementsExtra> = match &requirements.extra {
            Some(v) => serde_json::from_value(v.clone()).ok(),
            None => None,
        };
        let (name, version) = match extra {
            Some(PaymentRequirementsExtra { name: Some(name), version: Some(version) }) => (name, version),
            _ => return Err(X402SchemeFacilitatorError::Verification(x402_core::proto::PaymentVerificationError::MissingEip712Domain)),
        };

        let domain = alloy_sol_types::eip712_domain! {
            name: name,
            version: version,
            chain_id: self.chain.inner(),
            verifying_contract: asset_address,
        };

        let now = UnixTimestamp::now();
        let valid_after = UnixTimestamp::from_secs(now.as_secs().saturating_sub(10 * 60));
        let valid_before = now + requirements.max_timeout_seconds;
        let nonce: [u8; 32] = rng().random();
        let nonce = FixedBytes(nonce);

        let authorization = Eip3009Authorization {
            from: self.signer.address(),
            to: pay_to,
            value: amount,
            valid_after,
            valid_before,
            nonce,
        };

        let transfer = crate::eip3009::TransferWithAuthorization {
            from: authorization.from,
            to: authorization.to,
            value: authorization.value,
            validAfter: U256::from(authorization.valid_after.as_secs()),
            validBefore: U256::from(authorization.valid_before.as_secs()),
            nonce: authorization.nonce,
        };
        let hash = transfer.eip712_signing_hash(&domain);
        let signature = self
            .signer
            .sign_hash(&hash)
            .await
            .map_err(|e| X402SchemeFacilitatorError::Rpc(e.to_string()))?;

        Ok(Eip3009PaymentPayload {
            authorization,
            signature: signature.as_bytes().into(),
        })
    }

    async fn sign_permit2(&self, requirements: &PaymentRequirements) -> Result<Permit2PaymentPayload, X402SchemeFacilitatorError> {
        let token: Address = requirements
            .asset
            .parse()
            .map_err(|_| X402SchemeFacilitatorError::Rpc("malformed asset address".into()))?;
        let recipient: Address = requirements
            .pay_to
            .parse()
            .map_err(|_| X402SchemeFacilitatorError::Rpc("malformed pay_to address".into()))?;
        let amount: U256 = requirements
            .amount
            .parse()
            .map_err(|_| X402SchemeFacilitatorError::Rpc("malformed amount".into()))?;

        let chain_reference = self.chain.inner();
        let settlement_contract = permit2::settlement_address(chain_reference)
            .ok_or(X402SchemeFacilitatorError::Verification(
                x402_core::proto::PaymentVerificationError::SettlementContractNotDeployed,
            ))?;

        let resource_url = requirements.extra.as_ref().and_then(|extra| extra.get("resourceUrl")).and_then(|v| v.as_str());
        let payment_id = permit2::payment_id(resource_url);

        let now = UnixTimestamp::now();
        let deadline = now + requirements.max_timeout_seconds;
        let nonce_bytes: [u8; 32] = rng().random();
        let nonce = U256::from_be_bytes(nonce_bytes);

        let mut payload = Permit2PaymentPayload {
            token,
            amount,
            nonce,
            deadline,
            owner: self.signer.address(),
            recipient,
            payment_id,
            signature: Default::default(),
        };

        let domain = permit2::eip712_domain_for(&self.chain);
        let hash = permit2::signing_hash(&payload, settlement_contract, &domain);
        let signature = self
            .signer
            .sign_hash(&hash)
            .await
            .map_err(|e| X402SchemeFacilitatorError::Rpc(e.to_string()))?;
        payload.signature = signature.as_bytes().into();

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_signer_local::PrivateKeySigner;

    fn client() -> Eip155ExactClient<PrivateKeySigner> {
        let signer: PrivateKeySigner = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318".parse().unwrap();
        Eip155ExactClient::new(signer, Eip155ChainReference::new(84532))
    }

    fn eip3009_requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".into(),
            network: ChainId::new("eip155", "84532"),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            amount: "10000".into(),
            pay_to: "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA9604".into(),
            max_timeout_seconds: 60,
            extra: Some(serde_json::json!({"name": "USDC", "version": "2"})),
        }
    }

    #[tokio::test]
    async fn signs_eip3009_when_extra_has_domain() {
        let client = client();
        let requirements = eip3009_requirements();
        let signed = client.sign_payment(&requirements).await.unwrap();
        assert!(signed.get("authorization").is_some());
        assert!(signed.get("signature").is_some());
    }

    #[tokio::test]
    async fn signs_permit2_when_extra_tags_it() {
        let client = client();
        let mut requirements = eip3009_requirements();
        requirements.extra = Some(serde_json::json!({"assetTransferMethod": "permit2"}));
        let signed = client.sign_payment(&requirements).await.unwrap();
        assert!(signed.get("nonce").is_some());
        assert!(signed.get("paymentId").is_some());
    }

    #[tokio::test]
    async fn payer_address_matches_configured_chain_only() {
        let client = client();
        let own = client.payer_address(&ChainId::new("eip155", "84532")).await;
        assert!(own.is_some());
        let other = client.payer_address(&ChainId::new("eip155", "8453")).await;
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn missing_eip712_domain_fails_without_permit2_tag() {
        let client = client();
        let mut requirements = eip3009_requirements();
        requirements.extra = None;
        let err = client.sign_payment(&requirements).await.unwrap_err();
        assert!(matches!(
            err,
            X402SchemeFacilitatorError::Verification(x402_core::proto::PaymentVerificationError::MissingEip712Domain)
        ));
    }
}

#[async_trait]
impl<S: SignerLike> X402SchemeClient for Eip155ExactClient<S> {
    fn scheme(&self) -> &'static str {
        "exact"
    }

    fn network_pattern(&self) -> &ChainIdPattern {
        &self.network_pattern
    }

    async fn payer_address(&self, network: &ChainId) -> Option<String> {
        if *network == self.chain.as_chain_id() {
            Some(self.signer.address().to_string())
        } else {
            None
        }
    }

    async fn balance(&self, _requirements: &PaymentRequirements) -> u128 {
        0
    }

    async fn sign_payment(&self, requirements: &PaymentRequirements) -> Result<serde_json::Value, X402SchemeFacilitatorError> {
        if Self::is_permit2(requirements) {
            let payload = self.sign_permit2(requirements).await?;
            serde_json::to_value(payload).map_err(|e| X402SchemeFacilitatorError::Rpc(e.to_string()))
        } else {
            let payload = self.sign_eip3009(requirements).await?;
            serde_json::to_value(payload).map_err(|e| X402SchemeFacilitatorError::Rpc(e.to_string()))
        }
    }
}
