//! Wire format types for the x402 protocol, fixed at version 2.
//!
//! A single protocol version means there is no `v1`/`v2` split and no
//! version-negotiation step: every message carries `x402Version: 2` and a
//! mismatch is a hard failure, not something to fall back from.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

use crate::chain::ChainId;

/// Version marker for x402 protocol version 2. Serializes as the integer `2`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version;

impl X402Version {
    pub const VALUE: u8 = 2;
}

impl Serialize for X402Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for X402Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        if num == Self::VALUE {
            Ok(X402Version)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported x402Version {num}, this implementation speaks only version {}",
                Self::VALUE
            )))
        }
    }
}

impl fmt::Display for X402Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::VALUE)
    }
}

/// Metadata about the resource being paid for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub url: String,
    pub description: String,
    pub mime_type: String,
}

/// Payment terms offered by the server for one mechanism.
///
/// Generic over the scheme-specific `extra` payload so
/// `x402-eip155-exact` can plug in its own `AssetTransferMethod` shape
/// while `x402-core` stays chain-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(bound(deserialize = "TExtra: Deserialize<'de>"))]
pub struct PaymentRequirements<TExtra = serde_json::Value> {
    pub scheme: String,
    pub network: ChainId,
    pub asset: String,
    pub amount: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<TExtra>,
}

/// HTTP 402 response body, carried base64url-encoded in `PAYMENT-REQUIRED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired<TExtra = serde_json::Value> {
    pub x402_version: X402Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub resource: ResourceInfo,
    pub accepts: Vec<PaymentRequirements<TExtra>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<HashMap<String, serde_json::Value>>,
}

/// Signed payment authorization, carried base64url-encoded in `PAYMENT-SIGNATURE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload<TPayload, TExtra = serde_json::Value> {
    pub x402_version: X402Version,
    pub scheme: String,
    pub network: ChainId,
    pub payload: TPayload,
    pub accepted: PaymentRequirements<TExtra>,
}

/// Settlement outcome, carried base64url-encoded in `PAYMENT-RESPONSE` on 2xx
/// responses, and returned directly as the body of `/settle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    /// Transaction hash on success, empty string on failure.
    #[serde(default)]
    pub transaction: String,
    pub network: ChainId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl SettleResponse {
    pub fn success(network: ChainId, payer: String, transaction: String) -> Self {
        Self {
            success: true,
            transaction,
            network,
            payer: Some(payer),
            error_reason: None,
        }
    }

    pub fn failure(network: ChainId, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction: String::new(),
            network,
            payer: None,
            error_reason: Some(reason.into()),
        }
    }
}

/// Response body of `POST /verify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
}

impl VerifyResponse {
    pub fn valid(payer: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            payer: Some(payer.into()),
            invalid_reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            payer: None,
            invalid_reason: Some(reason.into()),
        }
    }
}

/// One registered `(scheme, network)` pairing, as advertised by `GET /supported`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedPaymentKind {
    pub x402_version: X402Version,
    pub scheme: String,
    pub network: ChainId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Response body of `GET /supported`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    pub kinds: Vec<SupportedPaymentKind>,
    #[serde(default)]
    pub extensions: Vec<String>,
}

/// The stable, machine-checkable verification/settlement failure reasons from
/// spec §4.3.3/§4.3.4/§7. Serializes to the exact snake_case strings test
/// suites key off of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentVerificationError {
    #[error("unsupported scheme")]
    UnsupportedScheme,
    #[error("network mismatch")]
    NetworkMismatch,
    #[error("accepted requirements do not match the route's offered requirements")]
    AcceptedRequirementsMismatch,
    #[error("missing EIP-712 domain in requirements.extra")]
    MissingEip712Domain,
    #[error("recipient does not match requirements.payTo")]
    #[serde(rename = "invalid_exact_evm_payload_recipient_mismatch")]
    RecipientMismatch,
    #[error("authorization validBefore is too close to now")]
    #[serde(rename = "invalid_exact_evm_payload_authorization_valid_before")]
    ValidBeforeTooSoon,
    #[error("authorization validAfter is in the future")]
    #[serde(rename = "invalid_exact_evm_payload_authorization_valid_after")]
    ValidAfterInFuture,
    #[error("authorization value is less than the required amount")]
    #[serde(rename = "invalid_exact_evm_payload_authorization_value")]
    InsufficientAuthorizationValue,
    #[error("payer balance is insufficient")]
    InsufficientFunds,
    #[error("payer permit2 allowance is insufficient")]
    #[serde(rename = "insufficient_permit2_allowance")]
    InsufficientAllowance,
    #[error("payer signature does not recover to the claimed address")]
    InvalidSignature,
    #[error("token does not match requirements.asset")]
    TokenMismatch,
    #[error("settlement contract is not deployed for this network")]
    SettlementContractNotDeployed,
    #[error("permit2 deadline is too close to now")]
    Permit2DeadlineExpired,
    #[error("authorized amount is less than the required amount")]
    InsufficientAmount,
    #[error("signature is ERC-6492 but the smart wallet is undeployed and deployment is disabled")]
    InvalidExactEvmPayloadUndeployedSmartWallet,
    #[error("rpc call did not complete before the caller-supplied deadline")]
    RpcTimeout,
}

/// Settlement-only failure reasons not already covered by verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementError {
    #[error("on-chain transaction reverted or receipt status was not success")]
    TransactionFailed,
    #[error("on-chain transaction receipt had an unexpected status")]
    InvalidTransactionState,
    #[error("rpc call did not complete before the caller-supplied deadline")]
    RpcTimeout,
    #[error("settlement contract is not deployed for this network")]
    SettlementContractNotDeployed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_round_trips() {
        let json = serde_json::to_string(&X402Version).unwrap();
        assert_eq!(json, "2");
        let back: X402Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, X402Version);
    }

    #[test]
    fn version_mismatch_rejected() {
        let result: Result<X402Version, _> = serde_json::from_str("1");
        assert!(result.is_err());
    }

    #[test]
    fn verification_error_serializes_to_stable_reason() {
        let err = PaymentVerificationError::ValidBeforeTooSoon;
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"invalid_exact_evm_payload_authorization_valid_before\"");
    }

    #[test]
    fn settle_response_round_trips() {
        let response = SettleResponse::success(
            ChainId::new("eip155", "84532"),
            "0xPAYER".to_string(),
            "0xdeadbeef".to_string(),
        );
        let json = serde_json::to_string(&response).unwrap();
        let back: SettleResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.success, true);
        assert_eq!(back.transaction, "0xdeadbeef");
    }
}
