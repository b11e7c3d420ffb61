//! Permit2 settlement-contract sub-method: a `PaymentOrder` witness bundled
//! into a `PermitWitnessTransferFrom` signature, redeemed via a dedicated
//! settlement contract that forwards funds in the same transaction Permit2
//! moves them (the payer never grants the facilitator an allowance, only
//! Permit2).

use std::sync::OnceLock;

use alloy_primitives::{Address, B256, Bytes, U256, address, keccak256};
use alloy_provider::Provider;
use alloy_sol_types::{Eip712Domain, SolCall, SolStruct, eip712_domain, sol};
use serde::{Deserialize, Serialize};

#[cfg(feature = "telemetry")]
use tracing::Instrument;
#[cfg(feature = "telemetry")]
use tracing::instrument;

use x402_core::proto::PaymentVerificationError;

use crate::chain::Eip155ChainReference;
use crate::chain::erc20::IERC20;
use crate::eip3009::{Eip155ExactError, StructuredSignature, assert_enough_value};

/// Canonical Permit2 contract address, identical on every EVM chain.
pub const PERMIT2_ADDRESS: Address = address!("0x000000000022D473030F116dDEE9F6B43aC78BA3");

/// Fallback seed for `paymentId` when a route offers no `extra.resourceUrl`.
const DEFAULT_PAYMENT_ID_SEED: &str = "x402-payment";

/// Compile-time default settlement contract addresses, keyed by numeric
/// chain id. Overridden at runtime per §6's env precedence.
fn default_settlement_address(chain_reference: u64) -> Option<Address> {
    match chain_reference {
        8453 => Some(address!("0x1111000000000000000000000000000000aaaa")),
        84532 => Some(address!("0x2222000000000000000000000000000000bbbb")),
        _ => None,
    }
}

static SETTLEMENT_ADDRESS_CACHE: OnceLock<dashmap::DashMap<u64, Option<Address>>> = OnceLock::new();

/// Resolves the settlement contract address for `chain_reference`, in order:
/// `X402_SETTLEMENT_ADDRESS_<chainId>` env var, then `X402_SETTLEMENT_ADDRESS`,
/// then the compile-time table. Memoized lazily per chain so a `.env` loader
/// that runs after process start is still observed on first lookup.
pub fn settlement_address(chain_reference: u64) -> Option<Address> {
    let cache = SETTLEMENT_ADDRESS_CACHE.get_or_init(dashmap::DashMap::new);
    if let Some(existing) = cache.get(&chain_reference) {
        return *existing;
    }
    let per_chain_var = format!("X402_SETTLEMENT_ADDRESS_{chain_reference}");
    let resolved = std::env::var(&per_chain_var)
        .ok()
        .or_else(|| std::env::var("X402_SETTLEMENT_ADDRESS").ok())
        .and_then(|s| s.parse::<Address>().ok())
        .or_else(|| default_settlement_address(chain_reference));
    cache.insert(chain_reference, resolved);
    resolved
}

/// Derives `paymentId = keccak256(utf8(resourceUrl ?? "x402-payment"))`.
pub fn payment_id(resource_url: Option<&str>) -> B256 {
    keccak256(resource_url.unwrap_or(DEFAULT_PAYMENT_ID_SEED).as_bytes())
}

sol!(
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug, Serialize, Deserialize)]
    struct TokenPermissions {
        address token;
        uint256 amount;
    }

    /// The x402 settlement contract's order struct, bundled as Permit2's witness.
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug, Serialize, Deserialize)]
    struct PaymentOrder {
        address token;
        uint256 amount;
        address recipient;
        bytes32 paymentId;
        uint256 nonce;
        uint256 deadline;
    }

    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    struct PermitWitnessTransferFrom {
        TokenPermissions permitted;
        address spender;
        uint256 nonce;
        uint256 deadline;
        PaymentOrder witness;
    }
);

/// The witness type string Permit2 hashes alongside `PermitTransferFrom`,
/// per spec. Byte-for-byte fixed; any deviation breaks verification.
const WITNESS_TYPE_STRING: &str = "PaymentOrder witness)PaymentOrder(address token,uint256 amount,address recipient,bytes32 paymentId,uint256 nonce,uint256 deadline)TokenPermissions(address token,uint256 amount)";

sol!(
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface ISettlementContract {
        function executePayment(PaymentOrder order, address payer, bytes signature) external;
    }
);

/// The signed Permit2 payload as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permit2PaymentPayload {
    pub token: Address,
    #[serde(with = "crate::chain::types::decimal_u256")]
    pub amount: U256,
    #[serde(with = "crate::chain::types::decimal_u256")]
    pub nonce: U256,
    pub deadline: x402_core::timestamp::UnixTimestamp,
    pub owner: Address,
    pub recipient: Address,
    pub payment_id: B256,
    pub signature: Bytes,
}

pub(crate) fn order_from_payload(payload: &Permit2PaymentPayload) -> PaymentOrder {
    PaymentOrder {
        token: payload.token,
        amount: payload.amount,
        recipient: payload.recipient,
        paymentId: payload.payment_id,
        nonce: payload.nonce,
        deadline: U256::from(payload.deadline.as_secs()),
    }
}

pub(crate) fn eip712_domain_for(chain: &Eip155ChainReference) -> Eip712Domain {
    eip712_domain! {
        name: "Permit2",
        chain_id: chain.inner(),
        verifying_contract: PERMIT2_ADDRESS,
    }
}

pub(crate) fn signing_hash(payload: &Permit2PaymentPayload, spender: Address, domain: &Eip712Domain) -> B256 {
    let transfer = PermitWitnessTransferFrom {
        permitted: TokenPermissions {
            token: payload.token,
            amount: payload.amount,
        },
        spender,
        nonce: payload.nonce,
        deadline: U256::from(payload.deadline.as_secs()),
        witness: order_from_payload(payload),
    };
    transfer.eip712_signing_hash(domain)
}

/// Offline checks requiring no RPC: recipient/token match, time window,
/// sufficient authorized amount. Mirrors spec §4.3.3's Permit2 ordering.
pub fn assert_offchain(
    payload: &Permit2PaymentPayload,
    asset: Address,
    pay_to: Address,
    amount_required: U256,
) -> Result<(), PaymentVerificationError> {
    if payload.token != asset {
        return Err(PaymentVerificationError::TokenMismatch);
    }
    if payload.recipient != pay_to {
        return Err(PaymentVerificationError::RecipientMismatch);
    }
    let now = x402_core::timestamp::UnixTimestamp::now();
    if payload.deadline < now + 6 {
        return Err(PaymentVerificationError::Permit2DeadlineExpired);
    }
    assert_enough_value(&payload.amount, &amount_required)?;
    Ok(())
}

/// Verifies the EIP-712 signature recovers to `payload.owner`. Non-EOA
/// signatures (EIP-1271/6492) are out of scope for Permit2: the settlement
/// contract only accepts direct ECDSA signatures over the witness hash.
pub fn assert_signature(payload: &Permit2PaymentPayload, spender: Address, domain: &Eip712Domain) -> Result<(), PaymentVerificationError> {
    let hash = signing_hash(payload, spender, domain);
    let structured = StructuredSignature::try_from_bytes(payload.signature.clone(), payload.owner, &hash)
        .map_err(|_| PaymentVerificationError::InvalidSignature)?;
    match structured {
        StructuredSignature::EOA(_) => Ok(()),
        _ => Err(PaymentVerificationError::InvalidSignature),
    }
}

/// Checks the payer's ERC-20 allowance to the canonical Permit2 contract. Per
/// spec §4.3.3, an unreachable RPC makes this check non-fatal: the allowance
/// check is skipped rather than failing verification, since Permit2 itself
/// re-checks the allowance when the settlement contract redeems the permit.
pub async fn assert_onchain_allowance<P: Provider>(
    token_contract: &IERC20::IERC20Instance<P>,
    payer: Address,
    required_amount: U256,
) -> Result<(), Eip155ExactError> {
    let fut = token_contract.allowance(payer, PERMIT2_ADDRESS).call().into_future();
    #[cfg(feature = "telemetry")]
    let allowance = fut
        .instrument(tracing::info_span!("fetch_permit2_allowance", token_contract = %token_contract.address(), sender = %payer, otel.kind = "client"))
        .await;
    #[cfg(not(feature = "telemetry"))]
    let allowance = fut.await;
    let allowance = match allowance {
        Ok(allowance) => allowance,
        Err(_) => return Ok(()),
    };
    if allowance < required_amount {
        Err(PaymentVerificationError::InsufficientAllowance.into())
    } else {
        Ok(())
    }
}

/// Checks the payer's on-chain token balance. Non-fatal on an unreachable
/// RPC, for the same reason as [`assert_onchain_allowance`].
pub async fn assert_onchain_balance<P: Provider>(
    token_contract: &IERC20::IERC20Instance<P>,
    payer: Address,
    required_amount: U256,
) -> Result<(), Eip155ExactError> {
    let fut = token_contract.balanceOf(payer).call().into_future();
    #[cfg(feature = "telemetry")]
    let balance = fut
        .instrument(tracing::info_span!("fetch_balance", token_contract = %token_contract.address(), sender = %payer, otel.kind = "client"))
        .await;
    #[cfg(not(feature = "telemetry"))]
    let balance = fut.await;
    let balance = match balance {
        Ok(balance) => balance,
        Err(_) => return Ok(()),
    };
    if balance < required_amount {
        Err(PaymentVerificationError::InsufficientFunds.into())
    } else {
        Ok(())
    }
}

/// Verifies a Permit2 payment end to end: offline checks, settlement
/// contract deployment, signature recovery, and on-chain balance/allowance.
#[cfg_attr(feature = "telemetry", instrument(skip_all, err))]
pub async fn verify_payment<P: Provider>(
    provider: P,
    chain: &Eip155ChainReference,
    payload: &Permit2PaymentPayload,
    asset: Address,
    pay_to: Address,
    amount_required: U256,
) -> Result<Address, Eip155ExactError> {
    assert_offchain(payload, asset, pay_to, amount_required)?;

    let settlement_contract = settlement_address(chain.inner()).ok_or(Eip155ExactError::PaymentVerification(
        PaymentVerificationError::SettlementContractNotDeployed,
    ))?;

    let domain = eip712_domain_for(chain);
    assert_signature(payload, settlement_contract, &domain)?;

    let token_contract = IERC20::new(payload.token, &provider);
    assert_onchain_allowance(&token_contract, payload.owner, amount_required).await?;
    assert_onchain_balance(&token_contract, payload.owner, amount_required).await?;

    Ok(payload.owner)
}

/// Settles a Permit2 payment by calling `executePayment` on the resolved
/// settlement contract; it performs `permitWitnessTransferFrom` internally
/// and forwards funds to `order.recipient` in the same transaction.
pub async fn settle_payment<P, E>(
    provider: P,
    chain: &Eip155ChainReference,
    payload: &Permit2PaymentPayload,
) -> Result<alloy_primitives::TxHash, Eip155ExactError>
where
    P: crate::chain::Eip155MetaTransactionProvider<Error = E>,
    Eip155ExactError: From<E>,
{
    let settlement_contract = settlement_address(chain.inner()).ok_or(Eip155ExactError::PaymentVerification(
        PaymentVerificationError::SettlementContractNotDeployed,
    ))?;

    let order = order_from_payload(payload);
    let call = ISettlementContract::executePaymentCall {
        order,
        payer: payload.owner,
        signature: payload.signature.clone(),
    };

    let receipt = crate::chain::Eip155MetaTransactionProvider::send_transaction(
        &provider,
        crate::chain::MetaTransaction {
            to: settlement_contract,
            calldata: call.abi_encode().into(),
            confirmations: 1,
        },
    )
    .await?;

    if receipt.status() {
        Ok(receipt.transaction_hash)
    } else {
        Err(Eip155ExactError::TransactionReverted(receipt.transaction_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn witness_type_string_matches_spec_exactly() {
        assert_eq!(
            WITNESS_TYPE_STRING,
            "PaymentOrder witness)PaymentOrder(address token,uint256 amount,address recipient,bytes32 paymentId,uint256 nonce,uint256 deadline)TokenPermissions(address token,uint256 amount)"
        );
    }

    #[test]
    fn payment_id_defaults_to_fixed_seed() {
        let default_id = payment_id(None);
        let explicit_id = payment_id(Some("x402-payment"));
        assert_eq!(default_id, explicit_id);
        let other_id = payment_id(Some("https://example.com/resource"));
        assert_ne!(default_id, other_id);
    }

    #[test]
    fn settlement_address_resolves_from_env_override() {
        let chain_id: u64 = 999_001;
        unsafe {
            std::env::set_var(format!("X402_SETTLEMENT_ADDRESS_{chain_id}"), "0x1000000000000000000000000000000000000aa");
        }
        let resolved = settlement_address(chain_id);
        assert_eq!(resolved, Some(address!("0x1000000000000000000000000000000000000aa")));
    }
}
