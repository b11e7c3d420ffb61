//! EIP-3009 `transferWithAuthorization` primitives: signature normalization,
//! on-chain verification, and settlement.
//!
//! Supports three signature shapes over the same EIP-712 digest: a plain EOA
//! signature (65 or 64 bytes), an EIP-1271 contract signature, and an
//! EIP-6492 counterfactual-wallet wrapper (the wallet may not be deployed yet).

use alloy_contract::SolCallBuilder;
use alloy_primitives::{Address, B256, Bytes, Signature, TxHash, U256, address, hex};
use alloy_provider::bindings::IMulticall3;
use alloy_provider::{MULTICALL3_ADDRESS, MulticallError, MulticallItem, PendingTransactionError, Provider};
use alloy_sol_types::{Eip712Domain, SolCall, SolStruct, eip712_domain, sol};
use alloy_transport::TransportError;
use serde::{Deserialize, Serialize};

#[cfg(feature = "telemetry")]
use tracing::Instrument;
#[cfg(feature = "telemetry")]
use tracing::instrument;

use x402_core::proto::PaymentVerificationError;
use x402_core::scheme::X402SchemeFacilitatorError;
use x402_core::timestamp::UnixTimestamp;

use crate::chain::{Eip155ChainReference, Eip155MetaTransactionProvider, MetaTransaction, MetaTransactionSendError};

/// Signature verifier for EIP-6492/EIP-1271, deployed on every chain this
/// crate supports. If absent on a target chain, counterfactual-wallet
/// verification will fail until the validator is deployed there.
pub const VALIDATOR_ADDRESS: Address = address!("0xdAcD51A54883eb67D95FAEb2BBfdC4a9a6BD2a3B");

sol!(
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IEIP3009 {
        function name() external view returns (string);
        function version() external view returns (string);
        function balanceOf(address account) external view returns (uint256);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            bytes signature
        ) external;
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
);

sol!(
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface Validator6492 {
        function isValidSigWithSideEffects(address signer, bytes32 hash, bytes signature) external returns (bool);
    }
);

/// A fully specified ERC-3009 authorization payload for EVM settlement.
#[derive(Debug)]
pub struct ExactEvmPayment {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: B256,
    pub signature: Bytes,
}

/// The signed authorization as it travels on the wire, before chain/requirements
/// cross-checks turn it into an [`ExactEvmPayment`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip3009Authorization {
    pub from: Address,
    pub to: Address,
    #[serde(with = "crate::chain::types::decimal_u256")]
    pub value: U256,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: B256,
}

/// Wire shape of the EIP-3009 payload variant, as carried in `PAYMENT-SIGNATURE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip3009PaymentPayload {
    pub authorization: Eip3009Authorization,
    pub signature: Bytes,
}

/// EIP-712 domain parameters from `PaymentRequirements.extra`. Both fields are
/// required for EIP-3009; a missing one fails verification outright.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRequirementsExtra {
    pub name: Option<String>,
    pub version: Option<String>,
}

sol!(
    /// Matches the EIP-712 typed-data struct signed by the payer.
    #[derive(Serialize, Deserialize)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
);

/// Validates the current time is within `[validAfter, validBefore)`, with a
/// 6-second grace window on expiry to absorb clock skew and RPC latency.
#[cfg_attr(feature = "telemetry", instrument(skip_all, err))]
pub fn assert_time(
    valid_after: UnixTimestamp,
    valid_before: UnixTimestamp,
) -> Result<(), PaymentVerificationError> {
    let now = UnixTimestamp::now();
    if valid_before < now + 6 {
        return Err(PaymentVerificationError::ValidBeforeTooSoon);
    }
    if valid_after > now {
        return Err(PaymentVerificationError::ValidAfterInFuture);
    }
    Ok(())
}

/// Resolves the EIP-712 domain for `token_contract` from `extra.name`/`extra.version`.
/// Both must be present on the requirements; this scheme does not fall back to an
/// on-chain `name()`/`version()` query.
#[cfg_attr(feature = "telemetry", instrument(skip_all, err, fields(network = %chain.as_chain_id(), asset = %asset_address)))]
pub async fn assert_domain<P: Provider>(
    chain: &Eip155ChainReference,
    _token_contract: &IEIP3009::IEIP3009Instance<P>,
    asset_address: &Address,
    extra: &Option<PaymentRequirementsExtra>,
) -> Result<Eip712Domain, Eip155ExactError> {
    let name = extra.as_ref().and_then(|e| e.name.clone());
    let version = extra.as_ref().and_then(|e| e.version.clone());
    let (name, version) = match (name, version) {
        (Some(name), Some(version)) => (name, version),
        _ => return Err(PaymentVerificationError::MissingEip712Domain.into()),
    };
    let domain = eip712_domain! {
        name: name,
        version: version,
        chain_id: chain.inner(),
        verifying_contract: *asset_address,
    };
    Ok(domain)
}

/// Checks the payer's on-chain balance covers `amount_required`. Per spec
/// §4.3.3, an unreachable RPC makes this check non-fatal: the balance is
/// skipped rather than failing verification, since the transfer call itself
/// still re-checks the balance on-chain.
#[cfg_attr(feature = "telemetry", instrument(skip_all, err, fields(sender = %sender, amount_required = %amount_required)))]
pub async fn assert_enough_balance<P: Provider>(
    token_contract: &IEIP3009::IEIP3009Instance<P>,
    sender: &Address,
    amount_required: U256,
) -> Result<(), Eip155ExactError> {
    let fut = token_contract.balanceOf(*sender).call().into_future();
    #[cfg(feature = "telemetry")]
    let balance = fut
        .instrument(tracing::info_span!("fetch_token_balance", token_contract = %token_contract.address(), sender = %sender, otel.kind = "client"))
        .await;
    #[cfg(not(feature = "telemetry"))]
    let balance = fut.await;
    let balance = match balance {
        Ok(balance) => balance,
        Err(_) => return Ok(()),
    };
    if balance < amount_required {
        Err(PaymentVerificationError::InsufficientFunds.into())
    } else {
        Ok(())
    }
}

/// Static check that the authorized `value` meets `amount_required` — no RPC call.
pub fn assert_enough_value(sent: &U256, amount_required: &U256) -> Result<(), PaymentVerificationError> {
    if sent < amount_required {
        Err(PaymentVerificationError::InsufficientAuthorizationValue)
    } else {
        Ok(())
    }
}

/// Canonical data required to verify a signature: expected signer, signed
/// digest, and the normalized signature shape.
#[derive(Debug, Clone)]
struct SignedMessage {
    hash: B256,
    signature: StructuredSignature,
}

impl SignedMessage {
    fn extract(payment: &ExactEvmPayment, domain: &Eip712Domain) -> Result<Self, StructuredSignatureFormatError> {
        let transfer = TransferWithAuthorization {
            from: payment.from,
            to: payment.to,
            value: payment.value,
            validAfter: U256::from(payment.valid_after.as_secs()),
            validBefore: U256::from(payment.valid_before.as_secs()),
            nonce: payment.nonce,
        };
        let hash = transfer.eip712_signing_hash(domain);
        let signature = StructuredSignature::try_from_bytes(payment.signature.clone(), payment.from, &hash)?;
        Ok(Self { hash, signature })
    }
}

/// A structured representation of a payload signature: EOA, EIP-1271, or a
/// EIP-6492-wrapped counterfactual-wallet signature.
#[derive(Debug, Clone)]
pub enum StructuredSignature {
    EIP6492 {
        factory: Address,
        factory_calldata: Bytes,
        inner: Bytes,
        original: Bytes,
    },
    #[allow(clippy::upper_case_acronyms)]
    EOA(Signature),
    EIP1271(Bytes),
}

/// Fixed 32-byte magic suffix defined by EIP-6492. A signature ending in this
/// value is ABI-decoded as `(address factory, bytes factoryCalldata, bytes innerSig)`.
const EIP6492_MAGIC_SUFFIX: [u8; 32] = hex!("6492649264926492649264926492649264926492649264926492649264926492");

sol! {
    #[derive(Debug)]
    struct Sig6492 {
        address factory;
        bytes factoryCalldata;
        bytes innerSig;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StructuredSignatureFormatError {
    #[error(transparent)]
    InvalidEIP6492Format(alloy_sol_types::Error),
}

impl StructuredSignature {
    pub fn try_from_bytes(
        bytes: Bytes,
        expected_signer: Address,
        prehash: &B256,
    ) -> Result<Self, StructuredSignatureFormatError> {
        let is_eip6492 = bytes.len() >= 32 && bytes[bytes.len() - 32..] == EIP6492_MAGIC_SUFFIX;
        let signature = if is_eip6492 {
            let body = &bytes[..bytes.len() - 32];
            let sig6492 = Sig6492::abi_decode_params(body).map_err(StructuredSignatureFormatError::InvalidEIP6492Format)?;
            StructuredSignature::EIP6492 {
                factory: sig6492.factory,
                factory_calldata: sig6492.factoryCalldata,
                inner: sig6492.innerSig,
                original: bytes,
            }
        } else {
            let eoa_signature = if bytes.len() == 65 {
                Signature::from_raw(&bytes).ok().map(|s| s.normalized_s())
            } else if bytes.len() == 64 {
                Some(Signature::from_erc2098(&bytes).normalized_s())
            } else {
                None
            };
            match eoa_signature {
                None => StructuredSignature::EIP1271(bytes),
                Some(s) => {
                    let is_expected_signer = s
                        .recover_address_from_prehash(prehash)
                        .ok()
                        .map(|r| r == expected_signer)
                        .unwrap_or(false);
                    if is_expected_signer {
                        StructuredSignature::EOA(s)
                    } else {
                        StructuredSignature::EIP1271(bytes)
                    }
                }
            }
        };
        Ok(signature)
    }
}

struct TransferCall<P> {
    tx: SolCallBuilder<P, IEIP3009::transferWithAuthorization_0Call>,
    target: Address,
}

fn transfer_call_0<'a, P: Provider>(
    contract: &'a IEIP3009::IEIP3009Instance<P>,
    payment: &ExactEvmPayment,
    signature: Bytes,
) -> TransferCall<&'a P> {
    let tx = contract.transferWithAuthorization_0(
        payment.from,
        payment.to,
        payment.value,
        U256::from(payment.valid_after.as_secs()),
        U256::from(payment.valid_before.as_secs()),
        payment.nonce,
        signature,
    );
    TransferCall {
        target: *contract.address(),
        tx,
    }
}

fn transfer_call_1<'a, P: Provider>(
    contract: &'a IEIP3009::IEIP3009Instance<P>,
    payment: &ExactEvmPayment,
    signature: Signature,
) -> SolCallBuilder<&'a P, IEIP3009::transferWithAuthorization_1Call> {
    let v = 27 + (signature.v() as u8);
    let r = B256::from(signature.r());
    let s = B256::from(signature.s());
    contract.transferWithAuthorization_1(
        payment.from,
        payment.to,
        payment.value,
        U256::from(payment.valid_after.as_secs()),
        U256::from(payment.valid_before.as_secs()),
        payment.nonce,
        v,
        r,
        s,
    )
}

async fn is_contract_deployed<P: Provider>(provider: P, address: &Address) -> Result<bool, TransportError> {
    let fut = provider.get_code_at(*address).into_future();
    #[cfg(feature = "telemetry")]
    let bytes = fut.instrument(tracing::info_span!("get_code_at", address = %address, otel.kind = "client")).await?;
    #[cfg(not(feature = "telemetry"))]
    let bytes = fut.await?;
    Ok(!bytes.is_empty())
}

/// Verifies `payment` by simulating the on-chain transfer: validates the
/// signature (recovering/side-effect-checking as needed) and that the
/// transfer call itself would succeed, without sending a transaction.
///
/// `allow_smart_wallet_deployment` gates EIP-6492 counterfactual wallets: when
/// `false`, an undeployed wallet fails verification outright rather than
/// being simulated as deployed.
pub async fn verify_payment<P: Provider>(
    provider: P,
    contract: &IEIP3009::IEIP3009Instance<P>,
    payment: &ExactEvmPayment,
    eip712_domain: &Eip712Domain,
    allow_smart_wallet_deployment: bool,
) -> Result<Address, Eip155ExactError> {
    let signed_message = SignedMessage::extract(payment, eip712_domain)?;
    let payer = payment.from;
    let hash = signed_message.hash;

    match signed_message.signature {
        StructuredSignature::EIP6492 { inner, original, .. } => {
            if !allow_smart_wallet_deployment && !is_contract_deployed(&provider, &payer).await? {
                return Err(PaymentVerificationError::InvalidExactEvmPayloadUndeployedSmartWallet.into());
            }
            let validator6492 = Validator6492::new(VALIDATOR_ADDRESS, &provider);
            let is_valid_signature_call = validator6492.isValidSigWithSideEffects(payer, hash, original);
            let transfer_call = transfer_call_0(contract, payment, inner);
            let (is_valid, transfer_result) = provider
                .multicall()
                .add(is_valid_signature_call)
                .add(transfer_call.tx)
                .aggregate3()
                .await?;
            let is_valid = is_valid.map_err(|e| Eip155ExactError::Rpc(e.to_string()))?;
            if !is_valid {
                return Err(Eip155ExactError::Rpc("smart wallet reported signature invalid".into()));
            }
            transfer_result.map_err(|e| Eip155ExactError::Rpc(e.to_string()))?;
        }
        StructuredSignature::EIP1271(signature) => {
            let transfer_call = transfer_call_0(contract, payment, signature);
            transfer_call.tx.call().into_future().await?;
        }
        StructuredSignature::EOA(signature) => {
            let transfer_call = transfer_call_1(contract, payment, signature);
            transfer_call.call().into_future().await?;
        }
    }

    Ok(payer)
}

/// Settles `payment` by submitting the on-chain `transferWithAuthorization`
/// call (deploying a counterfactual wallet first if necessary).
///
/// `allow_smart_wallet_deployment` gates EIP-6492 counterfactual wallets: when
/// `false`, an undeployed wallet fails settlement instead of being deployed.
pub async fn settle_payment<P, E>(
    provider: P,
    contract: &IEIP3009::IEIP3009Instance<&P::Inner>,
    payment: &ExactEvmPayment,
    eip712_domain: &Eip712Domain,
    allow_smart_wallet_deployment: bool,
) -> Result<TxHash, Eip155ExactError>
where
    P: Eip155MetaTransactionProvider<Error = E>,
    Eip155ExactError: From<E>,
{
    let signed_message = SignedMessage::extract(payment, eip712_domain)?;
    let payer = payment.from;

    let receipt = match signed_message.signature {
        StructuredSignature::EIP6492 {
            factory,
            factory_calldata,
            inner,
            ..
        } => {
            let deployed = is_contract_deployed(provider.inner(), &payer).await?;
            if !deployed && !allow_smart_wallet_deployment {
                return Err(PaymentVerificationError::InvalidExactEvmPayloadUndeployedSmartWallet.into());
            }
            let transfer_call = transfer_call_0(contract, payment, inner);
            if deployed {
                Eip155MetaTransactionProvider::send_transaction(
                    &provider,
                    MetaTransaction {
                        to: transfer_call.target,
                        calldata: transfer_call.tx.calldata().clone(),
                        confirmations: 1,
                    },
                )
                .await?
            } else {
                let deployment_call = IMulticall3::Call3 {
                    allowFailure: true,
                    target: factory,
                    callData: factory_calldata,
                };
                let transfer_with_authorization_call = IMulticall3::Call3 {
                    allowFailure: false,
                    target: transfer_call.target,
                    callData: transfer_call.tx.calldata().clone(),
                };
                let aggregate_call = IMulticall3::aggregate3Call {
                    calls: vec![deployment_call, transfer_with_authorization_call],
                };
                Eip155MetaTransactionProvider::send_transaction(
                    &provider,
                    MetaTransaction {
                        to: MULTICALL3_ADDRESS,
                        calldata: aggregate_call.abi_encode().into(),
                        confirmations: 1,
                    },
                )
                .await?
            }
        }
        StructuredSignature::EIP1271(signature) => {
            let transfer_call = transfer_call_0(contract, payment, signature);
            Eip155MetaTransactionProvider::send_transaction(
                &provider,
                MetaTransaction {
                    to: transfer_call.target,
                    calldata: transfer_call.tx.calldata().clone(),
                    confirmations: 1,
                },
            )
            .await?
        }
        StructuredSignature::EOA(signature) => {
            let transfer_call = transfer_call_1(contract, payment, signature);
            Eip155MetaTransactionProvider::send_transaction(
                &provider,
                MetaTransaction {
                    to: *contract.address(),
                    calldata: transfer_call.calldata().clone(),
                    confirmations: 1,
                },
            )
            .await?
        }
    };

    if receipt.status() {
        Ok(receipt.transaction_hash)
    } else {
        Err(Eip155ExactError::TransactionReverted(receipt.transaction_hash))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Eip155ExactError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    PendingTransaction(#[from] PendingTransactionError),
    #[error("transaction {0} reverted")]
    TransactionReverted(TxHash),
    #[error(transparent)]
    PaymentVerification(#[from] PaymentVerificationError),
    #[error("rpc error: {0}")]
    Rpc(String),
}

impl From<Eip155ExactError> for X402SchemeFacilitatorError {
    fn from(value: Eip155ExactError) -> Self {
        match value {
            Eip155ExactError::Transport(e) => Self::Rpc(e.to_string()),
            Eip155ExactError::PendingTransaction(e) => Self::Rpc(e.to_string()),
            Eip155ExactError::TransactionReverted(_) => {
                Self::Settlement(x402_core::proto::SettlementError::TransactionFailed)
            }
            Eip155ExactError::PaymentVerification(e) => Self::Verification(e),
            Eip155ExactError::Rpc(s) => Self::Rpc(s),
        }
    }
}

impl From<StructuredSignatureFormatError> for Eip155ExactError {
    fn from(e: StructuredSignatureFormatError) -> Self {
        Self::Rpc(e.to_string())
    }
}

impl From<MetaTransactionSendError> for Eip155ExactError {
    fn from(e: MetaTransactionSendError) -> Self {
        match e {
            MetaTransactionSendError::Transport(e) => Self::Transport(e),
            MetaTransactionSendError::PendingTransaction(e) => Self::PendingTransaction(e),
            MetaTransactionSendError::Custom(s) => Self::Rpc(s),
        }
    }
}

impl From<MulticallError> for Eip155ExactError {
    fn from(e: MulticallError) -> Self {
        match e {
            MulticallError::TransportError(e) => Self::Transport(e),
            other => Self::Rpc(other.to_string()),
        }
    }
}

impl From<alloy_contract::Error> for Eip155ExactError {
    fn from(e: alloy_contract::Error) -> Self {
        match e {
            alloy_contract::Error::TransportError(e) => Self::Transport(e),
            alloy_contract::Error::PendingTransactionError(e) => Self::PendingTransaction(e),
            other => Self::Rpc(other.to_string()),
        }
    }
}
