//! EIP-155 (EVM) chain support for the x402 payment protocol.
//!
//! This crate implements the `exact` payment scheme on EVM-compatible chains,
//! addressed via CAIP-2 chain identifiers. Two asset transfer methods are
//! supported: ERC-3009 `transferWithAuthorization` for tokens that implement
//! it, and Permit2 `permitWitnessTransferFrom` through a dedicated settlement
//! contract for everything else.
//!
//! # Architecture
//!
//! - [`chain`] — chain types, RPC provider, nonce management
//! - [`eip3009`] — ERC-3009 authorization payloads, signature recovery, settlement
//! - [`permit2`] — Permit2 witness transfer payloads, signature recovery, settlement
//! - [`facilitator`] — [`x402_core::scheme::X402SchemeFacilitator`] binding, dispatches
//!   between the two transfer methods
//! - [`client`] — [`x402_core::scheme::X402SchemeClient`] binding, signs either payload shape
//! - [`service`] — [`x402_core::scheme::X402SchemeService`] binding, prices against USDC
//!
//! # Feature Flags
//!
//! - `server` - price tag generation ([`service`])
//! - `client` - client-side payment signing ([`client`])
//! - `facilitator` - payment verification and settlement ([`facilitator`], [`chain::provider`])
//! - `telemetry` - tracing spans on the verify/settle hot paths

pub mod chain;
pub mod eip3009;
pub mod permit2;

#[cfg(feature = "server")]
pub mod service;
#[cfg(feature = "server")]
pub use service::Eip155ExactService;

#[cfg(feature = "facilitator")]
pub mod facilitator;
#[cfg(feature = "facilitator")]
pub use facilitator::Eip155ExactFacilitator;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub use client::{Eip155ExactClient, SignerLike};

mod networks;
pub use networks::*;
