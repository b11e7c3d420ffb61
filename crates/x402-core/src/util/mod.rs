//! Utility types and functions for x402.
//!
//! This module provides various helper types used throughout the x402 crate:
//!
//! - [`b64`] - Base64url encoding/decoding utilities
//! - [`money_amount`] - Human-readable currency amount parsing

pub mod b64;
pub mod money_amount;

pub use b64::*;
