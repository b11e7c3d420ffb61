#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Local facilitator implementation for the x402 payment protocol.
//!
//! This crate provides [`FacilitatorLocal`], a [`Facilitator`](x402_core::facilitator::Facilitator)
//! implementation that validates x402 payment payloads and performs on-chain settlements
//! using registered scheme handlers.
//!
//! # Architecture
//!
//! [`FacilitatorLocal`] wraps a [`x402_core::scheme::SchemeRegistry`] of
//! `dyn X402SchemeFacilitator` entries, one per configured chain, and routes
//! each `verify`/`settle` call to whichever entry's `(scheme, network)`
//! matches the payment's requirements.
//!
//! # Modules
//!
//! - [`facilitator_local`] - Core facilitator implementation
//! - [`handlers`] - HTTP endpoints for the x402 protocol
//! - [`util`] - Utilities for graceful shutdown and telemetry
//!
//! # Example
//!
//! ```ignore
//! use x402_facilitator_local::{FacilitatorLocal, handlers};
//! use x402_core::scheme::SchemeRegistry;
//! use x402_eip155_exact::Eip155ExactFacilitator;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = SchemeRegistry::new();
//!     registry.register(Arc::new(Eip155ExactFacilitator::new(provider)));
//!
//!     let facilitator = FacilitatorLocal::new(registry);
//!     let state = Arc::new(facilitator);
//!
//!     let app = axum::Router::new()
//!         .merge(handlers::routes().with_state(state));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod facilitator_local;
pub mod handlers;
pub mod util;

pub use facilitator_local::*;
pub use handlers::*;
