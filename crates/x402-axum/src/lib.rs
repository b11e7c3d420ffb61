#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Axum middleware for enforcing [x402](https://www.x402.org) payments on protected routes.
//!
//! This middleware validates incoming payment headers using a configured x402 facilitator,
//! and settles valid payments either before or after request execution (configurable).
//!
//! Returns a `402 Payment Required` response if the request lacks a valid payment.
//!
//! ## Example Usage
//!
//! ```rust
//! use axum::{Router, routing::get};
//! use axum::response::IntoResponse;
//! use http::StatusCode;
//! use x402_axum::X402Middleware;
//! use x402_core::networks::chain_id_by_network_name;
//! use x402_core::scheme::X402SchemeService;
//! use x402_core::util::money_amount::MoneyAmount;
//! use x402_eip155_exact::Eip155ExactService;
//!
//! let network = chain_id_by_network_name("base-sepolia").unwrap().clone();
//! let service = Eip155ExactService::new(network.clone());
//! let price = MoneyAmount::parse("0.01").unwrap();
//! let requirements = service
//!     .parse_price(&price, &network, "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA9604", 60)
//!     .unwrap();
//!
//! let x402 = X402Middleware::try_from("https://facilitator.x402.rs").unwrap();
//!
//! let app: Router = Router::new().route(
//!     "/protected",
//!     get(my_handler).layer(x402.with_price_tag(vec![requirements])),
//! );
//!
//! async fn my_handler() -> impl IntoResponse {
//!     (StatusCode::OK, "This is VIP content!")
//! }
//! ```
//!
//! See [`X402Middleware`] for full configuration options.
//! For low-level interaction with the facilitator, see [`facilitator_client::FacilitatorClient`].
//!
//! ## Dynamic Pricing
//!
//! For dynamic pricing based on request context, use [`X402Middleware::with_dynamic_price`]:
//!
//! ```rust
//! use axum::Router;
//! use axum::routing::get;
//! use axum::response::IntoResponse;
//! use axum::http::StatusCode;
//! use x402_axum::X402Middleware;
//! use x402_core::networks::chain_id_by_network_name;
//! use x402_core::scheme::X402SchemeService;
//! use x402_core::util::money_amount::MoneyAmount;
//! use x402_eip155_exact::Eip155ExactService;
//!
//! let x402 = X402Middleware::try_from("https://facilitator.x402.rs").unwrap();
//!
//! let app: Router = Router::new().route(
//!     "/protected",
//!     get(my_handler).layer(
//!         x402.with_dynamic_price(|headers, _uri, _base_url| {
//!             let is_premium = headers
//!                 .get("X-User-Tier")
//!                 .and_then(|v| v.to_str().ok())
//!                 .map(|v| v == "premium")
//!                 .unwrap_or(false);
//!             let amount = if is_premium { "0.005" } else { "0.01" };
//!             let network = chain_id_by_network_name("base-sepolia").unwrap().clone();
//!             let service = Eip155ExactService::new(network.clone());
//!             let price = MoneyAmount::parse(amount).unwrap();
//!             async move {
//!                 let requirements = service
//!                     .parse_price(&price, &network, "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA9604", 60)
//!                     .unwrap();
//!                 vec![requirements]
//!             }
//!         })
//!     ),
//! );
//!
//! async fn my_handler() -> impl IntoResponse {
//!     (StatusCode::OK, "This is a VIP content!")
//! }
//! ```
//!
//! ## Settlement Timing
//!
//! Settlement always happens **after** the request is processed and only if the inner
//! handler's response is not a client or server error. A request that fails never incurs
//! an on-chain settlement.
//!
//! ## Configuration Notes
//!
//! - **[`X402Middleware::with_price_tag`]** sets the assets and amounts accepted for payment (static pricing).
//! - **[`X402Middleware::with_dynamic_price`]** sets a callback for dynamic pricing based on request context.
//! - **[`X402Middleware::with_base_url`]** sets the base URL for computing full resource URLs.
//!   If not set, defaults to `http://localhost/` (avoid in production).
//! - **[`X402Middleware::with_description`]** is optional but helps the payer understand what is being paid for.
//! - **[`X402Middleware::with_mime_type`]** sets the MIME type of the protected resource (default: `application/json`).
//! - **[`X402Middleware::with_resource`]** explicitly sets the full URI of the protected resource.

pub mod facilitator_client;
pub mod layer;
pub mod paygate;

pub use layer::X402Middleware;
pub use paygate::{DynamicPriceTags, PriceTagSource, StaticPriceTags};
