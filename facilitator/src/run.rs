//! x402 Facilitator HTTP entrypoint.
//!
//! This binary launches an Axum-based HTTP server that exposes the x402 protocol interface
//! for payment verification and settlement via EIP-155 (EVM) networks.
//!
//! Endpoints:
//! - `GET /verify` – Supported verification schema
//! - `POST /verify` – Verify a payment payload against requirements
//! - `GET /settle` – Supported settlement schema
//! - `POST /settle` – Settle an accepted payment payload on-chain
//! - `GET /supported` – List supported payment kinds (scheme/network)
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `OTEL_*` variables enable tracing to systems like Honeycomb

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;

use x402_core::chain::ChainIdPattern;
use x402_core::scheme::{SchemeRegistry, X402SchemeFacilitator};
use x402_eip155_exact::Eip155ExactFacilitator;
use x402_facilitator_local::util::SigDown;
use x402_facilitator_local::{FacilitatorLocal, handlers};

#[cfg(feature = "telemetry")]
use x402_facilitator_local::util::Telemetry;

use crate::chain::build_chain_registry;
use crate::config::Config;

/// Initializes the x402 facilitator server.
///
/// - Loads `.env` variables.
/// - Initializes OpenTelemetry tracing.
/// - Connects to EIP-155 providers for configured chains.
/// - Starts an Axum HTTP server with the x402 protocol handlers.
///
/// Binds to the address specified by the `HOST` and `PORT` env vars.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .expect("Failed to initialize rustls crypto provider");

    dotenv().ok();

    #[cfg(feature = "telemetry")]
    let telemetry_layer = {
        let telemetry = Telemetry::new()
            .with_name(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .register();
        telemetry.http_tracing()
    };

    let config = Config::load()?;

    let chain_registry = build_chain_registry(config.chains()).await?;
    let mut scheme_registry: SchemeRegistry<dyn X402SchemeFacilitator> = SchemeRegistry::new();
    for provider in chain_registry.by_chain_id_pattern(&ChainIdPattern::wildcard("eip155")) {
        scheme_registry.register(Arc::new(Eip155ExactFacilitator::new(Arc::clone(provider))));
    }

    let facilitator = Arc::new(FacilitatorLocal::new(scheme_registry));

    let sig_down = SigDown::try_new()?;

    let mut http_endpoints = Router::new().merge(handlers::routes().with_state(Arc::clone(&facilitator)));
    if config.enable_close_endpoint() {
        http_endpoints = http_endpoints.merge(handlers::close_route(sig_down.cancellation_token()));
    }
    #[cfg(feature = "telemetry")]
    let http_endpoints = http_endpoints.layer(telemetry_layer);
    let http_endpoints = http_endpoints.layer(
        cors::CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(cors::Any),
    );

    let addr = SocketAddr::new(config.host(), config.port());
    #[cfg(feature = "telemetry")]
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await;
    #[cfg(feature = "telemetry")]
    let listener = listener.inspect_err(|e| tracing::error!("Failed to bind to {}: {}", addr, e));
    let listener = listener?;

    let axum_cancellation_token = sig_down.cancellation_token();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    facilitator.shutdown().await;

    Ok(())
}
