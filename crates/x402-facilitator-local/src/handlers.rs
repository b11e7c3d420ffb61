//! HTTP endpoints implemented by the x402 **facilitator**.
//!
//! Server-side handlers for `/verify`, `/settle`, and the discovery endpoints
//! `/supported` and `/health`. Request bodies carry the raw scheme payload and
//! the `PaymentRequirements` it was signed against as plain JSON (not the
//! base64url-framed headers used between a client and a resource server).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use x402_core::facilitator::Facilitator;
use x402_core::proto::PaymentRequirements;

use crate::facilitator_local::FacilitatorLocalError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBody {
    pub payment_payload: serde_json::Value,
    pub payment_requirements: PaymentRequirements,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleBody {
    pub payment_payload: serde_json::Value,
    pub payment_requirements: PaymentRequirements,
}

pub fn routes<A>() -> Router<A>
where
    A: Facilitator + Clone + Send + Sync + 'static,
    A::Error: IntoResponse,
{
    Router::new()
        .route("/", get(get_root))
        .route("/verify", get(get_verify_info))
        .route("/verify", post(post_verify::<A>))
        .route("/settle", get(get_settle_info))
        .route("/settle", post(post_settle::<A>))
        .route("/health", get(get_health::<A>))
        .route("/supported", get(get_supported::<A>))
}

/// `POST /close`: triggers graceful shutdown by cancelling `cancellation_token`.
///
/// Not mounted by default — a test harness that cannot send the process a
/// SIGTERM/SIGINT needs some way to stop the server, so this route exists to
/// be merged in by the caller when `config.enable_close_endpoint` is set.
pub fn close_route(cancellation_token: CancellationToken) -> Router<()> {
    Router::new().route(
        "/close",
        post(move || {
            let cancellation_token = cancellation_token.clone();
            async move {
                cancellation_token.cancel();
                StatusCode::OK
            }
        }),
    )
}

/// `GET /`: a simple greeting, mainly useful to confirm the server is up.
pub async fn get_root() -> impl IntoResponse {
    (StatusCode::OK, format!("Hello from {}!", env!("CARGO_PKG_NAME")))
}

/// `GET /verify`: machine-readable description of the `/verify` endpoint.
pub async fn get_verify_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/verify",
        "description": "POST to verify an x402 payment payload",
        "body": { "paymentPayload": "object", "paymentRequirements": "PaymentRequirements" },
    }))
}

/// `GET /settle`: machine-readable description of the `/settle` endpoint.
pub async fn get_settle_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/settle",
        "description": "POST to settle an accepted x402 payment on-chain",
        "body": { "paymentPayload": "object", "paymentRequirements": "PaymentRequirements" },
    }))
}

/// `GET /supported`: lists the `(scheme, network)` pairs this facilitator handles.
pub async fn get_supported<A>(State(facilitator): State<A>) -> impl IntoResponse
where
    A: Facilitator,
    A::Error: IntoResponse,
{
    match facilitator.supported().await {
        Ok(supported) => (StatusCode::OK, Json(supported)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `GET /health`: liveness probe, currently an alias for `/supported`.
pub async fn get_health<A>(state: State<A>) -> impl IntoResponse
where
    A: Facilitator,
    A::Error: IntoResponse,
{
    get_supported(state).await
}

/// `POST /verify`: checks a payment payload against the accompanying requirements.
#[cfg_attr(feature = "telemetry", tracing::instrument(skip_all))]
pub async fn post_verify<A>(State(facilitator): State<A>, Json(body): Json<VerifyBody>) -> impl IntoResponse
where
    A: Facilitator,
    A::Error: IntoResponse,
{
    match facilitator
        .verify(&body.payment_payload, &body.payment_requirements)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /settle`: executes a previously verified payment on-chain.
#[cfg_attr(feature = "telemetry", tracing::instrument(skip_all))]
pub async fn post_settle<A>(State(facilitator): State<A>, Json(body): Json<SettleBody>) -> impl IntoResponse
where
    A: Facilitator,
    A::Error: IntoResponse,
{
    match facilitator
        .settle(&body.payment_payload, &body.payment_requirements)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => error.into_response(),
    }
}

impl IntoResponse for FacilitatorLocalError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ErrorBody {
            is_valid: bool,
            success: bool,
            error_reason: String,
        }

        let (status, reason) = match &self {
            FacilitatorLocalError::Unsupported(reason) => (
                StatusCode::BAD_REQUEST,
                serde_json::to_value(reason).unwrap_or_default(),
            ),
            FacilitatorLocalError::Verification(err) | FacilitatorLocalError::Settlement(err) => {
                let status = match err {
                    x402_core::scheme::X402SchemeFacilitatorError::Verification(_) => StatusCode::BAD_REQUEST,
                    x402_core::scheme::X402SchemeFacilitatorError::Settlement(_) => StatusCode::BAD_REQUEST,
                    x402_core::scheme::X402SchemeFacilitatorError::Rpc(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, json!(err.to_string()))
            }
            FacilitatorLocalError::NotVerified => (StatusCode::BAD_REQUEST, json!(self.to_string())),
            FacilitatorLocalError::Codec(err) => (StatusCode::INTERNAL_SERVER_ERROR, json!(err.to_string())),
        };
        let reason = reason.as_str().map(str::to_string).unwrap_or_else(|| reason.to_string());
        let body = ErrorBody { is_valid: false, success: false, error_reason: reason };
        (status, Json(body)).into_response()
    }
}
