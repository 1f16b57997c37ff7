use crate::{
    errors::ServiceError,
    handlers::common::success_response,
    mpesa::StkCallbackEnvelope,
    services::payments::PaymentOutcome,
    AppState,
};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Deserialize, ToSchema)]
pub struct InitiatePaymentRequest {
    pub order_id: Uuid,
    /// Payer number override; defaults to the number captured on the order
    #[serde(default)]
    pub phone: Option<String>,
}

/// Push a payment prompt for a pending mobile-money order. Used for
/// retries after a failed or declined attempt.
#[utoipa::path(
    post,
    path = "/api/v1/payments/mpesa/initiate",
    request_body = InitiatePaymentRequest,
    responses(
        (status = 200, description = "Prompt delivered", body = PaymentOutcome),
        (status = 400, description = "Order cannot take a payment"),
        (status = 502, description = "Gateway declined the request")
    ),
    security(("bearer_auth" = [])),
    tag = "payments"
)]
pub async fn initiate(
    State(state): State<AppState>,
    _user: crate::auth::AuthenticatedUser,
    Json(payload): Json<InitiatePaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state
        .services
        .payments
        .initiate_for_order(payload.order_id, payload.phone)
        .await?;
    Ok(success_response(outcome))
}

/// Gateway result callback. Unauthenticated by protocol; the payload is
/// only trusted as far as it matches a recorded transaction, and it is
/// always acknowledged so the gateway stops redelivering.
#[utoipa::path(
    post,
    path = "/api/v1/payments/mpesa/callback",
    responses((status = 200, description = "Callback acknowledged")),
    tag = "payments"
)]
pub async fn callback(
    State(state): State<AppState>,
    Json(envelope): Json<StkCallbackEnvelope>,
) -> impl IntoResponse {
    let callback = envelope.body.stk_callback;
    match state.services.monitor.apply_callback(&callback).await {
        Ok(()) => info!(
            checkout_request_id = %callback.checkout_request_id,
            "Gateway callback applied"
        ),
        Err(e) => warn!(
            checkout_request_id = %callback.checkout_request_id,
            "Gateway callback not applied: {e}"
        ),
    }

    Json(serde_json::json!({ "ResultCode": 0, "ResultDesc": "Accepted" }))
}

/// Payment state for an order.
#[utoipa::path(
    get,
    path = "/api/v1/payments/{order_id}",
    params(("order_id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Payment state", body = crate::services::payments::PaymentView),
        (status = 404, description = "Order not found")
    ),
    tag = "payments"
)]
pub async fn payment_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(success_response(
        state.services.payments.status(order_id).await?,
    ))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/payments/mpesa/initiate", post(initiate))
        .route("/payments/mpesa/callback", post(callback))
        .route("/payments/{order_id}", get(payment_status))
}
