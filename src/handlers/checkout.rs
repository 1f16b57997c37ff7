use crate::{
    auth::AuthenticatedUser,
    errors::ServiceError,
    handlers::common::{created_response, success_response},
    services::checkout::CheckoutView,
    services::orders::{PaymentIntentInput, ShippingDetails},
    AppState,
};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{post, put},
    Json, Router,
};

/// Open (or resume) a checkout. Requires a verified credential and a
/// non-empty cart before any state is entered.
#[utoipa::path(
    post,
    path = "/api/v1/checkout/{session}",
    params(("session" = String, Path, description = "Shopper session id")),
    responses(
        (status = 200, description = "Checkout state", body = CheckoutView),
        (status = 400, description = "Empty cart"),
        (status = 401, description = "Missing or invalid credential")
    ),
    security(("bearer_auth" = [])),
    tag = "checkout"
)]
pub async fn begin(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(session): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(success_response(state.services.checkout.begin(&session).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/checkout/{session}",
    params(("session" = String, Path, description = "Shopper session id")),
    responses(
        (status = 200, description = "Checkout state", body = CheckoutView),
        (status = 404, description = "No checkout in progress")
    ),
    tag = "checkout"
)]
pub async fn view(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(success_response(state.services.checkout.view(&session)?))
}

/// Record shipping details and advance to the payment step.
#[utoipa::path(
    put,
    path = "/api/v1/checkout/{session}/shipping",
    params(("session" = String, Path, description = "Shopper session id")),
    request_body = ShippingDetails,
    responses(
        (status = 200, description = "Checkout state", body = CheckoutView),
        (status = 400, description = "Invalid or incomplete shipping details")
    ),
    tag = "checkout"
)]
pub async fn submit_shipping(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(payload): Json<ShippingDetails>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(success_response(
        state.services.checkout.submit_shipping(&session, payload)?,
    ))
}

/// Record the payment intent and advance to confirmation.
#[utoipa::path(
    put,
    path = "/api/v1/checkout/{session}/payment",
    params(("session" = String, Path, description = "Shopper session id")),
    request_body = PaymentIntentInput,
    responses((status = 200, description = "Checkout state", body = CheckoutView)),
    tag = "checkout"
)]
pub async fn submit_payment(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(payload): Json<PaymentIntentInput>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(success_response(
        state.services.checkout.submit_payment(&session, payload)?,
    ))
}

/// Step backwards without losing entered data.
#[utoipa::path(
    post,
    path = "/api/v1/checkout/{session}/back",
    params(("session" = String, Path, description = "Shopper session id")),
    responses((status = 200, description = "Checkout state", body = CheckoutView)),
    tag = "checkout"
)]
pub async fn back(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(success_response(state.services.checkout.back(&session)?))
}

/// Place the order and start payment. Requires a verified credential;
/// idempotent once confirmed; rejects a concurrent submission for the
/// same session.
#[utoipa::path(
    post,
    path = "/api/v1/checkout/{session}/submit",
    params(("session" = String, Path, description = "Shopper session id")),
    responses(
        (status = 201, description = "Order placed", body = CheckoutView),
        (status = 400, description = "Submission rejected"),
        (status = 401, description = "Missing or invalid credential"),
        (status = 502, description = "Payment gateway declined")
    ),
    security(("bearer_auth" = [])),
    tag = "checkout"
)]
pub async fn submit(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(created_response(
        state
            .services
            .checkout
            .submit(&session, &user.subject)
            .await?,
    ))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/checkout/{session}", post(begin).get(view))
        .route("/checkout/{session}/shipping", put(submit_shipping))
        .route("/checkout/{session}/payment", put(submit_payment))
        .route("/checkout/{session}/back", post(back))
        .route("/checkout/{session}/submit", post(submit))
}
