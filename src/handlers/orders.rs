use crate::{
    auth::AuthenticatedUser,
    entities::order::PaymentStatus,
    errors::ServiceError,
    handlers::common::{created_response, success_response},
    services::orders::{
        CreateOrderInput, OrderConfirmation, OrderLineInput, PaymentIntentInput, ShippingDetails,
    },
    AppState,
};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

/// Direct order submission, for clients that manage their own cart.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateOrderRequest {
    pub lines: Vec<OrderLineInput>,
    pub shipping: ShippingDetails,
    pub payment: PaymentIntentInput,
    /// Total the client displayed to the shopper; checked server-side
    pub declared_total: Decimal,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdatePaymentStatusRequest {
    pub status: PaymentStatus,
}

/// Create an order from an explicit line snapshot.
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = OrderConfirmation),
        (status = 400, description = "Submission rejected with a typed code")
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let confirmation = state
        .services
        .orders
        .create_order(CreateOrderInput {
            placed_by: user.subject,
            lines: payload.lines,
            shipping: payload.shipping,
            payment: payload.payment,
            declared_total: payload.declared_total,
        })
        .await?;

    // Payment starts immediately for mobile-money orders.
    let order = state.services.orders.get_order(confirmation.order_id).await?;
    let payment = state.services.payments.execute(&order).await?;

    Ok(created_response(serde_json::json!({
        "order": confirmation,
        "payment": payment,
    })))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with its line items"),
        (status = 404, description = "Order not found")
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.get_order(id).await?;
    let items = state.services.orders.get_order_items(id).await?;
    Ok(success_response(serde_json::json!({
        "order": order,
        "items": items,
    })))
}

/// Current payment state of an order, including any gateway transaction.
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/payment-status",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Payment state", body = crate::services::payments::PaymentView),
        (status = 404, description = "Order not found")
    ),
    tag = "orders"
)]
pub async fn get_payment_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(success_response(state.services.payments.status(id).await?))
}

/// Operator override for a payment outcome, used when reconciliation
/// flags an order for review.
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/payment-status",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdatePaymentStatusRequest,
    responses(
        (status = 200, description = "Updated order"),
        (status = 400, description = "Invalid transition"),
        (status = 403, description = "Operator role required")
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn update_payment_status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdatePaymentStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_operator()?;
    let order = state
        .services
        .orders
        .update_payment_status(id, payload.status)
        .await?;
    Ok(success_response(order))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/{id}", get(get_order))
        .route(
            "/orders/{id}/payment-status",
            get(get_payment_status).put(update_payment_status),
        )
}
