use crate::{
    handlers::common::success_response,
    services::carts::CartView,
    AppState,
};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetQuantityRequest {
    pub quantity: i32,
}

/// Fetch the cart for a session.
#[utoipa::path(
    get,
    path = "/api/v1/carts/{session}",
    params(("session" = String, Path, description = "Shopper session id")),
    responses((status = 200, description = "Current cart", body = CartView)),
    tag = "carts"
)]
pub async fn get_cart(State(state): State<AppState>, Path(session): Path<String>) -> impl IntoResponse {
    success_response(state.services.carts.load(&session).await)
}

/// Add a quantity of a product to the cart, merging with any existing line.
#[utoipa::path(
    post,
    path = "/api/v1/carts/{session}/items",
    params(("session" = String, Path, description = "Shopper session id")),
    request_body = AddItemRequest,
    responses(
        (status = 200, description = "Updated cart", body = CartView),
        (status = 404, description = "Unknown product")
    ),
    tag = "carts"
)]
pub async fn add_item(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, crate::errors::ServiceError> {
    let cart = state
        .services
        .carts
        .add_item(&session, payload.product_id, payload.quantity)
        .await?;
    Ok(success_response(cart))
}

/// Replace a line's quantity; zero or less removes the line.
#[utoipa::path(
    put,
    path = "/api/v1/carts/{session}/items/{product_id}",
    params(
        ("session" = String, Path, description = "Shopper session id"),
        ("product_id" = Uuid, Path, description = "Product id")
    ),
    request_body = SetQuantityRequest,
    responses((status = 200, description = "Updated cart", body = CartView)),
    tag = "carts"
)]
pub async fn set_quantity(
    State(state): State<AppState>,
    Path((session, product_id)): Path<(String, Uuid)>,
    Json(payload): Json<SetQuantityRequest>,
) -> Result<impl IntoResponse, crate::errors::ServiceError> {
    let cart = state
        .services
        .carts
        .set_quantity(&session, product_id, payload.quantity)
        .await?;
    Ok(success_response(cart))
}

#[utoipa::path(
    delete,
    path = "/api/v1/carts/{session}/items/{product_id}",
    params(
        ("session" = String, Path, description = "Shopper session id"),
        ("product_id" = Uuid, Path, description = "Product id")
    ),
    responses((status = 200, description = "Updated cart", body = CartView)),
    tag = "carts"
)]
pub async fn remove_item(
    State(state): State<AppState>,
    Path((session, product_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse, crate::errors::ServiceError> {
    let cart = state.services.carts.remove_item(&session, product_id).await?;
    Ok(success_response(cart))
}

#[utoipa::path(
    delete,
    path = "/api/v1/carts/{session}",
    params(("session" = String, Path, description = "Shopper session id")),
    responses((status = 200, description = "Cart emptied")),
    tag = "carts"
)]
pub async fn clear_cart(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<impl IntoResponse, crate::errors::ServiceError> {
    state.services.carts.clear(&session).await?;
    Ok(success_response(serde_json::json!({ "cleared": true })))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/carts/{session}", get(get_cart).delete(clear_cart))
        .route("/carts/{session}/items", axum::routing::post(add_item))
        .route(
            "/carts/{session}/items/{product_id}",
            delete(remove_item).put(set_quantity),
        )
}
