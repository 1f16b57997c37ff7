pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod mpesa;
pub mod openapi;
pub mod services;
pub mod tracing;

use crate::{
    auth::AuthService,
    config::AppConfig,
    errors::ServiceError,
    events::EventSender,
    mpesa::MpesaClient,
    services::{CartService, CheckoutService, OrderService, PaymentMonitor, PaymentService},
};
use axum::{extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json, Router};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use utoipa::OpenApi;

/// The wired-up service graph.
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub checkout: Arc<CheckoutService>,
    pub monitor: Arc<PaymentMonitor>,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthService>,
    pub event_sender: Arc<EventSender>,
    pub services: AppServices,
}

impl AppState {
    /// Wires services onto a connection and configuration.
    pub fn build(
        config: AppConfig,
        db: DatabaseConnection,
        event_sender: EventSender,
    ) -> Result<Self, ServiceError> {
        let db = Arc::new(db);
        let config = Arc::new(config);
        let event_sender = Arc::new(event_sender);
        let auth = Arc::new(AuthService::new(&config.jwt_secret));

        let client = MpesaClient::new(config.mpesa.clone())?;
        let carts = Arc::new(CartService::new(db.clone(), event_sender.clone()));
        let orders = Arc::new(OrderService::new(
            db.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let payments = Arc::new(PaymentService::new(
            db.clone(),
            event_sender.clone(),
            orders.clone(),
            client.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            carts.clone(),
            orders.clone(),
            payments.clone(),
        ));
        let monitor = Arc::new(PaymentMonitor::new(
            db.clone(),
            orders.clone(),
            client,
            event_sender.clone(),
            config.mpesa.clone(),
        ));

        Ok(Self {
            db,
            config,
            auth,
            event_sender,
            services: AppServices {
                carts,
                orders,
                payments,
                checkout,
                monitor,
            },
        })
    }
}

async fn status() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Liveness plus a database round trip.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "healthy" })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unhealthy", "detail": e.to_string() })),
        ),
    }
}

async fn openapi_json() -> impl IntoResponse {
    Json(openapi::ApiDoc::openapi())
}

/// Builds the application router with its middleware stack.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/api-docs/openapi.json", get(openapi_json))
        .nest("/api/v1", handlers::routes())
        .layer(middleware::from_fn(crate::tracing::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
