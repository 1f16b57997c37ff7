#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    routing::{get, post},
    Json, Router,
};
use cellar_api::{
    app,
    config::AppConfig,
    db,
    entities::product,
    events::{self, Event},
    AppState,
};
use chrono::Utc;
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, Set};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub events: mpsc::Receiver<Event>,
}

/// Fresh application over an in-memory database.
pub async fn spawn_app() -> TestApp {
    spawn_app_with(|_| {}).await
}

/// Same, with a configuration hook (used to point the gateway client at a
/// mock server).
pub async fn spawn_app_with(customize: impl FnOnce(&mut AppConfig)) -> TestApp {
    // One connection so every query sees the same in-memory database.
    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options.max_connections(1).sqlx_logging(false);
    let pool = Database::connect(options).await.expect("sqlite connect");
    db::migrate(&pool).await.expect("schema bootstrap");

    let mut config = AppConfig::new(
        "sqlite::memory:".to_string(),
        "test_secret_key_for_testing_purposes_only".to_string(),
        "127.0.0.1".to_string(),
        0,
    );
    customize(&mut config);

    let (sender, receiver) = events::channel(64);
    let state = AppState::build(config, pool, sender).expect("state build");

    TestApp {
        router: app(state.clone()),
        state,
        events: receiver,
    }
}

impl TestApp {
    pub fn token(&self, subject: &str, role: &str) -> String {
        self.state.auth.issue(subject, role, 3600).expect("token")
    }

    /// Inserts a catalog product and returns its id.
    pub async fn seed_product(&self, name: &str, unit_price: Decimal) -> Uuid {
        let id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            unit_price: Set(unit_price),
            image_ref: Set(None),
            available: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product");
        id
    }

    /// Inserts a catalog product that is not currently purchasable.
    pub async fn seed_unavailable_product(&self, name: &str, unit_price: Decimal) -> Uuid {
        let id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            unit_price: Set(unit_price),
            image_ref: Set(None),
            available: Set(false),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product");
        id
    }

    /// Marks an existing product as no longer purchasable.
    pub async fn delist_product(&self, id: Uuid) {
        product::ActiveModel {
            id: Set(id),
            available: Set(false),
            ..Default::default()
        }
        .update(&*self.state.db)
        .await
        .expect("delist product");
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, None, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, None, Some(body)).await
    }
}

/// Stands in for the payment gateway: token exchange, push acceptance,
/// and a status query that reports a cancellation.
pub async fn spawn_mock_gateway() -> String {
    let router = Router::new()
        .route(
            "/oauth/v1/generate",
            get(|| async {
                Json(json!({ "access_token": "test-token", "expires_in": "3599" }))
            }),
        )
        .route(
            "/mpesa/stkpush/v1/processrequest",
            post(|| async {
                Json(json!({
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": format!("ws_CO_{}", Uuid::new_v4().simple()),
                    "ResponseCode": "0",
                    "ResponseDescription": "Success. Request accepted for processing",
                    "CustomerMessage": "Success. Request accepted for processing"
                }))
            }),
        )
        .route(
            "/mpesa/stkpushquery/v1/query",
            post(|| async {
                Json(json!({
                    "CheckoutRequestID": "ws_CO_unknown",
                    "ResponseCode": "0",
                    "ResultCode": "1032",
                    "ResultDesc": "Request cancelled by user."
                }))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock gateway");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock gateway");
    });
    format!("http://{addr}")
}

/// A complete, valid shipping payload.
pub fn shipping_payload() -> Value {
    json!({
        "first_name": "Asha",
        "last_name": "Mwangi",
        "email": "asha@example.com",
        "phone": "0712345678",
        "address": "Riverside Drive 12",
        "city": "Nairobi",
        "postal_code": "00100"
    })
}
