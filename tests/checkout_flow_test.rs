mod common;

use axum::http::{Method, StatusCode};
use cellar_api::events::Event;
use cellar_api::mpesa::StkCallbackEnvelope;
use common::{shipping_payload, spawn_app, spawn_app_with, spawn_mock_gateway, TestApp};
use rust_decimal_macros::dec;
use serde_json::{json, Value};

fn stk_callback(checkout_request_id: &str, result_code: i64) -> Value {
    let mut callback = json!({
        "MerchantRequestID": "29115-34620561-1",
        "CheckoutRequestID": checkout_request_id,
        "ResultCode": result_code,
        "ResultDesc": if result_code == 0 {
            "The service request is processed successfully."
        } else {
            "Request cancelled by user."
        }
    });
    if result_code == 0 {
        callback["CallbackMetadata"] = json!({
            "Item": [
                { "Name": "Amount", "Value": 2000.0 },
                { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                { "Name": "PhoneNumber", "Value": 254712345678u64 }
            ]
        });
    }
    json!({ "Body": { "stkCallback": callback } })
}

async fn put(app: &TestApp, uri: &str, body: Value) -> (StatusCode, Value) {
    app.request(Method::PUT, uri, None, Some(body)).await
}

async fn begin(app: &TestApp, session: &str, token: &str) -> (StatusCode, Value) {
    app.request(
        Method::POST,
        &format!("/api/v1/checkout/{session}"),
        Some(token),
        None,
    )
    .await
}

async fn submit(app: &TestApp, session: &str, token: &str) -> (StatusCode, Value) {
    app.request(
        Method::POST,
        &format!("/api/v1/checkout/{session}/submit"),
        Some(token),
        None,
    )
    .await
}

#[tokio::test]
async fn checkout_cannot_begin_with_an_empty_cart() {
    let app = spawn_app().await;
    let token = app.token("shopper-1", "shopper");

    let (status, body) = begin(&app, "s1", &token).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "EMPTY_CART");
}

#[tokio::test]
async fn checkout_cannot_begin_without_a_credential() {
    let app = spawn_app().await;
    let product = app.seed_product("Merlot", dec!(1000)).await;
    app.post(
        "/api/v1/carts/s1/items",
        json!({ "product_id": product, "quantity": 1 }),
    )
    .await;

    let (status, _) = app.post("/api/v1/checkout/s1", json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn steps_advance_one_at_a_time_and_back_preserves_data() {
    let app = spawn_app().await;
    let product = app.seed_product("Cabernet Reserve", dec!(1000)).await;
    let token = app.token("shopper-1", "shopper");
    app.post(
        "/api/v1/carts/s1/items",
        json!({ "product_id": product, "quantity": 2 }),
    )
    .await;

    let (status, body) = begin(&app, "s1", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["step"], "shipping");

    // Payment cannot be recorded before shipping.
    let (status, _) = put(&app, "/api/v1/checkout/s1/payment", json!({ "method": "cash" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = put(&app, "/api/v1/checkout/s1/shipping", shipping_payload()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["step"], "payment");

    let (_, body) = put(&app, "/api/v1/checkout/s1/payment", json!({ "method": "cash" })).await;
    assert_eq!(body["data"]["step"], "confirmation");

    // Back to payment, then back to shipping; everything entered stays.
    let (_, body) = app.post("/api/v1/checkout/s1/back", json!({})).await;
    assert_eq!(body["data"]["step"], "payment");
    let (_, body) = app.post("/api/v1/checkout/s1/back", json!({})).await;
    assert_eq!(body["data"]["step"], "shipping");
    assert_eq!(body["data"]["shipping"]["first_name"], "Asha");
    assert_eq!(body["data"]["payment_method"], "cash");
}

#[tokio::test]
async fn malformed_shipping_is_rejected_at_the_step() {
    let app = spawn_app().await;
    let product = app.seed_product("Merlot", dec!(1000)).await;
    let token = app.token("shopper-1", "shopper");
    app.post(
        "/api/v1/carts/s1/items",
        json!({ "product_id": product, "quantity": 1 }),
    )
    .await;
    begin(&app, "s1", &token).await;

    let mut shipping = shipping_payload();
    shipping["email"] = json!("not-an-email");
    let (status, _) = put(&app, "/api/v1/checkout/s1/shipping", shipping).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut shipping = shipping_payload();
    shipping["address"] = json!("");
    let (status, body) = put(&app, "/api/v1/checkout/s1/shipping", shipping).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INCOMPLETE_ADDRESS");
    assert_eq!(body["fields"], json!(["address"]));

    // Well-formed length, but not a local mobile number.
    let mut shipping = shipping_payload();
    shipping["phone"] = json!("0812345678");
    let (status, _) = put(&app, "/api/v1/checkout/s1/shipping", shipping).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = app
        .request(Method::GET, "/api/v1/checkout/s1", None, None)
        .await;
    assert_eq!(body["data"]["step"], "shipping");
}

#[tokio::test]
async fn invalid_payment_intent_is_rejected_at_the_step() {
    let app = spawn_app().await;
    let product = app.seed_product("Merlot", dec!(1000)).await;
    let token = app.token("shopper-1", "shopper");
    app.post(
        "/api/v1/carts/s1/items",
        json!({ "product_id": product, "quantity": 1 }),
    )
    .await;
    begin(&app, "s1", &token).await;
    put(&app, "/api/v1/checkout/s1/shipping", shipping_payload()).await;

    let (status, body) = put(&app, "/api/v1/checkout/s1/payment", json!({ "method": "card" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PAYMENT_METHOD");

    let (status, body) = put(
        &app,
        "/api/v1/checkout/s1/payment",
        json!({ "method": "mpesa", "phone": "0812345678" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "MISSING_MOBILE_MONEY_PHONE");

    // Neither rejection advanced the session.
    let (_, body) = app
        .request(Method::GET, "/api/v1/checkout/s1", None, None)
        .await;
    assert_eq!(body["data"]["step"], "payment");
}

#[tokio::test]
async fn submission_requires_a_credential() {
    let app = spawn_app().await;
    let product = app.seed_product("Merlot", dec!(1000)).await;
    let token = app.token("shopper-1", "shopper");
    app.post(
        "/api/v1/carts/s1/items",
        json!({ "product_id": product, "quantity": 1 }),
    )
    .await;
    begin(&app, "s1", &token).await;
    put(&app, "/api/v1/checkout/s1/shipping", shipping_payload()).await;
    put(&app, "/api/v1/checkout/s1/payment", json!({ "method": "cash" })).await;

    let (status, _) = app.post("/api/v1/checkout/s1/submit", json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn cash_checkout_places_the_order_and_clears_the_cart() {
    let app = spawn_app().await;
    let product = app.seed_product("Cabernet Reserve", dec!(1000)).await;
    let token = app.token("shopper-1", "shopper");
    app.post(
        "/api/v1/carts/s1/items",
        json!({ "product_id": product, "quantity": 2 }),
    )
    .await;

    begin(&app, "s1", &token).await;
    put(&app, "/api/v1/checkout/s1/shipping", shipping_payload()).await;
    put(&app, "/api/v1/checkout/s1/payment", json!({ "method": "cash" })).await;

    let (status, body) = submit(&app, "s1", &token).await;
    assert_eq!(status, StatusCode::CREATED);
    let order = &body["data"]["order"];
    assert!(order["order_number"].as_str().unwrap().starts_with("VN"));
    assert_eq!(order["payment_status"], "completed");
    assert_eq!(body["data"]["payment"]["kind"], "cash_settled");

    let (_, cart) = app.get("/api/v1/carts/s1").await;
    assert!(cart["data"]["lines"].as_array().unwrap().is_empty());

    // Submitting again returns the same confirmation, not a second order.
    let first_number = order["order_number"].as_str().unwrap().to_string();
    let (status, body) = submit(&app, "s1", &token).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["order"]["order_number"], first_number.as_str());
}

#[tokio::test]
async fn concurrent_submissions_are_rejected_not_queued() {
    let app = spawn_app().await;
    let product = app.seed_product("Cabernet Reserve", dec!(1000)).await;
    let token = app.token("shopper-1", "shopper");
    app.post(
        "/api/v1/carts/s1/items",
        json!({ "product_id": product, "quantity": 2 }),
    )
    .await;

    begin(&app, "s1", &token).await;
    put(&app, "/api/v1/checkout/s1/shipping", shipping_payload()).await;
    put(&app, "/api/v1/checkout/s1/payment", json!({ "method": "cash" })).await;

    // The first submission holds the in-flight flag across its database
    // work; the second lands while it is still outstanding.
    let (first, second) = tokio::join!(submit(&app, "s1", &token), submit(&app, "s1", &token));

    let (placed, rejected) = if first.0 == StatusCode::CREATED {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(placed.0, StatusCode::CREATED);
    assert_eq!(rejected.0, StatusCode::BAD_REQUEST);
    assert_eq!(rejected.1["code"], "SUBMISSION_IN_FLIGHT");
}

#[tokio::test]
async fn submit_requires_completed_steps() {
    let app = spawn_app().await;
    let product = app.seed_product("Merlot", dec!(1000)).await;
    let token = app.token("shopper-1", "shopper");
    app.post(
        "/api/v1/carts/s1/items",
        json!({ "product_id": product, "quantity": 1 }),
    )
    .await;
    begin(&app, "s1", &token).await;

    let (status, _) = submit(&app, "s1", &token).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn mobile_money_checkout_settles_through_the_callback_exactly_once() {
    let gateway = spawn_mock_gateway().await;
    let mut app = spawn_app_with(|cfg| {
        cfg.mpesa.base_url = gateway.clone();
    })
    .await;
    let product = app.seed_product("Cabernet Reserve", dec!(1000)).await;
    let token = app.token("shopper-1", "shopper");
    app.post(
        "/api/v1/carts/s1/items",
        json!({ "product_id": product, "quantity": 2 }),
    )
    .await;

    begin(&app, "s1", &token).await;
    put(&app, "/api/v1/checkout/s1/shipping", shipping_payload()).await;
    put(
        &app,
        "/api/v1/checkout/s1/payment",
        json!({ "method": "mpesa", "phone": "0712345678" }),
    )
    .await;

    let (status, body) = submit(&app, "s1", &token).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["order"]["payment_status"], "pending");
    assert_eq!(body["data"]["payment"]["kind"], "mpesa_initiated");
    let order_id = body["data"]["order"]["order_id"].as_str().unwrap().to_string();
    let checkout_request_id = body["data"]["payment"]["checkout_request_id"]
        .as_str()
        .unwrap()
        .to_string();

    // Gateway posts the result; a retry delivers the same callback twice.
    for _ in 0..2 {
        let (status, ack) = app
            .post(
                "/api/v1/payments/mpesa/callback",
                stk_callback(&checkout_request_id, 0),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["ResultCode"], 0);
    }

    let (_, body) = app.get(&format!("/api/v1/payments/{order_id}")).await;
    assert_eq!(body["data"]["payment_status"], "completed");
    assert_eq!(body["data"]["receipt"], "NLJ7RT61SV");

    // The confirmation signal fired exactly once despite the replay.
    let mut confirmations = 0;
    while let Ok(event) = app.events.try_recv() {
        if matches!(event, Event::PaymentConfirmed(id) if id.to_string() == order_id) {
            confirmations += 1;
        }
    }
    assert_eq!(confirmations, 1);
}

#[tokio::test]
async fn racing_settlement_signals_confirm_exactly_once() {
    let gateway = spawn_mock_gateway().await;
    let mut app = spawn_app_with(|cfg| {
        cfg.mpesa.base_url = gateway.clone();
    })
    .await;
    let product = app.seed_product("Cabernet Reserve", dec!(1000)).await;
    let token = app.token("shopper-1", "shopper");
    app.post(
        "/api/v1/carts/s1/items",
        json!({ "product_id": product, "quantity": 2 }),
    )
    .await;

    begin(&app, "s1", &token).await;
    put(&app, "/api/v1/checkout/s1/shipping", shipping_payload()).await;
    put(
        &app,
        "/api/v1/checkout/s1/payment",
        json!({ "method": "mpesa", "phone": "0712345678" }),
    )
    .await;
    let (_, body) = submit(&app, "s1", &token).await;
    let order_id = body["data"]["order"]["order_id"].as_str().unwrap().to_string();
    let checkout_request_id = body["data"]["payment"]["checkout_request_id"]
        .as_str()
        .unwrap()
        .to_string();

    // Callback and poll both carry the outcome; apply them concurrently.
    let envelope: StkCallbackEnvelope =
        serde_json::from_value(stk_callback(&checkout_request_id, 0)).unwrap();
    let callback = envelope.body.stk_callback;
    let monitor = app.state.services.monitor.clone();
    let (a, b) = tokio::join!(
        monitor.apply_callback(&callback),
        monitor.apply_callback(&callback)
    );
    a.unwrap();
    b.unwrap();

    let (_, body) = app.get(&format!("/api/v1/payments/{order_id}")).await;
    assert_eq!(body["data"]["payment_status"], "completed");

    let mut confirmations = 0;
    while let Ok(event) = app.events.try_recv() {
        if matches!(event, Event::PaymentConfirmed(id) if id.to_string() == order_id) {
            confirmations += 1;
        }
    }
    assert_eq!(confirmations, 1);
}

#[tokio::test]
async fn cancelled_payment_marks_the_order_failed() {
    let gateway = spawn_mock_gateway().await;
    let app = spawn_app_with(|cfg| {
        cfg.mpesa.base_url = gateway.clone();
    })
    .await;
    let product = app.seed_product("Merlot", dec!(1000)).await;
    let token = app.token("shopper-1", "shopper");
    app.post(
        "/api/v1/carts/s1/items",
        json!({ "product_id": product, "quantity": 2 }),
    )
    .await;

    begin(&app, "s1", &token).await;
    put(&app, "/api/v1/checkout/s1/shipping", shipping_payload()).await;
    put(
        &app,
        "/api/v1/checkout/s1/payment",
        json!({ "method": "mpesa", "phone": "0712345678" }),
    )
    .await;
    let (_, body) = submit(&app, "s1", &token).await;
    let order_id = body["data"]["order"]["order_id"].as_str().unwrap().to_string();
    let checkout_request_id = body["data"]["payment"]["checkout_request_id"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, _) = app
        .post(
            "/api/v1/payments/mpesa/callback",
            stk_callback(&checkout_request_id, 1032),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app.get(&format!("/api/v1/payments/{order_id}")).await;
    assert_eq!(body["data"]["payment_status"], "failed");
}

#[tokio::test]
async fn unmatched_callback_is_still_acknowledged() {
    let app = spawn_app().await;

    let (status, ack) = app
        .post(
            "/api/v1/payments/mpesa/callback",
            stk_callback("ws_CO_never_seen", 0),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ResultCode"], 0);
}
