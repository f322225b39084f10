mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use common::TestApp;
use hmac::{Hmac, Mac};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use sha2::Sha512;
use storefront_api::services::carts::AddItemInput;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

#[tokio::test]
async fn health_endpoint_responds() {
    let app = TestApp::new().await;
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn anonymous_cart_request_sets_a_session_cookie() {
    let app = TestApp::new().await;

    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/cart")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("session cookie issued")
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("cart_session=sess_"));
    assert!(cookie.contains("HttpOnly"));

    let first = body_json(response).await;
    let cart_id = first["cart"]["id"].as_str().unwrap().to_string();

    // Replaying the cookie returns the same cart and mints nothing new.
    let session_value = cookie.split(';').next().unwrap().to_string();
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/cart")
                .header(header::COOKIE, session_value)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    let second = body_json(response).await;
    assert_eq!(second["cart"]["id"].as_str().unwrap(), cart_id);
}

#[tokio::test]
async fn order_can_be_placed_and_driven_over_http() {
    let app = TestApp::new().await;
    let widget = app.seed_product("Widget", dec!(10.00), 5).await;

    let response = app
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/orders")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "user_id": Uuid::new_v4(),
                        "items": [{ "product_id": widget.id, "quantity": 2 }],
                        "shipping_address": "1 Main St",
                        "payment_method": "cash_on_delivery"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let placed = body_json(response).await;
    let order_id = placed["order"]["id"].as_str().unwrap().to_string();
    assert_eq!(placed["order"]["status"], "Processing");

    // Delivery before shipment is a conflict, not a no-op.
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/api/v1/orders/{}/deliver", order_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/api/v1/orders/{}/ship", order_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/orders/{}", order_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let details = body_json(response).await;
    assert_eq!(details["order"]["status"], "Shipped");
    assert_eq!(details["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_order_returns_not_found() {
    let app = TestApp::new().await;
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/orders/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_places_the_order_for_a_successful_charge() {
    let gateway = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/TXN-WH-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "data": { "status": "success" }
        })))
        .mount(&gateway)
        .await;

    let app = TestApp::with_gateway_url(&gateway.uri()).await;
    let widget = app.seed_product("Widget", dec!(10.00), 5).await;
    let user_id = Uuid::new_v4();

    let resolved = app
        .state
        .services
        .carts
        .resolve(Some(user_id), None)
        .await
        .unwrap();
    app.state
        .services
        .carts
        .add_item(
            resolved.cart.id,
            AddItemInput {
                product_id: widget.id,
                quantity: 2,
            },
        )
        .await
        .unwrap();

    let payload = json!({
        "event": "charge.success",
        "data": {
            "reference": "TXN-WH-1",
            "metadata": {
                "user_id": user_id,
                "cart_id": resolved.cart.id,
                "shipping_address": "1 Main St",
                "payment_method": "card"
            }
        }
    })
    .to_string();
    let signature = sign("whsec_test", payload.as_bytes());

    let response = app
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/payments/webhook")
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-gateway-signature", signature)
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let placed = app
        .state
        .services
        .orders
        .find_by_transaction_id("TXN-WH-1")
        .await
        .unwrap()
        .expect("order created from webhook");
    assert_eq!(placed.order.user_id, user_id);
    assert_eq!(placed.order.total_amount, dec!(20.00));

    // Checkout consumed the cart lines.
    let cart = app
        .state
        .services
        .carts
        .get_cart(resolved.cart.id)
        .await
        .unwrap();
    assert!(cart.items.is_empty());

    assert_eq!(app.product(widget.id).await.stock_quantity, 3);
}

#[tokio::test]
async fn webhook_with_bad_signature_is_acknowledged_but_ignored() {
    let app = TestApp::new().await;

    let payload = json!({
        "event": "charge.success",
        "data": { "reference": "TXN-FORGED", "metadata": {} }
    })
    .to_string();

    let response = app
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/payments/webhook")
                .header("x-gateway-signature", "deadbeef")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();

    // The gateway always gets a 200 so it stops retrying.
    assert_eq!(response.status(), StatusCode::OK);

    let placed = app
        .state
        .services
        .orders
        .find_by_transaction_id("TXN-FORGED")
        .await
        .unwrap();
    assert!(placed.is_none());
}
