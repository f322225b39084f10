use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use storefront_api::{
    config::GatewayConfig,
    errors::ServiceError,
    services::payment_gateway::{InitiateRequest, ManualClock, PaymentGatewayService},
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway_config(base_url: &str, cache_ttl_secs: u64) -> GatewayConfig {
    GatewayConfig {
        base_url: base_url.to_string(),
        secret_key: "sk_test_secret".to_string(),
        webhook_secret: None,
        callback_url: "http://127.0.0.1:18080/payments/callback".to_string(),
        verify_timeout_secs: 2,
        verification_cache_ttl_secs: cache_ttl_secs,
    }
}

fn verify_success() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "status": true,
        "data": { "status": "success", "amount": 1050 }
    }))
}

#[tokio::test]
async fn verification_is_cached_within_ttl() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/TXN-CACHE"))
        .and(header("authorization", "Bearer sk_test_secret"))
        .respond_with(verify_success())
        .expect(1)
        .mount(&server)
        .await;

    let service = PaymentGatewayService::new(&gateway_config(&server.uri(), 300)).unwrap();

    let first = service.verify("TXN-CACHE").await.unwrap();
    let second = service.verify("TXN-CACHE").await.unwrap();

    assert!(first.verified);
    assert!(second.verified);
    // expect(1) on the mock asserts the second call never hit the network.
}

#[tokio::test]
async fn expired_cache_entry_triggers_a_refetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/TXN-TTL"))
        .respond_with(verify_success())
        .expect(2)
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::new());
    let service =
        PaymentGatewayService::with_clock(&gateway_config(&server.uri(), 300), clock.clone())
            .unwrap();

    service.verify("TXN-TTL").await.unwrap();
    clock.advance(Duration::from_secs(301));
    service.verify("TXN-TTL").await.unwrap();
}

#[tokio::test]
async fn gateway_outage_falls_back_to_stale_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/TXN-STALE"))
        .respond_with(verify_success())
        .expect(1)
        .mount(&server)
        .await;

    // TTL of zero: every entry is immediately stale, so the second call
    // must go to the network and find the gateway down.
    let service = PaymentGatewayService::new(&gateway_config(&server.uri(), 0)).unwrap();

    let first = service.verify("TXN-STALE").await.unwrap();
    assert!(first.verified);

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/TXN-STALE"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    // Degraded mode: the stale result is better than refusing checkout.
    let fallback = service.verify("TXN-STALE").await.unwrap();
    assert!(fallback.verified);
}

#[tokio::test]
async fn gateway_outage_without_cache_is_a_retryable_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/TXN-DOWN"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let service = PaymentGatewayService::new(&gateway_config(&server.uri(), 300)).unwrap();

    let err = service.verify("TXN-DOWN").await.unwrap_err();
    assert!(matches!(err, ServiceError::ExternalService(_)));
}

#[tokio::test]
async fn unverifiable_reference_is_a_payment_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/TXN-UNKNOWN"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": false,
            "message": "Transaction reference not found"
        })))
        .mount(&server)
        .await;

    let service = PaymentGatewayService::new(&gateway_config(&server.uri(), 300)).unwrap();

    let err = service.verify("TXN-UNKNOWN").await.unwrap_err();
    assert!(matches!(err, ServiceError::PaymentVerification(_)));
}

#[tokio::test]
async fn initiation_converts_to_minor_units() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transaction/initialize"))
        .and(header("authorization", "Bearer sk_test_secret"))
        .and(body_partial_json(serde_json::json!({
            "email": "shopper@example.com",
            "amount": 1050
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": true,
            "message": "Authorization URL created",
            "data": {
                "authorization_url": "https://gateway.example/pay/abc123",
                "reference": "TXN-20260825-ABCDEF123456"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let service = PaymentGatewayService::new(&gateway_config(&server.uri(), 300)).unwrap();

    let initiated = service
        .initiate(InitiateRequest {
            email: "shopper@example.com".to_string(),
            amount: dec!(10.50),
            callback_url: "http://127.0.0.1:18080/payments/callback".to_string(),
            metadata: None,
        })
        .await
        .unwrap();

    assert_eq!(initiated.reference, "TXN-20260825-ABCDEF123456");
    assert_eq!(
        initiated.authorization_url,
        "https://gateway.example/pay/abc123"
    );
}

#[tokio::test]
async fn non_positive_amounts_never_reach_the_gateway() {
    // Port 9 (discard) is not listening; a network attempt would error
    // differently than the validation failure asserted here.
    let service = PaymentGatewayService::new(&gateway_config("http://127.0.0.1:9", 300)).unwrap();

    let err = service
        .initiate(InitiateRequest {
            email: "shopper@example.com".to_string(),
            amount: dec!(0),
            callback_url: "http://127.0.0.1:18080/payments/callback".to_string(),
            metadata: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::ValidationError(_)));
}
