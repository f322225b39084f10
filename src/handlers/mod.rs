pub mod carts;
pub mod common;
pub mod orders;
pub mod payments;
pub mod webhooks;

use crate::{
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    events::EventSender,
    services::{
        carts::CartService, order_status::OrderStatusService, orders::OrderService,
        payment_gateway::PaymentGatewayService,
    },
};
use axum::{response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub order_status: Arc<OrderStatusService>,
    pub gateway: Arc<PaymentGatewayService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        event_sender: Arc<EventSender>,
    ) -> Result<Self, ServiceError> {
        let gateway = Arc::new(PaymentGatewayService::new(&config.gateway)?);

        Ok(Self {
            carts: Arc::new(CartService::new(db_pool.clone(), event_sender.clone())),
            orders: Arc::new(OrderService::new(
                db_pool.clone(),
                gateway.clone(),
                event_sender.clone(),
            )),
            order_status: Arc::new(OrderStatusService::new(db_pool, event_sender)),
            gateway,
        })
    }
}

/// Assembles the full API router.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/cart", carts::carts_routes())
        .nest("/api/v1/orders", orders::orders_routes())
        .nest(
            "/api/v1/payments",
            payments::payments_routes().merge(webhooks::webhooks_routes()),
        )
}

/// Liveness probe
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
