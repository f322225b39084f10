use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use sea_orm_migration::MigratorTrait;
use storefront_api::{
    config::{AppConfig, GatewayConfig},
    db::{self, DbConfig},
    entities::product,
    events::{self, EventSender},
    handlers,
    migrator::Migrator,
    AppState,
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Helper harness backed by an in-memory SQLite database.
///
/// The pool is capped at a single connection so every query sees the same
/// in-memory database.
pub struct TestApp {
    pub state: Arc<AppState>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a test application whose gateway client points at an
    /// address nothing listens on. Fine for flows that never call the
    /// gateway (cash on delivery, lifecycle, carts).
    pub async fn new() -> Self {
        Self::with_gateway_url("http://127.0.0.1:9/gateway").await
    }

    /// Construct a test application with the gateway client pointed at the
    /// given base URL, typically a wiremock server.
    pub async fn with_gateway_url(gateway_base_url: &str) -> Self {
        let cfg = test_config(gateway_base_url);

        let pool = db::establish_connection_with_config(&DbConfig {
            url: cfg.database_url.clone(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .expect("failed to create test database");

        Migrator::up(&pool, None)
            .await
            .expect("failed to run migrations");

        let (event_tx, event_rx) = mpsc::channel(64);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let state = Arc::new(
            AppState::new(Arc::new(pool), cfg, event_sender).expect("failed to build app state"),
        );

        Self {
            state,
            _event_task: event_task,
        }
    }

    /// Full API router bound to this app's state.
    pub fn router(&self) -> Router {
        handlers::api_routes().with_state(self.state.clone())
    }

    /// Insert a product with the given price and stock.
    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        self.seed_product_with_sale(name, price, None, stock).await
    }

    pub async fn seed_product_with_sale(
        &self,
        name: &str,
        price: Decimal,
        sale_price: Option<Decimal>,
        stock: i32,
    ) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            sku: Set(format!("SKU-{}", Uuid::new_v4().simple())),
            price: Set(price),
            sale_price: Set(sale_price),
            stock_quantity: Set(stock),
            in_stock: Set(stock > 0),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(self.state.db.as_ref())
        .await
        .expect("failed to seed product")
    }

    /// Current catalog row for a product.
    pub async fn product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(self.state.db.as_ref())
            .await
            .expect("product query failed")
            .expect("product missing")
    }

    /// Overwrite a product's stock, recomputing availability the same way
    /// the services do.
    pub async fn set_stock(&self, id: Uuid, stock: i32) {
        let current = self.product(id).await;
        let mut active: product::ActiveModel = current.into();
        active.stock_quantity = Set(stock);
        active.in_stock = Set(stock > 0);
        active.updated_at = Set(Utc::now());
        active
            .update(self.state.db.as_ref())
            .await
            .expect("stock update failed");
    }
}

fn test_config(gateway_base_url: &str) -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        host: "127.0.0.1".to_string(),
        port: 18080,
        environment: "test".to_string(),
        log_level: "debug".to_string(),
        log_json: false,
        auto_migrate: true,
        cart_session_ttl_secs: Duration::from_secs(60 * 60 * 24 * 30).as_secs(),
        event_channel_capacity: 64,
        gateway: GatewayConfig {
            base_url: gateway_base_url.to_string(),
            secret_key: "sk_test_secret".to_string(),
            webhook_secret: Some("whsec_test".to_string()),
            callback_url: "http://127.0.0.1:18080/payments/callback".to_string(),
            verify_timeout_secs: 2,
            verification_cache_ttl_secs: 300,
        },
    }
}
