use crate::{
    entities::{
        order::{self, OrderStatus},
        order_item,
        payment::{self, PaymentMethod, PaymentStatus},
        product, Order, OrderItem, Payment, Product,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::payment_gateway::PaymentGatewayService,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// One requested order line. Quantities only; prices are always resolved
/// server-side from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderLineInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderInput {
    pub user_id: Uuid,
    #[validate]
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<OrderLineInput>,
    #[validate(length(min = 1, message = "Shipping address is required"))]
    pub shipping_address: String,
    pub payment_method: PaymentMethod,
    /// Gateway reference. Required for gateway-settled methods, absent
    /// otherwise.
    pub transaction_id: Option<String>,
}

/// Order plus its payment record, the unit `create_order` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order: order::Model,
    pub payment: payment::Model,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub payment: Option<payment::Model>,
}

/// Coordinates order placement: payment verification, pricing, inventory,
/// and the atomic write of order, items and payment.
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<PaymentGatewayService>,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<PaymentGatewayService>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            gateway,
            event_sender,
        }
    }

    /// Places an order.
    ///
    /// For gateway-settled methods the payment is verified first, before
    /// any database write. An unverified payment still produces a record:
    /// the order and payment are persisted as cancelled, inventory
    /// untouched, so the attempt is auditable.
    ///
    /// Order, items, payment and stock decrements commit in one database
    /// transaction. The unique constraint on `payments.transaction_id`
    /// makes the call idempotent: a concurrent duplicate loses the insert
    /// race, rolls back its own writes, and returns the winner's order as
    /// its own success.
    #[instrument(skip(self, input), fields(user_id = %input.user_id, method = ?input.payment_method))]
    pub async fn create_order(&self, input: CreateOrderInput) -> Result<PlacedOrder, ServiceError> {
        input.validate()?;

        // Fast path: a payment for this reference already exists, so a
        // previous (or concurrent, now committed) call placed the order.
        // Checked before verification so a retry succeeds even when the
        // gateway is unreachable.
        if let Some(ref transaction_id) = input.transaction_id {
            if let Some(existing) = self.find_by_transaction_id(transaction_id).await? {
                info!(
                    order_id = %existing.order.id,
                    transaction_id = %transaction_id,
                    "duplicate order request, returning existing order"
                );
                return Ok(existing);
            }
        }

        let verified = self.verify_payment(&input).await?;

        let txn = self.db.begin().await?;

        let placed = match self.place_in_txn(&txn, &input, verified).await {
            Ok(placed) => {
                txn.commit().await?;
                placed
            }
            Err(ServiceError::Conflict(_)) => {
                // Lost the insert race on transaction_id. Rolling back
                // discards our speculative order and items; the winner's
                // order is the caller's result.
                txn.rollback().await?;
                let transaction_id = input
                    .transaction_id
                    .as_deref()
                    .unwrap_or_default()
                    .to_string();
                warn!(
                    transaction_id = %transaction_id,
                    "lost order creation race, adopting winner"
                );
                self.find_by_transaction_id(&transaction_id)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::Conflict(format!(
                            "Concurrent order for transaction '{}' no longer exists",
                            transaction_id
                        ))
                    })?
            }
            Err(err) => {
                txn.rollback().await?;
                return Err(err);
            }
        };

        self.event_sender
            .send_or_log(Event::OrderCreated(placed.order.id))
            .await;
        self.event_sender
            .send_or_log(Event::PaymentRecorded {
                payment_id: placed.payment.id,
                order_id: placed.order.id,
                verified,
            })
            .await;

        Ok(placed)
    }

    /// Verifies the payment precondition for the chosen method.
    ///
    /// Gateway methods without a reference fail fast; nothing is persisted
    /// for them. Non-gateway methods settle out of band and count as
    /// verified.
    async fn verify_payment(&self, input: &CreateOrderInput) -> Result<bool, ServiceError> {
        if !input.payment_method.requires_gateway() {
            return Ok(true);
        }

        let transaction_id = input.transaction_id.as_deref().ok_or_else(|| {
            ServiceError::ValidationError(
                "A transaction reference is required for this payment method".to_string(),
            )
        })?;

        let outcome = self.gateway.verify(transaction_id).await?;
        Ok(outcome.verified)
    }

    async fn place_in_txn(
        &self,
        txn: &DatabaseTransaction,
        input: &CreateOrderInput,
        verified: bool,
    ) -> Result<PlacedOrder, ServiceError> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let mut total_amount = Decimal::ZERO;
        let mut lines: Vec<(product::Model, i32, Decimal)> = Vec::with_capacity(input.items.len());

        for line in &input.items {
            let product = Product::find_by_id(line.product_id)
                .one(txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", line.product_id))
                })?;

            // Unverified payments never touch inventory, so the stock gate
            // only applies when we are about to decrement.
            if verified && (!product.in_stock || line.quantity > product.stock_quantity) {
                return Err(ServiceError::InsufficientStock(format!(
                    "Product '{}' has {} in stock, {} requested",
                    product.name, product.stock_quantity, line.quantity
                )));
            }

            let unit_price = product.effective_price();
            total_amount += unit_price * Decimal::from(line.quantity);
            lines.push((product, line.quantity, unit_price));
        }

        let (order_status, payment_status) = if verified {
            (OrderStatus::Processing, PaymentStatus::Completed)
        } else {
            (OrderStatus::Cancelled, PaymentStatus::Cancelled)
        };

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number()),
            user_id: Set(input.user_id),
            status: Set(order_status),
            total_amount: Set(total_amount),
            shipping_address: Set(input.shipping_address.clone()),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(txn)
        .await?;

        for (product, quantity, unit_price) in &lines {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product.id),
                quantity: Set(*quantity),
                price: Set(*unit_price),
                created_at: Set(now),
            }
            .insert(txn)
            .await?;
        }

        let payment_insert = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            amount: Set(total_amount),
            transaction_id: Set(input.transaction_id.clone()),
            payment_method: Set(input.payment_method),
            payment_status: Set(payment_status),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(txn)
        .await;

        let payment = match payment_insert {
            Ok(payment) => payment,
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                return Err(ServiceError::Conflict(format!(
                    "Payment for transaction '{}' already recorded",
                    input.transaction_id.as_deref().unwrap_or_default()
                )));
            }
            Err(err) => return Err(err.into()),
        };

        if verified {
            for (product, quantity, _) in lines {
                let remaining = product.stock_quantity - quantity;
                let mut active: product::ActiveModel = product.into();
                active.stock_quantity = Set(remaining);
                active.in_stock = Set(remaining > 0);
                active.updated_at = Set(now);
                active.update(txn).await?;
            }
        }

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total_amount,
            status = %order.status,
            "order placed"
        );

        Ok(PlacedOrder { order, payment })
    }

    /// Order owned by an already-recorded gateway reference, if any.
    pub async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PlacedOrder>, ServiceError> {
        let payment = Payment::find()
            .filter(payment::Column::TransactionId.eq(transaction_id))
            .one(self.db.as_ref())
            .await?;

        let Some(payment) = payment else {
            return Ok(None);
        };

        let order = Order::find_by_id(payment.order_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "Payment {} references missing order {}",
                    payment.id, payment.order_id
                ))
            })?;

        Ok(Some(PlacedOrder { order, payment }))
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(self.db.as_ref())
            .await?;

        let payment = Payment::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .one(self.db.as_ref())
            .await?;

        Ok(OrderDetails {
            order,
            items,
            payment,
        })
    }
}

/// Human-readable unique order number, e.g. `ORD-20260825-1A2B3C4D`.
/// Uniqueness is enforced by the column constraint, not by this generator.
fn generate_order_number() -> String {
    let timestamp = Utc::now().format("%Y%m%d");
    let random = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect::<String>()
        .to_uppercase();
    format!("ORD-{}-{}", timestamp, random)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_numbers_are_prefixed_and_unique() {
        let a = generate_order_number();
        let b = generate_order_number();
        assert!(a.starts_with("ORD-"));
        assert_eq!(a.len(), "ORD-20260825-1A2B3C4D".len());
        assert_ne!(a, b);
    }

    #[test]
    fn create_order_input_rejects_empty_items() {
        let input = CreateOrderInput {
            user_id: Uuid::new_v4(),
            items: vec![],
            shipping_address: "1 Main St".into(),
            payment_method: PaymentMethod::CashOnDelivery,
            transaction_id: None,
        };
        assert!(input.validate().is_err());
    }

    #[test]
    fn create_order_input_rejects_zero_quantity() {
        let input = CreateOrderInput {
            user_id: Uuid::new_v4(),
            items: vec![OrderLineInput {
                product_id: Uuid::new_v4(),
                quantity: 0,
            }],
            shipping_address: "1 Main St".into(),
            payment_method: PaymentMethod::CashOnDelivery,
            transaction_id: None,
        };
        assert!(input.validate().is_err());
    }
}
