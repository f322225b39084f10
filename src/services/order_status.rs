use crate::{
    entities::{
        order::{self, OrderStatus},
        order_item, product, Order, OrderItem, Product,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Drives orders through their lifecycle after creation.
///
/// Every transition is checked against [`OrderStatus::can_transition_to`];
/// an illegal move is rejected with both states named, never applied and
/// never silently ignored.
pub struct OrderStatusService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl OrderStatusService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    #[instrument(skip(self))]
    pub async fn ship_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.transition(order_id, OrderStatus::Shipped).await
    }

    #[instrument(skip(self))]
    pub async fn deliver_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.transition(order_id, OrderStatus::Delivered).await
    }

    /// Cancels an order and compensates inventory.
    ///
    /// Restores each line's quantity to its product and recomputes the
    /// availability flag, all in the same transaction as the status flip,
    /// so a failed cancellation leaves both order and stock untouched.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let order = self.load(&txn, order_id).await?;
        let old_status = order.status;
        Self::check_transition(&order, OrderStatus::Cancelled)?;

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;

        let mut restored: Vec<(Uuid, i32)> = Vec::with_capacity(items.len());
        for item in items {
            let product = Product::find_by_id(item.product_id)
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", item.product_id))
                })?;

            let replenished = product.stock_quantity + item.quantity;
            let mut active: product::ActiveModel = product.into();
            active.stock_quantity = Set(replenished);
            active.in_stock = Set(replenished > 0);
            active.updated_at = Set(Utc::now());
            active.update(&txn).await?;
            restored.push((item.product_id, item.quantity));
        }

        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::Cancelled);
        active.updated_at = Set(Some(Utc::now()));
        let cancelled = active.update(&txn).await?;

        txn.commit().await?;

        info!(order_id = %order_id, from = %old_status, "order cancelled, stock restored");

        for (product_id, quantity) in restored {
            self.event_sender
                .send_or_log(Event::StockRestored {
                    product_id,
                    quantity,
                })
                .await;
        }
        self.event_sender
            .send_or_log(Event::OrderCancelled(order_id))
            .await;

        Ok(cancelled)
    }

    async fn transition(
        &self,
        order_id: Uuid,
        next: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let order = self.load(self.db.as_ref(), order_id).await?;
        let old_status = order.status;
        Self::check_transition(&order, next)?;

        let mut active: order::ActiveModel = order.into();
        active.status = Set(next);
        active.updated_at = Set(Some(Utc::now()));
        let updated = active.update(self.db.as_ref()).await?;

        info!(order_id = %order_id, from = %old_status, to = %next, "order status changed");

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status: next,
            })
            .await;

        Ok(updated)
    }

    fn check_transition(order: &order::Model, next: OrderStatus) -> Result<(), ServiceError> {
        if order.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(ServiceError::InvalidStateTransition {
                from: order.status.to_string(),
                to: next.to_string(),
            })
        }
    }

    async fn load<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        Order::find_by_id(order_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }
}
