use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::OrderStatus;

/// Events emitted by the order/payment core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartCreated(Uuid),
    CartMerged {
        user_cart_id: Uuid,
        session_cart_id: Uuid,
    },
    CartItemAdded {
        cart_id: Uuid,
        product_id: Uuid,
    },
    CartItemRemoved {
        cart_id: Uuid,
        product_id: Uuid,
    },

    // Order events
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled(Uuid),

    // Payment events
    PaymentRecorded {
        payment_id: Uuid,
        order_id: Uuid,
        verified: bool,
    },

    // Inventory compensation
    StockRestored {
        product_id: Uuid,
        quantity: i32,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, surfacing delivery failure to the caller.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event; a full or closed channel is logged, never fatal.
    /// Domain operations must not fail because observers are behind.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.sender.send(event).await {
            warn!("Failed to send event: {}", e);
        }
    }
}

/// Background worker draining the event channel. Downstream consumers
/// (notifications, analytics) hang off this; here events are logged.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        info!(?event, "event processed");
    }
}
