use crate::{
    entities::{cart, cart_item, product, Cart, CartItem, Product},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, ModelTrait,
    QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Cart identity: a durable user or an ephemeral guest session.
///
/// Replaces null-checked `user_id`/`session_id` branching with one variant
/// consumed exhaustively wherever ownership matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartOwner {
    User(Uuid),
    Session(String),
}

/// Result of resolving a cart for a request.
///
/// `session_id` is echoed back (newly minted when `is_new_session`) so the
/// caller can persist it as a cookie for subsequent calls.
#[derive(Debug, Serialize)]
pub struct ResolvedCart {
    pub cart: cart::Model,
    pub items: Vec<cart_item::Model>,
    pub session_id: Option<String>,
    pub is_new_session: bool,
}

/// Input for adding an item to a cart
#[derive(Debug, Deserialize)]
pub struct AddItemInput {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Cart aggregation service: resolves guest/user carts, merges a guest cart
/// into a user cart on login, and manages items with availability checks.
///
/// Item operations validate against current stock but do not reserve it;
/// the order-time transaction is authoritative.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Resolves the cart for the given identity.
    ///
    /// - Neither identity: mint a session id and create an empty guest cart.
    /// - Session only: return (or lazily create) the guest cart.
    /// - User without a user cart but with a guest cart: re-bind the guest
    ///   cart to the user — ownership transfer, no item copy.
    /// - User with both carts: merge, summing quantities for shared
    ///   products, then delete the guest cart. No data loss.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        user_id: Option<Uuid>,
        session_id: Option<String>,
    ) -> Result<ResolvedCart, ServiceError> {
        match (user_id, session_id) {
            (Some(uid), sid) => self.resolve_for_user(uid, sid).await,
            (None, Some(sid)) => {
                let owner = CartOwner::Session(sid.clone());
                let cart = match self.find_by_owner(&*self.db, &owner).await? {
                    Some(cart) => cart,
                    None => self.create_for_owner(&*self.db, &owner).await?,
                };
                let items = cart.find_related(CartItem).all(&*self.db).await?;
                Ok(ResolvedCart {
                    cart,
                    items,
                    session_id: Some(sid),
                    is_new_session: false,
                })
            }
            (None, None) => {
                let sid = mint_session_id();
                let cart = self
                    .create_for_owner(&*self.db, &CartOwner::Session(sid.clone()))
                    .await?;
                Ok(ResolvedCart {
                    cart,
                    items: Vec::new(),
                    session_id: Some(sid),
                    is_new_session: true,
                })
            }
        }
    }

    async fn resolve_for_user(
        &self,
        user_id: Uuid,
        session_id: Option<String>,
    ) -> Result<ResolvedCart, ServiceError> {
        let txn = self.db.begin().await?;

        let user_owner = CartOwner::User(user_id);
        let user_cart = self.find_by_owner(&txn, &user_owner).await?;
        let session_cart = match &session_id {
            Some(sid) => {
                self.find_by_owner(&txn, &CartOwner::Session(sid.clone()))
                    .await?
            }
            None => None,
        };

        let cart = match (user_cart, session_cart) {
            // Guest cart exists but no user cart: transfer ownership.
            (None, Some(guest)) => {
                let guest_id = guest.id;
                let mut active: cart::ActiveModel = guest.into();
                active.user_id = Set(Some(user_id));
                active.session_id = Set(None);
                active.updated_at = Set(Utc::now());
                let rebound = active.update(&txn).await?;
                info!(cart_id = %guest_id, user_id = %user_id, "re-bound guest cart to user");
                rebound
            }
            // Both exist: absorb the guest cart into the user cart.
            (Some(user), Some(guest)) => self.merge_session_cart(&txn, user, guest).await?,
            (Some(user), None) => user,
            (None, None) => self.create_for_owner(&txn, &user_owner).await?,
        };

        let items = cart.find_related(CartItem).all(&txn).await?;
        txn.commit().await?;

        Ok(ResolvedCart {
            cart,
            items,
            session_id,
            is_new_session: false,
        })
    }

    /// Merges every guest-cart item into the user cart: shared products sum
    /// their quantities, unseen items move over. The guest cart is deleted.
    async fn merge_session_cart(
        &self,
        conn: &impl ConnectionTrait,
        user_cart: cart::Model,
        session_cart: cart::Model,
    ) -> Result<cart::Model, ServiceError> {
        let user_cart_id = user_cart.id;
        let session_cart_id = session_cart.id;

        let session_items = session_cart.find_related(CartItem).all(conn).await?;

        for item in session_items {
            let existing = CartItem::find()
                .filter(cart_item::Column::CartId.eq(user_cart_id))
                .filter(cart_item::Column::ProductId.eq(item.product_id))
                .one(conn)
                .await?;

            match existing {
                Some(target) => {
                    let summed = target.quantity + item.quantity;
                    let mut active: cart_item::ActiveModel = target.into();
                    active.quantity = Set(summed);
                    active.updated_at = Set(Utc::now());
                    active.update(conn).await?;
                    item.delete(conn).await?;
                }
                None => {
                    let mut active: cart_item::ActiveModel = item.into();
                    active.cart_id = Set(user_cart_id);
                    active.updated_at = Set(Utc::now());
                    active.update(conn).await?;
                }
            }
        }

        session_cart.delete(conn).await?;

        let mut active: cart::ActiveModel = user_cart.into();
        active.updated_at = Set(Utc::now());
        let merged = active.update(conn).await?;

        self.event_sender
            .send_or_log(Event::CartMerged {
                user_cart_id,
                session_cart_id,
            })
            .await;

        info!(
            user_cart_id = %user_cart_id,
            session_cart_id = %session_cart_id,
            "merged guest cart into user cart"
        );
        Ok(merged)
    }

    /// Adds an item, summing with any existing line for the same product.
    /// The combined quantity is validated against current availability.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        input: AddItemInput,
    ) -> Result<cart_item::Model, ServiceError> {
        if input.quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        Cart::find_by_id(cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        let product = self.available_product(&txn, input.product_id).await?;

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(input.product_id))
            .one(&txn)
            .await?;

        let requested = existing.as_ref().map_or(0, |i| i.quantity) + input.quantity;
        ensure_stock(&product, requested)?;

        let item = match existing {
            Some(item) => {
                let mut active: cart_item::ActiveModel = item.into();
                active.quantity = Set(requested);
                active.updated_at = Set(Utc::now());
                active.update(&txn).await?
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart_id),
                    product_id: Set(input.product_id),
                    quantity: Set(input.quantity),
                    created_at: Set(Utc::now()),
                    updated_at: Set(Utc::now()),
                }
                .insert(&txn)
                .await?
            }
        };

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id,
                product_id: input.product_id,
            })
            .await;

        Ok(item)
    }

    /// Sets an item's quantity; zero or less removes the line.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<Option<cart_item::Model>, ServiceError> {
        if quantity <= 0 {
            self.remove_item(cart_id, product_id).await?;
            return Ok(None);
        }

        let txn = self.db.begin().await?;

        let item = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not in cart {}", product_id, cart_id))
            })?;

        let product = self.available_product(&txn, product_id).await?;
        ensure_stock(&product, quantity)?;

        let mut active: cart_item::ActiveModel = item.into();
        active.quantity = Set(quantity);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;

        txn.commit().await?;
        Ok(Some(updated))
    }

    /// Removes a product's line from the cart.
    #[instrument(skip(self))]
    pub async fn remove_item(&self, cart_id: Uuid, product_id: Uuid) -> Result<(), ServiceError> {
        let item = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not in cart {}", product_id, cart_id))
            })?;

        item.delete(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CartItemRemoved {
                cart_id,
                product_id,
            })
            .await;

        Ok(())
    }

    /// Empties a cart after checkout. The cart row itself survives so the
    /// caller's session keeps pointing at a valid cart.
    #[instrument(skip(self))]
    pub async fn clear(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Retrieves a cart with all its items.
    pub async fn get_cart(&self, cart_id: Uuid) -> Result<ResolvedCart, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        let items = cart.find_related(CartItem).all(&*self.db).await?;
        let session_id = cart.session_id.clone();

        Ok(ResolvedCart {
            cart,
            items,
            session_id,
            is_new_session: false,
        })
    }

    async fn find_by_owner(
        &self,
        conn: &impl ConnectionTrait,
        owner: &CartOwner,
    ) -> Result<Option<cart::Model>, ServiceError> {
        let query = match owner {
            CartOwner::User(uid) => Cart::find().filter(cart::Column::UserId.eq(*uid)),
            CartOwner::Session(sid) => {
                Cart::find().filter(cart::Column::SessionId.eq(sid.clone()))
            }
        };
        Ok(query.one(conn).await?)
    }

    async fn create_for_owner(
        &self,
        conn: &impl ConnectionTrait,
        owner: &CartOwner,
    ) -> Result<cart::Model, ServiceError> {
        let (user_id, session_id) = match owner {
            CartOwner::User(uid) => (Some(*uid), None),
            CartOwner::Session(sid) => (None, Some(sid.clone())),
        };

        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            session_id: Set(session_id),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?;

        self.event_sender.send_or_log(Event::CartCreated(cart.id)).await;
        Ok(cart)
    }

    async fn available_product(
        &self,
        conn: &impl ConnectionTrait,
        product_id: Uuid,
    ) -> Result<product::Model, ServiceError> {
        Product::find_by_id(product_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }
}

fn ensure_stock(product: &product::Model, requested: i32) -> Result<(), ServiceError> {
    if !product.in_stock || requested > product.stock_quantity {
        return Err(ServiceError::InsufficientStock(format!(
            "Product {} has {} in stock, {} requested",
            product.id, product.stock_quantity, requested
        )));
    }
    Ok(())
}

fn mint_session_id() -> String {
    format!("sess_{}", Uuid::new_v4().simple())
}
