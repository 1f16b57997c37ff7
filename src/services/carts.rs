use crate::{
    entities::{cart_line, product, CartLine, Product},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Cart ledger: {product, quantity} pairs keyed by session, with totals
/// derived from the catalog on every read. Each mutation persists the new
/// line set before returning; the persisted store is last-write-wins
/// across tabs.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

/// A cart line enriched with catalog data.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CartLineView {
    pub product_id: Uuid,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
}

/// Derived view over the persisted lines. `total` and `item_count` are
/// recomputed here every time, never stored.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CartView {
    pub session_id: String,
    pub lines: Vec<CartLineView>,
    pub total: Decimal,
    pub item_count: i64,
}

impl CartView {
    fn empty(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            lines: Vec::new(),
            total: Decimal::ZERO,
            item_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Loads the persisted cart for a session. Fails open: rows with a
    /// non-positive quantity or a vanished product are discarded, and a
    /// store read failure yields an empty cart rather than an error.
    #[instrument(skip(self))]
    pub async fn load(&self, session_id: &str) -> CartView {
        let rows = CartLine::find()
            .filter(cart_line::Column::SessionId.eq(session_id))
            .order_by_asc(cart_line::Column::Position)
            .all(&*self.db)
            .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Cart load failed for session {session_id}, treating as empty: {e}");
                return CartView::empty(session_id);
            }
        };

        let product_ids: Vec<Uuid> = rows.iter().map(|r| r.product_id).collect();
        let products: HashMap<Uuid, product::Model> = match Product::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(&*self.db)
            .await
        {
            Ok(models) => models.into_iter().map(|m| (m.id, m)).collect(),
            Err(e) => {
                warn!("Catalog read failed for session {session_id}, treating cart as empty: {e}");
                return CartView::empty(session_id);
            }
        };

        let mut lines = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(product) = products.get(&row.product_id) else {
                warn!(
                    "Dropping cart line for unknown product {} in session {session_id}",
                    row.product_id
                );
                self.discard_line(session_id, row.product_id).await;
                continue;
            };
            if row.quantity <= 0 {
                warn!(
                    "Dropping cart line with non-positive quantity for {} in session {session_id}",
                    row.product_id
                );
                self.discard_line(session_id, row.product_id).await;
                continue;
            }

            lines.push(CartLineView {
                product_id: product.id,
                name: product.name.clone(),
                unit_price: product.unit_price,
                quantity: row.quantity,
                line_total: product.unit_price * Decimal::from(row.quantity),
            });
        }

        Self::with_totals(session_id, lines)
    }

    /// Adds a quantity of a product, merging into an existing line.
    /// A non-positive quantity is a no-op.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        session_id: &str,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity <= 0 {
            return Ok(self.load(session_id).await);
        }

        let product = Product::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;
        if !product.available {
            return Err(ServiceError::ValidationError(format!(
                "Product {} is not available for sale",
                product_id
            )));
        }

        let existing = CartLine::find_by_id((session_id.to_string(), product_id))
            .one(&*self.db)
            .await?;

        match existing {
            Some(line) => {
                let merged = line.quantity.saturating_add(quantity);
                let mut line: cart_line::ActiveModel = line.into();
                line.quantity = Set(merged);
                line.updated_at = Set(Utc::now());
                line.update(&*self.db).await?;
            }
            None => {
                let position = self.next_position(session_id).await?;
                cart_line::ActiveModel {
                    session_id: Set(session_id.to_string()),
                    product_id: Set(product_id),
                    quantity: Set(quantity),
                    position: Set(position),
                    updated_at: Set(Utc::now()),
                }
                .insert(&*self.db)
                .await?;
            }
        }

        self.event_sender
            .send_or_log(Event::CartUpdated {
                session: session_id.to_string(),
            })
            .await;

        Ok(self.load(session_id).await)
    }

    /// Replaces a line's quantity; a non-positive quantity removes the
    /// line. Setting a quantity for a product not yet in the cart adds it.
    #[instrument(skip(self))]
    pub async fn set_quantity(
        &self,
        session_id: &str,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity <= 0 {
            return self.remove_item(session_id, product_id).await;
        }

        let existing = CartLine::find_by_id((session_id.to_string(), product_id))
            .one(&*self.db)
            .await?;

        match existing {
            Some(line) => {
                let mut line: cart_line::ActiveModel = line.into();
                line.quantity = Set(quantity);
                line.updated_at = Set(Utc::now());
                line.update(&*self.db).await?;

                self.event_sender
                    .send_or_log(Event::CartUpdated {
                        session: session_id.to_string(),
                    })
                    .await;

                Ok(self.load(session_id).await)
            }
            None => self.add_item(session_id, product_id, quantity).await,
        }
    }

    /// Deletes a line outright.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        session_id: &str,
        product_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        CartLine::delete_by_id((session_id.to_string(), product_id))
            .exec(&*self.db)
            .await?;

        self.event_sender
            .send_or_log(Event::CartUpdated {
                session: session_id.to_string(),
            })
            .await;

        Ok(self.load(session_id).await)
    }

    /// Empties the cart. Called by the checkout flow on confirmed success,
    /// or directly by the shopper.
    #[instrument(skip(self))]
    pub async fn clear(&self, session_id: &str) -> Result<(), ServiceError> {
        CartLine::delete_many()
            .filter(cart_line::Column::SessionId.eq(session_id))
            .exec(&*self.db)
            .await?;

        self.event_sender
            .send_or_log(Event::CartCleared {
                session: session_id.to_string(),
            })
            .await;

        info!("Cleared cart for session {session_id}");
        Ok(())
    }

    fn with_totals(session_id: &str, lines: Vec<CartLineView>) -> CartView {
        let total = lines.iter().map(|l| l.line_total).sum();
        let item_count = lines.iter().map(|l| i64::from(l.quantity)).sum();
        CartView {
            session_id: session_id.to_string(),
            lines,
            total,
            item_count,
        }
    }

    async fn next_position(&self, session_id: &str) -> Result<i32, ServiceError> {
        let last = CartLine::find()
            .filter(cart_line::Column::SessionId.eq(session_id))
            .order_by_desc(cart_line::Column::Position)
            .one(&*self.db)
            .await?;
        Ok(last.map(|l| l.position + 1).unwrap_or(0))
    }

    /// Best-effort removal of a malformed row during fail-open loading.
    async fn discard_line(&self, session_id: &str, product_id: Uuid) {
        if let Err(e) = CartLine::delete_by_id((session_id.to_string(), product_id))
            .exec(&*self.db)
            .await
        {
            warn!("Could not discard malformed cart line: {e}");
        }
    }
}
