use crate::{
    config::AppConfig,
    entities::{
        order::{self, OrderStatus, PaymentMethod, PaymentStatus},
        order_item, Order, OrderItem, Product,
    },
    errors::{RejectionCode, ServiceError},
    events::{Event, EventSender},
    mpesa,
};
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// Tolerance for the declared-total staleness check. The declared value is
/// only a tamper/staleness tripwire; the recomputed total is what gets
/// persisted.
const TOTAL_EPSILON: Decimal = dec!(0.01);

/// Shipping details captured at checkout. All fields are required.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ShippingDetails {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub city: String,
    pub postal_code: String,
}

impl ShippingDetails {
    /// Names of required fields that are empty or whitespace.
    pub fn missing_fields(&self) -> Vec<String> {
        let checks = [
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("email", &self.email),
            ("phone", &self.phone),
            ("address", &self.address),
            ("city", &self.city),
            ("postal_code", &self.postal_code),
        ];
        checks
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

/// Payment intent as submitted by the client. The method arrives as text
/// so an unknown value can be rejected with a typed code instead of a
/// deserialization error.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentIntentInput {
    pub method: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct OrderLineInput {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct CreateOrderInput {
    pub placed_by: String,
    pub lines: Vec<OrderLineInput>,
    pub shipping: ShippingDetails,
    pub payment: PaymentIntentInput,
    pub declared_total: Decimal,
}

/// Identifiers returned immediately at creation, before any gateway
/// confirmation.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderConfirmation {
    pub order_id: Uuid,
    pub order_number: String,
    pub total: Decimal,
    pub currency: String,
    pub payment_status: PaymentStatus,
    pub order_status: OrderStatus,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    /// Validates a submission and persists the order.
    ///
    /// The snapshot is priced from the catalog here; the client-declared
    /// total is checked against the recomputation and rejected on
    /// divergence beyond [`TOTAL_EPSILON`]. Identifiers are returned
    /// without waiting for any payment-gateway confirmation.
    #[instrument(skip(self, input), fields(placed_by = %input.placed_by))]
    pub async fn create_order(
        &self,
        input: CreateOrderInput,
    ) -> Result<OrderConfirmation, ServiceError> {
        if input.lines.is_empty() {
            return Err(ServiceError::rejected(
                RejectionCode::EmptyCart,
                "Cannot create an order from an empty cart",
            ));
        }

        // Price the snapshot server-side; the catalog is the authority.
        let mut priced_lines = Vec::with_capacity(input.lines.len());
        let mut total = Decimal::ZERO;
        for line in &input.lines {
            if line.quantity < 1 {
                return Err(ServiceError::ValidationError(format!(
                    "Quantity for product {} must be at least 1",
                    line.product_id
                )));
            }
            let product = Product::find_by_id(line.product_id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| {
                    ServiceError::rejected(
                        RejectionCode::UnknownProduct,
                        format!("Product {} is not in the catalog", line.product_id),
                    )
                })?;
            if !product.available {
                return Err(ServiceError::rejected(
                    RejectionCode::UnknownProduct,
                    format!("Product {} is no longer available", line.product_id),
                ));
            }

            let line_total = product.unit_price * Decimal::from(line.quantity);
            total += line_total;
            priced_lines.push((product, line.quantity, line_total));
        }

        if (total - input.declared_total).abs() > TOTAL_EPSILON {
            return Err(ServiceError::rejected(
                RejectionCode::TotalMismatch,
                format!(
                    "Declared total {} does not match computed total {}",
                    input.declared_total, total
                ),
            ));
        }

        let missing = input.shipping.missing_fields();
        if !missing.is_empty() {
            return Err(ServiceError::rejected_fields(
                RejectionCode::IncompleteAddress,
                format!("Missing shipping fields: {}", missing.join(", ")),
                missing,
            ));
        }

        let (method, mpesa_phone) = self.resolve_payment(&input.payment)?;
        let payment_status = match method {
            PaymentMethod::Cash => PaymentStatus::Completed,
            PaymentMethod::Mpesa => PaymentStatus::Pending,
        };

        let order_id = Uuid::new_v4();
        let order_number = generate_order_number();
        let now = Utc::now();

        let shipping_json = serde_json::to_value(&input.shipping)
            .map_err(|e| ServiceError::SerializationError(e.to_string()))?;

        let txn = self.db.begin().await?;

        order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            placed_by: Set(input.placed_by.clone()),
            status: Set(OrderStatus::Processing),
            total: Set(total),
            currency: Set(self.config.currency.clone()),
            shipping_address: Set(shipping_json),
            payment_method: Set(method),
            mpesa_phone: Set(mpesa_phone),
            payment_status: Set(payment_status),
            created_at: Set(now),
            updated_at: Set(None),
            version: Set(1),
        }
        .insert(&txn)
        .await?;

        for (product, quantity, line_total) in &priced_lines {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product.id),
                name: Set(product.name.clone()),
                quantity: Set(*quantity),
                unit_price: Set(product.unit_price),
                line_total: Set(*line_total),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;

        self.event_sender.send_or_log(Event::OrderCreated(order_id)).await;

        info!(%order_id, %order_number, "Order created");
        Ok(OrderConfirmation {
            order_id,
            order_number,
            total,
            currency: self.config.currency.clone(),
            payment_status,
            order_status: OrderStatus::Processing,
        })
    }

    pub async fn get_order(&self, id: Uuid) -> Result<order::Model, ServiceError> {
        Order::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))
    }

    pub async fn get_order_items(&self, id: Uuid) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(OrderItem::find()
            .filter(order_item::Column::OrderId.eq(id))
            .all(&*self.db)
            .await?)
    }

    /// Applies a terminal payment outcome onto an order.
    ///
    /// Idempotent: re-applying the status an order already carries is a
    /// no-op and fires no event, so a replayed gateway notification cannot
    /// re-trigger the user-visible confirmation. The write is conditional
    /// on the version read, so concurrent writers cannot both land it.
    /// Moving a terminal order to a different status is rejected.
    #[instrument(skip(self))]
    pub async fn update_payment_status(
        &self,
        order_id: Uuid,
        new_status: PaymentStatus,
    ) -> Result<order::Model, ServiceError> {
        let existing = self.get_order(order_id).await?;

        if existing.payment_status == new_status {
            return Ok(existing);
        }
        if existing.payment_status.is_terminal() {
            return Err(ServiceError::InvalidStatus(format!(
                "Payment status of order {} is already terminal",
                order_id
            )));
        }
        if new_status == PaymentStatus::Pending {
            return Err(ServiceError::InvalidStatus(
                "Payment status cannot move back to pending".to_string(),
            ));
        }

        let version = existing.version;
        let written = Order::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(new_status))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .col_expr(order::Column::Version, Expr::value(version + 1))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Version.eq(version))
            .filter(order::Column::PaymentStatus.eq(existing.payment_status))
            .exec(&*self.db)
            .await?;

        if written.rows_affected == 0 {
            // Lost the write to a concurrent updater. The same status
            // landing first is a replay; anything else is a conflict.
            let current = self.get_order(order_id).await?;
            if current.payment_status == new_status {
                return Ok(current);
            }
            return Err(ServiceError::InvalidStatus(format!(
                "Payment status of order {} changed concurrently",
                order_id
            )));
        }

        let updated = self.get_order(order_id).await?;
        let event = match new_status {
            PaymentStatus::Completed => Event::PaymentConfirmed(order_id),
            PaymentStatus::Failed => Event::PaymentFailed(order_id),
            PaymentStatus::Pending => unreachable!("rejected above"),
        };
        self.event_sender.send_or_log(event).await;

        info!(%order_id, ?new_status, "Payment status updated");
        Ok(updated)
    }

    /// Resolves the client's payment intent into a typed method, rejecting
    /// unknown methods and absent or malformed mobile-money numbers. Also
    /// used by the checkout flow to gate the payment step.
    pub(crate) fn resolve_payment(
        &self,
        intent: &PaymentIntentInput,
    ) -> Result<(PaymentMethod, Option<String>), ServiceError> {
        match intent.method.as_str() {
            "cash" => Ok((PaymentMethod::Cash, None)),
            "mpesa" => {
                let raw = intent
                    .phone
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        ServiceError::rejected(
                            RejectionCode::MissingMobileMoneyPhone,
                            "Mobile-money payment requires a phone number",
                        )
                    })?;

                let canonical = mpesa::normalize_msisdn(&self.config.mpesa.country_code, raw)
                    .map_err(|_| {
                        ServiceError::rejected(
                            RejectionCode::MissingMobileMoneyPhone,
                            format!("'{}' is not a valid mobile-money number", raw),
                        )
                    })?;

                Ok((PaymentMethod::Mpesa, Some(canonical)))
            }
            other => Err(ServiceError::rejected(
                RejectionCode::InvalidPaymentMethod,
                format!("Unknown payment method '{}'", other),
            )),
        }
    }
}

/// Human-facing order number: two-letter prefix, second-resolution
/// timestamp digits, and a random hex suffix. Uniqueness is probabilistic;
/// the UUID order id is the uniqueness anchor.
pub fn generate_order_number() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("VN{}{:06X}", Utc::now().format("%y%m%d%H%M%S"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn missing_fields_are_named() {
        let shipping = ShippingDetails {
            first_name: "Asha".into(),
            last_name: "".into(),
            email: "asha@example.com".into(),
            phone: "0712345678".into(),
            address: "  ".into(),
            city: "Nairobi".into(),
            postal_code: "00100".into(),
        };
        assert_eq!(shipping.missing_fields(), vec!["last_name", "address"]);
    }

    #[test]
    fn complete_address_has_no_missing_fields() {
        let shipping = ShippingDetails {
            first_name: "Asha".into(),
            last_name: "Mwangi".into(),
            email: "asha@example.com".into(),
            phone: "0712345678".into(),
            address: "Riverside Drive 12".into(),
            city: "Nairobi".into(),
            postal_code: "00100".into(),
        };
        assert!(shipping.missing_fields().is_empty());
    }

    #[test]
    fn order_numbers_have_the_expected_shape() {
        let number = generate_order_number();
        assert!(number.starts_with("VN"));
        // "VN" + 12 timestamp digits + 6 hex digits
        assert_eq!(number.len(), 20);
        assert!(number[2..14].chars().all(|c| c.is_ascii_digit()));
        assert!(number[14..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ten_thousand_order_identifier_pairs_are_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let pair = (Uuid::new_v4(), generate_order_number());
            assert!(seen.insert(pair), "duplicate identifier pair generated");
        }
    }
}
