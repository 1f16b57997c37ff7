use crate::{
    entities::{
        mpesa_transaction::{self, TransactionStatus},
        order::{self, PaymentMethod, PaymentStatus},
        MpesaTransaction,
    },
    errors::{RejectionCode, ServiceError},
    events::{Event, EventSender},
    mpesa::MpesaClient,
    services::orders::OrderService,
};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// Outcome of executing payment for a freshly created order.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// Cash settles at handoff; the order was already created completed.
    CashSettled,
    /// The payment prompt reached the payer's device; the terminal
    /// outcome arrives later through the monitor.
    MpesaInitiated {
        checkout_request_id: String,
        customer_message: String,
    },
}

/// Current payment state of an order, for status read-backs.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PaymentView {
    pub order_id: Uuid,
    pub payment_status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
}

/// Executes payment for an order, branching on method. The mobile-money
/// path is a blocking two-hop exchange with the gateway; cash needs
/// nothing.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    orders: Arc<OrderService>,
    client: MpesaClient,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        orders: Arc<OrderService>,
        client: MpesaClient,
    ) -> Self {
        Self {
            db,
            event_sender,
            orders,
            client,
        }
    }

    pub fn client(&self) -> &MpesaClient {
        &self.client
    }

    /// Executes payment for an order right after creation.
    pub async fn execute(&self, order: &order::Model) -> Result<PaymentOutcome, ServiceError> {
        match order.payment_method {
            PaymentMethod::Cash => Ok(PaymentOutcome::CashSettled),
            PaymentMethod::Mpesa => self.initiate(order, None).await,
        }
    }

    /// Initiates a mobile-money push payment for an order.
    ///
    /// Exactly one gateway transaction exists per order: re-initiating
    /// while one is pending returns the existing prompt instead of pushing
    /// a second one. A declined initiation records nothing, leaving retry
    /// open.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn initiate(
        &self,
        order: &order::Model,
        phone_override: Option<String>,
    ) -> Result<PaymentOutcome, ServiceError> {
        if order.payment_method != PaymentMethod::Mpesa {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is not a mobile-money order",
                order.id
            )));
        }
        if order.payment_status.is_terminal() {
            return Err(ServiceError::InvalidOperation(format!(
                "Payment for order {} is already settled",
                order.id
            )));
        }

        if let Some(existing) = self.transaction_for_order(order.id).await? {
            if existing.status == TransactionStatus::Pending {
                info!(order_id = %order.id, "Reusing in-flight gateway transaction");
                return Ok(PaymentOutcome::MpesaInitiated {
                    checkout_request_id: existing.checkout_request_id,
                    customer_message: existing.customer_message.unwrap_or_default(),
                });
            }
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} already has a settled gateway transaction",
                order.id
            )));
        }

        let raw_phone = phone_override
            .or_else(|| order.mpesa_phone.clone())
            .ok_or_else(|| {
                ServiceError::rejected(
                    RejectionCode::MissingMobileMoneyPhone,
                    "Order has no mobile-money phone number",
                )
            })?;
        let msisdn = self.client.normalize(&raw_phone)?;

        // The gateway takes whole currency units only.
        if order.total.fract() != rust_decimal::Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "Order total {} is not a whole-unit amount",
                order.total
            )));
        }
        let amount = order.total.to_u64().ok_or_else(|| {
            ServiceError::ValidationError(format!("Order total {} is not payable", order.total))
        })?;

        let reference = order.id.to_string();
        let description = format!("Wine order {}", order.order_number);
        let ack = self
            .client
            .stk_push(&msisdn, amount, &reference, &description)
            .await?;

        mpesa_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            merchant_request_id: Set(Some(ack.merchant_request_id.clone())),
            checkout_request_id: Set(ack.checkout_request_id.clone()),
            response_code: Set(ack.response_code.clone()),
            customer_message: Set(Some(ack.customer_message.clone())),
            status: Set(TransactionStatus::Pending),
            result_code: Set(None),
            result_desc: Set(None),
            receipt: Set(None),
            created_at: Set(Utc::now()),
            completed_at: Set(None),
        }
        .insert(&*self.db)
        .await?;

        self.event_sender
            .send_or_log(Event::PaymentInitiated {
                order_id: order.id,
                checkout_request_id: ack.checkout_request_id.clone(),
            })
            .await;

        Ok(PaymentOutcome::MpesaInitiated {
            checkout_request_id: ack.checkout_request_id,
            customer_message: ack.customer_message,
        })
    }

    /// Convenience wrapper for the HTTP surface: initiate by order id.
    pub async fn initiate_for_order(
        &self,
        order_id: Uuid,
        phone_override: Option<String>,
    ) -> Result<PaymentOutcome, ServiceError> {
        let order = self.orders.get_order(order_id).await?;
        self.initiate(&order, phone_override).await
    }

    /// Payment status read-back for an order.
    pub async fn status(&self, order_id: Uuid) -> Result<PaymentView, ServiceError> {
        let order = self.orders.get_order(order_id).await?;
        let transaction = self.transaction_for_order(order_id).await?;

        Ok(PaymentView {
            order_id,
            payment_status: order.payment_status,
            checkout_request_id: transaction.as_ref().map(|t| t.checkout_request_id.clone()),
            customer_message: transaction.as_ref().and_then(|t| t.customer_message.clone()),
            receipt: transaction.and_then(|t| t.receipt),
        })
    }

    pub(crate) async fn transaction_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<mpesa_transaction::Model>, ServiceError> {
        Ok(MpesaTransaction::find()
            .filter(mpesa_transaction::Column::OrderId.eq(order_id))
            .one(&*self.db)
            .await?)
    }
}
