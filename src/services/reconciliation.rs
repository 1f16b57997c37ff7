use crate::{
    config::MpesaConfig,
    entities::{
        mpesa_transaction::{self, TransactionStatus},
        order::{self, PaymentMethod, PaymentStatus},
        MpesaTransaction, Order,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    mpesa::{MpesaClient, StkCallback},
    services::orders::OrderService,
};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashSet;
use sea_orm::{sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Settles pending mobile-money payments.
///
/// The gateway's asynchronous result callback is the primary signal; a
/// bounded status poll covers callbacks that never arrive. Both paths
/// funnel through the same idempotent settlement, so an order settles
/// exactly once no matter which signal lands first or how often it is
/// replayed.
#[derive(Clone)]
pub struct PaymentMonitor {
    db: Arc<DatabaseConnection>,
    orders: Arc<OrderService>,
    client: MpesaClient,
    event_sender: Arc<EventSender>,
    config: MpesaConfig,
    /// Orders already flagged for review in this process, so the sweep
    /// warns an operator once rather than every interval.
    flagged: Arc<DashSet<Uuid>>,
}

impl PaymentMonitor {
    pub fn new(
        db: Arc<DatabaseConnection>,
        orders: Arc<OrderService>,
        client: MpesaClient,
        event_sender: Arc<EventSender>,
        config: MpesaConfig,
    ) -> Self {
        Self {
            db,
            orders,
            client,
            event_sender,
            config,
            flagged: Arc::new(DashSet::new()),
        }
    }

    /// Applies a gateway result callback.
    ///
    /// A callback that matches no recorded transaction is an error for the
    /// caller to log; the HTTP handler still acknowledges it so the gateway
    /// stops redelivering. Replays of an already-settled transaction are
    /// no-ops.
    #[instrument(skip(self, callback), fields(checkout_request_id = %callback.checkout_request_id))]
    pub async fn apply_callback(&self, callback: &StkCallback) -> Result<(), ServiceError> {
        let transaction = MpesaTransaction::find()
            .filter(
                mpesa_transaction::Column::CheckoutRequestId.eq(&callback.checkout_request_id),
            )
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No transaction matches checkout request {}",
                    callback.checkout_request_id
                ))
            })?;

        self.settle(
            transaction,
            callback.result_code,
            Some(callback.result_desc.clone()),
            callback.receipt(),
        )
        .await
    }

    /// One sweep over pending transactions: poll those still inside the
    /// poll window, flag orders stuck past the pending timeout.
    #[instrument(skip(self))]
    pub async fn check_pending(&self) -> Result<(), ServiceError> {
        let pending = MpesaTransaction::find()
            .filter(mpesa_transaction::Column::Status.eq(TransactionStatus::Pending))
            .all(&*self.db)
            .await?;

        let poll_window = ChronoDuration::seconds(
            (self.config.poll_interval_secs * u64::from(self.config.poll_max_attempts)) as i64,
        );
        let now = Utc::now();

        for transaction in pending {
            if now - transaction.created_at <= poll_window {
                self.poll_transaction(&transaction).await;
            }
        }

        self.flag_stuck_orders().await
    }

    /// Runs the monitor until the process exits.
    pub async fn run(self) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        info!(
            interval_secs = self.config.poll_interval_secs,
            "Payment monitor started"
        );
        loop {
            ticker.tick().await;
            if let Err(e) = self.check_pending().await {
                warn!("Payment monitor sweep failed: {e}");
            }
        }
    }

    /// Queries the gateway for one transaction's outcome. A query failure
    /// or a still-processing answer leaves the transaction pending for the
    /// next sweep.
    async fn poll_transaction(&self, transaction: &mpesa_transaction::Model) {
        let response = match self
            .client
            .query_status(&transaction.checkout_request_id)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(
                    checkout_request_id = %transaction.checkout_request_id,
                    "Status query inconclusive: {e}"
                );
                return;
            }
        };

        if response.response_code != "0" {
            debug!(
                checkout_request_id = %transaction.checkout_request_id,
                code = %response.response_code,
                "Status query not processed by the gateway"
            );
            return;
        }

        if let Err(e) = self
            .settle(
                transaction.clone(),
                response.result_code,
                response.result_desc,
                None,
            )
            .await
        {
            warn!(
                checkout_request_id = %transaction.checkout_request_id,
                "Could not settle polled transaction: {e}"
            );
        }
    }

    /// Records a terminal gateway outcome on the transaction and pushes it
    /// through to the order. Result code 0 is success; everything else
    /// (cancellation, timeout, insufficient funds) is failure.
    async fn settle(
        &self,
        transaction: mpesa_transaction::Model,
        result_code: i32,
        result_desc: Option<String>,
        receipt: Option<String>,
    ) -> Result<(), ServiceError> {
        if transaction.status.is_terminal() {
            debug!(
                checkout_request_id = %transaction.checkout_request_id,
                "Transaction already settled, ignoring replay"
            );
            return Ok(());
        }

        let order_id = transaction.order_id;
        let outcome = if result_code == 0 {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Failed
        };

        // Conditional write: only the writer that flips the row out of
        // pending carries the outcome through to the order, so a callback
        // racing the poll loop settles once.
        let written = MpesaTransaction::update_many()
            .col_expr(mpesa_transaction::Column::Status, Expr::value(outcome))
            .col_expr(
                mpesa_transaction::Column::ResultCode,
                Expr::value(Some(result_code)),
            )
            .col_expr(mpesa_transaction::Column::ResultDesc, Expr::value(result_desc))
            .col_expr(mpesa_transaction::Column::Receipt, Expr::value(receipt))
            .col_expr(
                mpesa_transaction::Column::CompletedAt,
                Expr::value(Some(Utc::now())),
            )
            .filter(mpesa_transaction::Column::Id.eq(transaction.id))
            .filter(mpesa_transaction::Column::Status.eq(TransactionStatus::Pending))
            .exec(&*self.db)
            .await?;

        if written.rows_affected == 0 {
            debug!(
                checkout_request_id = %transaction.checkout_request_id,
                "Transaction settled concurrently, ignoring replay"
            );
            return Ok(());
        }

        let payment_status = match outcome {
            TransactionStatus::Completed => PaymentStatus::Completed,
            _ => PaymentStatus::Failed,
        };
        self.orders
            .update_payment_status(order_id, payment_status)
            .await?;

        info!(%order_id, result_code, ?outcome, "Payment settled");
        Ok(())
    }

    /// Flags mobile-money orders pending past the configured timeout for
    /// operator review, once per order.
    async fn flag_stuck_orders(&self) -> Result<(), ServiceError> {
        let cutoff = Utc::now() - ChronoDuration::minutes(self.config.pending_timeout_minutes);

        let stuck = Order::find()
            .filter(order::Column::PaymentMethod.eq(PaymentMethod::Mpesa))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Pending))
            .filter(order::Column::CreatedAt.lt(cutoff))
            .all(&*self.db)
            .await?;

        for order in stuck {
            if !self.flagged.insert(order.id) {
                continue;
            }
            warn!(
                order_id = %order.id,
                order_number = %order.order_number,
                "Payment pending past timeout, operator review required"
            );
            self.event_sender
                .send_or_log(Event::PaymentReviewRequired(order.id))
                .await;
        }
        Ok(())
    }
}
