use crate::{
    errors::{RejectionCode, ServiceError},
    mpesa,
    services::{
        carts::CartService,
        orders::{CreateOrderInput, OrderConfirmation, OrderLineInput, PaymentIntentInput, ShippingDetails},
        orders::OrderService,
        payments::{PaymentOutcome, PaymentService},
    },
};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

/// Where a checkout session currently sits. Transitions only move one step
/// at a time; `back` walks the same edges in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStep {
    Shipping,
    Payment,
    Confirmation,
}

/// Per-session checkout state, held in memory. Entered data survives back
/// navigation and failed submissions; only a confirmed order retires the
/// session.
#[derive(Debug, Clone)]
struct CheckoutSession {
    step: CheckoutStep,
    shipping: Option<ShippingDetails>,
    payment: Option<PaymentIntentInput>,
    submitting: bool,
    last_error: Option<String>,
    order: Option<OrderConfirmation>,
    payment_outcome: Option<PaymentOutcome>,
}

impl CheckoutSession {
    fn new() -> Self {
        Self {
            step: CheckoutStep::Shipping,
            shipping: None,
            payment: None,
            submitting: false,
            last_error: None,
            order: None,
            payment_outcome: None,
        }
    }
}

/// Snapshot of a checkout session returned to the client.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutView {
    pub session_id: String,
    pub step: CheckoutStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping: Option<ShippingDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderConfirmation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentOutcome>,
}

/// Drives a shopper through shipping, payment, and confirmation.
///
/// The session store is in-process; a restart drops in-flight checkouts
/// but never placed orders, which live in the database.
#[derive(Clone)]
pub struct CheckoutService {
    sessions: Arc<DashMap<String, CheckoutSession>>,
    carts: Arc<CartService>,
    orders: Arc<OrderService>,
    payments: Arc<PaymentService>,
}

impl CheckoutService {
    pub fn new(
        carts: Arc<CartService>,
        orders: Arc<OrderService>,
        payments: Arc<PaymentService>,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            carts,
            orders,
            payments,
        }
    }

    /// Opens (or resumes) a checkout for a session. An empty cart cannot
    /// enter checkout.
    #[instrument(skip(self))]
    pub async fn begin(&self, session_id: &str) -> Result<CheckoutView, ServiceError> {
        let cart = self.carts.load(session_id).await;
        if cart.is_empty() {
            return Err(ServiceError::rejected(
                RejectionCode::EmptyCart,
                "Cannot start checkout with an empty cart",
            ));
        }

        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(CheckoutSession::new);
        Ok(self.view(session_id)?)
    }

    /// Records shipping details and advances to the payment step.
    #[instrument(skip(self, shipping))]
    pub fn submit_shipping(
        &self,
        session_id: &str,
        shipping: ShippingDetails,
    ) -> Result<CheckoutView, ServiceError> {
        validate_shipping(&shipping, self.country_code())?;

        let mut session = self.session_mut(session_id)?;
        if session.order.is_some() {
            return Err(ServiceError::InvalidOperation(
                "Checkout is already confirmed".to_string(),
            ));
        }
        session.shipping = Some(shipping);
        session.step = CheckoutStep::Payment;
        session.last_error = None;
        drop(session);

        Ok(self.view(session_id)?)
    }

    /// Records the payment intent and advances to confirmation. The intent
    /// must resolve to a known method, with a usable mobile-money number
    /// where the method needs one; submit re-resolves it against the cart.
    #[instrument(skip(self, payment))]
    pub fn submit_payment(
        &self,
        session_id: &str,
        payment: PaymentIntentInput,
    ) -> Result<CheckoutView, ServiceError> {
        self.orders.resolve_payment(&payment)?;

        let mut session = self.session_mut(session_id)?;
        if session.order.is_some() {
            return Err(ServiceError::InvalidOperation(
                "Checkout is already confirmed".to_string(),
            ));
        }
        if session.shipping.is_none() {
            return Err(ServiceError::InvalidOperation(
                "Shipping details must be submitted before payment".to_string(),
            ));
        }
        session.payment = Some(payment);
        session.step = CheckoutStep::Confirmation;
        session.last_error = None;
        drop(session);

        Ok(self.view(session_id)?)
    }

    /// Steps backwards without losing anything already entered.
    #[instrument(skip(self))]
    pub fn back(&self, session_id: &str) -> Result<CheckoutView, ServiceError> {
        let mut session = self.session_mut(session_id)?;
        if session.order.is_some() {
            return Err(ServiceError::InvalidOperation(
                "Checkout is already confirmed".to_string(),
            ));
        }
        session.step = match session.step {
            CheckoutStep::Shipping => CheckoutStep::Shipping,
            CheckoutStep::Payment => CheckoutStep::Shipping,
            CheckoutStep::Confirmation => CheckoutStep::Payment,
        };
        drop(session);

        Ok(self.view(session_id)?)
    }

    /// Places the order from the session's cart and entered details, then
    /// kicks off payment.
    ///
    /// Only one submission per session may be in flight; a concurrent
    /// attempt gets a typed rejection instead of a second order. A failed
    /// submission drops back to the payment step with the failure
    /// recorded, ready for retry. A confirmed one clears the cart and is
    /// idempotent thereafter.
    #[instrument(skip(self))]
    pub async fn submit(
        &self,
        session_id: &str,
        placed_by: &str,
    ) -> Result<CheckoutView, ServiceError> {
        let (shipping, payment) = {
            let mut session = self.session_mut(session_id)?;
            if session.order.is_some() {
                return Ok(Self::view_of(session_id, &session));
            }
            if session.submitting {
                return Err(ServiceError::rejected(
                    RejectionCode::SubmissionInFlight,
                    "A submission for this session is already in progress",
                ));
            }
            let shipping = session.shipping.clone().ok_or_else(|| {
                ServiceError::InvalidOperation(
                    "Shipping details must be submitted before placing the order".to_string(),
                )
            })?;
            let payment = session.payment.clone().ok_or_else(|| {
                ServiceError::InvalidOperation(
                    "A payment method must be chosen before placing the order".to_string(),
                )
            })?;
            session.submitting = true;
            (shipping, payment)
        };

        let result = self
            .place_order(session_id, placed_by, shipping, payment)
            .await;

        let mut session = self.session_mut(session_id)?;
        session.submitting = false;
        match result {
            Ok((confirmation, outcome)) => {
                session.step = CheckoutStep::Confirmation;
                session.last_error = None;
                session.order = Some(confirmation);
                session.payment_outcome = Some(outcome);
                let view = Self::view_of(session_id, &session);
                drop(session);

                if let Err(e) = self.carts.clear(session_id).await {
                    warn!("Could not clear cart after checkout for {session_id}: {e}");
                }
                info!("Checkout confirmed for session {session_id}");
                Ok(view)
            }
            Err(e) => {
                // Failed submission drops back to the payment step with the
                // failure recorded; everything entered stays for the retry.
                session.step = CheckoutStep::Payment;
                session.last_error = Some(e.response_message());
                Err(e)
            }
        }
    }

    async fn place_order(
        &self,
        session_id: &str,
        placed_by: &str,
        shipping: ShippingDetails,
        payment: PaymentIntentInput,
    ) -> Result<(OrderConfirmation, PaymentOutcome), ServiceError> {
        let cart = self.carts.load(session_id).await;
        if cart.is_empty() {
            return Err(ServiceError::rejected(
                RejectionCode::EmptyCart,
                "The cart emptied before the order was placed",
            ));
        }

        let lines = cart
            .lines
            .iter()
            .map(|l| OrderLineInput {
                product_id: l.product_id,
                quantity: l.quantity,
            })
            .collect();

        let confirmation = self
            .orders
            .create_order(CreateOrderInput {
                placed_by: placed_by.to_string(),
                lines,
                shipping,
                payment,
                declared_total: cart.total,
            })
            .await?;

        let order = self.orders.get_order(confirmation.order_id).await?;
        let outcome = self.payments.execute(&order).await?;

        Ok((confirmation, outcome))
    }

    /// Current state of a session, if one exists.
    pub fn view(&self, session_id: &str) -> Result<CheckoutView, ServiceError> {
        let session = self.sessions.get(session_id).ok_or_else(|| {
            ServiceError::NotFound(format!("No checkout in progress for session {session_id}"))
        })?;
        Ok(Self::view_of(session_id, &session))
    }

    fn session_mut(
        &self,
        session_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, CheckoutSession>, ServiceError> {
        self.sessions.get_mut(session_id).ok_or_else(|| {
            ServiceError::NotFound(format!("No checkout in progress for session {session_id}"))
        })
    }

    fn country_code(&self) -> &str {
        &self.payments.client().config().country_code
    }

    fn view_of(session_id: &str, session: &CheckoutSession) -> CheckoutView {
        CheckoutView {
            session_id: session_id.to_string(),
            step: session.step,
            shipping: session.shipping.clone(),
            payment_method: session.payment.as_ref().map(|p| p.method.clone()),
            last_error: session.last_error.clone(),
            order: session.order.clone(),
            payment: session.payment_outcome.clone(),
        }
    }
}

/// Field-level shipping validation: every field present, the email shaped
/// like an email, and the phone a normalizable local mobile number.
fn validate_shipping(shipping: &ShippingDetails, country_code: &str) -> Result<(), ServiceError> {
    let missing = shipping.missing_fields();
    if !missing.is_empty() {
        return Err(ServiceError::rejected_fields(
            RejectionCode::IncompleteAddress,
            format!("Missing shipping fields: {}", missing.join(", ")),
            missing,
        ));
    }
    if !EMAIL_RE.is_match(shipping.email.trim()) {
        return Err(ServiceError::ValidationError(format!(
            "'{}' is not a valid email address",
            shipping.email
        )));
    }
    if mpesa::normalize_msisdn(country_code, &shipping.phone).is_err() {
        return Err(ServiceError::ValidationError(format!(
            "'{}' is not a valid mobile number",
            shipping.phone
        )));
    }
    Ok(())
}
