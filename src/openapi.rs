use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Cellar API",
        description = "Wine-shop checkout and mobile-money payment service"
    ),
    paths(
        crate::handlers::carts::get_cart,
        crate::handlers::carts::add_item,
        crate::handlers::carts::set_quantity,
        crate::handlers::carts::remove_item,
        crate::handlers::carts::clear_cart,
        crate::handlers::checkout::begin,
        crate::handlers::checkout::view,
        crate::handlers::checkout::submit_shipping,
        crate::handlers::checkout::submit_payment,
        crate::handlers::checkout::back,
        crate::handlers::checkout::submit,
        crate::handlers::orders::create_order,
        crate::handlers::orders::get_order,
        crate::handlers::orders::get_payment_status,
        crate::handlers::orders::update_payment_status,
        crate::handlers::payments::initiate,
        crate::handlers::payments::callback,
        crate::handlers::payments::payment_status,
    ),
    components(schemas(
        crate::errors::ErrorResponse,
        crate::errors::RejectionCode,
        crate::entities::order::OrderStatus,
        crate::entities::order::PaymentStatus,
        crate::entities::order::PaymentMethod,
        crate::services::carts::CartView,
        crate::services::carts::CartLineView,
        crate::services::checkout::CheckoutStep,
        crate::services::checkout::CheckoutView,
        crate::services::orders::ShippingDetails,
        crate::services::orders::PaymentIntentInput,
        crate::services::orders::OrderLineInput,
        crate::services::orders::OrderConfirmation,
        crate::services::payments::PaymentOutcome,
        crate::services::payments::PaymentView,
        crate::mpesa::StkCallbackEnvelope,
        crate::mpesa::StkCallbackBody,
        crate::mpesa::StkCallback,
        crate::mpesa::CallbackMetadata,
        crate::mpesa::CallbackItem,
        crate::handlers::carts::AddItemRequest,
        crate::handlers::carts::SetQuantityRequest,
        crate::handlers::orders::CreateOrderRequest,
        crate::handlers::orders::UpdatePaymentStatusRequest,
        crate::handlers::payments::InitiatePaymentRequest,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "carts", description = "Cart ledger"),
        (name = "checkout", description = "Checkout flow"),
        (name = "orders", description = "Order management"),
        (name = "payments", description = "Mobile-money payments"),
    )
)]
pub struct ApiDoc;
