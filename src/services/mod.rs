pub mod carts;
pub mod checkout;
pub mod orders;
pub mod payments;
pub mod reconciliation;

pub use carts::CartService;
pub use checkout::CheckoutService;
pub use orders::OrderService;
pub use payments::PaymentService;
pub use reconciliation::PaymentMonitor;
