pub mod carts;
pub mod checkout;
pub mod common;
pub mod orders;
pub mod payments;

use crate::AppState;
use axum::Router;

/// All v1 API routes, to be nested under `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(carts::routes())
        .merge(checkout::routes())
        .merge(orders::routes())
        .merge(payments::routes())
}
