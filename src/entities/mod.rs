pub mod cart_line;
pub mod mpesa_transaction;
pub mod order;
pub mod order_item;
pub mod product;

pub use cart_line::Entity as CartLine;
pub use mpesa_transaction::Entity as MpesaTransaction;
pub use order::Entity as Order;
pub use order_item::Entity as OrderItem;
pub use product::Entity as Product;
