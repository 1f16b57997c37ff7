use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One push-payment attempt per mobile-money order. Created when the STK
/// push is acknowledged and resolved when the gateway's asynchronous
/// result arrives (callback or status poll).
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "mpesa_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_id: Uuid,
    #[sea_orm(nullable)]
    pub merchant_request_id: Option<String>,
    #[sea_orm(unique)]
    pub checkout_request_id: String,
    /// Acknowledgement code from the initiation hop ("0" = prompt delivered)
    pub response_code: String,
    #[sea_orm(nullable)]
    pub customer_message: Option<String>,
    pub status: TransactionStatus,
    /// Terminal result code from the callback / status query
    #[sea_orm(nullable)]
    pub result_code: Option<i32>,
    #[sea_orm(nullable)]
    pub result_desc: Option<String>,
    #[sea_orm(nullable)]
    pub receipt: Option<String>,
    pub created_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}
