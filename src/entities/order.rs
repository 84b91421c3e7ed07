use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Production order created at intake.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub responsible_employee: String,
    pub payment_type: String,
    pub invoice_proof_url: Option<String>,
    pub notes: Option<String>,
    pub priority: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::line_item::Entity")]
    LineItems,
    #[sea_orm(has_many = "super::process_instance::Entity")]
    ProcessInstances,
}

impl Related<super::line_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LineItems.def()
    }
}

impl Related<super::process_instance::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProcessInstances.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
