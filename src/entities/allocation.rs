use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Ledger row: how much of a line item sits in a process instance,
/// optionally held by a manufacturer. `quantity` is always positive;
/// rows that reach zero are deleted.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "allocations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub line_item_id: i32,
    pub process_instance_id: i32,
    pub quantity: i32,
    pub manufacturer_id: Option<i32>,
    /// Units already cut; only meaningful on cutting-stage rows.
    pub quantity_cut: i32,
    pub received_at: Option<NaiveDate>,
    pub delivered_at: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::line_item::Entity",
        from = "Column::LineItemId",
        to = "super::line_item::Column::Id"
    )]
    LineItem,
    #[sea_orm(
        belongs_to = "super::process_instance::Entity",
        from = "Column::ProcessInstanceId",
        to = "super::process_instance::Column::Id"
    )]
    ProcessInstance,
    #[sea_orm(
        belongs_to = "super::manufacturer::Entity",
        from = "Column::ManufacturerId",
        to = "super::manufacturer::Column::Id"
    )]
    Manufacturer,
}

impl Related<super::line_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LineItem.def()
    }
}

impl Related<super::process_instance::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProcessInstance.def()
    }
}

impl Related<super::manufacturer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Manufacturer.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
