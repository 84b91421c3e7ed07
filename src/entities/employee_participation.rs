use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// First advancement an employee performed out of a process instance.
///
/// `snapshot` is serialized JSON frozen at write time; it is never updated.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "employee_participations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub process_instance_id: i32,
    pub employee_id: String,
    #[sea_orm(column_type = "Text")]
    pub snapshot: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::process_instance::Entity",
        from = "Column::ProcessInstanceId",
        to = "super::process_instance::Column::Id"
    )]
    ProcessInstance,
}

impl Related<super::process_instance::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProcessInstance.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
