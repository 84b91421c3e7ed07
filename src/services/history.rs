use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::instrument;

use crate::{
    dto::production::{
        AuditEventKind, AuditLogEntry, LineItemView, ParticipationView, StageHistoryEntry,
        StageItemView, StageQuantity,
    },
    entities::{
        allocation::{self, Entity as AllocationEntity},
        employee_participation::{self, Entity as ParticipationEntity},
        line_item::{self, Entity as LineItemEntity},
        manufacturer::{self, Entity as ManufacturerEntity},
        order::{self, Entity as OrderEntity},
        process_instance::{self, Entity as ProcessInstanceEntity, InstanceStatus},
        product::{self, Entity as ProductEntity},
        Stage,
    },
    errors::ServiceError,
    services::{collaborators::UNKNOWN_PRODUCT_NAME, process_instances::ProcessInstanceManager},
};

/// Decodes a frozen snapshot; undecodable text is kept verbatim.
fn decode_snapshot(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Read-side views over the production ledger. No method mutates.
#[derive(Clone)]
pub struct HistoryReader {
    db: Arc<DatabaseConnection>,
}

impl HistoryReader {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn require_order(&self, order_id: i32) -> Result<order::Model, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::OrderOrLineItemNotFound(format!("order {} not found", order_id))
            })
    }

    async fn instances(&self, order_id: i32) -> Result<Vec<process_instance::Model>, ServiceError> {
        ProcessInstanceEntity::find()
            .filter(process_instance::Column::OrderId.eq(order_id))
            .order_by_asc(process_instance::Column::StartedAt)
            .order_by_asc(process_instance::Column::Id)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn participations(
        &self,
        instance_ids: Vec<i32>,
    ) -> Result<Vec<employee_participation::Model>, ServiceError> {
        ParticipationEntity::find()
            .filter(employee_participation::Column::ProcessInstanceId.is_in(instance_ids))
            .order_by_asc(employee_participation::Column::CreatedAt)
            .order_by_asc(employee_participation::Column::Id)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn product_names(
        &self,
        product_ids: Vec<i32>,
    ) -> Result<HashMap<i32, String>, ServiceError> {
        Ok(ProductEntity::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect())
    }

    /// Per instance: owner, timestamps, notes and participations in time order.
    #[instrument(skip(self))]
    pub async fn stage_history(
        &self,
        order_id: i32,
    ) -> Result<Vec<StageHistoryEntry>, ServiceError> {
        self.require_order(order_id).await?;
        let instances = self.instances(order_id).await?;

        let mut by_instance: HashMap<i32, Vec<ParticipationView>> = HashMap::new();
        for record in self
            .participations(instances.iter().map(|i| i.id).collect())
            .await?
        {
            by_instance
                .entry(record.process_instance_id)
                .or_default()
                .push(ParticipationView {
                    employee_id: record.employee_id,
                    recorded_at: record.created_at,
                    snapshot: decode_snapshot(&record.snapshot),
                });
        }

        Ok(instances
            .into_iter()
            .map(|instance| StageHistoryEntry {
                process_instance_id: instance.id,
                stage: instance.stage,
                stage_name: instance.stage.display_name(),
                status: instance.status,
                responsible_employee: instance.employee_id,
                started_at: instance.started_at,
                ended_at: instance.ended_at,
                notes: instance.notes,
                participations: by_instance.remove(&instance.id).unwrap_or_default(),
            })
            .collect())
    }

    /// Chronological merge of instance lifecycle events and participations.
    #[instrument(skip(self))]
    pub async fn audit_log(&self, order_id: i32) -> Result<Vec<AuditLogEntry>, ServiceError> {
        self.require_order(order_id).await?;
        let instances = self.instances(order_id).await?;
        let participations = self
            .participations(instances.iter().map(|i| i.id).collect())
            .await?;

        let mut entries = Vec::with_capacity(instances.len() * 2 + participations.len());
        let stages: HashMap<i32, Stage> = instances.iter().map(|i| (i.id, i.stage)).collect();

        for instance in &instances {
            entries.push(AuditLogEntry {
                at: instance.started_at,
                kind: AuditEventKind::InstanceOpened,
                process_instance_id: instance.id,
                stage: instance.stage,
                stage_name: instance.stage.display_name(),
                employee_id: instance.employee_id.clone(),
                details: instance.notes.clone().map(serde_json::Value::String),
            });
            let closing_kind = match instance.status {
                InstanceStatus::Open => None,
                InstanceStatus::Completed => Some(AuditEventKind::InstanceCompleted),
                InstanceStatus::Cancelled => Some(AuditEventKind::InstanceCancelled),
            };
            if let (Some(kind), Some(ended_at)) = (closing_kind, instance.ended_at) {
                entries.push(AuditLogEntry {
                    at: ended_at,
                    kind,
                    process_instance_id: instance.id,
                    stage: instance.stage,
                    stage_name: instance.stage.display_name(),
                    employee_id: instance.employee_id.clone(),
                    details: None,
                });
            }
        }

        for record in participations {
            let Some(stage) = stages.get(&record.process_instance_id).copied() else {
                continue;
            };
            entries.push(AuditLogEntry {
                at: record.created_at,
                kind: AuditEventKind::Participation,
                process_instance_id: record.process_instance_id,
                stage,
                stage_name: stage.display_name(),
                employee_id: record.employee_id,
                details: Some(decode_snapshot(&record.snapshot)),
            });
        }

        // Stable: equal timestamps keep opened, participation, closed order per instance.
        entries.sort_by_key(|entry| {
            let rank = match entry.kind {
                AuditEventKind::InstanceOpened => 0,
                AuditEventKind::Participation => 1,
                AuditEventKind::InstanceCompleted | AuditEventKind::InstanceCancelled => 2,
            };
            (entry.at, rank)
        });
        Ok(entries)
    }

    /// Each line item with its quantity per Open stage.
    #[instrument(skip(self))]
    pub async fn order_line_items(&self, order_id: i32) -> Result<Vec<LineItemView>, ServiceError> {
        self.require_order(order_id).await?;

        let line_items = LineItemEntity::find()
            .filter(line_item::Column::OrderId.eq(order_id))
            .order_by_asc(line_item::Column::Id)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        let names = self
            .product_names(line_items.iter().map(|l| l.product_id).collect())
            .await?;

        let open_instances: HashMap<i32, Stage> = ProcessInstanceEntity::find()
            .filter(process_instance::Column::OrderId.eq(order_id))
            .filter(process_instance::Column::Status.eq(InstanceStatus::Open))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|i| (i.id, i.stage))
            .collect();

        let rows = AllocationEntity::find()
            .filter(
                allocation::Column::ProcessInstanceId
                    .is_in(open_instances.keys().copied().collect::<Vec<_>>()),
            )
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut distribution: HashMap<i32, BTreeMap<Stage, i32>> = HashMap::new();
        for row in rows {
            if let Some(stage) = open_instances.get(&row.process_instance_id) {
                *distribution
                    .entry(row.line_item_id)
                    .or_default()
                    .entry(*stage)
                    .or_insert(0) += row.quantity;
            }
        }

        Ok(line_items
            .into_iter()
            .map(|line| LineItemView {
                line_item_id: line.id,
                product_id: line.product_id,
                product_name: names
                    .get(&line.product_id)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_PRODUCT_NAME.to_string()),
                total_quantity: line.total_quantity,
                delivered_quantity: line.delivered_quantity,
                delivery_state: line.delivery_state,
                distribution: distribution
                    .remove(&line.id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(stage, quantity)| StageQuantity {
                        stage,
                        stage_name: stage.display_name(),
                        quantity,
                    })
                    .collect(),
            })
            .collect())
    }

    /// Allocations in the Open instance of `stage`, with product and manufacturer names.
    #[instrument(skip(self))]
    pub async fn items_in_stage(
        &self,
        order_id: i32,
        stage: Stage,
    ) -> Result<Vec<StageItemView>, ServiceError> {
        self.require_order(order_id).await?;
        let Some(instance) =
            ProcessInstanceManager::find_open(&*self.db, order_id, stage, false).await?
        else {
            return Ok(Vec::new());
        };

        let rows = AllocationEntity::find()
            .filter(allocation::Column::ProcessInstanceId.eq(instance.id))
            .order_by_asc(allocation::Column::LineItemId)
            .order_by_asc(allocation::Column::Id)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let line_products: HashMap<i32, i32> = LineItemEntity::find()
            .filter(line_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|l| (l.id, l.product_id))
            .collect();
        let names = self
            .product_names(line_products.values().copied().collect())
            .await?;
        let manufacturers: HashMap<i32, String> = ManufacturerEntity::find()
            .filter(
                manufacturer::Column::Id
                    .is_in(rows.iter().filter_map(|r| r.manufacturer_id).collect::<Vec<_>>()),
            )
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|m| (m.id, m.name))
            .collect();

        Ok(rows
            .into_iter()
            .map(|row| StageItemView {
                allocation_id: row.id,
                line_item_id: row.line_item_id,
                product_name: line_products
                    .get(&row.line_item_id)
                    .and_then(|product_id| names.get(product_id))
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_PRODUCT_NAME.to_string()),
                quantity: row.quantity,
                manufacturer_id: row.manufacturer_id,
                manufacturer_name: row
                    .manufacturer_id
                    .and_then(|id| manufacturers.get(&id).cloned()),
                quantity_cut: row.quantity_cut,
                received_at: row.received_at,
                delivered_at: row.delivered_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_decode_or_fall_back_to_raw_text() {
        let decoded = decode_snapshot(r#"{"employee_id":"emp1","items":[]}"#);
        assert_eq!(decoded["employee_id"], "emp1");

        let raw = decode_snapshot("not json");
        assert_eq!(raw, serde_json::Value::String("not json".into()));
    }
}
