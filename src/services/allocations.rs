use chrono::{NaiveDate, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, ConnectionTrait,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::{
    entities::{
        allocation::{self, Entity as AllocationEntity},
        process_instance::Entity as ProcessInstanceEntity,
        Stage,
    },
    errors::ServiceError,
};

/// One quantity move between two process instances.
#[derive(Debug, Clone)]
pub struct MoveRequest {
    pub line_item_id: i32,
    pub source_instance_id: i32,
    pub destination_instance_id: i32,
    pub quantity: i32,
    pub manufacturer_id: Option<i32>,
    /// Restricts the source to this single row.
    pub allocation_id: Option<i32>,
    /// Decrement `quantity_cut` on the source rows by the moved amount.
    pub consume_cut_counter: bool,
}

/// Picks the rows an advancement draws from.
///
/// Rows tagged with the requested manufacturer win; otherwise untagged rows;
/// otherwise every row of the line item in the instance. Legacy data recorded
/// some stages without a manufacturer, which is why the chain exists.
/// Input order is preserved.
pub fn select_source_tier(
    rows: &[allocation::Model],
    manufacturer_id: Option<i32>,
) -> Vec<allocation::Model> {
    if let Some(manufacturer_id) = manufacturer_id {
        let tagged: Vec<_> = rows
            .iter()
            .filter(|row| row.manufacturer_id == Some(manufacturer_id))
            .cloned()
            .collect();
        if !tagged.is_empty() {
            return tagged;
        }
    }

    let untagged: Vec<_> = rows
        .iter()
        .filter(|row| row.manufacturer_id.is_none())
        .cloned()
        .collect();
    if !untagged.is_empty() {
        return untagged;
    }

    rows.to_vec()
}

/// Splits `quantity` over `rows` in order. Returns (row, amount taken) pairs,
/// or `None` when the rows do not hold enough.
pub fn plan_decrements(
    rows: &[allocation::Model],
    quantity: i32,
) -> Option<Vec<(allocation::Model, i32)>> {
    let mut remaining = quantity;
    let mut plan = Vec::new();
    for row in rows {
        if remaining == 0 {
            break;
        }
        let take = row.quantity.min(remaining);
        if take > 0 {
            plan.push((row.clone(), take));
            remaining -= take;
        }
    }
    if remaining == 0 {
        Some(plan)
    } else {
        None
    }
}

/// Ledger of quantities per (line item, process instance, manufacturer).
#[derive(Clone)]
pub struct AllocationStore {
    db: Arc<DatabaseConnection>,
}

impl AllocationStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// All rows of a line item in an instance, ordered by id.
    pub async fn rows_in_instance<C: ConnectionTrait>(
        conn: &C,
        line_item_id: i32,
        instance_id: i32,
        lock: bool,
    ) -> Result<Vec<allocation::Model>, ServiceError> {
        let mut query = AllocationEntity::find()
            .filter(allocation::Column::LineItemId.eq(line_item_id))
            .filter(allocation::Column::ProcessInstanceId.eq(instance_id))
            .order_by_asc(allocation::Column::Id);
        if lock {
            query = query.lock_exclusive();
        }
        query.all(conn).await.map_err(ServiceError::db_error)
    }

    /// Quantity that an advancement keyed by `manufacturer_id` could draw.
    pub async fn available_in<C: ConnectionTrait>(
        conn: &C,
        line_item_id: i32,
        instance_id: i32,
        manufacturer_id: Option<i32>,
    ) -> Result<i32, ServiceError> {
        let rows = Self::rows_in_instance(conn, line_item_id, instance_id, false).await?;
        Ok(select_source_tier(&rows, manufacturer_id)
            .iter()
            .map(|row| row.quantity)
            .sum())
    }

    /// Non-transactional read of [`Self::available_in`].
    #[instrument(skip(self))]
    pub async fn quantity_available(
        &self,
        line_item_id: i32,
        instance_id: i32,
        manufacturer_id: Option<i32>,
    ) -> Result<i32, ServiceError> {
        Self::available_in(&*self.db, line_item_id, instance_id, manufacturer_id).await
    }

    /// Moves quantity from the source instance to the destination instance.
    ///
    /// Must run inside the caller's transaction: source rows are locked, the
    /// availability check and the decrement happen on the same snapshot.
    /// Returns the destination row.
    pub async fn move_quantity<C: ConnectionTrait>(
        conn: &C,
        request: &MoveRequest,
    ) -> Result<allocation::Model, ServiceError> {
        let source_rows = match request.allocation_id {
            Some(allocation_id) => {
                let row = AllocationEntity::find_by_id(allocation_id)
                    .lock_exclusive()
                    .one(conn)
                    .await
                    .map_err(ServiceError::db_error)?
                    .filter(|row| {
                        row.line_item_id == request.line_item_id
                            && row.process_instance_id == request.source_instance_id
                    })
                    .ok_or_else(|| {
                        ServiceError::OrderOrLineItemNotFound(format!(
                            "allocation {} does not hold line item {} in instance {}",
                            allocation_id, request.line_item_id, request.source_instance_id
                        ))
                    })?;
                vec![row]
            }
            None => {
                let rows = Self::rows_in_instance(
                    conn,
                    request.line_item_id,
                    request.source_instance_id,
                    true,
                )
                .await?;
                select_source_tier(&rows, request.manufacturer_id)
            }
        };

        let available: i32 = source_rows.iter().map(|row| row.quantity).sum();
        let plan = plan_decrements(&source_rows, request.quantity).ok_or_else(|| {
            ServiceError::InsufficientQuantity(format!(
                "line item {} has {} available in instance {}, requested {}",
                request.line_item_id, available, request.source_instance_id, request.quantity
            ))
        })?;

        let now = Utc::now();
        for (row, take) in plan {
            let remaining = row.quantity - take;
            if remaining == 0 {
                AllocationEntity::delete_by_id(row.id)
                    .exec(conn)
                    .await
                    .map_err(ServiceError::db_error)?;
                debug!(allocation_id = row.id, "Source allocation exhausted and removed");
                continue;
            }

            let quantity_cut = if request.consume_cut_counter {
                (row.quantity_cut - take).max(0)
            } else {
                row.quantity_cut
            };
            let mut active: allocation::ActiveModel = row.into();
            active.quantity = Set(remaining);
            active.quantity_cut = Set(quantity_cut);
            active.updated_at = Set(now);
            active.update(conn).await.map_err(ServiceError::db_error)?;
        }

        Self::credit_destination(conn, request, now.date_naive()).await
    }

    async fn credit_destination<C: ConnectionTrait>(
        conn: &C,
        request: &MoveRequest,
        today: NaiveDate,
    ) -> Result<allocation::Model, ServiceError> {
        let manufacturer_filter = match request.manufacturer_id {
            Some(id) => allocation::Column::ManufacturerId.eq(id),
            None => allocation::Column::ManufacturerId.is_null(),
        };
        let existing = AllocationEntity::find()
            .filter(allocation::Column::LineItemId.eq(request.line_item_id))
            .filter(allocation::Column::ProcessInstanceId.eq(request.destination_instance_id))
            .filter(manufacturer_filter)
            .order_by_asc(allocation::Column::Id)
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let now = Utc::now();
        match existing {
            Some(row) => {
                let quantity = row.quantity + request.quantity;
                let mut active: allocation::ActiveModel = row.into();
                active.quantity = Set(quantity);
                active.updated_at = Set(now);
                active.update(conn).await.map_err(ServiceError::db_error)
            }
            None => allocation::ActiveModel {
                id: NotSet,
                line_item_id: Set(request.line_item_id),
                process_instance_id: Set(request.destination_instance_id),
                quantity: Set(request.quantity),
                manufacturer_id: Set(request.manufacturer_id),
                quantity_cut: Set(0),
                received_at: Set(request.manufacturer_id.map(|_| today)),
                delivered_at: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(conn)
            .await
            .map_err(ServiceError::db_error),
        }
    }

    /// Places a fresh quantity into an instance (intake only).
    pub async fn place<C: ConnectionTrait>(
        conn: &C,
        line_item_id: i32,
        instance_id: i32,
        quantity: i32,
    ) -> Result<allocation::Model, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "allocation quantity must be positive, got {}",
                quantity
            )));
        }
        let now = Utc::now();
        allocation::ActiveModel {
            id: NotSet,
            line_item_id: Set(line_item_id),
            process_instance_id: Set(instance_id),
            quantity: Set(quantity),
            manufacturer_id: Set(None),
            quantity_cut: Set(0),
            received_at: Set(None),
            delivered_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)
    }

    /// Records units cut on a cutting-stage allocation, capped at its quantity.
    #[instrument(skip(self))]
    pub async fn record_cut(
        &self,
        allocation_id: i32,
        quantity: i32,
    ) -> Result<allocation::Model, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "cut quantity must be positive, got {}",
                quantity
            )));
        }

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let row = AllocationEntity::find_by_id(allocation_id)
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Allocation {} not found", allocation_id))
            })?;

        let instance = ProcessInstanceEntity::find_by_id(row.process_instance_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Process instance {} not found",
                    row.process_instance_id
                ))
            })?;
        if instance.stage != Stage::Cutting {
            return Err(ServiceError::InvalidOperation(format!(
                "allocation {} is in {}, cut counts are only kept for {}",
                allocation_id,
                instance.stage,
                Stage::Cutting
            )));
        }

        let quantity_cut = (row.quantity_cut + quantity).min(row.quantity);
        let mut active: allocation::ActiveModel = row.into();
        active.quantity_cut = Set(quantity_cut);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("garment_flow.allocations.cut_recorded", 1);
        info!(allocation_id, quantity_cut, "Cut quantity recorded");
        Ok(updated)
    }

    /// Stamps the date a manufacturer handed its quantity back.
    #[instrument(skip(self))]
    pub async fn record_manufacturer_return(
        &self,
        allocation_id: i32,
        returned_on: NaiveDate,
    ) -> Result<allocation::Model, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let row = AllocationEntity::find_by_id(allocation_id)
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Allocation {} not found", allocation_id))
            })?;
        if row.manufacturer_id.is_none() {
            return Err(ServiceError::InvalidOperation(format!(
                "allocation {} is not held by a manufacturer",
                allocation_id
            )));
        }

        let mut active: allocation::ActiveModel = row.into();
        active.delivered_at = Set(Some(returned_on));
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(allocation_id, %returned_on, "Manufacturer return recorded");
        Ok(updated)
    }
}
