use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, ConnectionTrait,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::{
    entities::{
        allocation::{self, Entity as AllocationEntity},
        process_instance::{self, Entity as ProcessInstanceEntity, InstanceStatus},
        Stage,
    },
    errors::ServiceError,
};

const NOTE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Appends `addition` to `existing` behind a `[YYYY-MM-DD HH:MM]` prefix.
/// Blank additions leave the notes untouched.
pub fn merge_notes(
    existing: Option<&str>,
    addition: Option<&str>,
    at: DateTime<Utc>,
) -> Option<String> {
    let addition = match addition.map(str::trim) {
        Some(text) if !text.is_empty() => text,
        _ => return existing.map(str::to_string),
    };
    let stamped = format!("[{}] {}", at.format(NOTE_TIMESTAMP_FORMAT), addition);
    match existing {
        Some(previous) if !previous.is_empty() => Some(format!("{}\n{}", previous, stamped)),
        _ => Some(stamped),
    }
}

#[derive(Debug, Clone)]
pub struct OpenedInstance {
    pub instance: process_instance::Model,
    pub created: bool,
}

/// Opens, reuses and closes the per-(order, stage) process instances.
///
/// Every operation runs on the caller's connection so it joins the caller's
/// transaction.
pub struct ProcessInstanceManager;

impl ProcessInstanceManager {
    pub async fn find_open<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
        stage: Stage,
        lock: bool,
    ) -> Result<Option<process_instance::Model>, ServiceError> {
        let mut query = ProcessInstanceEntity::find()
            .filter(process_instance::Column::OrderId.eq(order_id))
            .filter(process_instance::Column::Stage.eq(stage))
            .filter(process_instance::Column::Status.eq(InstanceStatus::Open));
        if lock {
            query = query.lock_exclusive();
        }
        query.one(conn).await.map_err(ServiceError::db_error)
    }

    /// Returns the Open instance for (order, stage), creating it when absent.
    ///
    /// A reused instance keeps its owner; only `notes` is merged. A concurrent
    /// creator trips the partial unique index and surfaces as a retryable conflict.
    pub async fn open_or_reuse<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
        stage: Stage,
        employee_id: &str,
        notes: Option<&str>,
    ) -> Result<OpenedInstance, ServiceError> {
        let now = Utc::now();
        if let Some(existing) = Self::find_open(conn, order_id, stage, true).await? {
            let merged = merge_notes(existing.notes.as_deref(), notes, now);
            if merged == existing.notes {
                return Ok(OpenedInstance {
                    instance: existing,
                    created: false,
                });
            }
            let mut active: process_instance::ActiveModel = existing.into();
            active.notes = Set(merged);
            let instance = active.update(conn).await.map_err(ServiceError::db_error)?;
            return Ok(OpenedInstance {
                instance,
                created: false,
            });
        }

        let initial_notes = notes
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        let instance = process_instance::ActiveModel {
            id: NotSet,
            order_id: Set(order_id),
            stage: Set(stage),
            status: Set(InstanceStatus::Open),
            employee_id: Set(employee_id.to_string()),
            notes: Set(initial_notes),
            started_at: Set(now),
            ended_at: Set(None),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;

        debug!(order_id, %stage, instance_id = instance.id, "Opened process instance");
        Ok(OpenedInstance {
            instance,
            created: true,
        })
    }

    /// Completes the Open instance of (order, stage) once no allocation references it.
    /// Returns the closed instance, or `None` when nothing was closed.
    pub async fn close_if_empty<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
        stage: Stage,
    ) -> Result<Option<process_instance::Model>, ServiceError> {
        let Some(instance) = Self::find_open(conn, order_id, stage, true).await? else {
            return Ok(None);
        };

        let remaining = AllocationEntity::find()
            .filter(allocation::Column::ProcessInstanceId.eq(instance.id))
            .count(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if remaining > 0 {
            return Ok(None);
        }

        let instance_id = instance.id;
        let closed = Self::mark_completed(conn, instance, None).await?;
        info!(order_id, %stage, instance_id, "Process instance completed");
        Ok(Some(closed))
    }

    /// Marks an instance Completed, stamping `ended_at` and merging closing notes.
    pub async fn mark_completed<C: ConnectionTrait>(
        conn: &C,
        instance: process_instance::Model,
        notes: Option<&str>,
    ) -> Result<process_instance::Model, ServiceError> {
        let now = Utc::now();
        let merged = merge_notes(instance.notes.as_deref(), notes, now);
        let mut active: process_instance::ActiveModel = instance.into();
        active.status = Set(InstanceStatus::Completed);
        active.ended_at = Set(Some(now));
        active.notes = Set(merged);
        active.update(conn).await.map_err(ServiceError::db_error)
    }

    /// Cancels every Open instance of an order.
    pub async fn cancel_open_for_order<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
    ) -> Result<Vec<process_instance::Model>, ServiceError> {
        let open = ProcessInstanceEntity::find()
            .filter(process_instance::Column::OrderId.eq(order_id))
            .filter(process_instance::Column::Status.eq(InstanceStatus::Open))
            .order_by_asc(process_instance::Column::Id)
            .lock_exclusive()
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let now = Utc::now();
        let mut cancelled = Vec::with_capacity(open.len());
        for instance in open {
            let mut active: process_instance::ActiveModel = instance.into();
            active.status = Set(InstanceStatus::Cancelled);
            active.ended_at = Set(Some(now));
            cancelled.push(active.update(conn).await.map_err(ServiceError::db_error)?);
        }
        Ok(cancelled)
    }

    /// Reopens the latest Cancelled instance per stage that still holds quantity.
    pub async fn restore_cancelled<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
    ) -> Result<Vec<process_instance::Model>, ServiceError> {
        let cancelled = ProcessInstanceEntity::find()
            .filter(process_instance::Column::OrderId.eq(order_id))
            .filter(process_instance::Column::Status.eq(InstanceStatus::Cancelled))
            .order_by_desc(process_instance::Column::Id)
            .lock_exclusive()
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut seen_stages = HashSet::new();
        let mut restored = Vec::new();
        for instance in cancelled {
            if !seen_stages.insert(instance.stage) {
                continue;
            }
            let holds_quantity = AllocationEntity::find()
                .filter(allocation::Column::ProcessInstanceId.eq(instance.id))
                .count(conn)
                .await
                .map_err(ServiceError::db_error)?
                > 0;
            if !holds_quantity
                || Self::find_open(conn, order_id, instance.stage, false)
                    .await?
                    .is_some()
            {
                continue;
            }

            let mut active: process_instance::ActiveModel = instance.into();
            active.status = Set(InstanceStatus::Open);
            active.ended_at = Set(None);
            restored.push(active.update(conn).await.map_err(ServiceError::db_error)?);
        }
        restored.sort_by_key(|instance| instance.id);
        Ok(restored)
    }
}
