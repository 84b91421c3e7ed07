use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait,
    ActiveValue::{NotSet, Set},
    ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait, QueryFilter, QuerySelect,
    TransactionTrait,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};
use validator::Validate;

use crate::{
    dto::production::{CreatedOrder, NewOrder},
    entities::{
        line_item::{self, DeliveryState},
        order::{self, Entity as OrderEntity},
        product::{self, Entity as ProductEntity},
        Stage,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{allocations::AllocationStore, process_instances::ProcessInstanceManager},
};

/// Creates orders and manages their lifecycle flags.
#[derive(Clone)]
pub struct OrderIntakeService {
    db: Arc<DatabaseConnection>,
    event_sender: Option<EventSender>,
}

impl OrderIntakeService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<EventSender>) -> Self {
        Self { db, event_sender }
    }

    async fn send(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }

    async fn lock_order(
        txn: &DatabaseTransaction,
        order_id: i32,
    ) -> Result<order::Model, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .lock_exclusive()
            .one(txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Inserts the order, its line items and the Intake instance holding every unit.
    #[instrument(skip(self, new_order), fields(line_items = new_order.line_items.len()))]
    pub async fn create_order(&self, new_order: NewOrder) -> Result<CreatedOrder, ServiceError> {
        new_order.validate()?;
        if new_order.line_items.is_empty() {
            return Err(ServiceError::ValidationError(
                "an order needs at least one line item".into(),
            ));
        }

        let product_ids: HashSet<i32> =
            new_order.line_items.iter().map(|l| l.product_id).collect();
        let known: HashSet<i32> = ProductEntity::find()
            .filter(product::Column::Id.is_in(product_ids.iter().copied().collect::<Vec<_>>()))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|p| p.id)
            .collect();
        let mut missing: Vec<i32> = product_ids.difference(&known).copied().collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(ServiceError::NotFound(format!(
                "Unknown products: {:?}",
                missing
            )));
        }

        let now = Utc::now();
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let order = order::ActiveModel {
            id: NotSet,
            responsible_employee: Set(new_order.responsible_employee.clone()),
            payment_type: Set(new_order.payment_type.clone()),
            invoice_proof_url: Set(None),
            notes: Set(new_order.notes.clone()),
            priority: Set(new_order.priority),
            active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        let intake = ProcessInstanceManager::open_or_reuse(
            &txn,
            order.id,
            Stage::Intake,
            &new_order.responsible_employee,
            new_order.notes.as_deref(),
        )
        .await?
        .instance;

        let mut line_item_ids = Vec::with_capacity(new_order.line_items.len());
        for line in &new_order.line_items {
            let created = line_item::ActiveModel {
                id: NotSet,
                order_id: Set(order.id),
                product_id: Set(line.product_id),
                total_quantity: Set(line.quantity),
                delivered_quantity: Set(0),
                delivery_state: Set(DeliveryState::InProduction),
                created_at: Set(now),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;
            AllocationStore::place(&txn, created.id, intake.id, line.quantity).await?;
            line_item_ids.push(created.id);
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("garment_flow.orders.created", 1);
        info!(order_id = order.id, intake_instance_id = intake.id, "Order created");
        self.send(Event::OrderCreated {
            order_id: order.id,
            line_items: line_item_ids.len(),
        })
        .await;

        Ok(CreatedOrder {
            order_id: order.id,
            intake_instance_id: intake.id,
            line_item_ids,
        })
    }

    #[instrument(skip(self))]
    pub async fn set_priority(&self, order_id: i32, priority: i32) -> Result<(), ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let order = Self::lock_order(&txn, order_id).await?;
        let mut active: order::ActiveModel = order.into();
        active.priority = Set(priority);
        active.updated_at = Set(Utc::now());
        active.update(&txn).await.map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Marks the order inactive and cancels its Open instances. Allocations stay put.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, order_id: i32) -> Result<usize, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let order = Self::lock_order(&txn, order_id).await?;
        if !order.active {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is already inactive",
                order_id
            )));
        }

        let cancelled = ProcessInstanceManager::cancel_open_for_order(&txn, order_id).await?;
        let mut active: order::ActiveModel = order.into();
        active.active = Set(false);
        active.updated_at = Set(Utc::now());
        active.update(&txn).await.map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("garment_flow.orders.deactivated", 1);
        info!(order_id, cancelled = cancelled.len(), "Order deactivated");
        self.send(Event::OrderDeactivated {
            order_id,
            cancelled_instances: cancelled.len(),
        })
        .await;
        Ok(cancelled.len())
    }

    /// Reactivates the order and reopens the cancelled instances that still hold quantity.
    #[instrument(skip(self))]
    pub async fn reactivate(&self, order_id: i32) -> Result<usize, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let order = Self::lock_order(&txn, order_id).await?;
        if order.active {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is already active",
                order_id
            )));
        }

        let restored = ProcessInstanceManager::restore_cancelled(&txn, order_id).await?;
        let mut active: order::ActiveModel = order.into();
        active.active = Set(true);
        active.updated_at = Set(Utc::now());
        active.update(&txn).await.map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("garment_flow.orders.reactivated", 1);
        info!(order_id, restored = restored.len(), "Order reactivated");
        self.send(Event::OrderReactivated {
            order_id,
            restored_instances: restored.len(),
        })
        .await;
        Ok(restored.len())
    }
}
