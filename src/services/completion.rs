use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use validator::Validate;

use crate::{
    dto::production::CompleteOrderRequest,
    entities::{
        allocation::{self, Entity as AllocationEntity},
        line_item::{self, DeliveryState, Entity as LineItemEntity},
        order::{self, Entity as OrderEntity},
        process_instance, Stage,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{process_instances::ProcessInstanceManager, stage_catalog},
};

/// A line item whose quantity in the delivery stage differs from its total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortfall {
    pub line_item_id: i32,
    pub total_quantity: i32,
    pub in_stage: i32,
}

/// Strict per-line-item equality check between totals and stage contents.
///
/// An order with no line items is never complete.
pub fn delivery_shortfalls(
    line_items: &[line_item::Model],
    in_stage: &HashMap<i32, i32>,
) -> Option<Vec<Shortfall>> {
    if line_items.is_empty() {
        return None;
    }
    Some(
        line_items
            .iter()
            .filter_map(|line| {
                let present = in_stage.get(&line.id).copied().unwrap_or(0);
                (present != line.total_quantity).then(|| Shortfall {
                    line_item_id: line.id,
                    total_quantity: line.total_quantity,
                    in_stage: present,
                })
            })
            .collect(),
    )
}

/// Open instance of a stage with the quantity it holds per line item.
type StageContents = (process_instance::Model, HashMap<i32, i32>);

/// Decides and performs order completion from the delivery stage.
#[derive(Clone)]
pub struct OrderCompletionChecker {
    db: Arc<DatabaseConnection>,
    event_sender: Option<EventSender>,
}

impl OrderCompletionChecker {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Line items of the order and what the Open instance of `stage` holds for each.
    /// `None` for the map means the stage has no Open instance.
    async fn load_state<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
        stage: Stage,
        lock: bool,
    ) -> Result<(Vec<line_item::Model>, Option<StageContents>), ServiceError> {
        let line_items = LineItemEntity::find()
            .filter(line_item::Column::OrderId.eq(order_id))
            .order_by_asc(line_item::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let Some(instance) = ProcessInstanceManager::find_open(conn, order_id, stage, lock).await?
        else {
            return Ok((line_items, None));
        };

        let mut query = AllocationEntity::find()
            .filter(allocation::Column::ProcessInstanceId.eq(instance.id));
        if lock {
            query = query.lock_exclusive();
        }
        let mut in_stage: HashMap<i32, i32> = HashMap::new();
        for row in query.all(conn).await.map_err(ServiceError::db_error)? {
            *in_stage.entry(row.line_item_id).or_insert(0) += row.quantity;
        }
        Ok((line_items, Some((instance, in_stage))))
    }

    /// True only when every line item sits in full in the Open `delivery_stage` instance.
    #[instrument(skip(self))]
    pub async fn can_complete(
        &self,
        order_id: i32,
        delivery_stage: Stage,
    ) -> Result<bool, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::OrderOrLineItemNotFound(format!("order {} not found", order_id))
            })?;

        let (line_items, open) =
            Self::load_state(&*self.db, order_id, delivery_stage, false).await?;
        Ok(match open {
            Some((_, in_stage)) => matches!(
                delivery_shortfalls(&line_items, &in_stage),
                Some(shortfalls) if shortfalls.is_empty()
            ),
            None => false,
        })
    }

    /// Completes the delivery instance and marks every line item delivered.
    ///
    /// The check is repeated under row locks inside the transaction.
    #[instrument(skip(self, request), fields(order_id = request.order_id))]
    pub async fn complete_order(&self, request: CompleteOrderRequest) -> Result<(), ServiceError> {
        request.validate()?;
        let order_id = request.order_id;
        let stage = request.delivery_stage;
        if !stage_catalog::is_terminal(stage) {
            return Err(ServiceError::InvalidTransition(format!(
                "orders complete from a terminal stage, {} is not one",
                stage
            )));
        }

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let order = OrderEntity::find_by_id(order_id)
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::OrderOrLineItemNotFound(format!("order {} not found", order_id))
            })?;
        if !order.active {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is inactive",
                order_id
            )));
        }

        let (line_items, open) = Self::load_state(&txn, order_id, stage, true).await?;
        let Some((instance, in_stage)) = open else {
            return Err(ServiceError::IncompleteDelivery(format!(
                "order {} has nothing in {}",
                order_id, stage
            )));
        };
        match delivery_shortfalls(&line_items, &in_stage) {
            Some(shortfalls) if shortfalls.is_empty() => {}
            Some(shortfalls) => {
                let detail = shortfalls
                    .iter()
                    .map(|s| {
                        format!(
                            "line item {} has {} of {}",
                            s.line_item_id, s.in_stage, s.total_quantity
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(ServiceError::IncompleteDelivery(detail));
            }
            None => {
                return Err(ServiceError::IncompleteDelivery(format!(
                    "order {} has no line items",
                    order_id
                )))
            }
        }

        ProcessInstanceManager::mark_completed(&txn, instance, request.notes.as_deref()).await?;

        let line_count = line_items.len();
        for line in line_items {
            let total = line.total_quantity;
            let mut active: line_item::ActiveModel = line.into();
            active.delivery_state = Set(DeliveryState::Delivered);
            active.delivered_quantity = Set(total);
            active.update(&txn).await.map_err(ServiceError::db_error)?;
        }

        let mut active_order: order::ActiveModel = order.into();
        active_order.updated_at = Set(Utc::now());
        active_order.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("garment_flow.orders.completed", 1);
        info!(
            order_id,
            line_items = line_count,
            employee_id = %request.employee_id,
            "Order completed"
        );

        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::OrderCompleted {
                    order_id,
                    employee_id: request.employee_id.clone(),
                })
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(id: i32, total_quantity: i32) -> line_item::Model {
        line_item::Model {
            id,
            order_id: 1,
            product_id: 1,
            total_quantity,
            delivered_quantity: 0,
            delivery_state: DeliveryState::InProduction,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn exact_totals_leave_no_shortfall() {
        let in_stage = HashMap::from([(1, 10), (2, 4)]);
        assert_eq!(
            delivery_shortfalls(&[line(1, 10), line(2, 4)], &in_stage),
            Some(vec![])
        );
    }

    #[test]
    fn one_missing_unit_is_a_shortfall() {
        let in_stage = HashMap::from([(1, 10), (2, 3)]);
        assert_eq!(
            delivery_shortfalls(&[line(1, 10), line(2, 4)], &in_stage),
            Some(vec![Shortfall {
                line_item_id: 2,
                total_quantity: 4,
                in_stage: 3
            }])
        );
    }

    #[test]
    fn surplus_is_also_a_shortfall() {
        let in_stage = HashMap::from([(1, 11)]);
        assert_eq!(
            delivery_shortfalls(&[line(1, 10)], &in_stage).map(|s| s.len()),
            Some(1)
        );
    }

    #[test]
    fn orders_without_lines_are_never_complete() {
        assert_eq!(delivery_shortfalls(&[], &HashMap::new()), None);
    }
}
