use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, QueryFilter, QuerySelect, TransactionTrait,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::{
    dto::production::{AdvanceOutcome, AdvanceRequest, ParticipationSnapshot, SnapshotItem},
    entities::{
        employee_participation::{self, Entity as ParticipationEntity},
        invoice,
        line_item::{self, Entity as LineItemEntity},
        order::{self, Entity as OrderEntity},
        process_instance, Stage,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        allocations::{AllocationStore, MoveRequest},
        collaborators::{
            resolve_product_names, DbProductNameLookup, InvoiceDocumentStore, ProductNameLookup,
            UrlDocumentStore, UNKNOWN_PRODUCT_NAME,
        },
        invoice_gate::InvoiceGate,
        manufacturers::ManufacturerCatalog,
        process_instances::ProcessInstanceManager,
        stage_catalog,
    },
};

const DEFAULT_PRODUCT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(500);

/// Resolves the destination stage of every item, in request order.
///
/// Leaving a bifurcating stage needs an explicit, allowed entry per item; there
/// is no fallback to `destination_stage`. Other stages take the per-item entry
/// when present, otherwise `destination_stage`.
pub fn plan_routes(request: &AdvanceRequest) -> Result<Vec<Stage>, ServiceError> {
    if request.items.is_empty() {
        return Err(ServiceError::ValidationError(
            "an advancement needs at least one item".into(),
        ));
    }

    let source = request.source_stage;
    let map = request.bifurcation.as_ref();

    if stage_catalog::is_bifurcating(source) {
        let allowed = stage_catalog::bifurcation_targets(source);
        return request
            .items
            .iter()
            .map(|item| {
                let target = map
                    .and_then(|m| m.get(&item.line_item_id))
                    .copied()
                    .ok_or_else(|| {
                        ServiceError::MissingBifurcationTarget(format!(
                            "line item {} has no target stage out of {}",
                            item.line_item_id, source
                        ))
                    })?;
                if !allowed.contains(&target) {
                    return Err(ServiceError::MissingBifurcationTarget(format!(
                        "{} is not a bifurcation target of {} (line item {})",
                        target, source, item.line_item_id
                    )));
                }
                Ok(target)
            })
            .collect();
    }

    if let Some(dest) = request.destination_stage {
        if !stage_catalog::is_valid_transition(source, dest) {
            return Err(ServiceError::InvalidTransition(format!(
                "{} cannot advance to {}",
                source, dest
            )));
        }
    }

    request
        .items
        .iter()
        .map(|item| {
            match (
                map.and_then(|m| m.get(&item.line_item_id)).copied(),
                request.destination_stage,
            ) {
                (Some(target), _) if stage_catalog::is_valid_transition(source, target) => {
                    Ok(target)
                }
                (Some(target), _) => Err(ServiceError::InvalidTransition(format!(
                    "{} cannot advance to {} (line item {})",
                    source, target, item.line_item_id
                ))),
                (None, Some(dest)) => Ok(dest),
                (None, None) if map.is_some() => Err(ServiceError::MissingBifurcationTarget(
                    format!("line item {} has no target stage", item.line_item_id),
                )),
                (None, None) => Err(ServiceError::InvalidTransition(format!(
                    "no destination stage given for {}",
                    source
                ))),
            }
        })
        .collect()
}

/// Executes stage advancements as single all-or-nothing transactions.
#[derive(Clone)]
pub struct AdvancementEngine {
    db: Arc<DatabaseConnection>,
    product_names: Arc<dyn ProductNameLookup>,
    documents: Arc<dyn InvoiceDocumentStore>,
    product_lookup_timeout: Duration,
    event_sender: Option<EventSender>,
}

struct Committed {
    outcome: AdvanceOutcome,
    destination_stages: Vec<Stage>,
    invoice: Option<invoice::Model>,
    closed_source: Option<process_instance::Model>,
}

impl AdvancementEngine {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<EventSender>) -> Self {
        Self {
            product_names: Arc::new(DbProductNameLookup::new(db.clone())),
            documents: Arc::new(UrlDocumentStore::default()),
            product_lookup_timeout: DEFAULT_PRODUCT_LOOKUP_TIMEOUT,
            db,
            event_sender,
        }
    }

    pub fn with_product_lookup(mut self, lookup: Arc<dyn ProductNameLookup>) -> Self {
        self.product_names = lookup;
        self
    }

    pub fn with_document_store(mut self, documents: Arc<dyn InvoiceDocumentStore>) -> Self {
        self.documents = documents;
        self
    }

    pub fn with_product_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.product_lookup_timeout = timeout;
        self
    }

    /// Moves the requested quantities out of `source_stage`.
    ///
    /// Any failure rolls back every mutation. Not idempotent: repeating an
    /// advancement that exhausted its source fails with `InsufficientQuantity`.
    #[instrument(
        skip(self, request),
        fields(order_id = request.order_id, source = %request.source_stage)
    )]
    pub async fn advance(&self, request: AdvanceRequest) -> Result<AdvanceOutcome, ServiceError> {
        match self.run(&request).await {
            Ok(committed) => {
                counter!("garment_flow.advance.succeeded", 1);
                self.publish(&request, &committed).await;
                Ok(committed.outcome)
            }
            Err(e) => {
                counter!("garment_flow.advance.failed", 1, "reason" => e.reason_code());
                warn!(reason = e.reason_code(), error = %e, "Advancement rejected");
                Err(e)
            }
        }
    }

    async fn run(&self, request: &AdvanceRequest) -> Result<Committed, ServiceError> {
        request.validate()?;
        let routes = plan_routes(request)?;

        let gated = routes
            .iter()
            .any(|target| stage_catalog::is_invoice_gated(request.source_stage, *target));
        let invoice_data = if gated {
            Some(InvoiceGate::require_invoice_data(request.invoice.as_ref())?)
        } else {
            None
        };

        // Collaborator calls happen before the transaction opens.
        let document_url = match invoice_data {
            Some(data) => Some(self.documents.store(&data.document_url).await?),
            None => None,
        };
        let product_names = self.product_names_for(request).await?;

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let committed = self
            .apply(&txn, request, &routes, document_url, &product_names)
            .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(committed)
    }

    async fn product_names_for(
        &self,
        request: &AdvanceRequest,
    ) -> Result<HashMap<i32, String>, ServiceError> {
        let line_item_ids: Vec<i32> = request.items.iter().map(|i| i.line_item_id).collect();
        let product_ids: Vec<i32> = LineItemEntity::find()
            .filter(line_item::Column::OrderId.eq(request.order_id))
            .filter(line_item::Column::Id.is_in(line_item_ids))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|line| line.product_id)
            .collect();
        Ok(resolve_product_names(
            self.product_names.as_ref(),
            &product_ids,
            self.product_lookup_timeout,
        )
        .await)
    }

    async fn apply(
        &self,
        txn: &DatabaseTransaction,
        request: &AdvanceRequest,
        routes: &[Stage],
        document_url: Option<String>,
        product_names: &HashMap<i32, String>,
    ) -> Result<Committed, ServiceError> {
        let order_id = request.order_id;
        let source_stage = request.source_stage;

        let order = OrderEntity::find_by_id(order_id)
            .lock_exclusive()
            .one(txn)
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

        let line_items: HashMap<i32, line_item::Model> = LineItemEntity::find()
            .filter(line_item::Column::OrderId.eq(order_id))
            .all(txn)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|line| (line.id, line))
            .collect();
        for item in &request.items {
            if !line_items.contains_key(&item.line_item_id) {
                return Err(ServiceError::OrderOrLineItemNotFound(format!(
                    "line item {} does not belong to order {}",
                    item.line_item_id, order_id
                )));
            }
        }

        let manufacturer_ids: BTreeSet<i32> = request
            .items
            .iter()
            .filter_map(|item| item.manufacturer_id)
            .collect();
        for manufacturer_id in manufacturer_ids {
            ManufacturerCatalog::require_active(txn, manufacturer_id).await?;
        }

        let source = ProcessInstanceManager::find_open(txn, order_id, source_stage, true)
            .await?
            .ok_or_else(|| {
                ServiceError::InsufficientQuantity(format!(
                    "order {} has nothing in {}",
                    order_id, source_stage
                ))
            })?;

        let mut destinations: Vec<(Stage, process_instance::Model)> = Vec::new();
        for target in routes {
            if destinations.iter().any(|(stage, _)| stage == target) {
                continue;
            }
            let opened = ProcessInstanceManager::open_or_reuse(
                txn,
                order_id,
                *target,
                &request.employee_id,
                request.notes.as_deref(),
            )
            .await?;
            destinations.push((*target, opened.instance));
        }

        let issued = match (&request.invoice, document_url) {
            (Some(data), Some(url)) => {
                let issued =
                    InvoiceGate::issue_invoice(txn, &data.number, &url, data.notes.as_deref())
                        .await?;
                let mut active: order::ActiveModel = order.into();
                active.invoice_proof_url = Set(Some(url));
                active.updated_at = Set(Utc::now());
                active.update(txn).await.map_err(ServiceError::db_error)?;
                Some(issued)
            }
            _ => None,
        };

        let participation_recorded = self
            .record_participation(txn, request, routes, &source, &line_items, product_names)
            .await?;

        for (item, target) in request.items.iter().zip(routes) {
            let destination_instance_id = destinations
                .iter()
                .find(|(stage, _)| stage == target)
                .map(|(_, instance)| instance.id)
                .ok_or_else(|| {
                    ServiceError::InternalError(format!("no instance resolved for {}", target))
                })?;

            let credited = AllocationStore::move_quantity(
                txn,
                &MoveRequest {
                    line_item_id: item.line_item_id,
                    source_instance_id: source.id,
                    destination_instance_id,
                    quantity: item.quantity,
                    manufacturer_id: item.manufacturer_id,
                    allocation_id: item.allocation_id,
                    consume_cut_counter: stage_catalog::consumes_cut_counter(
                        source_stage,
                        *target,
                    ),
                },
            )
            .await?;

            if let Some(issued) = &issued {
                if stage_catalog::is_invoice_gated(source_stage, *target) {
                    InvoiceGate::link_allocation(txn, issued.id, credited.id).await?;
                }
            }
        }

        let closed_source =
            ProcessInstanceManager::close_if_empty(txn, order_id, source_stage).await?;

        Ok(Committed {
            outcome: AdvanceOutcome {
                source_instance_id: source.id,
                destination_instance_ids: destinations.iter().map(|(_, i)| i.id).collect(),
                invoice_id: issued.as_ref().map(|i| i.id),
                source_closed: closed_source.is_some(),
                participation_recorded,
            },
            destination_stages: destinations.iter().map(|(stage, _)| *stage).collect(),
            invoice: issued,
            closed_source,
        })
    }

    /// Writes the participation record for (source instance, employee) unless
    /// one exists. Returns whether a record was written.
    async fn record_participation(
        &self,
        txn: &DatabaseTransaction,
        request: &AdvanceRequest,
        routes: &[Stage],
        source: &process_instance::Model,
        line_items: &HashMap<i32, line_item::Model>,
        product_names: &HashMap<i32, String>,
    ) -> Result<bool, ServiceError> {
        let existing = ParticipationEntity::find()
            .filter(employee_participation::Column::ProcessInstanceId.eq(source.id))
            .filter(employee_participation::Column::EmployeeId.eq(request.employee_id.as_str()))
            .one(txn)
            .await
            .map_err(ServiceError::db_error)?;
        if existing.is_some() {
            return Ok(false);
        }

        let now = Utc::now();
        let snapshot = ParticipationSnapshot {
            source_stage: source.stage.display_name(),
            employee_id: request.employee_id.clone(),
            items: request
                .items
                .iter()
                .zip(routes)
                .map(|(item, target)| SnapshotItem {
                    line_item_id: item.line_item_id,
                    product_name: line_items
                        .get(&item.line_item_id)
                        .and_then(|line| product_names.get(&line.product_id))
                        .cloned()
                        .unwrap_or_else(|| UNKNOWN_PRODUCT_NAME.to_string()),
                    quantity: item.quantity,
                    destination_stage: target.display_name(),
                    manufacturer_id: item.manufacturer_id,
                })
                .collect(),
            notes: request.notes.clone(),
            recorded_at: now,
        };

        employee_participation::ActiveModel {
            id: NotSet,
            process_instance_id: Set(source.id),
            employee_id: Set(request.employee_id.clone()),
            snapshot: Set(serde_json::to_string(&snapshot)?),
            created_at: Set(now),
        }
        .insert(txn)
        .await
        .map_err(ServiceError::db_error)?;
        Ok(true)
    }

    async fn publish(&self, request: &AdvanceRequest, committed: &Committed) {
        let quantity: i64 = request.items.iter().map(|i| i64::from(i.quantity)).sum();
        counter!("garment_flow.advance.units", quantity.max(0) as u64);

        info!(
            order_id = request.order_id,
            source = %request.source_stage,
            destinations = ?committed.destination_stages,
            quantity,
            employee_id = %request.employee_id,
            source_closed = committed.outcome.source_closed,
            "Stage advanced"
        );

        let Some(sender) = &self.event_sender else {
            return;
        };
        sender
            .send_or_log(Event::StageAdvanced {
                order_id: request.order_id,
                source_stage: request.source_stage,
                destination_stages: committed.destination_stages.clone(),
                employee_id: request.employee_id.clone(),
                quantity,
                occurred_at: Utc::now(),
            })
            .await;
        if let Some(issued) = &committed.invoice {
            sender
                .send_or_log(Event::InvoiceIssued {
                    order_id: request.order_id,
                    invoice_id: issued.id,
                    number: issued.number.clone(),
                })
                .await;
        }
        if let Some(closed) = &committed.closed_source {
            sender
                .send_or_log(Event::ProcessInstanceClosed {
                    order_id: request.order_id,
                    process_instance_id: closed.id,
                    stage: closed.stage,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::production::AdvanceItem;
    use assert_matches::assert_matches;

    fn item(line_item_id: i32, quantity: i32) -> AdvanceItem {
        AdvanceItem {
            line_item_id,
            quantity,
            manufacturer_id: None,
            allocation_id: None,
        }
    }

    fn request(
        source_stage: Stage,
        destination_stage: Option<Stage>,
        bifurcation: Option<Vec<(i32, Stage)>>,
    ) -> AdvanceRequest {
        AdvanceRequest {
            order_id: 1,
            source_stage,
            destination_stage,
            employee_id: "emp1".into(),
            items: vec![item(10, 2), item(11, 3)],
            notes: None,
            bifurcation: bifurcation.map(|pairs| pairs.into_iter().collect()),
            invoice: None,
        }
    }

    #[test]
    fn linear_advance_routes_every_item_to_the_destination() {
        let routes = plan_routes(&request(Stage::Cutting, Some(Stage::Confection), None)).unwrap();
        assert_eq!(routes, vec![Stage::Confection, Stage::Confection]);
    }

    #[test]
    fn same_or_illegal_destination_is_an_invalid_transition() {
        assert_matches!(
            plan_routes(&request(Stage::Cutting, Some(Stage::Cutting), None)),
            Err(ServiceError::InvalidTransition(_))
        );
        assert_matches!(
            plan_routes(&request(Stage::Tracing, Some(Stage::Delivery), None)),
            Err(ServiceError::InvalidTransition(_))
        );
        assert_matches!(
            plan_routes(&request(Stage::Tracing, None, None)),
            Err(ServiceError::InvalidTransition(_))
        );
    }

    #[test]
    fn confection_requires_a_target_per_item() {
        assert_matches!(
            plan_routes(&request(Stage::Confection, Some(Stage::Invoicing), None)),
            Err(ServiceError::MissingBifurcationTarget(_))
        );
        assert_matches!(
            plan_routes(&request(
                Stage::Confection,
                None,
                Some(vec![(10, Stage::Embroidery)])
            )),
            Err(ServiceError::MissingBifurcationTarget(_))
        );
        assert_matches!(
            plan_routes(&request(
                Stage::Confection,
                None,
                Some(vec![(10, Stage::Embroidery), (11, Stage::Delivery)])
            )),
            Err(ServiceError::MissingBifurcationTarget(_))
        );
    }

    #[test]
    fn confection_splits_items_between_targets() {
        let routes = plan_routes(&request(
            Stage::Confection,
            None,
            Some(vec![(10, Stage::Embroidery), (11, Stage::Invoicing)]),
        ))
        .unwrap();
        assert_eq!(routes, vec![Stage::Embroidery, Stage::Invoicing]);
    }

    #[test]
    fn map_entries_outside_bifurcating_stages_must_be_successors() {
        assert_matches!(
            plan_routes(&request(
                Stage::Embroidery,
                Some(Stage::Invoicing),
                Some(vec![(10, Stage::Delivery)])
            )),
            Err(ServiceError::InvalidTransition(_))
        );
        let routes = plan_routes(&request(
            Stage::Embroidery,
            None,
            Some(vec![(10, Stage::Invoicing), (11, Stage::Invoicing)]),
        ))
        .unwrap();
        assert_eq!(routes, vec![Stage::Invoicing, Stage::Invoicing]);
    }

    #[test]
    fn empty_item_lists_are_rejected() {
        let mut empty = request(Stage::Cutting, Some(Stage::Confection), None);
        empty.items.clear();
        assert_matches!(plan_routes(&empty), Err(ServiceError::ValidationError(_)));
    }
}
