#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use garment_flow::{
    db::{self, DbConfig},
    dto::production::{
        AdvanceItem, AdvanceOutcome, AdvanceRequest, CreatedOrder, InvoiceData, NewLineItem,
        NewOrder,
    },
    entities::{
        allocation::{self, Entity as AllocationEntity},
        manufacturer,
        process_instance::{self, Entity as ProcessInstanceEntity, InstanceStatus},
        product, Stage,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        advancement::AdvancementEngine, completion::OrderCompletionChecker,
        history::HistoryReader, order_intake::OrderIntakeService,
    },
};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder,
};
use tokio::sync::mpsc;

pub const EMPLOYEE: &str = "emp-ana";

/// In-memory SQLite database with migrations applied and a captured event channel.
pub struct TestEnv {
    pub db: Arc<DatabaseConnection>,
    pub sender: EventSender,
    pub events: mpsc::Receiver<Event>,
}

impl TestEnv {
    pub async fn new() -> Self {
        let pool = db::establish_connection_with_config(&DbConfig::in_memory_sqlite())
            .await
            .expect("connect to in-memory sqlite");
        db::run_migrations(&pool).await.expect("run migrations");
        let (sender, events) = EventSender::channel(256);
        Self {
            db: Arc::new(pool),
            sender,
            events,
        }
    }

    pub fn engine(&self) -> AdvancementEngine {
        AdvancementEngine::new(self.db.clone(), Some(self.sender.clone()))
    }

    pub fn intake(&self) -> OrderIntakeService {
        OrderIntakeService::new(self.db.clone(), Some(self.sender.clone()))
    }

    pub fn completion(&self) -> OrderCompletionChecker {
        OrderCompletionChecker::new(self.db.clone(), Some(self.sender.clone()))
    }

    pub fn history(&self) -> HistoryReader {
        HistoryReader::new(self.db.clone())
    }

    pub async fn seed_product(&self, name: &str) -> i32 {
        product::ActiveModel {
            id: NotSet,
            name: Set(name.to_string()),
        }
        .insert(&*self.db)
        .await
        .expect("insert product")
        .id
    }

    pub async fn seed_manufacturer(&self, name: &str, active: bool) -> i32 {
        manufacturer::ActiveModel {
            id: NotSet,
            name: Set(name.to_string()),
            active: Set(active),
        }
        .insert(&*self.db)
        .await
        .expect("insert manufacturer")
        .id
    }

    /// Creates an order with one line per `(product_id, quantity)`.
    pub async fn create_order(&self, lines: &[(i32, i32)]) -> CreatedOrder {
        self.intake()
            .create_order(NewOrder {
                responsible_employee: EMPLOYEE.to_string(),
                payment_type: "transfer".to_string(),
                notes: None,
                priority: 0,
                line_items: lines
                    .iter()
                    .map(|&(product_id, quantity)| NewLineItem {
                        product_id,
                        quantity,
                    })
                    .collect(),
            })
            .await
            .expect("create order")
    }

    pub async fn advance(
        &self,
        order_id: i32,
        from: Stage,
        to: Stage,
        items: Vec<AdvanceItem>,
    ) -> Result<AdvanceOutcome, ServiceError> {
        self.engine()
            .advance(request(order_id, from, Some(to), items))
            .await
    }

    /// Pushes full quantities of every line from intake into `target` along the main path.
    pub async fn walk_to(&self, created: &CreatedOrder, quantities: &[i32], target: Stage) {
        let path = [
            Stage::Intake,
            Stage::Tracing,
            Stage::Cutting,
            Stage::Confection,
            Stage::Invoicing,
            Stage::Delivery,
        ];
        for pair in path.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if from == target {
                return;
            }
            let items: Vec<AdvanceItem> = created
                .line_item_ids
                .iter()
                .zip(quantities)
                .map(|(&line, &qty)| item(line, qty))
                .collect();
            let mut req = request(created.order_id, from, Some(to), items);
            if from == Stage::Confection {
                req.bifurcation = Some(
                    created
                        .line_item_ids
                        .iter()
                        .map(|&line| (line, to))
                        .collect(),
                );
            }
            if from == Stage::Invoicing {
                req.invoice = Some(invoice(&format!("F-{}", created.order_id)));
            }
            self.engine().advance(req).await.expect("walk advance");
        }
    }

    pub async fn instances(&self, order_id: i32) -> Vec<process_instance::Model> {
        ProcessInstanceEntity::find()
            .filter(process_instance::Column::OrderId.eq(order_id))
            .order_by_asc(process_instance::Column::Id)
            .all(&*self.db)
            .await
            .expect("load instances")
    }

    pub async fn open_instance(
        &self,
        order_id: i32,
        stage: Stage,
    ) -> Option<process_instance::Model> {
        self.instances(order_id)
            .await
            .into_iter()
            .find(|i| i.stage == stage && i.status == InstanceStatus::Open)
    }

    /// Every allocation row of the order paired with the stage of its instance.
    pub async fn allocations(
        &self,
        order_id: i32,
    ) -> Vec<(process_instance::Model, allocation::Model)> {
        let instances = self.instances(order_id).await;
        let rows = AllocationEntity::find()
            .filter(
                allocation::Column::ProcessInstanceId
                    .is_in(instances.iter().map(|i| i.id).collect::<Vec<_>>()),
            )
            .order_by_asc(allocation::Column::Id)
            .all(&*self.db)
            .await
            .expect("load allocations");
        rows.into_iter()
            .filter_map(|row| {
                instances
                    .iter()
                    .find(|i| i.id == row.process_instance_id)
                    .cloned()
                    .map(|i| (i, row))
            })
            .collect()
    }

    /// Sum of a line item's quantity over Open instances.
    pub async fn open_total(&self, order_id: i32, line_item_id: i32) -> i32 {
        self.allocations(order_id)
            .await
            .iter()
            .filter(|(i, row)| i.status == InstanceStatus::Open && row.line_item_id == line_item_id)
            .map(|(_, row)| row.quantity)
            .sum()
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn item(line_item_id: i32, quantity: i32) -> AdvanceItem {
    AdvanceItem {
        line_item_id,
        quantity,
        manufacturer_id: None,
        allocation_id: None,
    }
}

pub fn item_for(line_item_id: i32, quantity: i32, manufacturer_id: i32) -> AdvanceItem {
    AdvanceItem {
        manufacturer_id: Some(manufacturer_id),
        ..item(line_item_id, quantity)
    }
}

pub fn request(
    order_id: i32,
    source_stage: Stage,
    destination_stage: Option<Stage>,
    items: Vec<AdvanceItem>,
) -> AdvanceRequest {
    AdvanceRequest {
        order_id,
        source_stage,
        destination_stage,
        employee_id: EMPLOYEE.to_string(),
        items,
        notes: None,
        bifurcation: None,
        invoice: None,
    }
}

pub fn invoice(number: &str) -> InvoiceData {
    InvoiceData {
        number: number.to_string(),
        document_url: format!("https://files.example.com/{}.pdf", number),
        notes: None,
    }
}

pub fn today() -> chrono::NaiveDate {
    Utc::now().date_naive()
}
