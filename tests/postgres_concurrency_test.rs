use std::sync::Arc;

use garment_flow::{
    db::{self, DbConfig},
    dto::production::{AdvanceItem, AdvanceRequest, NewLineItem, NewOrder},
    entities::{product, Stage},
    services::{advancement::AdvancementEngine, order_intake::OrderIntakeService},
};
use sea_orm::{ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set};

// Needs a disposable Postgres database. Run with:
// DATABASE_URL=postgres://... cargo test -- --ignored concurrent_advances
#[tokio::test]
#[ignore]
async fn concurrent_advances_never_oversell_a_stage() {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at postgres");
    let pool = db::establish_connection_with_config(&DbConfig {
        url,
        max_connections: 16,
        ..Default::default()
    })
    .await
    .expect("db connect");
    db::run_migrations(&pool).await.expect("migrations");
    let db = Arc::new(pool);

    let product_id = product::ActiveModel {
        id: NotSet,
        name: Set("Concurrency tee".into()),
    }
    .insert(&*db)
    .await
    .expect("seed product")
    .id;

    let created = OrderIntakeService::new(db.clone(), None)
        .create_order(NewOrder {
            responsible_employee: "emp-load".into(),
            payment_type: "transfer".into(),
            notes: None,
            priority: 0,
            line_items: vec![NewLineItem {
                product_id,
                quantity: 10,
            }],
        })
        .await
        .expect("create order");
    let line_item_id = created.line_item_ids[0];

    // 20 workers each try to move one unit; only 10 exist.
    let engine = AdvancementEngine::new(db.clone(), None);
    let mut tasks = vec![];
    for worker in 0..20 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .advance(AdvanceRequest {
                    order_id: created.order_id,
                    source_stage: Stage::Intake,
                    destination_stage: Some(Stage::Tracing),
                    employee_id: format!("emp-{}", worker),
                    items: vec![AdvanceItem {
                        line_item_id,
                        quantity: 1,
                        manufacturer_id: None,
                        allocation_id: None,
                    }],
                    notes: None,
                    bifurcation: None,
                    invoice: None,
                })
                .await
        }));
    }

    let mut moved = 0;
    for task in tasks {
        if let Ok(Ok(_)) = task.await {
            moved += 1;
        }
    }
    assert!(moved <= 10, "moved {} units out of 10", moved);
}
