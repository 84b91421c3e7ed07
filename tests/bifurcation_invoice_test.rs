mod common;

use assert_matches::assert_matches;
use common::{invoice, item, request, TestEnv};
use garment_flow::{
    db::{self, DbConfig},
    entities::{
        invoice::Entity as InvoiceEntity,
        invoice_allocation::{self, Entity as InvoiceAllocationEntity},
        order::Entity as OrderEntity,
        process_instance::InstanceStatus,
        Stage,
    },
    errors::ServiceError,
    events::Event,
    services::invoice_gate::InvoiceGate,
};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, TransactionTrait};
use std::collections::HashMap;

#[tokio::test]
async fn confection_splits_items_between_embroidery_and_invoicing() {
    let env = TestEnv::new().await;
    let tee = env.seed_product("T-shirt").await;
    let cap = env.seed_product("Cap").await;
    let created = env.create_order(&[(tee, 6), (cap, 4)]).await;
    let (a, b) = (created.line_item_ids[0], created.line_item_ids[1]);
    env.walk_to(&created, &[6, 4], Stage::Confection).await;

    let mut req = request(created.order_id, Stage::Confection, None, vec![item(a, 6), item(b, 4)]);
    req.bifurcation = Some(HashMap::from([(a, Stage::Embroidery), (b, Stage::Invoicing)]));
    let outcome = env.engine().advance(req).await.unwrap();

    assert_eq!(outcome.destination_instance_ids.len(), 2);
    assert!(outcome.source_closed);

    let rows = env.allocations(created.order_id).await;
    let stage_of = |line: i32| -> Vec<Stage> {
        rows.iter()
            .filter(|(i, r)| r.line_item_id == line && i.status == InstanceStatus::Open)
            .map(|(i, _)| i.stage)
            .collect()
    };
    assert_eq!(stage_of(a), vec![Stage::Embroidery]);
    assert_eq!(stage_of(b), vec![Stage::Invoicing]);

    let confection = env
        .instances(created.order_id)
        .await
        .into_iter()
        .find(|i| i.stage == Stage::Confection)
        .unwrap();
    assert_eq!(confection.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn leaving_confection_needs_a_target_for_every_item() {
    let env = TestEnv::new().await;
    let product = env.seed_product("Shorts").await;
    let created = env.create_order(&[(product, 3), (product, 3)]).await;
    let (a, b) = (created.line_item_ids[0], created.line_item_ids[1]);
    env.walk_to(&created, &[3, 3], Stage::Confection).await;

    // A plain destination is not enough out of a bifurcating stage.
    let plain = request(
        created.order_id,
        Stage::Confection,
        Some(Stage::Invoicing),
        vec![item(a, 3)],
    );
    assert_matches!(
        env.engine().advance(plain).await,
        Err(ServiceError::MissingBifurcationTarget(_))
    );

    let mut partial = request(
        created.order_id,
        Stage::Confection,
        None,
        vec![item(a, 3), item(b, 3)],
    );
    partial.bifurcation = Some(HashMap::from([(a, Stage::Embroidery)]));
    assert_matches!(
        env.engine().advance(partial).await,
        Err(ServiceError::MissingBifurcationTarget(_))
    );

    let mut illegal = request(created.order_id, Stage::Confection, None, vec![item(a, 3)]);
    illegal.bifurcation = Some(HashMap::from([(a, Stage::Delivery)]));
    assert_matches!(
        env.engine().advance(illegal).await,
        Err(ServiceError::MissingBifurcationTarget(_))
    );

    assert_eq!(env.open_total(created.order_id, a).await, 3);
    assert!(env.open_instance(created.order_id, Stage::Embroidery).await.is_none());
}

#[tokio::test]
async fn delivery_requires_invoice_data() {
    let env = TestEnv::new().await;
    let product = env.seed_product("Coat").await;
    let created = env.create_order(&[(product, 2)]).await;
    let line = created.line_item_ids[0];
    env.walk_to(&created, &[2], Stage::Invoicing).await;

    let bare = request(
        created.order_id,
        Stage::Invoicing,
        Some(Stage::Delivery),
        vec![item(line, 2)],
    );
    assert_matches!(
        env.engine().advance(bare).await,
        Err(ServiceError::InvoiceDataRequired(_))
    );

    let mut blank = request(
        created.order_id,
        Stage::Invoicing,
        Some(Stage::Delivery),
        vec![item(line, 2)],
    );
    blank.invoice = Some(garment_flow::dto::production::InvoiceData {
        number: "  ".into(),
        document_url: "https://files.example.com/x.pdf".into(),
        notes: None,
    });
    assert_matches!(
        env.engine().advance(blank).await,
        Err(ServiceError::InvoiceDataRequired(_))
    );
    assert_eq!(InvoiceEntity::find().count(&*env.db).await.unwrap(), 0);
}

#[tokio::test]
async fn invoiced_delivery_links_the_credited_rows() {
    let mut env = TestEnv::new().await;
    let product = env.seed_product("Blazer").await;
    let created = env.create_order(&[(product, 5)]).await;
    let line = created.line_item_ids[0];
    env.walk_to(&created, &[5], Stage::Invoicing).await;
    env.drain_events();

    let mut req = request(
        created.order_id,
        Stage::Invoicing,
        Some(Stage::Delivery),
        vec![item(line, 5)],
    );
    req.invoice = Some(invoice("F-2024-0001"));
    let outcome = env.engine().advance(req).await.unwrap();
    let invoice_id = outcome.invoice_id.expect("invoice issued");

    let delivery_row = env
        .allocations(created.order_id)
        .await
        .into_iter()
        .find(|(i, _)| i.stage == Stage::Delivery)
        .map(|(_, row)| row)
        .unwrap();
    let links = InvoiceAllocationEntity::find()
        .filter(invoice_allocation::Column::InvoiceId.eq(invoice_id))
        .all(&*env.db)
        .await
        .unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].allocation_id, delivery_row.id);

    let order = OrderEntity::find_by_id(created.order_id)
        .one(&*env.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        order.invoice_proof_url.as_deref(),
        Some("https://files.example.com/F-2024-0001.pdf")
    );

    let events = env.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::InvoiceIssued { number, .. } if number == "F-2024-0001"
    )));
}

#[tokio::test]
async fn duplicate_invoice_number_rolls_back_the_advance() {
    let env = TestEnv::new().await;
    let product = env.seed_product("Polo").await;
    let first = env.create_order(&[(product, 2)]).await;
    let second = env.create_order(&[(product, 3)]).await;
    env.walk_to(&first, &[2], Stage::Invoicing).await;
    env.walk_to(&second, &[3], Stage::Invoicing).await;

    let mut ok = request(
        first.order_id,
        Stage::Invoicing,
        Some(Stage::Delivery),
        vec![item(first.line_item_ids[0], 2)],
    );
    ok.invoice = Some(invoice("F-100"));
    env.engine().advance(ok).await.unwrap();

    let before = env.allocations(second.order_id).await;
    let mut dup = request(
        second.order_id,
        Stage::Invoicing,
        Some(Stage::Delivery),
        vec![item(second.line_item_ids[0], 3)],
    );
    dup.invoice = Some(invoice("F-100"));
    assert_matches!(
        env.engine().advance(dup).await,
        Err(ServiceError::DuplicateInvoiceNumber(_))
    );

    let after = env.allocations(second.order_id).await;
    assert_eq!(before, after);
    assert!(env.open_instance(second.order_id, Stage::Delivery).await.is_none());
    assert_eq!(InvoiceEntity::find().count(&*env.db).await.unwrap(), 1);
}

#[tokio::test]
async fn invoice_write_lock_contention_stays_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display());
    let config = DbConfig {
        url,
        max_connections: 1,
        min_connections: 1,
        statement_timeout: None,
        ..Default::default()
    };
    let holder = db::establish_connection_with_config(&config).await.unwrap();
    db::run_migrations(&holder).await.unwrap();
    let other = db::establish_connection_with_config(&config).await.unwrap();

    let txn = holder.begin().await.unwrap();
    InvoiceGate::issue_invoice(&txn, "A-1", "https://files.example.com/a-1.pdf", None)
        .await
        .unwrap();

    let err = InvoiceGate::issue_invoice(&other, "B-2", "https://files.example.com/b-2.pdf", None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));
    assert!(err.is_retryable());
    assert_eq!(err.reason_code(), "conflict");

    txn.rollback().await.unwrap();
    let issued =
        InvoiceGate::issue_invoice(&other, "B-2", "https://files.example.com/b-2.pdf", None)
            .await
            .unwrap();
    assert_eq!(issued.number, "B-2");
}
