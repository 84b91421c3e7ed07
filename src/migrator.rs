use anyhow::Result;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::prelude::*;
use std::time::Duration;
use tracing::{error, info};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_reference_tables::Migration),
            Box::new(m20240301_000002_create_orders_tables::Migration),
            Box::new(m20240301_000003_create_process_ledger_tables::Migration),
            Box::new(m20240301_000004_create_invoice_tables::Migration),
        ]
    }
}

mod m20240301_000001_create_reference_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_reference_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Products::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Manufacturers::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Manufacturers::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Manufacturers::Name).string().not_null())
                        .col(
                            ColumnDef::new(Manufacturers::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Manufacturers::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
        Name,
    }

    #[derive(DeriveIden)]
    enum Manufacturers {
        Table,
        Id,
        Name,
        Active,
    }
}

mod m20240301_000002_create_orders_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_orders_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Orders::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(Orders::ResponsibleEmployee)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Orders::PaymentType).string().not_null())
                        .col(ColumnDef::new(Orders::InvoiceProofUrl).string().null())
                        .col(ColumnDef::new(Orders::Notes).text().null())
                        .col(
                            ColumnDef::new(Orders::Priority)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(LineItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(LineItems::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(LineItems::OrderId).integer().not_null())
                        .col(ColumnDef::new(LineItems::ProductId).integer().not_null())
                        .col(
                            ColumnDef::new(LineItems::TotalQuantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(LineItems::DeliveredQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(LineItems::DeliveryState)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(LineItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_line_items_order_id")
                                .from(LineItems::Table, LineItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_line_items_product_id")
                                .from(LineItems::Table, LineItems::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_line_items_order_id")
                        .table(LineItems::Table)
                        .col(LineItems::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(LineItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Orders {
        Table,
        Id,
        ResponsibleEmployee,
        PaymentType,
        InvoiceProofUrl,
        Notes,
        Priority,
        Active,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum LineItems {
        Table,
        Id,
        OrderId,
        ProductId,
        TotalQuantity,
        DeliveredQuantity,
        DeliveryState,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
    }
}

mod m20240301_000003_create_process_ledger_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_process_ledger_tables"
        }
    }

    /// Partial unique index: one Open instance per (order, stage).
    /// Both SQLite and Postgres accept this statement verbatim.
    const SINGLE_OPEN_INSTANCE_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS \
         uq_process_instances_open_per_stage ON process_instances (order_id, stage) \
         WHERE status = 'open'";

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ProcessInstances::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProcessInstances::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(ProcessInstances::OrderId)
                                .integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ProcessInstances::Stage).integer().not_null())
                        .col(
                            ColumnDef::new(ProcessInstances::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProcessInstances::EmployeeId)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ProcessInstances::Notes).text().null())
                        .col(
                            ColumnDef::new(ProcessInstances::StartedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProcessInstances::EndedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_process_instances_order_id")
                                .from(ProcessInstances::Table, ProcessInstances::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .get_connection()
                .execute_unprepared(SINGLE_OPEN_INSTANCE_INDEX)
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Allocations::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Allocations::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(Allocations::LineItemId)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Allocations::ProcessInstanceId)
                                .integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Allocations::Quantity).integer().not_null())
                        .col(ColumnDef::new(Allocations::ManufacturerId).integer().null())
                        .col(
                            ColumnDef::new(Allocations::QuantityCut)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Allocations::ReceivedAt).date().null())
                        .col(ColumnDef::new(Allocations::DeliveredAt).date().null())
                        .col(
                            ColumnDef::new(Allocations::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Allocations::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::col(Allocations::Quantity).gt(0))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_allocations_line_item_id")
                                .from(Allocations::Table, Allocations::LineItemId)
                                .to(LineItems::Table, LineItems::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_allocations_process_instance_id")
                                .from(Allocations::Table, Allocations::ProcessInstanceId)
                                .to(ProcessInstances::Table, ProcessInstances::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_allocations_manufacturer_id")
                                .from(Allocations::Table, Allocations::ManufacturerId)
                                .to(Manufacturers::Table, Manufacturers::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_allocations_instance_line_item")
                        .table(Allocations::Table)
                        .col(Allocations::ProcessInstanceId)
                        .col(Allocations::LineItemId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(EmployeeParticipations::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(EmployeeParticipations::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(EmployeeParticipations::ProcessInstanceId)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(EmployeeParticipations::EmployeeId)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(EmployeeParticipations::Snapshot)
                                .text()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(EmployeeParticipations::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_employee_participations_instance_id")
                                .from(
                                    EmployeeParticipations::Table,
                                    EmployeeParticipations::ProcessInstanceId,
                                )
                                .to(ProcessInstances::Table, ProcessInstances::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_employee_participations_instance_employee")
                        .table(EmployeeParticipations::Table)
                        .col(EmployeeParticipations::ProcessInstanceId)
                        .col(EmployeeParticipations::EmployeeId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(EmployeeParticipations::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Allocations::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ProcessInstances::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum ProcessInstances {
        Table,
        Id,
        OrderId,
        Stage,
        Status,
        EmployeeId,
        Notes,
        StartedAt,
        EndedAt,
    }

    #[derive(DeriveIden)]
    enum Allocations {
        Table,
        Id,
        LineItemId,
        ProcessInstanceId,
        Quantity,
        ManufacturerId,
        QuantityCut,
        ReceivedAt,
        DeliveredAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum EmployeeParticipations {
        Table,
        Id,
        ProcessInstanceId,
        EmployeeId,
        Snapshot,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
    }

    #[derive(DeriveIden)]
    enum LineItems {
        Table,
        Id,
    }

    #[derive(DeriveIden)]
    enum Manufacturers {
        Table,
        Id,
    }
}

mod m20240301_000004_create_invoice_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_invoice_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Invoices::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Invoices::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(Invoices::Number)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Invoices::DocumentUrl).string().not_null())
                        .col(ColumnDef::new(Invoices::Notes).text().null())
                        .col(
                            ColumnDef::new(Invoices::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(InvoiceAllocations::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InvoiceAllocations::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(InvoiceAllocations::InvoiceId)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InvoiceAllocations::AllocationId)
                                .integer()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_invoice_allocations_invoice_id")
                                .from(InvoiceAllocations::Table, InvoiceAllocations::InvoiceId)
                                .to(Invoices::Table, Invoices::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_invoice_allocations_allocation_id")
                                .from(
                                    InvoiceAllocations::Table,
                                    InvoiceAllocations::AllocationId,
                                )
                                .to(Allocations::Table, Allocations::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_invoice_allocations_pair")
                        .table(InvoiceAllocations::Table)
                        .col(InvoiceAllocations::InvoiceId)
                        .col(InvoiceAllocations::AllocationId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(InvoiceAllocations::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Invoices::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Invoices {
        Table,
        Id,
        Number,
        DocumentUrl,
        Notes,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum InvoiceAllocations {
        Table,
        Id,
        InvoiceId,
        AllocationId,
    }

    #[derive(DeriveIden)]
    enum Allocations {
        Table,
        Id,
    }
}

// Database migration CLI runner
pub async fn run_migration(db_url: &str) -> Result<()> {
    info!("Setting up database connection for migrations");

    let mut opt = ConnectOptions::new(db_url);
    opt.max_connections(2)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;

    info!("Running database migrations");

    match Migrator::up(&db, None).await {
        Ok(_) => {
            info!("Migrations completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Migration failed: {}", e);
            Err(e.into())
        }
    }
}
