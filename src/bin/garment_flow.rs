use std::{collections::HashMap, fs, path::PathBuf, str::FromStr, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use garment_flow::{
    config::{self, AppConfig},
    db::{self, DbPool},
    dto::production::{
        AdvanceItem, AdvanceRequest, CompleteOrderRequest, InvoiceData, NewOrder,
    },
    entities::Stage,
    events::{self, EventSender},
    services::{
        advancement::AdvancementEngine,
        allocations::AllocationStore,
        collaborators::{DbProductNameLookup, UrlDocumentStore},
        completion::OrderCompletionChecker,
        history::HistoryReader,
        manufacturers::ManufacturerCatalog,
        order_intake::OrderIntakeService,
        stage_catalog,
    },
};
use serde::Serialize;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize().await?;

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&context.db)
                .await
                .context("failed to run migrations")?;
            println!("Migrations applied");
        }
        Commands::CreateOrder(args) => handle_create_order(&context, args, cli.json).await?,
        Commands::Advance(args) => handle_advance(&context, args, cli.json).await?,
        Commands::Complete(args) => handle_complete(&context, args, cli.json).await?,
        Commands::RecordCut(args) => {
            let row = AllocationStore::new(context.db.clone())
                .record_cut(args.allocation, args.quantity)
                .await
                .context("failed to record cut units")?;
            if cli.json {
                print_json(&row)?;
            } else {
                println!(
                    "Allocation {}: {} of {} cut",
                    row.id, row.quantity_cut, row.quantity
                );
            }
        }
        Commands::Deactivate(args) => {
            let cancelled = context
                .intake()
                .deactivate(args.order)
                .await
                .context("failed to deactivate order")?;
            println!("Order {} deactivated, {} instance(s) cancelled", args.order, cancelled);
        }
        Commands::Reactivate(args) => {
            let restored = context
                .intake()
                .reactivate(args.order)
                .await
                .context("failed to reactivate order")?;
            println!("Order {} reactivated, {} instance(s) restored", args.order, restored);
        }
        Commands::Manufacturers => {
            let catalog = ManufacturerCatalog::new(
                context.db.clone(),
                context.config.manufacturer_cache_ttl(),
            )?;
            let list = catalog.list_active().await?;
            if cli.json {
                print_json(&list)?;
            } else {
                for m in list {
                    println!("- {} • {}", m.id, m.name);
                }
            }
        }
        Commands::History(args) => {
            let history = context.history().stage_history(args.order).await?;
            if cli.json {
                print_json(&history)?;
            } else {
                for entry in history {
                    println!(
                        "- [{}] {} • {:?} • owner {} • started {} • {} participation(s)",
                        entry.process_instance_id,
                        entry.stage_name,
                        entry.status,
                        entry.responsible_employee,
                        entry.started_at.format("%Y-%m-%d %H:%M"),
                        entry.participations.len()
                    );
                }
            }
        }
        Commands::AuditLog(args) => {
            let log = context.history().audit_log(args.order).await?;
            if cli.json {
                print_json(&log)?;
            } else {
                for entry in log {
                    println!(
                        "{} {:?} {} (instance {}) by {}",
                        entry.at.format("%Y-%m-%d %H:%M:%S"),
                        entry.kind,
                        entry.stage_name,
                        entry.process_instance_id,
                        entry.employee_id
                    );
                }
            }
        }
        Commands::LineItems(args) => {
            let lines = context.history().order_line_items(args.order).await?;
            if cli.json {
                print_json(&lines)?;
            } else {
                for line in lines {
                    let distribution = line
                        .distribution
                        .iter()
                        .map(|d| format!("{}={}", d.stage_name, d.quantity))
                        .collect::<Vec<_>>()
                        .join(", ");
                    println!(
                        "- line {} • {} • {}/{} delivered • {}",
                        line.line_item_id,
                        line.product_name,
                        line.delivered_quantity,
                        line.total_quantity,
                        distribution
                    );
                }
            }
        }
        Commands::StageItems(args) => {
            let stage = parse_stage(args.stage)?;
            let items = context.history().items_in_stage(args.order, stage).await?;
            if cli.json {
                print_json(&items)?;
            } else {
                for item in items {
                    println!(
                        "- allocation {} • line {} • {} • qty {} • manufacturer {}",
                        item.allocation_id,
                        item.line_item_id,
                        item.product_name,
                        item.quantity,
                        item.manufacturer_name.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "garment-flow",
    about = "Advance garment production orders through their stages",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Create an order from a JSON file
    CreateOrder(CreateOrderArgs),
    /// Move quantities from one stage to the next
    Advance(AdvanceArgs),
    /// Complete an order whose units all sit in delivery
    Complete(CompleteArgs),
    /// Record units cut on a cutting allocation
    RecordCut(RecordCutArgs),
    Deactivate(OrderArgs),
    Reactivate(OrderArgs),
    /// List active manufacturers
    Manufacturers,
    History(OrderArgs),
    AuditLog(OrderArgs),
    LineItems(OrderArgs),
    StageItems(StageItemsArgs),
}

#[derive(Args)]
struct OrderArgs {
    #[arg(long, help = "Order identifier")]
    order: i32,
}

#[derive(Args)]
struct CreateOrderArgs {
    #[arg(long, help = "Path to a JSON order document")]
    file: PathBuf,
}

#[derive(Args)]
struct AdvanceArgs {
    #[arg(long)]
    order: i32,
    #[arg(long, help = "Source stage number (1-7)")]
    from: i32,
    #[arg(long, help = "Destination stage number; omit when every item is split")]
    to: Option<i32>,
    #[arg(long)]
    employee: String,
    #[arg(
        long = "item",
        required = true,
        help = "LINE_ITEM:QTY[:MANUFACTURER[:ALLOCATION]], repeatable"
    )]
    items: Vec<ItemSpec>,
    #[arg(long = "split", help = "LINE_ITEM=STAGE destination override, repeatable")]
    splits: Vec<SplitSpec>,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    invoice_number: Option<String>,
    #[arg(long, help = "Uploaded proof-of-invoice reference or URL")]
    invoice_document: Option<String>,
    #[arg(long)]
    invoice_notes: Option<String>,
}

#[derive(Args)]
struct CompleteArgs {
    #[arg(long)]
    order: i32,
    #[arg(long)]
    employee: String,
    #[arg(long, default_value_t = 7, help = "Delivery stage number")]
    stage: i32,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Args)]
struct RecordCutArgs {
    #[arg(long)]
    allocation: i32,
    #[arg(long)]
    quantity: i32,
}

#[derive(Args)]
struct StageItemsArgs {
    #[arg(long)]
    order: i32,
    #[arg(long, help = "Stage number (1-7)")]
    stage: i32,
}

#[derive(Debug, Clone)]
struct ItemSpec(AdvanceItem);

impl FromStr for ItemSpec {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        if !(2..=4).contains(&parts.len()) {
            return Err(anyhow!(
                "expected LINE_ITEM:QTY[:MANUFACTURER[:ALLOCATION]], got '{}'",
                raw
            ));
        }
        let optional = |index: usize| -> Result<Option<i32>> {
            match parts.get(index) {
                Some(value) if !value.is_empty() => Ok(Some(value.parse()?)),
                _ => Ok(None),
            }
        };
        Ok(Self(AdvanceItem {
            line_item_id: parts[0].parse().context("invalid line item id")?,
            quantity: parts[1].parse().context("invalid quantity")?,
            manufacturer_id: optional(2).context("invalid manufacturer id")?,
            allocation_id: optional(3).context("invalid allocation id")?,
        }))
    }
}

#[derive(Debug, Clone)]
struct SplitSpec(i32, i32);

impl FromStr for SplitSpec {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (line, stage) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("expected LINE_ITEM=STAGE, got '{}'", raw))?;
        Ok(Self(line.trim().parse()?, stage.trim().parse()?))
    }
}

fn parse_stage(number: i32) -> Result<Stage> {
    Ok(stage_catalog::stage_from_number(number)?)
}

async fn handle_create_order(
    context: &CliContext,
    args: CreateOrderArgs,
    json: bool,
) -> Result<()> {
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let new_order: NewOrder = serde_json::from_str(&raw).context("invalid order document")?;
    let created = context
        .intake()
        .create_order(new_order)
        .await
        .context("failed to create order")?;

    if json {
        print_json(&created)?;
    } else {
        println!(
            "Order {} created with {} line item(s) in intake instance {}",
            created.order_id,
            created.line_item_ids.len(),
            created.intake_instance_id
        );
    }
    Ok(())
}

async fn handle_advance(context: &CliContext, args: AdvanceArgs, json: bool) -> Result<()> {
    let bifurcation = if args.splits.is_empty() {
        None
    } else {
        let mut map = HashMap::with_capacity(args.splits.len());
        for SplitSpec(line, stage) in args.splits {
            map.insert(line, parse_stage(stage)?);
        }
        Some(map)
    };
    let invoice = match (args.invoice_number, args.invoice_document) {
        (Some(number), Some(document_url)) => Some(InvoiceData {
            number,
            document_url,
            notes: args.invoice_notes,
        }),
        (None, None) => None,
        _ => {
            return Err(anyhow!(
                "--invoice-number and --invoice-document must be given together"
            ))
        }
    };

    let request = AdvanceRequest {
        order_id: args.order,
        source_stage: parse_stage(args.from)?,
        destination_stage: args.to.map(parse_stage).transpose()?,
        employee_id: args.employee,
        items: args.items.into_iter().map(|ItemSpec(item)| item).collect(),
        notes: args.notes,
        bifurcation,
        invoice,
    };

    let outcome = context
        .engine()
        .advance(request)
        .await
        .context("advance failed")?;

    if json {
        print_json(&outcome)?;
    } else {
        println!(
            "Advanced from instance {} into {:?}{}",
            outcome.source_instance_id,
            outcome.destination_instance_ids,
            if outcome.source_closed {
                " (source closed)"
            } else {
                ""
            }
        );
        if let Some(invoice_id) = outcome.invoice_id {
            println!("Invoice {} issued", invoice_id);
        }
    }
    Ok(())
}

async fn handle_complete(context: &CliContext, args: CompleteArgs, json: bool) -> Result<()> {
    let request = CompleteOrderRequest {
        order_id: args.order,
        delivery_stage: parse_stage(args.stage)?,
        employee_id: args.employee,
        notes: args.notes,
    };
    let checker =
        OrderCompletionChecker::new(context.db.clone(), Some(context.event_sender.clone()));
    checker
        .complete_order(request)
        .await
        .context("failed to complete order")?;

    if json {
        print_json(&serde_json::json!({ "order_id": args.order, "completed": true }))?;
    } else {
        println!("Order {} completed", args.order);
    }
    Ok(())
}

struct CliContext {
    config: AppConfig,
    db: Arc<DbPool>,
    event_sender: EventSender,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        if config.auto_migrate {
            db::run_migrations(&db_pool)
                .await
                .context("failed to run migrations")?;
        }
        let db = Arc::new(db_pool);

        let (event_sender, event_rx) = EventSender::channel(config.event_channel_capacity);
        tokio::spawn(events::process_events(event_rx));

        Ok(Self {
            config,
            db,
            event_sender,
        })
    }

    fn engine(&self) -> AdvancementEngine {
        AdvancementEngine::new(self.db.clone(), Some(self.event_sender.clone()))
            .with_product_lookup(Arc::new(DbProductNameLookup::new(self.db.clone())))
            .with_document_store(Arc::new(UrlDocumentStore::new(
                self.config.document_base_url.clone(),
            )))
            .with_product_lookup_timeout(self.config.product_lookup_timeout())
    }

    fn intake(&self) -> OrderIntakeService {
        OrderIntakeService::new(self.db.clone(), Some(self.event_sender.clone()))
    }

    fn history(&self) -> HistoryReader {
        HistoryReader::new(self.db.clone())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
