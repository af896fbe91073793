mod config;
mod node_cmds;
mod order_cmds;
mod serve_cmd;
mod settlement_cmd;
#[cfg(test)]
mod test_util;
mod worker_cmd;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use uuid::Uuid;

use orderflow_db::models::ProxyTier;
use orderflow_db::pool;

use config::OrderflowConfig;

#[derive(Parser)]
#[command(name = "orderflow", about = "Delivery execution core for large-quantity order fulfillment")]
struct Cli {
    /// Database URL (overrides ORDERFLOW_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an orderflow config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/orderflow")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the orderflow database (requires config file or env vars)
    DbInit,
    /// Order management
    Order {
        #[command(subcommand)]
        command: OrderCommands,
    },
    /// Egress node registry management
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },
    /// Run a delivery worker
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Run a settlement sweep
    Settlement {
        #[command(subcommand)]
        command: SettlementCommands,
    },
    /// Run the admin HTTP surface
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand)]
enum OrderCommands {
    /// Submit a new order
    Submit {
        /// Owning user ID
        #[arg(long)]
        user_id: Uuid,
        /// Service identifier (e.g. "followers")
        #[arg(long)]
        service_id: String,
        /// Total quantity requested
        #[arg(long)]
        quantity: i32,
        /// Price per unit
        #[arg(long)]
        price_per_unit: Decimal,
        /// Delivery target reference (e.g. a URL)
        #[arg(long)]
        target_reference: String,
        /// Optional region hint
        #[arg(long)]
        region: Option<String>,
        /// Optional idempotency key: resubmitting with the same key
        /// returns the existing order instead of creating a duplicate
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Show an order's status and task progress
    Status {
        /// Order ID to show
        order_id: Uuid,
    },
    /// List orders for a user
    List {
        /// Owning user ID
        #[arg(long)]
        user_id: Uuid,
    },
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Register a new egress node
    Register {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        port: i32,
        #[arg(long)]
        tier: ProxyTier,
        #[arg(long)]
        capacity: i32,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        country: Option<String>,
    },
    /// List all registered nodes with current metrics
    List,
    /// Report a dispatch outcome against a node
    ReportMetrics {
        node_id: Uuid,
        #[arg(long)]
        succeeded: bool,
        #[arg(long)]
        banned: bool,
        #[arg(long, default_value_t = 0)]
        latency_ms: i32,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Run a delivery worker until interrupted
    Run {
        /// Worker identity (defaults to a random id)
        #[arg(long)]
        worker_id: Option<String>,
        /// Max tasks claimed per poll
        #[arg(long, default_value_t = 10)]
        batch_size: i64,
        /// Max tasks dispatched concurrently
        #[arg(long, default_value_t = 5)]
        concurrency: usize,
    },
}

#[derive(Subcommand)]
enum SettlementCommands {
    /// Run one settlement sweep
    Run,
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Serve the admin HTTP surface
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
    },
}

/// Execute the `orderflow init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `orderflow db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `orderflow db-init` command: create database and run
/// migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = OrderflowConfig::resolve(cli_db_url)?;

    println!("Initializing orderflow database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("orderflow db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Order { command } => {
            let resolved = OrderflowConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                OrderCommands::Submit {
                    user_id,
                    service_id,
                    quantity,
                    price_per_unit,
                    target_reference,
                    region,
                    idempotency_key,
                } => {
                    order_cmds::submit_order(
                        &db_pool,
                        user_id,
                        &service_id,
                        quantity,
                        price_per_unit,
                        &target_reference,
                        region,
                        idempotency_key,
                    )
                    .await
                }
                OrderCommands::Status { order_id } => {
                    order_cmds::show_order_status(&db_pool, order_id).await
                }
                OrderCommands::List { user_id } => order_cmds::list_orders(&db_pool, user_id).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Node { command } => {
            let resolved = OrderflowConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                NodeCommands::Register {
                    provider,
                    address,
                    port,
                    tier,
                    capacity,
                    region,
                    country,
                } => {
                    node_cmds::register_node(
                        &db_pool, &provider, &address, port, tier, capacity, region, country,
                    )
                    .await
                }
                NodeCommands::List => node_cmds::list_nodes(&db_pool).await,
                NodeCommands::ReportMetrics {
                    node_id,
                    succeeded,
                    banned,
                    latency_ms,
                } => node_cmds::report_metrics(&db_pool, node_id, succeeded, banned, latency_ms).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Worker { command } => {
            let resolved = OrderflowConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                WorkerCommands::Run {
                    worker_id,
                    batch_size,
                    concurrency,
                } => worker_cmd::run_worker(&db_pool, worker_id, batch_size, concurrency).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Settlement { command } => {
            let resolved = OrderflowConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                SettlementCommands::Run => settlement_cmd::run_settlement(&db_pool).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Admin { command } => {
            let resolved = OrderflowConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                AdminCommands::Serve { bind, port } => {
                    serve_cmd::run_serve(db_pool.clone(), &bind, port).await
                }
            };
            db_pool.close().await;
            result.context("admin server exited with an error")?;
        }
    }

    Ok(())
}
