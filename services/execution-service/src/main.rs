//! Execution Service binary
//!
//! Opens the event store, registers simulated venues, recovers state and
//! runs the workers until Ctrl-C. `--demo` places and fills one order.

use anyhow::{Context, Result};
use clap::Parser;
use common::{Px, Qty, Side};
use execution_service::config::ServiceConfig;
use execution_service::ExecutionService;
use oms::{AdapterRegistry, OrderRequest, SimulatedExchange};
use positions::{Fill, PriceCache};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::{EventStore, MemoryEventStore, SqliteEventStore};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "execution-service";

#[derive(Parser, Debug)]
#[clap(name = "execution-service")]
#[clap(about = "HFT execution core: order lifecycle, positions and event-sourced recovery")]
struct Cli {
    /// TOML configuration file
    #[clap(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG
    #[clap(long)]
    log_level: Option<String>,

    /// Place and fill one demo order, then exit
    #[clap(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));

    let config = ServiceConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let store = open_store(&config).await?;

    let mut adapters = AdapterRegistry::new();
    for exchange in &config.exchanges {
        adapters.register(Arc::new(SimulatedExchange::new(exchange.as_str())));
    }

    let prices = Arc::new(PriceCache::new(Duration::from_millis(config.positions.price_max_age_ms)));
    let service = ExecutionService::new(config, adapters, store, prices).context("building execution service")?;

    let report = service.recover().await.context("recovering state")?;
    if report.orders.discrepancies_found > 0 {
        warn!("{} recovered orders need reconciliation", report.orders.discrepancies_found);
    }

    service.start().context("starting workers")?;

    if cli.demo {
        run_demo(&service).await?;
    } else {
        info!("Running, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        info!("Shutdown requested");
    }

    service.stop().await;
    let metrics = service.metrics();
    info!(
        "Final metrics: {}",
        serde_json::to_string(&metrics).context("serializing metrics")?
    );
    Ok(())
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!(
                "{}=info,oms=info,positions=info,storage=info,perf=info",
                SERVICE_NAME.replace('-', "_")
            )
            .into()
        }),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_thread_names(true),
        )
        .init();
}

async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn EventStore>> {
    if config.store.is_memory() {
        info!("Using in-memory event store");
        return Ok(Arc::new(MemoryEventStore::new()));
    }

    let store = SqliteEventStore::connect(&config.store.url)
        .await
        .with_context(|| format!("connecting to {}", config.store.url))?;
    store.run_migrations().await.context("running store migrations")?;
    info!("Using SQLite event store at {}", config.store.url);
    Ok(Arc::new(store))
}

async fn run_demo(service: &ExecutionService) -> Result<()> {
    let exchange = service
        .config()
        .exchanges
        .first()
        .cloned()
        .context("no exchange configured")?;

    let order = service
        .place_order(OrderRequest::limit(
            "demo",
            "BTC-USD",
            exchange.as_str(),
            Side::Buy,
            Qty::from_int(1),
            Px::from_int(50_000),
        ))
        .await
        .context("placing demo order")?;
    info!("Demo order {} is {}", order.id, order.status);

    service.prices().update("BTC-USD", &exchange, Px::from_int(50_100));
    let mut updates = service.subscribe_positions();
    service.submit_fill(Fill::new(
        order.id,
        "demo-fill-1",
        "BTC-USD",
        exchange.as_str(),
        Side::Buy,
        Qty::from_int(1),
        Px::from_int(50_000),
    ));

    let position = tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .context("no position update within 5s")?
        .context("position stream closed")?;
    info!(
        "Demo position {}: {} @ {}, unrealized {}",
        position.key, position.size, position.entry_price, position.unrealized_pnl
    );

    let order = service.get_order(order.id).context("reading demo order")?;
    info!("Demo order {} finished as {}", order.id, order.status);
    Ok(())
}
