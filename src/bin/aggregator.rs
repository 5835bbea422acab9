//! Aggregator daemon
//!
//! Consumes facted records from the SQLite-backed queue, buffers counters
//! for every facet rollup and periodically reconciles them into durable
//! stats. Any number of instances may share one database file.
//!
//! Usage:
//!   cargo run --release --bin aggregator
//!
//! Environment variables: see `AggregatorConfig::from_env` (HYPERSTATS_*).
//! Ctrl-C stops the daemon after the record in flight.

use dotenv::dotenv;
use env_logger::Env;
use hyperstats::pipeline::{
    AggregatorConfig, AggregatorEngine, DaemonContext, QueueConsumer, ReliableBackend, Reconciler, SqliteBackend,
    StopFlag,
};
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    info!("🚀 hyperstats aggregator v{}", env!("CARGO_PKG_VERSION"));

    let config = AggregatorConfig::from_env()?;
    config.log_banner();

    let stop = StopFlag::new();
    let signal_flag = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("🛑 Interrupt received, finishing current record");
                signal_flag.stop();
            }
            Err(e) => error!("❌ Could not listen for interrupt: {}", e),
        }
    });

    info!("🔧 Opening database...");
    let backend = ReliableBackend::new(SqliteBackend::open(&config.db_path, &config.bucket)?, stop.clone());
    info!("✅ Database ready");

    let reconciler = Reconciler::new(backend.clone(), config.reconciler_config());
    let engine = AggregatorEngine::new(backend.clone(), reconciler, config.sync_trigger());
    let mut consumer = QueueConsumer::new(backend, engine, config.consumer_config());
    let mut ctx = DaemonContext::new(stop, config.status_interval());

    consumer.run(&mut ctx).await?;

    info!("✅ Aggregator stopped");
    Ok(())
}
