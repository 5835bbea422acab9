//! Synthetic load generator
//!
//! Submits random time/device/content records through the sink into the
//! aggregator's queue.
//!
//! Usage:
//!   cargo run --bin fakegen [count]
//!
//! Without a count it runs until interrupted.

use dotenv::dotenv;
use env_logger::Env;
use hyperstats::pipeline::{AggregatorConfig, SqliteBackend};
use hyperstats::sink::Sink;
use log::info;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use std::time::Instant;

const PUBLICATIONS: &[&str] = &["Weekly", "Monthly", "Quarterly"];

fn random_id() -> String {
    hex::encode(rand::random::<[u8; 5]>())
}

fn pick<R: Rng>(rng: &mut R, options: &[&'static str]) -> &'static str {
    options.choose(rng).copied().unwrap_or_default()
}

fn fake_record<R: Rng>(rng: &mut R) -> Value {
    json!({
        "id": random_id(),
        "facets": {
            "time": [
                rng.gen_range(2006..=2012),
                rng.gen_range(1..=12),
                rng.gen_range(1..=28),
                rng.gen_range(1..=24),
            ],
            "device": [pick(rng, &["tablet", "phone"]), pick(rng, &["apple", "samsung"])],
            "content": [
                rng.gen_range(10..=15),
                pick(rng, PUBLICATIONS),
                format!("Issue {}", rng.gen_range(1..=20)),
            ],
        },
        "values": {
            "datapoints": 1,
            "view_duration": rng.gen_range(1..=500),
            "revenue": rng.gen_range(1..=10),
        },
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let count: Option<u64> = match std::env::args().nth(1) {
        Some(raw) => Some(raw.parse().map_err(|_| format!("invalid record count: {}", raw))?),
        None => None,
    };

    let config = AggregatorConfig::from_env()?;
    let sink = Sink::new(SqliteBackend::open(&config.db_path, &config.bucket)?, config.queue.clone());

    info!("🚀 Generating records into '{}' ({})", config.queue, config.db_path);

    let started = Instant::now();
    let mut rng = rand::thread_rng();
    let mut sent = 0u64;

    while count.map_or(true, |count| sent < count) {
        sink.submit(&fake_record(&mut rng)).await?;
        sent += 1;

        if sent % 1_000 == 0 {
            info!(
                "📊 {} records sent ({:.1}/sec)",
                sent,
                sent as f64 / started.elapsed().as_secs_f64()
            );
        }
    }

    info!("✅ Sent {} records in {}ms", sent, started.elapsed().as_millis());
    Ok(())
}
