//! Query durable stats
//!
//! Usage:
//!   lookup get  '{"device": ["tablet", "apple"]}'
//!   lookup find '{"device": ["tablet"]}' [limit] [start_key] [--values]
//!
//! Results are printed as JSON on stdout.

use dotenv::dotenv;
use env_logger::Env;
use hyperstats::lookup::{find_values, get_values, FindQuery};
use hyperstats::pipeline::{AggregatorConfig, SqliteBackend};
use hyperstats::sink::sanitize_facets;

const USAGE: &str = "usage: lookup get '<facets json>' | lookup find '<facets json>' [limit] [start_key] [--values]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let with_values = match args.iter().position(|a| a == "--values") {
        Some(index) => {
            args.remove(index);
            true
        }
        None => false,
    };

    let (command, raw_facets) = match (args.first(), args.get(1)) {
        (Some(command), Some(facets)) => (command.as_str(), facets.as_str()),
        _ => return Err(USAGE.into()),
    };
    let raw: serde_json::Value = serde_json::from_str(raw_facets)?;
    let facets = sanitize_facets(&raw)?;

    let config = AggregatorConfig::from_env()?;
    let store = SqliteBackend::open(&config.db_path, &config.bucket)?;

    let output = match command {
        "get" => serde_json::to_string_pretty(&get_values(&store, &facets).await?)?,
        "find" => {
            let mut query = FindQuery {
                with_values,
                ..FindQuery::default()
            };
            if let Some(limit) = args.get(2) {
                query.limit = limit.parse().map_err(|_| format!("invalid limit: {}", limit))?;
            }
            query.start_key = args.get(3).cloned();
            serde_json::to_string_pretty(&find_values(&store, &facets, &query).await?)?
        }
        _ => return Err(USAGE.into()),
    };

    println!("{}", output);
    Ok(())
}
