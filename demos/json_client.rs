//! Stores serde values as JSON and queries them through a `json-flat`
//! mapping.

use clap::Parser;
use kvgrid::{ClientConfig, GridClient, Json, SqlStatement};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Country {
  name: String,
  iso_code: String,
  population: i64,
}

fn country(name: &str, iso_code: &str, population: i64) -> Country {
  Country {
    name: name.to_string(),
    iso_code: iso_code.to_string(),
    population,
  }
}

#[derive(Parser, Debug)]
#[command(name = "json_client", about = "Queries serde values through a json-flat mapping")]
struct Args {
  /// Client options as `kvgrid.<key>=<value>`
  options: Vec<String>,
}

#[tokio::main]
async fn main() -> kvgrid::Result<()> {
  let args = Args::parse();
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kvgrid=info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let config = ClientConfig::builder()
    .with_args(&args.options)
    .build()?;
  let client = GridClient::connect(config).await?;

  client
    .sql()
    .execute_command(
      "CREATE OR REPLACE MAPPING countries (
          __key VARCHAR,
          name VARCHAR,
          iso_code VARCHAR,
          population BIGINT) TYPE IMAP
       OPTIONS ('keyFormat' = 'varchar', 'valueFormat' = 'json-flat')",
    )
    .await?;

  let map = client.get_map::<String, Json<Country>>("countries");
  for c in [
    country("United Kingdom", "GB", 67_736_802),
    country("United States", "US", 334_914_895),
    country("Türkiye", "TR", 85_372_377),
    country("Brazil", "BR", 203_080_756),
  ] {
    map.put(&c.iso_code.clone(), &Json(c)).await?;
  }

  if let Some(Json(gb)) = map.get(&"GB".to_string()).await? {
    println!("GB is {} with {} people", gb.name, gb.population);
  }

  let mut result = client
    .sql()
    .execute_query(
      SqlStatement::new("SELECT name, population FROM countries WHERE population > ? ORDER BY population DESC")
        .param(100_000_000i64),
    )
    .await?;
  println!("Countries above 100M:");
  while let Some(row) = result.next_row().await? {
    let name: String = row.get("name")?;
    let population: i64 = row.get("population")?;
    println!("  {name:<20} {population:>12}");
  }

  client.close().await;
  println!("Done.");
  Ok(())
}
