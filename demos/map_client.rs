//! Connects to a store, then puts and gets random values in a map.
//!
//! ```text
//! cargo run --example map_client -- -n1000 \
//!     kvgrid.clusterName=<name> \
//!     kvgrid.networking.addresses=<host:port> \
//!     kvgrid.networking.cloud.discoveryToken=<token> \
//!     kvgrid.networking.ssl.enabled=true
//! ```
//!
//! Set `RUST_LOG=kvgrid=debug` for client logs.

use std::process::ExitCode;

use clap::Parser;
use kvgrid::{ClientConfig, GridClient};
use rand::Rng;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "map_client", about = "Puts and gets random values in a kvgrid map")]
struct Args {
  /// Number of put/get rounds
  #[arg(short = 'n', default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..))]
  count: u32,

  /// Client options as `kvgrid.<key>=<value>`
  options: Vec<String>,
}

fn init_logging() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kvgrid=warn"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .init();
}

#[tokio::main]
async fn main() -> kvgrid::Result<ExitCode> {
  init_logging();
  println!("kvgrid map client");

  let args = Args::parse();
  let total = args.count as usize;

  print!("Build options...");
  let config = ClientConfig::builder()
    .with_args(&args.options)
    .with(|config| {
      if config.networking.ssl.enabled {
        config.networking.ssl.validate_certificate_chain = false;
      }
      Ok(())
    })
    .build()?;
  println!(" ok.");
  println!(
    "Ssl is {}enabled.",
    if config.networking.ssl.enabled { "" } else { "not " }
  );

  print!("Get and connect client...");
  let client = GridClient::connect(config).await?;
  println!(" ok.");

  let map = client.get_map::<String, String>("map");

  print!("Put value into map...");
  map.put(&"key".to_string(), &"value".to_string()).await?;
  println!(" ok.");

  print!("Get value from map...");
  let value = map.get(&"key".to_string()).await?;
  println!(" ok.");

  print!("Validate value...");
  if value.as_deref() != Some("value") {
    println!(" error.");
    println!("Check your configuration.");
    client.close().await;
    return Ok(ExitCode::FAILURE);
  }
  println!(" ok.");

  println!("Put/Get values in/from map with random values...");
  let mut rng = rand::thread_rng();
  let step = (total / 10).max(1);
  for i in 0..total {
    let n: u32 = rng.gen_range(0..100_000);
    map.put(&format!("key_{n}"), &format!("value_{n}")).await?;

    let n: u32 = rng.gen_range(0..100_000);
    map.get(&format!("key_{n}")).await?;

    if i % step == 0 {
      println!("[{:03}] map size: {}", i, map.size().await?);
    }
  }

  client.close().await;
  println!("Done.");
  Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_count_flag() {
    let args = Args::try_parse_from(["map_client", "-n1000", "kvgrid.clusterName=dev"]).unwrap();
    assert_eq!(args.count, 1000);
    assert_eq!(args.options, vec!["kvgrid.clusterName=dev".to_string()]);

    assert_eq!(Args::try_parse_from(["map_client"]).unwrap().count, 100);
    assert!(Args::try_parse_from(["map_client", "-nfoo"]).is_err());
    assert!(Args::try_parse_from(["map_client", "-n0"]).is_err());
  }
}
