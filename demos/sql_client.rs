//! Creates a SQL mapping over a map of compact `city` records, fills it with
//! SQL and the map API, then reads it back with a query.
//!
//! ```text
//! cargo run --example sql_client -- \
//!     kvgrid.clusterName=<name> \
//!     kvgrid.networking.cloud.discoveryToken=<token> \
//!     kvgrid.networking.ssl.enabled=true \
//!     kvgrid.networking.ssl.certificatePath=client.pfx \
//!     kvgrid.networking.ssl.certificatePassword=<password>
//! ```

use clap::Parser;
use futures::TryStreamExt;
use kvgrid::{
  ClientConfig, CompactReader, CompactSerializer, CompactWriter, GridClient, TlsProtocol,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sql_client", about = "Maps compact city records and queries them over TLS")]
struct Args {
  /// Client options as `kvgrid.<key>=<value>`
  options: Vec<String>,
}

#[derive(Debug, Clone)]
struct City {
  country: String,
  city: String,
  population: i32,
}

impl kvgrid::Codec for City {}

struct CitySerializer;

impl CompactSerializer for CitySerializer {
  type Target = City;

  fn type_name(&self) -> &str {
    "city"
  }

  fn read(&self, reader: &CompactReader) -> kvgrid::Result<City> {
    Ok(City {
      city: reader.read_string("city")?,
      country: reader.read_string("country")?,
      population: reader.read_int32("population")?,
    })
  }

  fn write(&self, writer: &mut CompactWriter, value: &City) -> kvgrid::Result<()> {
    writer.write_string("city", &value.city);
    writer.write_string("country", &value.country);
    writer.write_int32("population", value.population);
    Ok(())
  }
}

const CREATE_MAPPING: &str = "CREATE OR REPLACE MAPPING
    cities (
        __key INT,
        country VARCHAR,
        city VARCHAR,
        population INT) TYPE IMAP
    OPTIONS (
        'keyFormat' = 'int',
        'valueFormat' = 'compact',
        'valueCompactTypeName' = 'city')";

const INSERT_CITIES: &str = "INSERT INTO cities
    (__key, city, country, population) VALUES
    (1, 'London', 'United Kingdom', 9540576),
    (2, 'Manchester', 'United Kingdom', 2770434),
    (3, 'New York', 'United States', 19223191),
    (4, 'Los Angeles', 'United States', 3985520),
    (5, 'Istanbul', 'Türkiye', 15636243),
    (6, 'Ankara', 'Türkiye', 5309690),
    (7, 'Sao Paulo ', 'Brazil', 22429800)";

fn init_logging() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kvgrid=info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn populate_cities(client: &GridClient) -> kvgrid::Result<()> {
  println!("Inserting cities into 'cities' map...");
  // Rows survive from earlier runs, so a duplicate key here is expected.
  if let Err(e) = client.sql().execute_command(INSERT_CITIES).await {
    warn!("Insert failed: {}", e);
    println!("FAILED. {e}");
  }

  println!("Putting a city into 'cities' map...");
  let map = client.get_map::<i32, City>("cities");
  map
    .put(
      &8,
      &City {
        city: "Rio de Janeiro".to_string(),
        country: "Brazil".to_string(),
        population: 13634274,
      },
    )
    .await?;
  println!("OK.");
  Ok(())
}

async fn fetch_cities(client: &GridClient) -> kvgrid::Result<()> {
  println!("Fetching cities via SQL...");
  let result = client
    .sql()
    .execute_query("SELECT __key, this FROM cities")
    .await?;
  println!("--Results of 'SELECT __key, this FROM cities'");
  println!(
    "| {:>4} | {:>20} | {:>20} | {:>15} |",
    "id", "country", "city", "population"
  );

  let rows: Vec<_> = result.into_stream().try_collect().await?;
  for row in rows {
    let id: i32 = row.get_key()?;
    let city: City = row.get_value()?;
    println!(
      "| {:>4} | {:>20} | {:>20} | {:>15} |",
      id, city.country, city.city, city.population
    );
  }
  Ok(())
}

async fn run(client: &GridClient) -> kvgrid::Result<()> {
  println!("Creating the mapping...");
  client.sql().execute_command(CREATE_MAPPING).await?;
  println!("OK.");

  populate_cities(client).await?;
  fetch_cities(client).await?;

  if let Some(stats) = client.statistics() {
    println!("{} invocations, {} failures", stats.invocations, stats.failures);
  }
  Ok(())
}

#[tokio::main]
async fn main() -> kvgrid::Result<()> {
  let args = Args::parse();
  init_logging();
  println!("Connect to kvgrid over TLS");

  let config = ClientConfig::builder()
    .with(|config| {
      config.metrics.enabled = true;
      config.networking.ssl.enabled = true;
      config.networking.ssl.validate_certificate_chain = false;
      config.networking.ssl.protocol = TlsProtocol::Tls12;
      config.add_serializer(CitySerializer)
    })
    .with_args(&args.options)
    .build()?;

  println!("Get and connect client...");
  let client = GridClient::connect(config).await?;
  println!("Connection successful!");

  let result = run(&client).await;
  client.close().await;
  result?;
  println!("Done.");
  Ok(())
}
