//! SQL tests: mappings, inserts, queries, paging and typed row access.

use std::time::Duration;

use futures::TryStreamExt;
use kvgrid::server::{ServerConfig, StoreServer};
use kvgrid::{
  ClientConfig, Codec, CompactReader, CompactSerializer, CompactWriter, Error, GridClient,
  QueryState, SqlColumnType, SqlStatement,
};

#[derive(Debug, Clone, PartialEq)]
struct City {
  country: String,
  city: String,
  population: i32,
}

impl Codec for City {}

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

async fn start() -> (StoreServer, GridClient) {
  let server = StoreServer::bind("127.0.0.1:0", ServerConfig::default())
    .await
    .unwrap();
  let config = ClientConfig::builder()
    .with_option("kvgrid.networking.addresses", server.address())
    .with(|config| config.add_serializer(CitySerializer))
    .build()
    .unwrap();
  let client = GridClient::connect(config).await.unwrap();
  (server, client)
}

async fn start_with_cities() -> (StoreServer, GridClient) {
  let (server, client) = start().await;
  client.sql().execute_command(CREATE_MAPPING).await.unwrap();
  assert_eq!(client.sql().execute_command(INSERT_CITIES).await.unwrap(), 7);
  (server, client)
}

async fn wait_for_cursors(server: &StoreServer, expected: usize) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  while server.store().open_cursors() != expected {
    assert!(
      tokio::time::Instant::now() < deadline,
      "expected {expected} open cursors, found {}",
      server.store().open_cursors()
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

#[tokio::test]
async fn test_cities_scenario() {
  let (_server, client) = start_with_cities().await;

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
    .await
    .unwrap();

  let result = client
    .sql()
    .execute_query("SELECT __key, this FROM cities")
    .await
    .unwrap();
  let rows: Vec<_> = result.into_stream().try_collect().await.unwrap();
  assert_eq!(rows.len(), 8);

  let mut cities = Vec::new();
  for row in &rows {
    let id: i32 = row.get_key().unwrap();
    let city: City = row.get_value().unwrap();
    cities.push((id, city));
  }
  cities.sort_by_key(|(id, _)| *id);
  assert_eq!(cities[0].1.city, "London");
  assert_eq!(cities[4].1.country, "Türkiye");
  assert_eq!(cities[7].1.city, "Rio de Janeiro");
  assert_eq!(cities[7].1.population, 13634274);
  client.close().await;
}

#[tokio::test]
async fn test_duplicate_insert_fails_but_sink_overwrites() {
  let (_server, client) = start_with_cities().await;

  let err = client.sql().execute_command(INSERT_CITIES).await.unwrap_err();
  assert!(matches!(err, Error::Sql(_)), "got {err:?}");
  assert_eq!(client.get_map::<i32, City>("cities").size().await.unwrap(), 7);

  client
    .sql()
    .execute_command("SINK INTO cities (__key, city, country, population) VALUES (1, 'Londinium', 'Britannia', 30000)")
    .await
    .unwrap();
  let city = client.get_map::<i32, City>("cities").get(&1).await.unwrap().unwrap();
  assert_eq!(city.city, "Londinium");
  client.close().await;
}

#[tokio::test]
async fn test_query_with_params() {
  let (_server, client) = start_with_cities().await;

  let mut result = client
    .sql()
    .execute_query(
      SqlStatement::new(
        "SELECT city, population FROM cities WHERE country = ? AND population > ? ORDER BY population DESC",
      )
      .param("United States".to_string())
      .param(1_000_000),
    )
    .await
    .unwrap();

  let columns = result.row_metadata().columns();
  assert_eq!(columns.len(), 2);
  assert_eq!(columns[1].column_type, SqlColumnType::Integer);

  let first = result.next_row().await.unwrap().unwrap();
  assert_eq!(first.get::<String>("city").unwrap(), "New York");
  assert_eq!(first.get::<i64>("population").unwrap(), 19223191);
  let second = result.next_row().await.unwrap().unwrap();
  assert_eq!(second.get_at::<String>(0).unwrap(), "Los Angeles");
  assert!(result.next_row().await.unwrap().is_none());
  assert_eq!(result.state(), QueryState::Closed);
  client.close().await;
}

#[tokio::test]
async fn test_typed_access_errors() {
  let (_server, client) = start_with_cities().await;
  let mut result = client
    .sql()
    .execute_query("SELECT city, population FROM cities WHERE __key = 1")
    .await
    .unwrap();
  let row = result.next_row().await.unwrap().unwrap();

  assert!(matches!(row.get::<String>("mayor"), Err(Error::ColumnNotFound(_))));
  assert!(matches!(row.get_at::<String>(5), Err(Error::ColumnNotFound(_))));
  match row.get::<String>("population") {
    Err(Error::TypeCoercion { column, .. }) => assert_eq!(column, "population"),
    other => panic!("expected a coercion error, got {other:?}"),
  }
  client.close().await;
}

#[tokio::test]
async fn test_statement_errors() {
  let (_server, client) = start().await;
  let sql = client.sql();

  assert!(matches!(
    sql.execute_query("SELECT * FROM nowhere").await,
    Err(Error::MappingNotFound(_))
  ));
  assert!(matches!(
    sql.execute_command("CREATE MAPPING broken TYPE").await,
    Err(Error::SqlSyntax(_))
  ));

  sql.execute_command(CREATE_MAPPING).await.unwrap();
  assert!(matches!(
    sql.execute_command("SELECT * FROM cities").await,
    Err(Error::Sql(_))
  ));
  assert!(matches!(
    sql.execute_query("DELETE FROM cities").await,
    Err(Error::Sql(_))
  ));
  assert!(matches!(
    sql.execute_query("SELECT mayor FROM cities").await,
    Err(Error::SqlSyntax(_))
  ));
  client.close().await;
}

#[tokio::test]
async fn test_pages_are_fetched_and_cursor_released_on_exhaustion() {
  let (server, client) = start_with_cities().await;

  let mut result = client
    .sql()
    .execute_query(SqlStatement::new("SELECT __key FROM cities").cursor_buffer_size(2))
    .await
    .unwrap();
  assert_eq!(server.store().open_cursors(), 1);

  let mut keys = Vec::new();
  while let Some(row) = result.next_row().await.unwrap() {
    keys.push(row.get_key::<i32>().unwrap());
  }
  assert_eq!(keys, vec![1, 2, 3, 4, 5, 6, 7]);
  assert_eq!(server.store().open_cursors(), 0);
  client.close().await;
}

#[tokio::test]
async fn test_close_releases_cursor() {
  let (server, client) = start_with_cities().await;

  let mut result = client
    .sql()
    .execute_query(SqlStatement::new("SELECT * FROM cities").cursor_buffer_size(3))
    .await
    .unwrap();
  result.next_row().await.unwrap().unwrap();
  assert_eq!(server.store().open_cursors(), 1);

  result.close().await.unwrap();
  result.close().await.unwrap();
  assert_eq!(result.state(), QueryState::Closed);
  assert_eq!(server.store().open_cursors(), 0);
  assert!(result.next_row().await.unwrap().is_none());
  client.close().await;
}

#[tokio::test]
async fn test_dropped_result_releases_cursor() {
  let (server, client) = start_with_cities().await;
  {
    let result = client
      .sql()
      .execute_query(SqlStatement::new("SELECT * FROM cities").cursor_buffer_size(1))
      .await
      .unwrap();
    assert_eq!(result.state(), QueryState::Streaming);
    assert_eq!(server.store().open_cursors(), 1);
  }
  wait_for_cursors(&server, 0).await;
  client.close().await;
}

#[tokio::test]
async fn test_closing_client_releases_session_cursors() {
  let (server, client) = start_with_cities().await;
  let _result = client
    .sql()
    .execute_query(SqlStatement::new("SELECT * FROM cities").cursor_buffer_size(1))
    .await
    .unwrap();
  assert_eq!(server.store().open_cursors(), 1);

  client.close().await;
  wait_for_cursors(&server, 0).await;
}

#[tokio::test]
async fn test_buffered_rows_are_unavailable_after_client_close() {
  let (_server, client) = start_with_cities().await;
  let mut result = client
    .sql()
    .execute_query("SELECT __key FROM cities WHERE __key <= 2")
    .await
    .unwrap();

  client.close().await;
  assert!(matches!(result.next_row().await, Err(Error::ClientClosed)));
  assert!(matches!(result.next_row().await, Err(Error::ClientClosed)));
  result.close().await.unwrap();
}

#[tokio::test]
async fn test_update_counts_and_show_mappings() {
  let (_server, client) = start_with_cities().await;
  let sql = client.sql();

  assert_eq!(
    sql
      .execute_command(SqlStatement::new("DELETE FROM cities WHERE country = ?").param("Türkiye".to_string()))
      .await
      .unwrap(),
    2
  );
  assert_eq!(client.get_map::<i32, City>("cities").size().await.unwrap(), 5);

  let mut result = sql.execute_query("SHOW MAPPINGS").await.unwrap();
  let row = result.next_row().await.unwrap().unwrap();
  assert_eq!(row.get::<String>("name").unwrap(), "cities");

  sql.execute_command("DROP MAPPING cities").await.unwrap();
  assert!(matches!(
    sql.execute_command("DROP MAPPING cities").await,
    Err(Error::MappingNotFound(_))
  ));
  sql.execute_command("DROP MAPPING IF EXISTS cities").await.unwrap();
  client.close().await;
}
