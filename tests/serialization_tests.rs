//! Compact serialization through the registry and over the wire.

use kvgrid::server::{ServerConfig, StoreServer};
use kvgrid::serialization::FieldValue;
use kvgrid::{
  ClientConfig, Codec, CompactReader, CompactSerializer, CompactWriter, Data, DataKind, Error,
  GenericRecord, GridClient, SerializationRegistry,
};

#[derive(Debug, Clone, PartialEq)]
struct City {
  city: String,
  country: String,
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

#[derive(Debug, Clone, PartialEq)]
struct User {
  name: String,
  country: Option<String>,
}

impl Codec for User {}

fn london() -> City {
  City {
    city: "London".to_string(),
    country: "United Kingdom".to_string(),
    population: 9540576,
  }
}

#[test]
fn test_registry_encodes_registered_types() {
  let mut registry = SerializationRegistry::new();
  registry.register(CitySerializer).unwrap();

  let data = london().to_data(&registry).unwrap();
  assert_eq!(data.kind(), DataKind::Compact);

  let record = registry.decode_record(&data).unwrap();
  assert_eq!(record.type_name(), "city");
  assert_eq!(record.field("population"), Some(&FieldValue::Int32(9540576)));

  assert_eq!(City::from_data(&data, &registry).unwrap(), london());
}

#[test]
fn test_unregistered_type_fails() {
  let registry = SerializationRegistry::new();
  let err = london().to_data(&registry).unwrap_err();
  assert!(matches!(err, Error::NoSerializer(_)), "got {err:?}");
}

#[test]
fn test_duplicate_registration_fails() {
  let mut registry = SerializationRegistry::new();
  registry.register(CitySerializer).unwrap();
  let err = registry.register(CitySerializer).unwrap_err();
  assert!(matches!(err, Error::DuplicateSerializer(_)));
}

#[test]
fn test_closure_serializer_with_nullable_field() {
  let mut registry = SerializationRegistry::new();
  registry
    .register_fn(
      "user",
      |writer: &mut CompactWriter, user: &User| {
        writer.write_string("name", &user.name);
        writer.write_nullable_string("country", user.country.as_deref());
        Ok(())
      },
      |reader: &CompactReader| {
        Ok(User {
          name: reader.read_string("name")?,
          country: reader.read_nullable_string("country")?,
        })
      },
    )
    .unwrap();
  assert!(registry.contains("user"));

  let user = User {
    name: "ada".to_string(),
    country: None,
  };
  let data = user.to_data(&registry).unwrap();
  assert_eq!(User::from_data(&data, &registry).unwrap(), user);
}

#[test]
fn test_schema_mismatch_is_reported() {
  let mut registry = SerializationRegistry::new();
  registry.register(CitySerializer).unwrap();
  let person = GenericRecord::new("person").with_field("name", FieldValue::String(Some("x".into())));
  let data = person.to_data(&registry).unwrap();

  let err = City::from_data(&data, &registry).unwrap_err();
  assert!(err.to_string().contains("schema mismatch"), "got {err}");
}

#[test]
fn test_scalar_widening() {
  let registry = SerializationRegistry::new();
  assert_eq!(i64::from_data(&Data::from_i32(5), &registry).unwrap(), 5);
  assert_eq!(f64::from_data(&Data::from_i64(2), &registry).unwrap(), 2.0);
  assert!(i32::from_data(&Data::from_string("5"), &registry).is_err());
  assert_eq!(
    Option::<String>::from_data(&Data::null(), &registry).unwrap(),
    None
  );
}

#[tokio::test]
async fn test_compact_values_over_the_wire() {
  let server = StoreServer::bind("127.0.0.1:0", ServerConfig::default())
    .await
    .unwrap();
  let config = ClientConfig::builder()
    .with_option("kvgrid.networking.addresses", server.address())
    .with(|config| config.add_serializer(CitySerializer))
    .build()
    .unwrap();
  let client = GridClient::connect(config).await.unwrap();

  let cities = client.get_map::<i32, City>("cities");
  cities.put(&1, &london()).await.unwrap();
  assert_eq!(cities.get(&1).await.unwrap(), Some(london()));

  // The same entry read without the domain type.
  let records = client.get_map::<i32, GenericRecord>("cities");
  let record = records.get(&1).await.unwrap().unwrap();
  assert_eq!(
    record.field("city"),
    Some(&FieldValue::String(Some("London".to_string())))
  );

  let users = client.get_map::<i32, User>("users");
  let err = users
    .put(
      &1,
      &User {
        name: "ada".to_string(),
        country: None,
      },
    )
    .await
    .unwrap_err();
  assert!(matches!(err, Error::NoSerializer(_)));
  client.close().await;
}
