//! Registry of compact serializers, keyed by type name and by Rust type.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::compact::{CompactReader, CompactWriter, GenericRecord};
use super::{Data, DataKind};
use crate::error::{Error, Result};

/// Reads and writes one domain type as a compact record.
///
/// ```ignore
/// struct CitySerializer;
///
/// impl CompactSerializer for CitySerializer {
///   type Target = City;
///
///   fn type_name(&self) -> &str {
///     "city"
///   }
///
///   fn read(&self, reader: &CompactReader) -> kvgrid::Result<City> {
///     Ok(City {
///       city: reader.read_string("city")?,
///       country: reader.read_string("country")?,
///       population: reader.read_int32("population")?,
///     })
///   }
///
///   fn write(&self, writer: &mut CompactWriter, value: &City) -> kvgrid::Result<()> {
///     writer.write_string("city", &value.city);
///     writer.write_string("country", &value.country);
///     writer.write_int32("population", value.population);
///     Ok(())
///   }
/// }
/// ```
pub trait CompactSerializer: Send + Sync + 'static {
  type Target: Send + Sync + 'static;

  fn type_name(&self) -> &str;

  fn read(&self, reader: &CompactReader) -> Result<Self::Target>;

  fn write(&self, writer: &mut CompactWriter, value: &Self::Target) -> Result<()>;
}

trait ErasedSerializer: Send + Sync {
  fn type_name(&self) -> &str;
  fn target_name(&self) -> &'static str;
  fn write_any(&self, writer: &mut CompactWriter, value: &dyn Any) -> Result<()>;
  fn read_any(&self, reader: &CompactReader) -> Result<Box<dyn Any>>;
}

impl<S: CompactSerializer> ErasedSerializer for S {
  fn type_name(&self) -> &str {
    CompactSerializer::type_name(self)
  }

  fn target_name(&self) -> &'static str {
    type_name::<S::Target>()
  }

  fn write_any(&self, writer: &mut CompactWriter, value: &dyn Any) -> Result<()> {
    let value = value
      .downcast_ref::<S::Target>()
      .ok_or_else(|| Error::Serialization(format!("value is not a {}", type_name::<S::Target>())))?;
    self.write(writer, value)
  }

  fn read_any(&self, reader: &CompactReader) -> Result<Box<dyn Any>> {
    Ok(Box::new(self.read(reader)?))
  }
}

struct FnSerializer<T, W, R> {
  type_name: String,
  write: W,
  read: R,
  _target: PhantomData<fn() -> T>,
}

impl<T, W, R> CompactSerializer for FnSerializer<T, W, R>
where
  T: Send + Sync + 'static,
  W: Fn(&mut CompactWriter, &T) -> Result<()> + Send + Sync + 'static,
  R: Fn(&CompactReader) -> Result<T> + Send + Sync + 'static,
{
  type Target = T;

  fn type_name(&self) -> &str {
    &self.type_name
  }

  fn read(&self, reader: &CompactReader) -> Result<T> {
    (self.read)(reader)
  }

  fn write(&self, writer: &mut CompactWriter, value: &T) -> Result<()> {
    (self.write)(writer, value)
  }
}

/// Maps type names to compact serializers.
///
/// At most one serializer per type name and per Rust type. The registry is
/// cloned into a client at connect time and never changes afterwards.
#[derive(Clone, Default)]
pub struct SerializationRegistry {
  by_name: HashMap<String, Arc<dyn ErasedSerializer>>,
  by_type: HashMap<TypeId, Arc<dyn ErasedSerializer>>,
}

impl SerializationRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register<S: CompactSerializer>(&mut self, serializer: S) -> Result<()> {
    let name = CompactSerializer::type_name(&serializer).to_string();
    if self.by_name.contains_key(&name) {
      return Err(Error::DuplicateSerializer(name));
    }
    let type_id = TypeId::of::<S::Target>();
    if self.by_type.contains_key(&type_id) {
      return Err(Error::DuplicateSerializer(type_name::<S::Target>().to_string()));
    }
    let erased: Arc<dyn ErasedSerializer> = Arc::new(serializer);
    self.by_name.insert(name, erased.clone());
    self.by_type.insert(type_id, erased);
    Ok(())
  }

  /// Registers a serializer from a pair of closures.
  pub fn register_fn<T, W, R>(&mut self, type_name: impl Into<String>, write: W, read: R) -> Result<()>
  where
    T: Send + Sync + 'static,
    W: Fn(&mut CompactWriter, &T) -> Result<()> + Send + Sync + 'static,
    R: Fn(&CompactReader) -> Result<T> + Send + Sync + 'static,
  {
    self.register(FnSerializer {
      type_name: type_name.into(),
      write,
      read,
      _target: PhantomData,
    })
  }

  pub fn contains(&self, type_name: &str) -> bool {
    self.by_name.contains_key(type_name)
  }

  pub fn type_names(&self) -> impl Iterator<Item = &str> {
    self.by_name.keys().map(String::as_str)
  }

  pub fn encode<T: Any>(&self, value: &T) -> Result<Data> {
    let serializer = self
      .by_type
      .get(&TypeId::of::<T>())
      .ok_or_else(|| Error::NoSerializer(type_name::<T>().to_string()))?;
    let mut writer = CompactWriter::new(serializer.type_name());
    serializer.write_any(&mut writer, value)?;
    Ok(Data::from_compact(&writer.finish().to_bytes()?))
  }

  pub fn decode<T: Any>(&self, data: &Data) -> Result<T> {
    let serializer = self
      .by_type
      .get(&TypeId::of::<T>())
      .ok_or_else(|| Error::NoSerializer(type_name::<T>().to_string()))?;
    let reader = CompactReader::new(self.decode_record(data)?);
    if reader.type_name() != serializer.type_name() {
      return Err(Error::Serialization(format!(
        "schema mismatch: {} expects compact type {}, found {}",
        serializer.target_name(),
        serializer.type_name(),
        reader.type_name()
      )));
    }
    serializer
      .read_any(&reader)?
      .downcast::<T>()
      .map(|boxed| *boxed)
      .map_err(|_| Error::Serialization(format!("serializer did not produce a {}", type_name::<T>())))
  }

  /// Decodes compact data without looking up a serializer.
  pub fn decode_record(&self, data: &Data) -> Result<GenericRecord> {
    match data.kind() {
      DataKind::Compact => GenericRecord::from_bytes(data.payload()),
      other => Err(Error::Serialization(format!("expected COMPACT, found {other}"))),
    }
  }
}

impl fmt::Debug for SerializationRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names: Vec<&str> = self.type_names().collect();
    names.sort_unstable();
    f.debug_struct("SerializationRegistry")
      .field("types", &names)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::serialization::Codec;

  #[derive(Debug, Clone, PartialEq)]
  struct User {
    name: String,
    country: String,
  }

  impl Codec for User {}

  fn registry() -> SerializationRegistry {
    let mut registry = SerializationRegistry::new();
    registry
      .register_fn(
        "user",
        |w: &mut CompactWriter, u: &User| {
          w.write_string("name", &u.name);
          w.write_string("country", &u.country);
          Ok(())
        },
        |r: &CompactReader| {
          Ok(User {
            name: r.read_string("name")?,
            country: r.read_string("country")?,
          })
        },
      )
      .unwrap();
    registry
  }

  #[test]
  fn test_encode_decode_registered_type() {
    let registry = registry();
    let user = User {
      name: "Alice".into(),
      country: "UK".into(),
    };
    let data = user.to_data(&registry).unwrap();
    assert_eq!(data.kind(), DataKind::Compact);
    assert_eq!(User::from_data(&data, &registry).unwrap(), user);
  }

  #[test]
  fn test_duplicate_type_name_is_rejected() {
    let mut registry = registry();
    let err = registry
      .register_fn(
        "user",
        |_: &mut CompactWriter, _: &String| Ok(()),
        |_: &CompactReader| Ok(String::new()),
      )
      .unwrap_err();
    assert!(matches!(err, Error::DuplicateSerializer(name) if name == "user"));
  }

  #[test]
  fn test_duplicate_rust_type_is_rejected() {
    let mut registry = registry();
    let err = registry
      .register_fn(
        "person",
        |_: &mut CompactWriter, _: &User| Ok(()),
        |_: &CompactReader| {
          Ok(User {
            name: String::new(),
            country: String::new(),
          })
        },
      )
      .unwrap_err();
    assert!(matches!(err, Error::DuplicateSerializer(_)));
  }

  #[test]
  fn test_unregistered_type_fails() {
    let registry = SerializationRegistry::new();
    let user = User {
      name: "Bob".into(),
      country: "US".into(),
    };
    assert!(matches!(user.to_data(&registry), Err(Error::NoSerializer(_))));
  }

  #[test]
  fn test_type_name_mismatch_is_schema_error() {
    let registry = registry();
    let other = GenericRecord::new("city");
    let data = Data::from_compact(&other.to_bytes().unwrap());
    let err = User::from_data(&data, &registry).unwrap_err();
    assert!(err.to_string().contains("schema mismatch"));
  }
}
