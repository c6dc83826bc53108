//! Value serialization.
//!
//! Every key, value and SQL parameter travels as a [`Data`]: one tag byte
//! followed by the payload. Scalars have built-in codecs; domain types are
//! written either as compact records through a [`SerializationRegistry`] or as
//! JSON text through [`JsonValue`] / [`Json`].

mod compact;
mod registry;

pub use compact::{CompactReader, CompactWriter, FieldKind, FieldValue, GenericRecord};
pub use registry::{CompactSerializer, SerializationRegistry};

use std::fmt;

use serde::de::{DeserializeOwned, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Kind tag stored in the first byte of a [`Data`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
  Null = 0x00,
  Boolean = 0x01,
  Int32 = 0x02,
  Int64 = 0x03,
  Float64 = 0x04,
  String = 0x05,
  Json = 0x06,
  Compact = 0x07,
}

impl TryFrom<u8> for DataKind {
  type Error = ();
  fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
    match v {
      0x00 => Ok(Self::Null),
      0x01 => Ok(Self::Boolean),
      0x02 => Ok(Self::Int32),
      0x03 => Ok(Self::Int64),
      0x04 => Ok(Self::Float64),
      0x05 => Ok(Self::String),
      0x06 => Ok(Self::Json),
      0x07 => Ok(Self::Compact),
      _ => Err(()),
    }
  }
}

impl fmt::Display for DataKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      DataKind::Null => "NULL",
      DataKind::Boolean => "BOOLEAN",
      DataKind::Int32 => "INT32",
      DataKind::Int64 => "INT64",
      DataKind::Float64 => "FLOAT64",
      DataKind::String => "STRING",
      DataKind::Json => "JSON",
      DataKind::Compact => "COMPACT",
    };
    f.write_str(name)
  }
}

/// A serialized value as it travels on the wire.
///
/// Ordering and equality are bytewise, which is how the store compares keys.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Data(Vec<u8>);

impl Data {
  fn tagged(kind: DataKind, payload: &[u8]) -> Self {
    let mut bytes = Vec::with_capacity(payload.len() + 1);
    bytes.push(kind as u8);
    bytes.extend_from_slice(payload);
    Data(bytes)
  }

  /// Wraps raw bytes, checking the kind tag.
  pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
    match bytes.first() {
      None => Err(Error::Serialization("empty data".to_string())),
      Some(tag) => {
        DataKind::try_from(*tag)
          .map_err(|_| Error::Serialization(format!("unknown data kind 0x{tag:02x}")))?;
        Ok(Data(bytes))
      }
    }
  }

  pub fn null() -> Self {
    Data(vec![DataKind::Null as u8])
  }

  pub fn from_bool(v: bool) -> Self {
    Self::tagged(DataKind::Boolean, &[v as u8])
  }

  pub fn from_i32(v: i32) -> Self {
    Self::tagged(DataKind::Int32, &v.to_be_bytes())
  }

  pub fn from_i64(v: i64) -> Self {
    Self::tagged(DataKind::Int64, &v.to_be_bytes())
  }

  pub fn from_f64(v: f64) -> Self {
    Self::tagged(DataKind::Float64, &v.to_bits().to_be_bytes())
  }

  pub fn from_string(v: &str) -> Self {
    Self::tagged(DataKind::String, v.as_bytes())
  }

  /// Raw JSON text. The text is not validated.
  pub fn from_json(text: &str) -> Self {
    Self::tagged(DataKind::Json, text.as_bytes())
  }

  /// A compact record body as produced by [`GenericRecord::to_bytes`].
  pub fn from_compact(body: &[u8]) -> Self {
    Self::tagged(DataKind::Compact, body)
  }

  pub fn kind(&self) -> DataKind {
    // The tag is validated on every construction path.
    self
      .0
      .first()
      .and_then(|tag| DataKind::try_from(*tag).ok())
      .unwrap_or(DataKind::Null)
  }

  pub fn is_null(&self) -> bool {
    self.kind() == DataKind::Null
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  /// Bytes after the kind tag.
  pub fn payload(&self) -> &[u8] {
    self.0.get(1..).unwrap_or(&[])
  }

  fn mismatch(&self, expected: &str) -> Error {
    Error::Serialization(format!("expected {expected}, found {}", self.kind()))
  }

  fn fixed<const N: usize>(&self) -> Result<[u8; N]> {
    self
      .payload()
      .try_into()
      .map_err(|_| Error::Serialization(format!("truncated {} payload", self.kind())))
  }

  pub fn as_bool(&self) -> Result<bool> {
    match self.kind() {
      DataKind::Boolean => Ok(self.fixed::<1>()?[0] != 0),
      _ => Err(self.mismatch("BOOLEAN")),
    }
  }

  pub fn as_i32(&self) -> Result<i32> {
    match self.kind() {
      DataKind::Int32 => Ok(i32::from_be_bytes(self.fixed()?)),
      _ => Err(self.mismatch("INT32")),
    }
  }

  /// Reads an integer, widening `INT32`.
  pub fn as_i64(&self) -> Result<i64> {
    match self.kind() {
      DataKind::Int32 => Ok(i32::from_be_bytes(self.fixed()?) as i64),
      DataKind::Int64 => Ok(i64::from_be_bytes(self.fixed()?)),
      _ => Err(self.mismatch("INT64")),
    }
  }

  /// Reads a float, widening integer kinds.
  pub fn as_f64(&self) -> Result<f64> {
    match self.kind() {
      DataKind::Float64 => Ok(f64::from_bits(u64::from_be_bytes(self.fixed()?))),
      DataKind::Int32 | DataKind::Int64 => Ok(self.as_i64()? as f64),
      _ => Err(self.mismatch("FLOAT64")),
    }
  }

  pub fn as_str(&self) -> Result<&str> {
    match self.kind() {
      DataKind::String => std::str::from_utf8(self.payload())
        .map_err(|e| Error::Serialization(format!("invalid UTF-8 in string: {e}"))),
      _ => Err(self.mismatch("STRING")),
    }
  }

  pub fn as_json(&self) -> Result<&str> {
    match self.kind() {
      DataKind::Json => std::str::from_utf8(self.payload())
        .map_err(|e| Error::Serialization(format!("invalid UTF-8 in JSON: {e}"))),
      _ => Err(self.mismatch("JSON")),
    }
  }
}

impl fmt::Debug for Data {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.kind() {
      DataKind::Null => write!(f, "Data(NULL)"),
      DataKind::String | DataKind::Json => {
        write!(f, "Data({} {:?})", self.kind(), String::from_utf8_lossy(self.payload()))
      }
      _ => write!(f, "Data({} {})", self.kind(), hex::encode(self.payload())),
    }
  }
}

impl Serialize for Data {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_bytes(&self.0)
  }
}

impl<'de> Deserialize<'de> for Data {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    struct DataVisitor;

    impl<'de> Visitor<'de> for DataVisitor {
      type Value = Vec<u8>;

      fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("serialized data bytes")
      }

      fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<Vec<u8>, E> {
        Ok(v.to_vec())
      }

      fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> std::result::Result<Vec<u8>, E> {
        Ok(v)
      }

      fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Vec<u8>, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(b) = seq.next_element::<u8>()? {
          bytes.push(b);
        }
        Ok(bytes)
      }
    }

    let bytes = deserializer.deserialize_byte_buf(DataVisitor)?;
    Data::from_bytes(bytes).map_err(serde::de::Error::custom)
  }
}

/// Conversion between a Rust value and its wire [`Data`].
///
/// Scalars, [`JsonValue`], [`Json`] and [`GenericRecord`] have their own
/// implementations. Domain types opt into compact serialization with an empty
/// impl, which routes through the serializer registered for the type:
///
/// ```ignore
/// impl kvgrid::Codec for City {}
/// ```
pub trait Codec: Sized + Send + Sync + 'static {
  fn to_data(&self, registry: &SerializationRegistry) -> Result<Data> {
    registry.encode(self)
  }

  fn from_data(data: &Data, registry: &SerializationRegistry) -> Result<Self> {
    registry.decode(data)
  }
}

impl Codec for String {
  fn to_data(&self, _: &SerializationRegistry) -> Result<Data> {
    Ok(Data::from_string(self))
  }

  fn from_data(data: &Data, _: &SerializationRegistry) -> Result<Self> {
    data.as_str().map(str::to_string)
  }
}

impl Codec for bool {
  fn to_data(&self, _: &SerializationRegistry) -> Result<Data> {
    Ok(Data::from_bool(*self))
  }

  fn from_data(data: &Data, _: &SerializationRegistry) -> Result<Self> {
    data.as_bool()
  }
}

impl Codec for i32 {
  fn to_data(&self, _: &SerializationRegistry) -> Result<Data> {
    Ok(Data::from_i32(*self))
  }

  fn from_data(data: &Data, _: &SerializationRegistry) -> Result<Self> {
    data.as_i32()
  }
}

impl Codec for i64 {
  fn to_data(&self, _: &SerializationRegistry) -> Result<Data> {
    Ok(Data::from_i64(*self))
  }

  fn from_data(data: &Data, _: &SerializationRegistry) -> Result<Self> {
    data.as_i64()
  }
}

impl Codec for f64 {
  fn to_data(&self, _: &SerializationRegistry) -> Result<Data> {
    Ok(Data::from_f64(*self))
  }

  fn from_data(data: &Data, _: &SerializationRegistry) -> Result<Self> {
    data.as_f64()
  }
}

impl<T: Codec> Codec for Option<T> {
  fn to_data(&self, registry: &SerializationRegistry) -> Result<Data> {
    match self {
      Some(v) => v.to_data(registry),
      None => Ok(Data::null()),
    }
  }

  fn from_data(data: &Data, registry: &SerializationRegistry) -> Result<Self> {
    if data.is_null() {
      Ok(None)
    } else {
      T::from_data(data, registry).map(Some)
    }
  }
}

impl Codec for GenericRecord {
  fn to_data(&self, _: &SerializationRegistry) -> Result<Data> {
    Ok(Data::from_compact(&self.to_bytes()?))
  }

  fn from_data(data: &Data, _: &SerializationRegistry) -> Result<Self> {
    match data.kind() {
      DataKind::Compact => GenericRecord::from_bytes(data.payload()),
      _ => Err(data.mismatch("COMPACT")),
    }
  }
}

/// A value stored as raw JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonValue(String);

impl JsonValue {
  pub fn new(text: impl Into<String>) -> Self {
    Self(text.into())
  }

  /// Serializes any serde value to JSON text.
  pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self> {
    Ok(Self(serde_json::to_string(value)?))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn to_object<T: DeserializeOwned>(&self) -> Result<T> {
    Ok(serde_json::from_str(&self.0)?)
  }
}

impl fmt::Display for JsonValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl Codec for JsonValue {
  fn to_data(&self, _: &SerializationRegistry) -> Result<Data> {
    Ok(Data::from_json(&self.0))
  }

  fn from_data(data: &Data, _: &SerializationRegistry) -> Result<Self> {
    data.as_json().map(|text| JsonValue(text.to_string()))
  }
}

/// Stores any serde type as JSON, without a registered serializer.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T> Codec for Json<T>
where
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
  fn to_data(&self, _: &SerializationRegistry) -> Result<Data> {
    Ok(Data::from_json(&serde_json::to_string(&self.0)?))
  }

  fn from_data(data: &Data, _: &SerializationRegistry) -> Result<Self> {
    Ok(Json(serde_json::from_str(data.as_json()?)?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_scalar_round_trips() {
    let registry = SerializationRegistry::new();
    let data = "value".to_string().to_data(&registry).unwrap();
    assert_eq!(data.kind(), DataKind::String);
    assert_eq!(String::from_data(&data, &registry).unwrap(), "value");

    let data = (-42i32).to_data(&registry).unwrap();
    assert_eq!(i32::from_data(&data, &registry).unwrap(), -42);

    let data = 1.5f64.to_data(&registry).unwrap();
    assert_eq!(f64::from_data(&data, &registry).unwrap(), 1.5);
  }

  #[test]
  fn test_widening_reads() {
    let registry = SerializationRegistry::new();
    let data = Data::from_i32(7);
    assert_eq!(i64::from_data(&data, &registry).unwrap(), 7);
    assert_eq!(f64::from_data(&data, &registry).unwrap(), 7.0);
    assert!(i32::from_data(&Data::from_i64(7), &registry).is_err());
  }

  #[test]
  fn test_option_maps_null() {
    let registry = SerializationRegistry::new();
    let none: Option<String> = None;
    assert!(none.to_data(&registry).unwrap().is_null());
    let back: Option<String> = Codec::from_data(&Data::null(), &registry).unwrap();
    assert!(back.is_none());
    assert!(String::from_data(&Data::null(), &registry).is_err());
  }

  #[test]
  fn test_from_bytes_rejects_unknown_tag() {
    assert!(Data::from_bytes(vec![]).is_err());
    assert!(Data::from_bytes(vec![0x7f]).is_err());
    assert!(Data::from_bytes(vec![0x05, b'a']).is_ok());
  }

  #[test]
  fn test_data_serde_messagepack_and_json() {
    let data = Data::from_string("hello");
    let packed = rmp_serde::to_vec(&data).unwrap();
    let back: Data = rmp_serde::from_slice(&packed).unwrap();
    assert_eq!(back, data);

    let text = serde_json::to_string(&data).unwrap();
    let back: Data = serde_json::from_str(&text).unwrap();
    assert_eq!(back, data);
  }

  #[test]
  fn test_json_wrapper() {
    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Country {
      #[serde(rename = "isoCode")]
      iso_code: String,
      country: String,
    }

    let registry = SerializationRegistry::new();
    let value = Json(Country {
      iso_code: "UK".into(),
      country: "United Kingdom".into(),
    });
    let data = value.to_data(&registry).unwrap();
    assert_eq!(data.as_json().unwrap(), r#"{"isoCode":"UK","country":"United Kingdom"}"#);
    let back = Json::<Country>::from_data(&data, &registry).unwrap();
    assert_eq!(back, value);
  }
}
