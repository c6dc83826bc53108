//! Compact records: named, typed fields that can be written and read in any
//! order.
//!
//! Layout of a record body:
//! - type name: u16 length + UTF-8
//! - field count: u16
//! - per field: u16 name length + UTF-8 name, u8 [`FieldKind`], value
//!
//! Values are big-endian. Strings are an i32 length (`-1` for null) followed
//! by UTF-8 bytes. The layout is self-describing, so a record can be inspected
//! as a [`GenericRecord`] without the serializer that produced it.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Type of a compact field.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
  Boolean = 0x01,
  Int32 = 0x02,
  Int64 = 0x03,
  Float64 = 0x04,
  String = 0x05,
}

impl TryFrom<u8> for FieldKind {
  type Error = ();
  fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
    match v {
      0x01 => Ok(Self::Boolean),
      0x02 => Ok(Self::Int32),
      0x03 => Ok(Self::Int64),
      0x04 => Ok(Self::Float64),
      0x05 => Ok(Self::String),
      _ => Err(()),
    }
  }
}

impl fmt::Display for FieldKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      FieldKind::Boolean => "boolean",
      FieldKind::Int32 => "int32",
      FieldKind::Int64 => "int64",
      FieldKind::Float64 => "float64",
      FieldKind::String => "string",
    };
    f.write_str(name)
  }
}

/// Value of a compact field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
  Boolean(bool),
  Int32(i32),
  Int64(i64),
  Float64(f64),
  String(Option<String>),
}

impl FieldValue {
  pub fn kind(&self) -> FieldKind {
    match self {
      FieldValue::Boolean(_) => FieldKind::Boolean,
      FieldValue::Int32(_) => FieldKind::Int32,
      FieldValue::Int64(_) => FieldKind::Int64,
      FieldValue::Float64(_) => FieldKind::Float64,
      FieldValue::String(_) => FieldKind::String,
    }
  }
}

/// A decoded compact record, independent of any Rust type.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericRecord {
  type_name: String,
  fields: Vec<(String, FieldValue)>,
}

impl GenericRecord {
  pub fn new(type_name: impl Into<String>) -> Self {
    Self {
      type_name: type_name.into(),
      fields: Vec::new(),
    }
  }

  /// Sets a field, replacing any earlier value with the same name.
  pub fn set(&mut self, name: &str, value: FieldValue) {
    match self.fields.iter_mut().find(|(n, _)| n == name) {
      Some((_, slot)) => *slot = value,
      None => self.fields.push((name.to_string(), value)),
    }
  }

  pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
    self.set(name, value);
    self
  }

  pub fn type_name(&self) -> &str {
    &self.type_name
  }

  pub fn field(&self, name: &str) -> Option<&FieldValue> {
    self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
  }

  pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
    self.fields.iter().map(|(n, v)| (n.as_str(), v))
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    put_short_str(&mut buf, &self.type_name)?;
    let count = u16::try_from(self.fields.len())
      .map_err(|_| Error::Serialization("too many compact fields".to_string()))?;
    buf.put_u16(count);
    for (name, value) in &self.fields {
      put_short_str(&mut buf, name)?;
      buf.put_u8(value.kind() as u8);
      match value {
        FieldValue::Boolean(v) => buf.put_u8(*v as u8),
        FieldValue::Int32(v) => buf.put_i32(*v),
        FieldValue::Int64(v) => buf.put_i64(*v),
        FieldValue::Float64(v) => buf.put_f64(*v),
        FieldValue::String(None) => buf.put_i32(-1),
        FieldValue::String(Some(s)) => {
          let len = i32::try_from(s.len())
            .map_err(|_| Error::Serialization(format!("string field {name} too long")))?;
          buf.put_i32(len);
          buf.put_slice(s.as_bytes());
        }
      }
    }
    Ok(buf)
  }

  pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
    let type_name = get_short_str(&mut buf)?;
    ensure(&buf, 2)?;
    let count = buf.get_u16();
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
      let name = get_short_str(&mut buf)?;
      ensure(&buf, 1)?;
      let tag = buf.get_u8();
      let kind = FieldKind::try_from(tag)
        .map_err(|_| Error::Serialization(format!("unknown field kind 0x{tag:02x} for {name}")))?;
      let value = match kind {
        FieldKind::Boolean => {
          ensure(&buf, 1)?;
          FieldValue::Boolean(buf.get_u8() != 0)
        }
        FieldKind::Int32 => {
          ensure(&buf, 4)?;
          FieldValue::Int32(buf.get_i32())
        }
        FieldKind::Int64 => {
          ensure(&buf, 8)?;
          FieldValue::Int64(buf.get_i64())
        }
        FieldKind::Float64 => {
          ensure(&buf, 8)?;
          FieldValue::Float64(buf.get_f64())
        }
        FieldKind::String => {
          ensure(&buf, 4)?;
          let len = buf.get_i32();
          if len < 0 {
            FieldValue::String(None)
          } else {
            FieldValue::String(Some(get_utf8(&mut buf, len as usize)?))
          }
        }
      };
      fields.push((name, value));
    }
    if buf.has_remaining() {
      return Err(Error::Serialization(format!(
        "{} trailing bytes after compact record",
        buf.remaining()
      )));
    }
    Ok(Self { type_name, fields })
  }
}

fn ensure(buf: &&[u8], n: usize) -> Result<()> {
  if buf.remaining() < n {
    Err(Error::Serialization("truncated compact record".to_string()))
  } else {
    Ok(())
  }
}

fn put_short_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
  let len = u16::try_from(s.len())
    .map_err(|_| Error::Serialization(format!("name too long: {} bytes", s.len())))?;
  buf.put_u16(len);
  buf.put_slice(s.as_bytes());
  Ok(())
}

fn get_short_str(buf: &mut &[u8]) -> Result<String> {
  ensure(buf, 2)?;
  let len = buf.get_u16() as usize;
  get_utf8(buf, len)
}

fn get_utf8(buf: &mut &[u8], len: usize) -> Result<String> {
  ensure(buf, len)?;
  let s = std::str::from_utf8(&buf[..len])
    .map_err(|e| Error::Serialization(format!("invalid UTF-8 in compact record: {e}")))?
    .to_string();
  buf.advance(len);
  Ok(s)
}

/// Field writer handed to compact serializers.
pub struct CompactWriter {
  record: GenericRecord,
}

impl CompactWriter {
  pub(crate) fn new(type_name: &str) -> Self {
    Self {
      record: GenericRecord::new(type_name),
    }
  }

  pub fn write_boolean(&mut self, name: &str, value: bool) {
    self.record.set(name, FieldValue::Boolean(value));
  }

  pub fn write_int32(&mut self, name: &str, value: i32) {
    self.record.set(name, FieldValue::Int32(value));
  }

  pub fn write_int64(&mut self, name: &str, value: i64) {
    self.record.set(name, FieldValue::Int64(value));
  }

  pub fn write_float64(&mut self, name: &str, value: f64) {
    self.record.set(name, FieldValue::Float64(value));
  }

  pub fn write_string(&mut self, name: &str, value: &str) {
    self.record.set(name, FieldValue::String(Some(value.to_string())));
  }

  pub fn write_nullable_string(&mut self, name: &str, value: Option<&str>) {
    self
      .record
      .set(name, FieldValue::String(value.map(str::to_string)));
  }

  pub(crate) fn finish(self) -> GenericRecord {
    self.record
  }
}

/// Field reader handed to compact serializers.
///
/// Reading a missing field or a field of another kind is an error; use
/// [`field_kind`](Self::field_kind) or the `*_or` variants to default fields
/// that older writers did not produce.
pub struct CompactReader {
  record: GenericRecord,
}

impl CompactReader {
  pub(crate) fn new(record: GenericRecord) -> Self {
    Self { record }
  }

  pub fn type_name(&self) -> &str {
    self.record.type_name()
  }

  pub fn field_kind(&self, name: &str) -> Option<FieldKind> {
    self.record.field(name).map(FieldValue::kind)
  }

  fn get(&self, name: &str) -> Result<&FieldValue> {
    self.record.field(name).ok_or_else(|| {
      Error::Serialization(format!(
        "field {name} not found in compact type {}",
        self.record.type_name()
      ))
    })
  }

  fn mismatch(&self, name: &str, found: &FieldValue, expected: FieldKind) -> Error {
    Error::Serialization(format!(
      "field {name} of compact type {} is {}, not {expected}",
      self.record.type_name(),
      found.kind()
    ))
  }

  pub fn read_boolean(&self, name: &str) -> Result<bool> {
    match self.get(name)? {
      FieldValue::Boolean(v) => Ok(*v),
      other => Err(self.mismatch(name, other, FieldKind::Boolean)),
    }
  }

  pub fn read_int32(&self, name: &str) -> Result<i32> {
    match self.get(name)? {
      FieldValue::Int32(v) => Ok(*v),
      other => Err(self.mismatch(name, other, FieldKind::Int32)),
    }
  }

  pub fn read_int64(&self, name: &str) -> Result<i64> {
    match self.get(name)? {
      FieldValue::Int64(v) => Ok(*v),
      other => Err(self.mismatch(name, other, FieldKind::Int64)),
    }
  }

  pub fn read_float64(&self, name: &str) -> Result<f64> {
    match self.get(name)? {
      FieldValue::Float64(v) => Ok(*v),
      other => Err(self.mismatch(name, other, FieldKind::Float64)),
    }
  }

  pub fn read_nullable_string(&self, name: &str) -> Result<Option<String>> {
    match self.get(name)? {
      FieldValue::String(v) => Ok(v.clone()),
      other => Err(self.mismatch(name, other, FieldKind::String)),
    }
  }

  /// Reads a non-null string.
  pub fn read_string(&self, name: &str) -> Result<String> {
    self
      .read_nullable_string(name)?
      .ok_or_else(|| Error::Serialization(format!("field {name} is null")))
  }

  pub fn read_int32_or(&self, name: &str, default: i32) -> Result<i32> {
    match self.field_kind(name) {
      None => Ok(default),
      Some(_) => self.read_int32(name),
    }
  }

  pub fn read_int64_or(&self, name: &str, default: i64) -> Result<i64> {
    match self.field_kind(name) {
      None => Ok(default),
      Some(_) => self.read_int64(name),
    }
  }

  pub fn read_string_or(&self, name: &str, default: &str) -> Result<String> {
    match self.field_kind(name) {
      None => Ok(default.to_string()),
      Some(_) => Ok(self.read_nullable_string(name)?.unwrap_or_else(|| default.to_string())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn city() -> GenericRecord {
    GenericRecord::new("city")
      .with_field("city", FieldValue::String(Some("London".into())))
      .with_field("country", FieldValue::String(Some("United Kingdom".into())))
      .with_field("population", FieldValue::Int32(9_540_576))
  }

  #[test]
  fn test_record_bytes_round_trip() {
    let record = city();
    let bytes = record.to_bytes().unwrap();
    let back = GenericRecord::from_bytes(&bytes).unwrap();
    assert_eq!(back, record);
    assert_eq!(back.type_name(), "city");
  }

  #[test]
  fn test_truncated_record_is_rejected() {
    let bytes = city().to_bytes().unwrap();
    let err = GenericRecord::from_bytes(&bytes[..bytes.len() - 2]).unwrap_err();
    assert!(err.to_string().contains("truncated"));
  }

  #[test]
  fn test_set_replaces_existing_field() {
    let mut record = city();
    record.set("population", FieldValue::Int32(1));
    assert_eq!(record.fields().count(), 3);
    assert_eq!(record.field("population"), Some(&FieldValue::Int32(1)));
  }

  #[test]
  fn test_reader_reports_missing_and_mismatched_fields() {
    let reader = CompactReader::new(city());
    assert_eq!(reader.read_string("city").unwrap(), "London");
    assert!(reader.read_int32("mayor").is_err());
    assert!(reader.read_int64("population").is_err());
    assert_eq!(reader.read_int32_or("area", 0).unwrap(), 0);
    assert_eq!(reader.read_string_or("mayor", "unknown").unwrap(), "unknown");
  }

  #[test]
  fn test_every_reader_rejects_other_kinds() {
    let reader = CompactReader::new(city());
    let message = |e: Error| e.to_string();
    assert!(message(reader.read_boolean("population").unwrap_err()).contains("not boolean"));
    assert!(message(reader.read_int32("city").unwrap_err()).contains("not int32"));
    assert!(message(reader.read_float64("population").unwrap_err()).contains("not float64"));
    assert!(message(reader.read_nullable_string("population").unwrap_err()).contains("is int32"));
  }

  #[test]
  fn test_null_string_field() {
    let mut writer = CompactWriter::new("user");
    writer.write_nullable_string("name", None);
    let record = writer.finish();
    let reader = CompactReader::new(GenericRecord::from_bytes(&record.to_bytes().unwrap()).unwrap());
    assert_eq!(reader.read_nullable_string("name").unwrap(), None);
    assert!(reader.read_string("name").is_err());
  }
}
