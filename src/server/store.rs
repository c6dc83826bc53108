//! In-memory state of the reference store: maps, SQL mappings and open
//! cursors.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde_json::{Map as JsonObject, Number, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

use crate::protocol::{ErrorCode, SqlColumn, SqlColumnType, SqlExpectedResult};
use crate::serialization::{Data, DataKind, FieldValue, GenericRecord};
use crate::sql::{KEY_COLUMN, VALUE_COLUMN};

use super::sql::{parse, ColumnType, CreateMapping, Expr, Predicate, Scalar, Statement};
use super::StoreError;

/// Storage format of a mapping's key or value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Format {
  Int,
  Bigint,
  Varchar,
  Boolean,
  Double,
  Compact,
  JsonFlat,
}

impl Format {
  fn parse(text: &str) -> Result<Self, StoreError> {
    match text.to_ascii_lowercase().as_str() {
      "int" | "integer" => Ok(Format::Int),
      "bigint" | "long" => Ok(Format::Bigint),
      "varchar" | "string" => Ok(Format::Varchar),
      "boolean" => Ok(Format::Boolean),
      "double" => Ok(Format::Double),
      "compact" => Ok(Format::Compact),
      "json-flat" => Ok(Format::JsonFlat),
      other => Err(StoreError::new(
        ErrorCode::SqlSyntax,
        format!("unsupported format '{other}'"),
      )),
    }
  }

  fn column_type(self) -> ColumnType {
    match self {
      Format::Int => ColumnType::Integer,
      Format::Bigint => ColumnType::Bigint,
      Format::Varchar => ColumnType::Varchar,
      Format::Boolean => ColumnType::Boolean,
      Format::Double => ColumnType::Double,
      Format::Compact | Format::JsonFlat => ColumnType::Object,
    }
  }

  fn is_scalar(self) -> bool {
    !matches!(self, Format::Compact | Format::JsonFlat)
  }
}

/// A SQL view over one map.
#[derive(Debug, Clone)]
pub(crate) struct Mapping {
  name: String,
  columns: Vec<(String, ColumnType)>,
  key_format: Format,
  value_format: Format,
  compact_type_name: Option<String>,
}

impl Mapping {
  fn from_statement(stmt: &CreateMapping) -> Result<Self, StoreError> {
    let option = |name: &str| {
      stmt
        .options
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
    };
    let missing = |name: &str| {
      StoreError::new(
        ErrorCode::SqlSyntax,
        format!("missing option '{name}' for mapping {}", stmt.name),
      )
    };

    let key_format = Format::parse(option("keyFormat").ok_or_else(|| missing("keyFormat"))?)?;
    let value_format =
      Format::parse(option("valueFormat").ok_or_else(|| missing("valueFormat"))?)?;
    if !key_format.is_scalar() {
      return Err(StoreError::new(
        ErrorCode::SqlSyntax,
        "keyFormat must be a scalar format",
      ));
    }
    let compact_type_name = match value_format {
      Format::Compact => Some(
        option("valueCompactTypeName")
          .ok_or_else(|| missing("valueCompactTypeName"))?
          .to_string(),
      ),
      _ => None,
    };

    let mut columns = stmt.columns.clone();
    if columns.is_empty() {
      if !value_format.is_scalar() {
        return Err(StoreError::new(
          ErrorCode::SqlSyntax,
          format!("mapping {} needs a column list for its value format", stmt.name),
        ));
      }
      columns = vec![
        (KEY_COLUMN.to_string(), key_format.column_type()),
        (VALUE_COLUMN.to_string(), value_format.column_type()),
      ];
    }
    for (i, (name, _)) in columns.iter().enumerate() {
      if columns[..i].iter().any(|(other, _)| other == name) {
        return Err(StoreError::new(
          ErrorCode::SqlSyntax,
          format!("duplicate column '{name}'"),
        ));
      }
    }

    Ok(Self {
      name: stmt.name.clone(),
      columns,
      key_format,
      value_format,
      compact_type_name,
    })
  }

  /// Type of a column; `__key` and `this` resolve even when not declared.
  fn column_type(&self, column: &str) -> Option<ColumnType> {
    if let Some((_, ty)) = self.columns.iter().find(|(name, _)| name == column) {
      return Some(*ty);
    }
    match column {
      KEY_COLUMN => Some(self.key_format.column_type()),
      VALUE_COLUMN => Some(self.value_format.column_type()),
      _ => None,
    }
  }

  fn resolve(&self, column: &str) -> Result<ColumnType, StoreError> {
    self.column_type(column).ok_or_else(|| {
      StoreError::new(
        ErrorCode::SqlSyntax,
        format!("Column '{column}' not found in mapping {}", self.name),
      )
    })
  }

  /// Reads one column from a stored entry.
  fn extract(&self, key: &Data, value: &Data, column: &str) -> Result<Data, StoreError> {
    let ty = self.resolve(column)?;
    let raw = match column {
      KEY_COLUMN => key.clone(),
      VALUE_COLUMN => value.clone(),
      _ => match (self.value_format, value.kind()) {
        (Format::Compact, DataKind::Compact) => {
          let record = GenericRecord::from_bytes(value.payload())?;
          record.field(column).map(field_to_data).unwrap_or_else(Data::null)
        }
        (Format::JsonFlat, DataKind::Json) => {
          let object: JsonValue = serde_json::from_str(value.as_json()?)
            .map_err(|e| StoreError::new(ErrorCode::Serialization, e.to_string()))?;
          object.get(column).map(json_to_data).unwrap_or_else(Data::null)
        }
        _ => Data::null(),
      },
    };
    // Values put through the map API may not match the declared type.
    Ok(ty.coerce(raw.clone(), column).unwrap_or(raw))
  }

  /// Builds a stored entry from insert columns.
  fn build_entry(&self, values: &[(String, Data)]) -> Result<(Data, Data), StoreError> {
    let lookup = |name: &str| values.iter().find(|(c, _)| c == name).map(|(_, v)| v);
    let key = lookup(KEY_COLUMN).filter(|k| !k.is_null()).ok_or_else(|| {
      StoreError::new(
        ErrorCode::SqlTypeMismatch,
        format!("cannot insert into {} without a {KEY_COLUMN} value", self.name),
      )
    })?;
    let key = self.key_format.column_type().coerce(key.clone(), KEY_COLUMN)?;

    let value = match self.value_format {
      Format::Compact => {
        let type_name = self.compact_type_name.as_deref().unwrap_or(&self.name);
        let mut record = match lookup(VALUE_COLUMN) {
          Some(this) if this.kind() == DataKind::Compact => {
            GenericRecord::from_bytes(this.payload())?
          }
          _ => GenericRecord::new(type_name),
        };
        for (column, data) in values {
          if column == KEY_COLUMN || column == VALUE_COLUMN {
            continue;
          }
          let ty = self.resolve(column)?;
          record.set(column, data_to_field(column, ty, data)?);
        }
        Data::from_compact(&record.to_bytes()?)
      }
      Format::JsonFlat => {
        let mut object = JsonObject::new();
        for (column, data) in values {
          if column == KEY_COLUMN || column == VALUE_COLUMN {
            continue;
          }
          self.resolve(column)?;
          object.insert(column.clone(), data_to_json(data)?);
        }
        Data::from_json(&JsonValue::Object(object).to_string())
      }
      scalar => {
        let this = lookup(VALUE_COLUMN).cloned().unwrap_or_else(Data::null);
        scalar.column_type().coerce(this, VALUE_COLUMN)?
      }
    };
    Ok((key, value))
  }

  fn select_columns(&self, projection: &Option<Vec<String>>) -> Result<Vec<SqlColumn>, StoreError> {
    let names: Vec<String> = match projection {
      Some(names) => names.clone(),
      None => self.columns.iter().map(|(name, _)| name.clone()).collect(),
    };
    names
      .into_iter()
      .map(|name| {
        let ty = self.resolve(&name)?;
        Ok(SqlColumn {
          name,
          column_type: ty.sql_type(),
          nullable: true,
        })
      })
      .collect()
  }
}

fn field_to_data(field: &FieldValue) -> Data {
  match field {
    FieldValue::Boolean(b) => Data::from_bool(*b),
    FieldValue::Int32(i) => Data::from_i32(*i),
    FieldValue::Int64(i) => Data::from_i64(*i),
    FieldValue::Float64(f) => Data::from_f64(*f),
    FieldValue::String(Some(s)) => Data::from_string(s),
    FieldValue::String(None) => Data::null(),
  }
}

fn data_to_field(column: &str, ty: ColumnType, data: &Data) -> Result<FieldValue, StoreError> {
  let data = ty.coerce(data.clone(), column)?;
  if data.is_null() && ty != ColumnType::Varchar {
    return Err(StoreError::new(
      ErrorCode::SqlTypeMismatch,
      format!("column {column} of type {ty:?} cannot hold NULL"),
    ));
  }
  Ok(match ty {
    ColumnType::Integer => FieldValue::Int32(data.as_i32()?),
    ColumnType::Bigint => FieldValue::Int64(data.as_i64()?),
    ColumnType::Double => FieldValue::Float64(data.as_f64()?),
    ColumnType::Boolean => FieldValue::Boolean(data.as_bool()?),
    ColumnType::Varchar => FieldValue::String(match data.kind() {
      DataKind::Null => None,
      _ => Some(data.as_str()?.to_string()),
    }),
    ColumnType::Object => {
      return Err(StoreError::new(
        ErrorCode::SqlTypeMismatch,
        format!("column {column} of type OBJECT cannot be stored in a compact field"),
      ))
    }
  })
}

fn json_to_data(value: &JsonValue) -> Data {
  match value {
    JsonValue::Null => Data::null(),
    JsonValue::Bool(b) => Data::from_bool(*b),
    JsonValue::Number(n) => match n.as_i64() {
      Some(i) => Data::from_i64(i),
      None => Data::from_f64(n.as_f64().unwrap_or(f64::NAN)),
    },
    JsonValue::String(s) => Data::from_string(s),
    other => Data::from_json(&other.to_string()),
  }
}

fn data_to_json(data: &Data) -> Result<JsonValue, StoreError> {
  Ok(match data.kind() {
    DataKind::Null => JsonValue::Null,
    DataKind::Boolean => JsonValue::Bool(data.as_bool()?),
    DataKind::Int32 | DataKind::Int64 => JsonValue::Number(data.as_i64()?.into()),
    DataKind::Float64 => Number::from_f64(data.as_f64()?)
      .map(JsonValue::Number)
      .unwrap_or(JsonValue::Null),
    DataKind::String => JsonValue::String(data.as_str()?.to_string()),
    DataKind::Json => serde_json::from_str(data.as_json()?)
      .map_err(|e| StoreError::new(ErrorCode::Serialization, e.to_string()))?,
    DataKind::Compact => {
      return Err(StoreError::new(
        ErrorCode::SqlTypeMismatch,
        "compact values cannot be stored in a json-flat mapping",
      ))
    }
  })
}

/// One page of a SQL result.
#[derive(Debug, Clone)]
pub struct SqlPage {
  pub query_id: Option<Uuid>,
  pub columns: Vec<SqlColumn>,
  pub rows: Vec<Vec<Data>>,
  pub last: bool,
  pub update_count: i64,
}

enum Outcome {
  UpdateCount(u64),
  Rows {
    columns: Vec<SqlColumn>,
    rows: Vec<Vec<Data>>,
  },
}

struct Cursor {
  session: Uuid,
  rows: VecDeque<Vec<Data>>,
}

#[derive(Default)]
struct StoreState {
  maps: HashMap<String, BTreeMap<Data, Data>>,
  mappings: BTreeMap<String, Mapping>,
  cursors: HashMap<Uuid, Cursor>,
}

/// The store behind a [`StoreServer`](super::StoreServer).
///
/// All operations take a single lock, so each is atomic with respect to the
/// others.
#[derive(Default)]
pub struct Store {
  state: Mutex<StoreState>,
}

impl Store {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, StoreState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn put(&self, map: &str, key: Data, value: Data) {
    self
      .lock()
      .maps
      .entry(map.to_string())
      .or_default()
      .insert(key, value);
  }

  pub fn get(&self, map: &str, key: &Data) -> Option<Data> {
    self.lock().maps.get(map).and_then(|m| m.get(key)).cloned()
  }

  pub fn remove(&self, map: &str, key: &Data) -> Option<Data> {
    self.lock().maps.get_mut(map).and_then(|m| m.remove(key))
  }

  pub fn contains_key(&self, map: &str, key: &Data) -> bool {
    self
      .lock()
      .maps
      .get(map)
      .is_some_and(|m| m.contains_key(key))
  }

  pub fn size(&self, map: &str) -> usize {
    self.lock().maps.get(map).map_or(0, BTreeMap::len)
  }

  /// Number of cursors held open for paged query results.
  pub fn open_cursors(&self) -> usize {
    self.lock().cursors.len()
  }

  /// Parses and runs one statement, returning its first page.
  ///
  /// A row result larger than `page_size` leaves a cursor open under the
  /// returned query id until it is drained, closed or its session ends.
  pub fn execute_sql(
    &self,
    session: Uuid,
    sql: &str,
    params: &[Data],
    page_size: usize,
    expected: SqlExpectedResult,
  ) -> Result<SqlPage, StoreError> {
    let (statement, markers) = parse(sql)?;
    if markers != params.len() {
      return Err(StoreError::new(
        ErrorCode::SqlSyntax,
        format!("statement has {markers} parameters but {} were given", params.len()),
      ));
    }
    match (expected, statement.produces_rows()) {
      (SqlExpectedResult::Rows, false) => {
        return Err(StoreError::new(
          ErrorCode::UnexpectedResult,
          "The statement doesn't produce rows",
        ))
      }
      (SqlExpectedResult::UpdateCount, true) => {
        return Err(StoreError::new(
          ErrorCode::UnexpectedResult,
          "The statement doesn't produce an update count",
        ))
      }
      _ => {}
    }

    let mut state = self.lock();
    match state.execute(statement, params)? {
      Outcome::UpdateCount(count) => Ok(SqlPage {
        query_id: None,
        columns: Vec::new(),
        rows: Vec::new(),
        last: true,
        update_count: count as i64,
      }),
      Outcome::Rows { columns, rows } => {
        let mut rows = VecDeque::from(rows);
        let page = take_page(&mut rows, page_size);
        let query_id = if rows.is_empty() {
          None
        } else {
          let id = Uuid::new_v4();
          debug!("Opening cursor {} with {} buffered rows", id, rows.len());
          state.cursors.insert(id, Cursor { session, rows });
          Some(id)
        };
        Ok(SqlPage {
          last: query_id.is_none(),
          query_id,
          columns,
          rows: page,
          update_count: -1,
        })
      }
    }
  }

  /// Returns the next page of an open cursor. The cursor is released once
  /// its last page is handed out.
  pub fn fetch(&self, query_id: Uuid, page_size: usize) -> Result<SqlPage, StoreError> {
    let mut state = self.lock();
    let cursor = state.cursors.get_mut(&query_id).ok_or_else(|| {
      StoreError::new(ErrorCode::QueryNotFound, format!("query {query_id} not found"))
    })?;
    let rows = take_page(&mut cursor.rows, page_size);
    let last = cursor.rows.is_empty();
    if last {
      state.cursors.remove(&query_id);
    }
    Ok(SqlPage {
      query_id: Some(query_id),
      columns: Vec::new(),
      rows,
      last,
      update_count: -1,
    })
  }

  /// Releases a cursor. Unknown ids are ignored.
  pub fn close_query(&self, query_id: Uuid) {
    if self.lock().cursors.remove(&query_id).is_some() {
      debug!("Closed cursor {}", query_id);
    }
  }

  /// Releases every cursor owned by a session.
  pub fn release_session(&self, session: Uuid) {
    self.lock().cursors.retain(|_, cursor| cursor.session != session);
  }
}

fn mapping_not_found(name: &str) -> StoreError {
  StoreError::new(
    ErrorCode::MappingNotFound,
    format!("Object '{name}' not found, did you forget to CREATE MAPPING?"),
  )
}

fn take_page(rows: &mut VecDeque<Vec<Data>>, page_size: usize) -> Vec<Vec<Data>> {
  let n = page_size.max(1).min(rows.len());
  rows.drain(..n).collect()
}

impl StoreState {
  fn mapping(&self, name: &str) -> Result<&Mapping, StoreError> {
    self.mappings.get(name).ok_or_else(|| mapping_not_found(name))
  }

  fn execute(&mut self, statement: Statement, params: &[Data]) -> Result<Outcome, StoreError> {
    match statement {
      Statement::CreateMapping(stmt) => {
        if self.mappings.contains_key(&stmt.name) && !stmt.replace {
          if stmt.if_not_exists {
            return Ok(Outcome::UpdateCount(0));
          }
          return Err(StoreError::new(
            ErrorCode::MappingExists,
            format!("Mapping already exists: {}", stmt.name),
          ));
        }
        let mapping = Mapping::from_statement(&stmt)?;
        debug!("Created mapping {}", mapping.name);
        self.mappings.insert(stmt.name, mapping);
        Ok(Outcome::UpdateCount(0))
      }
      Statement::DropMapping { name, if_exists } => {
        if self.mappings.remove(&name).is_none() && !if_exists {
          return Err(mapping_not_found(&name));
        }
        Ok(Outcome::UpdateCount(0))
      }
      Statement::ShowMappings => Ok(Outcome::Rows {
        columns: vec![SqlColumn {
          name: "name".to_string(),
          column_type: SqlColumnType::Varchar,
          nullable: false,
        }],
        rows: self
          .mappings
          .keys()
          .map(|name| vec![Data::from_string(name)])
          .collect(),
      }),
      Statement::Insert {
        table,
        columns,
        rows,
        overwrite,
      } => self.insert(&table, columns, rows, overwrite, params),
      Statement::Select {
        projection,
        table,
        filter,
        order_by,
        limit,
      } => self.select(&table, projection, &filter, order_by, limit, params),
      Statement::Delete { table, filter } => {
        let mapping = self.mapping(&table)?.clone();
        let Some(entries) = self.maps.get(&table) else {
          return Ok(Outcome::UpdateCount(0));
        };
        let mut doomed = Vec::new();
        for (key, value) in entries {
          if matches_all(&mapping, key, value, &filter, params)? {
            doomed.push(key.clone());
          }
        }
        if let Some(entries) = self.maps.get_mut(&table) {
          for key in &doomed {
            entries.remove(key);
          }
        }
        Ok(Outcome::UpdateCount(doomed.len() as u64))
      }
    }
  }

  fn insert(
    &mut self,
    table: &str,
    columns: Option<Vec<String>>,
    rows: Vec<Vec<Expr>>,
    overwrite: bool,
    params: &[Data],
  ) -> Result<Outcome, StoreError> {
    let mapping = self.mapping(table)?.clone();
    let columns = match columns {
      Some(columns) => {
        for column in &columns {
          mapping.resolve(column)?;
        }
        columns
      }
      None => mapping.columns.iter().map(|(name, _)| name.clone()).collect(),
    };

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
      if row.len() != columns.len() {
        return Err(StoreError::new(
          ErrorCode::SqlSyntax,
          format!("expected {} values, found {}", columns.len(), row.len()),
        ));
      }
      let values = columns
        .iter()
        .zip(row)
        .map(|(column, expr)| Ok((column.clone(), expr.eval(params)?)))
        .collect::<Result<Vec<_>, StoreError>>()?;
      entries.push(mapping.build_entry(&values)?);
    }

    let map = self.maps.entry(table.to_string()).or_default();
    if !overwrite {
      for (i, (key, _)) in entries.iter().enumerate() {
        if map.contains_key(key) || entries[..i].iter().any(|(k, _)| k == key) {
          return Err(StoreError::new(
            ErrorCode::DuplicateKey,
            format!("Duplicate key {key:?} in {table}"),
          ));
        }
      }
    }
    let count = entries.len() as u64;
    map.extend(entries);
    Ok(Outcome::UpdateCount(count))
  }

  fn select(
    &self,
    table: &str,
    projection: Option<Vec<String>>,
    filter: &[Predicate],
    order_by: Option<(String, bool)>,
    limit: Option<Expr>,
    params: &[Data],
  ) -> Result<Outcome, StoreError> {
    let mapping = self.mapping(table)?;
    let columns = mapping.select_columns(&projection)?;
    for predicate in filter {
      mapping.resolve(&predicate.column)?;
    }
    if let Some((column, _)) = &order_by {
      mapping.resolve(column)?;
    }
    let limit = match limit {
      Some(expr) => {
        let n = expr.eval(params)?.as_i64().map_err(|_| {
          StoreError::new(ErrorCode::SqlTypeMismatch, "LIMIT must be an integer")
        })?;
        Some(usize::try_from(n).unwrap_or(0))
      }
      None => None,
    };

    let mut selected = Vec::new();
    if let Some(entries) = self.maps.get(table) {
      for (key, value) in entries {
        if !matches_all(mapping, key, value, filter, params)? {
          continue;
        }
        let sort_key = match &order_by {
          Some((column, _)) => Scalar::from_data(&mapping.extract(key, value, column)?),
          None => Scalar::Null,
        };
        let row = columns
          .iter()
          .map(|c| mapping.extract(key, value, &c.name))
          .collect::<Result<Vec<_>, _>>()?;
        selected.push((sort_key, row));
      }
    }

    if let Some((_, descending)) = order_by {
      selected.sort_by(|(a, _), (b, _)| {
        let ordering = a.sort_cmp(b);
        if descending {
          ordering.reverse()
        } else {
          ordering
        }
      });
    }

    let mut rows: Vec<Vec<Data>> = selected.into_iter().map(|(_, row)| row).collect();
    if let Some(limit) = limit {
      rows.truncate(limit);
    }
    Ok(Outcome::Rows { columns, rows })
  }
}

fn matches_all(
  mapping: &Mapping,
  key: &Data,
  value: &Data,
  filter: &[Predicate],
  params: &[Data],
) -> Result<bool, StoreError> {
  for predicate in filter {
    let column_value = mapping.extract(key, value, &predicate.column)?;
    if !predicate.matches(&column_value, params)? {
      return Ok(false);
    }
  }
  Ok(true)
}

#[cfg(test)]
mod tests {
  use super::*;

  const CITIES: &str = "CREATE MAPPING cities (__key INT, country VARCHAR, city VARCHAR, population INT)
     TYPE IMAP OPTIONS ('keyFormat' = 'int', 'valueFormat' = 'compact', 'valueCompactTypeName' = 'city')";

  fn command(store: &Store, sql: &str) -> Result<i64, StoreError> {
    store
      .execute_sql(Uuid::nil(), sql, &[], 100, SqlExpectedResult::UpdateCount)
      .map(|page| page.update_count)
  }

  fn query(store: &Store, sql: &str, params: &[Data]) -> SqlPage {
    store
      .execute_sql(Uuid::nil(), sql, params, 100, SqlExpectedResult::Rows)
      .unwrap()
  }

  fn cities() -> Store {
    let store = Store::new();
    command(&store, CITIES).unwrap();
    command(
      &store,
      "INSERT INTO cities VALUES (1, 'United Kingdom', 'London', 9540576),
         (2, 'United Kingdom', 'Manchester', 2770434),
         (3, 'United States', 'New York', 19223191)",
    )
    .unwrap();
    store
  }

  #[test]
  fn test_map_operations() {
    let store = Store::new();
    let key = Data::from_string("key");
    assert!(store.get("m", &key).is_none());
    store.put("m", key.clone(), Data::from_string("value"));
    assert!(store.contains_key("m", &key));
    assert_eq!(store.size("m"), 1);
    assert_eq!(store.remove("m", &key), Some(Data::from_string("value")));
    assert_eq!(store.size("m"), 0);
  }

  #[test]
  fn test_insert_stores_compact_records() {
    let store = cities();
    assert_eq!(store.size("cities"), 3);
    let value = store.get("cities", &Data::from_i32(1)).unwrap();
    assert_eq!(value.kind(), DataKind::Compact);
    let record = GenericRecord::from_bytes(value.payload()).unwrap();
    assert_eq!(record.type_name(), "city");
    assert_eq!(
      record.field("city"),
      Some(&FieldValue::String(Some("London".to_string())))
    );
    assert_eq!(record.field("population"), Some(&FieldValue::Int32(9540576)));
  }

  #[test]
  fn test_duplicate_insert_fails_and_sink_overwrites() {
    let store = cities();
    let err = command(&store, "INSERT INTO cities VALUES (1, 'X', 'Y', 1)").unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateKey);
    assert_eq!(store.size("cities"), 3);

    command(&store, "SINK INTO cities VALUES (1, 'X', 'Y', 1)").unwrap();
    let page = query(&store, "SELECT city FROM cities WHERE __key = 1", &[]);
    assert_eq!(page.rows, vec![vec![Data::from_string("Y")]]);
  }

  #[test]
  fn test_select_with_filter_order_and_limit() {
    let store = cities();
    let page = query(
      &store,
      "SELECT city, population FROM cities WHERE country = ? ORDER BY population DESC LIMIT 1",
      &[Data::from_string("United Kingdom")],
    );
    assert_eq!(page.columns.len(), 2);
    assert_eq!(
      page.rows,
      vec![vec![Data::from_string("London"), Data::from_i32(9540576)]]
    );
    assert!(page.last);
    assert!(page.query_id.is_none());
  }

  #[test]
  fn test_select_star_uses_declared_columns() {
    let store = cities();
    let page = query(&store, "SELECT * FROM cities", &[]);
    let names: Vec<_> = page.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["__key", "country", "city", "population"]);
    assert_eq!(page.rows.len(), 3);
  }

  #[test]
  fn test_paging_keeps_cursor_until_drained() {
    let store = cities();
    let session = Uuid::new_v4();
    let first = store
      .execute_sql(session, "SELECT __key FROM cities", &[], 2, SqlExpectedResult::Rows)
      .unwrap();
    assert_eq!(first.rows.len(), 2);
    assert!(!first.last);
    let query_id = first.query_id.unwrap();
    assert_eq!(store.open_cursors(), 1);

    let second = store.fetch(query_id, 2).unwrap();
    assert_eq!(second.rows.len(), 1);
    assert!(second.last);
    assert_eq!(store.open_cursors(), 0);
    assert_eq!(store.fetch(query_id, 2).unwrap_err().code, ErrorCode::QueryNotFound);
  }

  #[test]
  fn test_release_session_drops_its_cursors() {
    let store = cities();
    let session = Uuid::new_v4();
    store
      .execute_sql(session, "SELECT * FROM cities", &[], 1, SqlExpectedResult::Rows)
      .unwrap();
    store
      .execute_sql(Uuid::new_v4(), "SELECT * FROM cities", &[], 1, SqlExpectedResult::Rows)
      .unwrap();
    assert_eq!(store.open_cursors(), 2);
    store.release_session(session);
    assert_eq!(store.open_cursors(), 1);
  }

  #[test]
  fn test_errors() {
    let store = cities();
    assert_eq!(
      command(&store, "DELETE FROM nowhere").unwrap_err().code,
      ErrorCode::MappingNotFound
    );
    assert_eq!(command(&store, CITIES).unwrap_err().code, ErrorCode::MappingExists);
    assert_eq!(
      command(&store, "SELECT * FROM cities").unwrap_err().code,
      ErrorCode::UnexpectedResult
    );
    assert_eq!(
      command(&store, "INSERT INTO cities VALUES (9, 'X', 'Y', 'many')").unwrap_err().code,
      ErrorCode::SqlTypeMismatch
    );
    assert_eq!(
      command(&store, "INSERT INTO cities VALUES (?, 'X', 'Y', 1)").unwrap_err().code,
      ErrorCode::SqlSyntax
    );
  }

  #[test]
  fn test_scalar_mapping_and_delete() {
    let store = Store::new();
    command(
      &store,
      "CREATE MAPPING kv TYPE IMAP OPTIONS ('keyFormat' = 'varchar', 'valueFormat' = 'bigint')",
    )
    .unwrap();
    command(&store, "INSERT INTO kv VALUES ('a', 1), ('b', 2), ('c', 3)").unwrap();
    assert_eq!(
      store.get("kv", &Data::from_string("b")),
      Some(Data::from_i64(2))
    );
    assert_eq!(command(&store, "DELETE FROM kv WHERE this >= 2").unwrap(), 2);
    assert_eq!(store.size("kv"), 1);
  }

  #[test]
  fn test_json_flat_mapping() {
    let store = Store::new();
    command(
      &store,
      "CREATE MAPPING people (__key BIGINT, name VARCHAR, age INT)
         TYPE IMAP OPTIONS ('keyFormat' = 'bigint', 'valueFormat' = 'json-flat')",
    )
    .unwrap();
    command(&store, "INSERT INTO people VALUES (1, 'Ada', 36)").unwrap();
    let value = store.get("people", &Data::from_i64(1)).unwrap();
    assert_eq!(value.kind(), DataKind::Json);
    let page = query(&store, "SELECT name, age FROM people WHERE age > 30", &[]);
    assert_eq!(
      page.rows,
      vec![vec![Data::from_string("Ada"), Data::from_i32(36)]]
    );
  }
}
