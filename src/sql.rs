//! SQL over kvgrid maps.
//!
//! # Example
//!
//! ```no_run
//! # async fn run(client: kvgrid::GridClient) -> kvgrid::Result<()> {
//! use kvgrid::SqlStatement;
//!
//! let sql = client.sql();
//! sql.execute_command("CREATE OR REPLACE MAPPING cities (__key INT, city VARCHAR) \
//!   TYPE IMAP OPTIONS ('keyFormat'='int', 'valueFormat'='compact', 'valueCompactTypeName'='city')")
//!   .await?;
//!
//! let mut result = sql
//!   .execute_query(SqlStatement::new("SELECT city FROM cities WHERE __key = ?").param(1))
//!   .await?;
//! while let Some(row) = result.next_row().await? {
//!   let city: String = row.get("city")?;
//!   println!("{city}");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures::Stream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::{unexpected, ClientInner};
use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, ServerMessage, SqlColumn, SqlExpectedResult};
use crate::serialization::{Codec, Data, SerializationRegistry};

/// Rows fetched per round trip unless a statement says otherwise.
pub const DEFAULT_CURSOR_BUFFER_SIZE: u32 = 4096;

/// Name of the key column.
pub const KEY_COLUMN: &str = "__key";

/// Name of the whole-value column.
pub const VALUE_COLUMN: &str = "this";

type Param = Box<dyn Fn(&SerializationRegistry) -> Result<Data> + Send + Sync>;

/// SQL text with positional parameters.
///
/// Parameters bind to `?` markers left to right.
pub struct SqlStatement {
  sql: String,
  params: Vec<Param>,
  cursor_buffer_size: u32,
}

impl SqlStatement {
  pub fn new(sql: impl Into<String>) -> Self {
    Self {
      sql: sql.into(),
      params: Vec::new(),
      cursor_buffer_size: DEFAULT_CURSOR_BUFFER_SIZE,
    }
  }

  pub fn param<T: Codec>(mut self, value: T) -> Self {
    self.params.push(Box::new(move |registry: &SerializationRegistry| value.to_data(registry)));
    self
  }

  /// Rows per page. Values below 1 are raised to 1.
  pub fn cursor_buffer_size(mut self, size: u32) -> Self {
    self.cursor_buffer_size = size.max(1);
    self
  }

  pub fn sql(&self) -> &str {
    &self.sql
  }

  fn encode_params(&self, registry: &SerializationRegistry) -> Result<Vec<Data>> {
    self.params.iter().map(|p| p(registry)).collect()
  }
}

impl From<&str> for SqlStatement {
  fn from(sql: &str) -> Self {
    Self::new(sql)
  }
}

impl From<String> for SqlStatement {
  fn from(sql: String) -> Self {
    Self::new(sql)
  }
}

impl fmt::Debug for SqlStatement {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SqlStatement")
      .field("sql", &self.sql)
      .field("params", &self.params.len())
      .field("cursor_buffer_size", &self.cursor_buffer_size)
      .finish()
  }
}

/// Entry point for SQL, obtained from [`GridClient::sql`](crate::GridClient::sql).
#[derive(Clone)]
pub struct SqlService {
  client: Arc<ClientInner>,
}

impl SqlService {
  pub(crate) fn new(client: Arc<ClientInner>) -> Self {
    Self { client }
  }

  /// Runs a statement that produces no rows and returns the affected row
  /// count.
  pub async fn execute_command(&self, statement: impl Into<SqlStatement>) -> Result<u64> {
    let statement = statement.into();
    let mut result = self
      .execute(statement, SqlExpectedResult::UpdateCount)
      .await?;
    let count = result.update_count.max(0) as u64;
    result.close().await?;
    Ok(count)
  }

  /// Runs a query and returns its rows lazily.
  pub async fn execute_query(&self, statement: impl Into<SqlStatement>) -> Result<SqlResult> {
    self.execute(statement.into(), SqlExpectedResult::Rows).await
  }

  async fn execute(&self, statement: SqlStatement, expected: SqlExpectedResult) -> Result<SqlResult> {
    let mut result = SqlResult::new(self.client.clone(), statement.cursor_buffer_size);
    result.start(statement, expected).await?;
    Ok(result)
  }
}

/// Lifecycle of a [`SqlResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
  Created,
  Executing,
  Streaming,
  Failed,
  Closed,
}

/// Column names and types of a result.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRowMetadata {
  columns: Vec<SqlColumn>,
}

impl SqlRowMetadata {
  pub fn columns(&self) -> &[SqlColumn] {
    &self.columns
  }

  pub fn find_column(&self, name: &str) -> Option<usize> {
    self.columns.iter().position(|c| c.name == name)
  }
}

/// A forward-only sequence of rows, fetched page by page.
///
/// Consume it to the end or call [`close`](Self::close); a result dropped
/// early asks the server to release its cursor in the background.
pub struct SqlResult {
  client: Arc<ClientInner>,
  cursor_buffer_size: u32,
  query_id: Option<Uuid>,
  metadata: Arc<SqlRowMetadata>,
  buffer: VecDeque<Vec<Data>>,
  last: bool,
  update_count: i64,
  state: QueryState,
}

impl SqlResult {
  fn new(client: Arc<ClientInner>, cursor_buffer_size: u32) -> Self {
    Self {
      client,
      cursor_buffer_size,
      query_id: None,
      metadata: Arc::new(SqlRowMetadata { columns: Vec::new() }),
      buffer: VecDeque::new(),
      last: true,
      update_count: -1,
      state: QueryState::Created,
    }
  }

  async fn start(&mut self, statement: SqlStatement, expected: SqlExpectedResult) -> Result<()> {
    self.state = QueryState::Executing;
    let params = match statement.encode_params(self.client.registry()) {
      Ok(params) => params,
      Err(e) => {
        self.state = QueryState::Failed;
        return Err(e);
      }
    };
    debug!("Executing SQL: {}", statement.sql);
    let sql = statement.sql;
    let cursor_buffer_size = self.cursor_buffer_size;
    let response = self
      .client
      .invoke(|id| ClientMessage::SqlExecute {
        id,
        sql,
        params,
        cursor_buffer_size,
        expected,
      })
      .await;

    match response {
      Ok(ServerMessage::SqlPage {
        query_id,
        columns,
        rows,
        last,
        update_count,
        ..
      }) => {
        self.query_id = query_id;
        self.metadata = Arc::new(SqlRowMetadata { columns });
        self.buffer = rows.into();
        self.last = last;
        self.update_count = update_count;
        self.state = if last && self.buffer.is_empty() {
          QueryState::Closed
        } else {
          QueryState::Streaming
        };
        Ok(())
      }
      Ok(other) => {
        self.state = QueryState::Failed;
        Err(unexpected(other))
      }
      Err(e) => {
        self.state = QueryState::Failed;
        Err(e)
      }
    }
  }

  pub fn state(&self) -> QueryState {
    self.state
  }

  pub fn row_metadata(&self) -> &SqlRowMetadata {
    &self.metadata
  }

  /// Rows affected by a command, or `-1` for a query.
  pub fn update_count(&self) -> i64 {
    self.update_count
  }

  /// Returns the next row, fetching another page when the buffer runs dry.
  ///
  /// Fails with [`Error::ClientClosed`] once the client is closed, even if
  /// rows are still buffered.
  pub async fn next_row(&mut self) -> Result<Option<SqlRow>> {
    loop {
      self.ensure_client_open()?;
      match self.state {
        QueryState::Closed => return Ok(None),
        QueryState::Failed => return Err(Error::QueryClosed),
        QueryState::Created | QueryState::Executing => {
          return Err(Error::Sql("query has not been executed".to_string()))
        }
        QueryState::Streaming => {}
      }

      if let Some(values) = self.buffer.pop_front() {
        return Ok(Some(SqlRow {
          metadata: self.metadata.clone(),
          values,
          registry: self.client.registry().clone(),
        }));
      }

      if self.last {
        self.state = QueryState::Closed;
        return Ok(None);
      }

      self.fetch_page().await?;
    }
  }

  fn ensure_client_open(&mut self) -> Result<()> {
    if self.client.is_closed() {
      self.buffer.clear();
      if self.state == QueryState::Streaming {
        self.state = QueryState::Closed;
      }
      return Err(Error::ClientClosed);
    }
    Ok(())
  }

  async fn fetch_page(&mut self) -> Result<()> {
    self.ensure_client_open()?;
    let Some(query_id) = self.query_id else {
      self.state = QueryState::Closed;
      return Ok(());
    };
    let cursor_buffer_size = self.cursor_buffer_size;
    let response = self
      .client
      .invoke(|id| ClientMessage::SqlFetch {
        id,
        query_id,
        cursor_buffer_size,
      })
      .await;
    match response {
      Ok(ServerMessage::SqlPage { rows, last, .. }) => {
        self.buffer.extend(rows);
        self.last = last;
        Ok(())
      }
      Ok(other) => {
        self.state = QueryState::Failed;
        Err(unexpected(other))
      }
      Err(e) => {
        self.state = QueryState::Failed;
        Err(e)
      }
    }
  }

  /// Releases the server-side cursor. Safe to call more than once.
  pub async fn close(&mut self) -> Result<()> {
    let open_cursor = self.state == QueryState::Streaming && !self.last;
    self.state = QueryState::Closed;
    self.buffer.clear();
    if !open_cursor {
      return Ok(());
    }
    let Some(query_id) = self.query_id.take() else {
      return Ok(());
    };
    match self
      .client
      .invoke(|id| ClientMessage::SqlClose { id, query_id })
      .await
    {
      Ok(ServerMessage::Ack { .. }) => Ok(()),
      Ok(other) => Err(unexpected(other)),
      Err(Error::ClientClosed) => Ok(()),
      Err(e) => Err(e),
    }
  }

  /// Adapts the result to a [`Stream`] of rows.
  pub fn into_stream(self) -> impl Stream<Item = Result<SqlRow>> {
    futures::stream::try_unfold(self, |mut result| async move {
      Ok(result.next_row().await?.map(|row| (row, result)))
    })
  }
}

impl Drop for SqlResult {
  fn drop(&mut self) {
    if self.state != QueryState::Streaming || self.last || self.client.is_closed() {
      return;
    }
    let Some(query_id) = self.query_id.take() else {
      return;
    };
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      warn!("Query {} dropped outside a runtime, cursor left open", query_id);
      return;
    };
    debug!("Query {} dropped before completion, closing cursor", query_id);
    let client = self.client.clone();
    handle.spawn(async move {
      if let Err(e) = client
        .invoke(|id| ClientMessage::SqlClose { id, query_id })
        .await
      {
        debug!("Background close of query {} failed: {}", query_id, e);
      }
    });
  }
}

impl fmt::Debug for SqlResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SqlResult")
      .field("query_id", &self.query_id)
      .field("state", &self.state)
      .field("buffered", &self.buffer.len())
      .field("last", &self.last)
      .finish()
  }
}

/// One result row.
pub struct SqlRow {
  metadata: Arc<SqlRowMetadata>,
  values: Vec<Data>,
  registry: Arc<SerializationRegistry>,
}

impl SqlRow {
  pub fn metadata(&self) -> &SqlRowMetadata {
    &self.metadata
  }

  /// Reads a column by name.
  pub fn get<T: Codec>(&self, column: &str) -> Result<T> {
    let index = self
      .metadata
      .find_column(column)
      .ok_or_else(|| Error::ColumnNotFound(column.to_string()))?;
    self.get_at(index)
  }

  /// Reads a column by position.
  pub fn get_at<T: Codec>(&self, index: usize) -> Result<T> {
    let data = self
      .values
      .get(index)
      .ok_or_else(|| Error::ColumnNotFound(format!("#{index}")))?;
    let column = self
      .metadata
      .columns
      .get(index)
      .map(|c| c.name.clone())
      .unwrap_or_else(|| format!("#{index}"));
    T::from_data(data, &self.registry).map_err(|e| match e {
      Error::Serialization(_) => Error::TypeCoercion {
        column,
        expected: std::any::type_name::<T>().to_string(),
        actual: data.kind().to_string(),
      },
      other => other,
    })
  }

  /// Reads the `__key` column.
  pub fn get_key<T: Codec>(&self) -> Result<T> {
    self.get(KEY_COLUMN)
  }

  /// Reads the `this` column.
  pub fn get_value<T: Codec>(&self) -> Result<T> {
    self.get(VALUE_COLUMN)
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }
}

impl fmt::Debug for SqlRow {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut map = f.debug_map();
    for (i, value) in self.values.iter().enumerate() {
      match self.metadata.columns.get(i) {
        Some(c) => map.entry(&c.name, value),
        None => map.entry(&i, value),
      };
    }
    map.finish()
  }
}
