//! Typed handles to remote maps.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use crate::client::{unexpected, ClientInner};
use crate::error::Result;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::serialization::{Codec, Data};

/// A named remote map with keys `K` and values `V`.
///
/// The handle stores nothing locally; every call is a round trip. It stays
/// valid only while its client is open.
pub struct Map<K, V> {
  name: String,
  client: Arc<ClientInner>,
  _types: PhantomData<fn() -> (K, V)>,
}

impl<K: Codec, V: Codec> Map<K, V> {
  pub(crate) fn new(name: &str, client: Arc<ClientInner>) -> Self {
    Self {
      name: name.to_string(),
      client,
      _types: PhantomData,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Stores `value` under `key`, replacing any existing value.
  pub async fn put(&self, key: &K, value: &V) -> Result<()> {
    let registry = self.client.registry();
    let key = key.to_data(registry)?;
    let value = value.to_data(registry)?;
    debug!("put into {}", self.name);
    let map = self.name.clone();
    match self
      .client
      .invoke(|id| ClientMessage::MapPut { id, map, key, value })
      .await?
    {
      ServerMessage::Ack { .. } => Ok(()),
      other => Err(unexpected(other)),
    }
  }

  /// Returns the value stored under `key`, or `None` if there is none.
  pub async fn get(&self, key: &K) -> Result<Option<V>> {
    let key = key.to_data(self.client.registry())?;
    let map = self.name.clone();
    match self
      .client
      .invoke(|id| ClientMessage::MapGet { id, map, key })
      .await?
    {
      ServerMessage::Value { value, .. } => self.decode_value(value),
      other => Err(unexpected(other)),
    }
  }

  /// Removes `key`, returning the value it held.
  pub async fn remove(&self, key: &K) -> Result<Option<V>> {
    let key = key.to_data(self.client.registry())?;
    let map = self.name.clone();
    match self
      .client
      .invoke(|id| ClientMessage::MapRemove { id, map, key })
      .await?
    {
      ServerMessage::Value { value, .. } => self.decode_value(value),
      other => Err(unexpected(other)),
    }
  }

  pub async fn contains_key(&self, key: &K) -> Result<bool> {
    let key = key.to_data(self.client.registry())?;
    let map = self.name.clone();
    match self
      .client
      .invoke(|id| ClientMessage::MapContainsKey { id, map, key })
      .await?
    {
      ServerMessage::Bool { value, .. } => Ok(value),
      other => Err(unexpected(other)),
    }
  }

  /// Number of entries. A snapshot: concurrent writers may change it at any
  /// time.
  pub async fn size(&self) -> Result<usize> {
    let map = self.name.clone();
    match self
      .client
      .invoke(|id| ClientMessage::MapSize { id, map })
      .await?
    {
      ServerMessage::Size { size, .. } => Ok(size as usize),
      other => Err(unexpected(other)),
    }
  }

  fn decode_value(&self, value: Option<Data>) -> Result<Option<V>> {
    match value {
      Some(data) if !data.is_null() => V::from_data(&data, self.client.registry()).map(Some),
      _ => Ok(None),
    }
  }
}

impl<K, V> Clone for Map<K, V> {
  fn clone(&self) -> Self {
    Self {
      name: self.name.clone(),
      client: self.client.clone(),
      _types: PhantomData,
    }
  }
}

impl<K, V> fmt::Debug for Map<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Map").field("name", &self.name).finish()
  }
}
