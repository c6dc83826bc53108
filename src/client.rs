//! The kvgrid client.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ClientConfig, ReconnectMode};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::map::Map;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::serialization::{Codec, SerializationRegistry};
use crate::sql::SqlService;

const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Runs `fut` until it completes or `token` is cancelled.
///
/// Cancelling only stops the local wait: a request already sent may still
/// take effect on the store.
pub async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
  F: Future<Output = Result<T>>,
{
  tokio::select! {
    biased;
    _ = token.cancelled() => Err(Error::Cancelled),
    result = fut => result,
  }
}

/// Counters kept when metrics are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStatistics {
  pub invocations: u64,
  pub failures: u64,
  pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
  invocations: AtomicU64,
  failures: AtomicU64,
  reconnects: AtomicU64,
}

enum ConnectionState {
  Active(Arc<Connection>),
  Closed,
}

pub(crate) struct ClientInner {
  config: ClientConfig,
  registry: Arc<SerializationRegistry>,
  state: Mutex<ConnectionState>,
  shutdown: CancellationToken,
  next_id: AtomicU64,
  counters: Counters,
}

/// A connection to a kvgrid cluster.
///
/// Cloning is cheap; clones share one session. Call [`close`](Self::close)
/// when done: outstanding and later operations then fail with
/// [`Error::ClientClosed`].
#[derive(Clone)]
pub struct GridClient {
  inner: Arc<ClientInner>,
}

impl std::fmt::Debug for GridClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("GridClient").finish_non_exhaustive()
  }
}

impl GridClient {
  /// Connects using the given configuration.
  pub async fn connect(config: ClientConfig) -> Result<Self> {
    config.validate()?;
    let connection = connect_any(&config).await?;
    let registry = Arc::new(config.serialization.clone());
    Ok(Self {
      inner: Arc::new(ClientInner {
        config,
        registry,
        state: Mutex::new(ConnectionState::Active(connection)),
        shutdown: CancellationToken::new(),
        next_id: AtomicU64::new(1),
        counters: Counters::default(),
      }),
    })
  }

  /// Connects to a single address with default options.
  pub async fn connect_to(address: &str) -> Result<Self> {
    let mut config = ClientConfig::default();
    config.networking.addresses = vec![address.to_string()];
    Self::connect(config).await
  }

  /// Returns a handle to a named map. No round trip is made.
  pub fn get_map<K: Codec, V: Codec>(&self, name: &str) -> Map<K, V> {
    Map::new(name, self.inner.clone())
  }

  pub fn sql(&self) -> SqlService {
    SqlService::new(self.inner.clone())
  }

  pub fn config(&self) -> &ClientConfig {
    &self.inner.config
  }

  pub fn serialization(&self) -> &SerializationRegistry {
    &self.inner.registry
  }

  /// Session id of the current connection, if any.
  pub async fn session_id(&self) -> Option<Uuid> {
    match &*self.inner.state.lock().await {
      ConnectionState::Active(conn) => Some(conn.session_id()),
      ConnectionState::Closed => None,
    }
  }

  pub fn is_closed(&self) -> bool {
    self.inner.shutdown.is_cancelled()
  }

  pub async fn ping(&self) -> Result<()> {
    match self.inner.invoke(|id| ClientMessage::Ping { id }).await? {
      ServerMessage::Pong { .. } => Ok(()),
      other => Err(unexpected(other)),
    }
  }

  /// Returns counters when metrics are enabled.
  pub fn statistics(&self) -> Option<ClientStatistics> {
    if !self.inner.config.metrics.enabled {
      return None;
    }
    let c = &self.inner.counters;
    Some(ClientStatistics {
      invocations: c.invocations.load(Ordering::Relaxed),
      failures: c.failures.load(Ordering::Relaxed),
      reconnects: c.reconnects.load(Ordering::Relaxed),
    })
  }

  /// Closes the client. Safe to call repeatedly and from any state.
  pub async fn close(&self) {
    self.inner.shutdown().await;
  }
}

/// Tries each configured address in order.
async fn connect_any(config: &ClientConfig) -> Result<Arc<Connection>> {
  let mut last_error = None;
  for address in &config.networking.addresses {
    match Connection::open(config, address).await {
      Ok(conn) => return Ok(conn),
      Err(e) => {
        debug!("Connection to {} failed: {}", address, e);
        last_error = Some(e);
      }
    }
  }
  Err(last_error.unwrap_or_else(|| Error::Config("no addresses configured".to_string())))
}

pub(crate) fn unexpected(msg: ServerMessage) -> Error {
  Error::Server(format!("unexpected response: {msg:?}"))
}

impl ClientInner {
  pub(crate) fn registry(&self) -> &Arc<SerializationRegistry> {
    &self.registry
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.shutdown.is_cancelled()
  }

  async fn shutdown(&self) {
    self.shutdown.cancel();
    let previous = std::mem::replace(&mut *self.state.lock().await, ConnectionState::Closed);
    if let ConnectionState::Active(conn) = previous {
      conn.close();
      info!("Client closed");
    }
  }

  /// Sends one request and waits for its response.
  ///
  /// Server-reported errors are mapped onto typed [`Error`] variants.
  pub(crate) async fn invoke<F>(&self, build: F) -> Result<ServerMessage>
  where
    F: FnOnce(u64) -> ClientMessage,
  {
    if self.is_closed() {
      return Err(Error::ClientClosed);
    }
    self.counters.invocations.fetch_add(1, Ordering::Relaxed);
    let result = self.invoke_inner(build).await;
    if result.is_err() {
      self.counters.failures.fetch_add(1, Ordering::Relaxed);
    }
    result
  }

  async fn invoke_inner<F>(&self, build: F) -> Result<ServerMessage>
  where
    F: FnOnce(u64) -> ClientMessage,
  {
    // The timeout covers reconnecting as well as the round trip.
    let exchange = async {
      let connection = self.connection().await?;
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      let slot = connection.send(build(id))?;
      slot.recv().await.map_err(|e| {
        if self.is_closed() {
          Error::ClientClosed
        } else {
          e
        }
      })
    };

    let response = tokio::select! {
      biased;
      _ = self.shutdown.cancelled() => return Err(Error::ClientClosed),
      r = tokio::time::timeout(self.config.networking.invocation_timeout, exchange) => r,
    };

    match response {
      Err(_) => Err(Error::Timeout),
      Ok(Err(e)) => Err(e),
      Ok(Ok(ServerMessage::Error { code, message, .. })) => Err(Error::from_server(code, message)),
      Ok(Ok(msg)) => Ok(msg),
    }
  }

  /// Returns the live connection, reconnecting per the configured mode.
  ///
  /// Callers queue on the state lock while one of them reconnects. A caller
  /// whose invocation times out abandons its attempt and the next caller
  /// starts over.
  async fn connection(&self) -> Result<Arc<Connection>> {
    let mut state = self.state.lock().await;
    let lost = match &*state {
      ConnectionState::Closed => return Err(Error::ClientClosed),
      ConnectionState::Active(conn) if !conn.is_closed() => return Ok(conn.clone()),
      ConnectionState::Active(conn) => conn.address().to_string(),
    };
    warn!("Session to {} lost, reconnect mode {:?}", lost, self.config.networking.reconnect_mode);

    let reconnected = match self.config.networking.reconnect_mode {
      ReconnectMode::DoNotReconnect => Err(Error::ConnectionLost),
      ReconnectMode::ReconnectOnce => connect_any(&self.config).await,
      ReconnectMode::ReconnectForever => self.reconnect_forever().await,
    };

    match reconnected {
      Ok(conn) => {
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        info!("Reconnected to {}", conn.address());
        *state = ConnectionState::Active(conn.clone());
        Ok(conn)
      }
      Err(e) => {
        *state = ConnectionState::Closed;
        self.shutdown.cancel();
        warn!("Reconnect failed, closing client: {}", e);
        match e {
          Error::ClientClosed => Err(Error::ClientClosed),
          _ => Err(Error::ConnectionLost),
        }
      }
    }
  }

  async fn reconnect_forever(&self) -> Result<Arc<Connection>> {
    let mut delay = BACKOFF_INITIAL;
    loop {
      match connect_any(&self.config).await {
        Ok(conn) => return Ok(conn),
        Err(e) => debug!("Reconnect attempt failed: {}, retrying in {:?}", e, delay),
      }
      tokio::select! {
        _ = self.shutdown.cancelled() => return Err(Error::ClientClosed),
        _ = tokio::time::sleep(delay) => {}
      }
      delay = (delay * 2).min(BACKOFF_MAX);
    }
  }
}
