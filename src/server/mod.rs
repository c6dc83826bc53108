//! A single-node, in-memory store speaking the kvgrid wire protocol.
//!
//! Used by the integration tests and handy for local experiments:
//!
//! ```no_run
//! use kvgrid::server::{ServerConfig, StoreServer};
//! use kvgrid::GridClient;
//!
//! # async fn run() -> kvgrid::Result<()> {
//! let server = StoreServer::bind("127.0.0.1:0", ServerConfig::default()).await?;
//! let client = GridClient::connect_to(&server.address()).await?;
//! # Ok(())
//! # }
//! ```

mod sql;
mod store;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_native_tls::{native_tls, TlsAcceptor};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_CLUSTER_NAME;
use crate::connection::{frame_codec, BoxedStream};
use crate::error::{Error, Result};
use crate::protocol::{
  decode_message, encode_message, peek_message_id, verify_auth_proof, ClientHello, ClientMessage,
  Encoding, ErrorCode, HandshakeStatus, ServerHello, ServerMessage, NONCE_SIZE, PROTOCOL_VERSION,
};

pub use store::{SqlPage, Store};

/// An error the store reports back to the client.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct StoreError {
  pub code: ErrorCode,
  pub message: String,
}

impl StoreError {
  pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
    }
  }
}

impl From<Error> for StoreError {
  fn from(e: Error) -> Self {
    StoreError::new(ErrorCode::Serialization, e.to_string())
  }
}

#[derive(Clone)]
pub struct ServerConfig {
  pub cluster_name: String,
  /// When set, clients must prove possession of this token.
  pub discovery_token: Option<String>,
  /// When set, every accepted connection is wrapped in TLS.
  pub tls: Option<TlsAcceptor>,
}

impl ServerConfig {
  /// Serves TLS with the identity in a PKCS#12 archive.
  pub fn with_pkcs12(mut self, der: &[u8], password: &str) -> Result<Self> {
    let identity = native_tls::Identity::from_pkcs12(der, password)
      .map_err(|e| Error::Config(format!("invalid server certificate: {e}")))?;
    let acceptor = native_tls::TlsAcceptor::new(identity)
      .map_err(|e| Error::TlsHandshake(e.to_string()))?;
    self.tls = Some(TlsAcceptor::from(acceptor));
    Ok(self)
  }
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
      discovery_token: None,
      tls: None,
    }
  }
}

impl fmt::Debug for ServerConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ServerConfig")
      .field("cluster_name", &self.cluster_name)
      .field("discovery_token", &self.discovery_token.as_ref().map(|_| "<redacted>"))
      .field("tls", &self.tls.is_some())
      .finish()
  }
}

/// A running store. Dropping it stops the listener and every session.
pub struct StoreServer {
  local_addr: SocketAddr,
  store: Arc<Store>,
  shutdown: CancellationToken,
}

impl StoreServer {
  pub async fn bind(addr: &str, config: ServerConfig) -> Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let store = Arc::new(Store::new());
    let shutdown = CancellationToken::new();
    info!(
      "Store listening on {} (cluster {}, tls {})",
      local_addr,
      config.cluster_name,
      config.tls.is_some()
    );

    tokio::spawn(accept_loop(
      listener,
      Arc::new(config),
      store.clone(),
      shutdown.clone(),
    ));

    Ok(Self {
      local_addr,
      store,
      shutdown,
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// The listen address as `host:port`.
  pub fn address(&self) -> String {
    self.local_addr.to_string()
  }

  pub fn store(&self) -> &Arc<Store> {
    &self.store
  }

  /// Stops accepting and drops every open session.
  pub fn shutdown(&self) {
    self.shutdown.cancel();
  }
}

impl Drop for StoreServer {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}

async fn accept_loop(
  listener: TcpListener,
  config: Arc<ServerConfig>,
  store: Arc<Store>,
  shutdown: CancellationToken,
) {
  loop {
    let accepted = tokio::select! {
      biased;
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => accepted,
    };
    match accepted {
      Ok((stream, peer)) => {
        debug!("Accepted connection from {}", peer);
        let config = config.clone();
        let store = store.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
          if let Err(e) = serve(stream, &config, &store, shutdown).await {
            debug!("Session from {} ended: {}", peer, e);
          }
        });
      }
      Err(e) => warn!("Accept error: {}", e),
    }
  }
  info!("Store listener stopped");
}

async fn serve(
  tcp: TcpStream,
  config: &ServerConfig,
  store: &Store,
  shutdown: CancellationToken,
) -> Result<()> {
  tcp.set_nodelay(true)?;
  let mut stream: BoxedStream = match &config.tls {
    Some(acceptor) => Box::new(
      acceptor
        .accept(tcp)
        .await
        .map_err(|e| Error::TlsHandshake(e.to_string()))?,
    ),
    None => Box::new(tcp),
  };
  let mut buf = [0u8; ClientHello::SIZE];
  stream.read_exact(&mut buf).await?;
  let nonce = *Uuid::new_v4().as_bytes();

  let reply = |status, encoding| ServerHello {
    status,
    version: PROTOCOL_VERSION,
    encoding,
    nonce,
  };
  let Some(hello) = ClientHello::from_bytes(&buf) else {
    stream
      .write_all(&reply(HandshakeStatus::BadMagic, Encoding::default()).to_bytes())
      .await?;
    return Err(Error::Handshake("bad magic".to_string()));
  };
  let encoding = match hello.flags.negotiate() {
    Some(encoding) if hello.version == PROTOCOL_VERSION => encoding,
    _ => {
      stream
        .write_all(&reply(HandshakeStatus::VersionMismatch, Encoding::default()).to_bytes())
        .await?;
      return Err(Error::VersionMismatch {
        server: PROTOCOL_VERSION,
        client: hello.version,
      });
    }
  };
  stream
    .write_all(&reply(HandshakeStatus::Success, encoding).to_bytes())
    .await?;

  let mut framed = Framed::new(stream, frame_codec());
  let session = authenticate(&mut framed, config, encoding, &nonce).await?;
  info!("Session {} opened", session);

  let result = session_loop(&mut framed, store, session, encoding, shutdown).await;
  store.release_session(session);
  info!("Session {} closed", session);
  result
}

async fn send(
  framed: &mut Framed<BoxedStream, LengthDelimitedCodec>,
  msg: &ServerMessage,
  encoding: Encoding,
) -> Result<()> {
  framed.send(Bytes::from(encode_message(msg, encoding)?)).await?;
  Ok(())
}

async fn authenticate(
  framed: &mut Framed<BoxedStream, LengthDelimitedCodec>,
  config: &ServerConfig,
  encoding: Encoding,
  nonce: &[u8; NONCE_SIZE],
) -> Result<Uuid> {
  let frame = framed
    .next()
    .await
    .ok_or_else(|| Error::Handshake("closed before authentication".to_string()))??;
  let ClientMessage::Authenticate {
    id,
    cluster_name,
    client_name,
    proof,
    ..
  } = decode_message::<ClientMessage>(&frame, encoding)?
  else {
    let msg = ServerMessage::error(0, ErrorCode::Protocol, "expected authentication");
    send(framed, &msg, encoding).await?;
    return Err(Error::Handshake("expected authentication".to_string()));
  };

  let rejection = if cluster_name != config.cluster_name {
    Some(format!("cluster name '{cluster_name}' does not match"))
  } else {
    match (&config.discovery_token, &proof) {
      (None, _) => None,
      (Some(token), Some(proof)) if verify_auth_proof(token, nonce, proof) => None,
      (Some(_), _) => Some("invalid or missing token proof".to_string()),
    }
  };
  if let Some(reason) = rejection {
    warn!("Rejected client {}: {}", client_name, reason);
    let msg = ServerMessage::error(id, ErrorCode::AuthenticationFailed, reason.clone());
    send(framed, &msg, encoding).await?;
    return Err(Error::AuthFailed(reason));
  }

  let session_id = Uuid::new_v4();
  debug!("Authenticated client {} as {}", client_name, session_id);
  let msg = ServerMessage::Authenticated {
    id,
    session_id,
    cluster_name: config.cluster_name.clone(),
  };
  send(framed, &msg, encoding).await?;
  Ok(session_id)
}

async fn session_loop(
  framed: &mut Framed<BoxedStream, LengthDelimitedCodec>,
  store: &Store,
  session: Uuid,
  encoding: Encoding,
  shutdown: CancellationToken,
) -> Result<()> {
  loop {
    let frame = tokio::select! {
      biased;
      _ = shutdown.cancelled() => return Ok(()),
      frame = framed.next() => frame,
    };
    let Some(frame) = frame else {
      return Ok(());
    };
    let frame = frame?;
    let request = match decode_message::<ClientMessage>(&frame, encoding) {
      Ok(request) => request,
      Err(e) => {
        warn!("Undecodable request in session {}: {}", session, e);
        let Some(id) = peek_message_id(&frame, encoding) else {
          return Err(e);
        };
        let msg =
          ServerMessage::error(id, ErrorCode::Protocol, format!("undecodable request: {e}"));
        send(framed, &msg, encoding).await?;
        continue;
      }
    };
    let response = handle(store, session, request);
    send(framed, &response, encoding).await?;
  }
}

fn handle(store: &Store, session: Uuid, request: ClientMessage) -> ServerMessage {
  let id = request.id();
  let result = match request {
    ClientMessage::Authenticate { .. } => Err(StoreError::new(
      ErrorCode::Protocol,
      "session is already authenticated",
    )),
    ClientMessage::MapPut { map, key, value, .. } => {
      store.put(&map, key, value);
      Ok(ServerMessage::Ack { id })
    }
    ClientMessage::MapGet { map, key, .. } => Ok(ServerMessage::Value {
      id,
      value: store.get(&map, &key),
    }),
    ClientMessage::MapRemove { map, key, .. } => Ok(ServerMessage::Value {
      id,
      value: store.remove(&map, &key),
    }),
    ClientMessage::MapContainsKey { map, key, .. } => Ok(ServerMessage::Bool {
      id,
      value: store.contains_key(&map, &key),
    }),
    ClientMessage::MapSize { map, .. } => Ok(ServerMessage::Size {
      id,
      size: store.size(&map) as u64,
    }),
    ClientMessage::SqlExecute {
      sql,
      params,
      cursor_buffer_size,
      expected,
      ..
    } => store
      .execute_sql(session, &sql, &params, cursor_buffer_size as usize, expected)
      .map(|page| page_message(id, page)),
    ClientMessage::SqlFetch {
      query_id,
      cursor_buffer_size,
      ..
    } => store
      .fetch(query_id, cursor_buffer_size as usize)
      .map(|page| page_message(id, page)),
    ClientMessage::SqlClose { query_id, .. } => {
      store.close_query(query_id);
      Ok(ServerMessage::Ack { id })
    }
    ClientMessage::Ping { .. } => Ok(ServerMessage::Pong { id }),
  };
  result.unwrap_or_else(|e| ServerMessage::error(id, e.code, e.message))
}

fn page_message(id: u64, page: SqlPage) -> ServerMessage {
  ServerMessage::SqlPage {
    id,
    query_id: page.query_id,
    columns: page.columns,
    rows: page.rows,
    last: page.last,
    update_count: page.update_count,
  }
}
