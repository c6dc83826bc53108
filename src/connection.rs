//! A single authenticated session to a store member.
//!
//! Opening a connection resolves the address, optionally wraps the socket in
//! TLS, performs the hello exchange and authenticates. The open connection
//! runs two tasks: a writer draining an outbound channel and a reader routing
//! responses to the oneshot channel registered under each correlation id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_native_tls::native_tls;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{split_address, ClientConfig, SslOptions, TlsProtocol};
use crate::error::{Error, Result};
use crate::protocol::{
  auth_proof, decode_message, encode_message, ClientHello, ClientMessage, Encoding,
  HandshakeStatus, ProtocolFlags, ServerHello, ServerMessage, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub(crate) type BoxedStream = Box<dyn AsyncStream>;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>>;

/// Correlation id used by the authentication request.
const AUTH_REQUEST_ID: u64 = 0;

pub(crate) fn frame_codec() -> LengthDelimitedCodec {
  LengthDelimitedCodec::builder()
    .max_frame_length(MAX_MESSAGE_SIZE as usize)
    .new_codec()
}

pub(crate) struct Connection {
  session_id: Uuid,
  address: String,
  encoding: Encoding,
  outbound: mpsc::UnboundedSender<Bytes>,
  pending: PendingMap,
  closed: CancellationToken,
}

impl Connection {
  /// Connects to one address and authenticates.
  pub(crate) async fn open(config: &ClientConfig, address: &str) -> Result<Arc<Self>> {
    let timeout = config.networking.connection_timeout;
    tokio::time::timeout(timeout, Self::establish(config, address))
      .await
      .map_err(|_| Error::Timeout)?
  }

  async fn establish(config: &ClientConfig, address: &str) -> Result<Arc<Self>> {
    let (host, _) = split_address(address)?;
    debug!("Connecting to {}", address);
    let tcp = TcpStream::connect(address)
      .await
      .map_err(|e| Error::Unreachable(format!("{address}: {e}")))?;
    tcp.set_nodelay(true)?;

    let mut stream: BoxedStream = if config.networking.ssl.enabled {
      Box::new(tls_connect(tcp, host, &config.networking.ssl).await?)
    } else {
      Box::new(tcp)
    };

    let hello = handshake(&mut stream, config).await?;
    let mut framed = Framed::new(stream, frame_codec());
    let session_id = authenticate(&mut framed, config, &hello).await?;
    info!("Connected to {} (session {})", address, session_id);

    let (sink, source) = framed.split::<Bytes>();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let closed = CancellationToken::new();

    tokio::spawn(write_loop(sink, outbound_rx, closed.clone()));
    tokio::spawn(read_loop(
      source,
      hello.encoding,
      pending.clone(),
      closed.clone(),
      address.to_string(),
    ));

    Ok(Arc::new(Self {
      session_id,
      address: address.to_string(),
      encoding: hello.encoding,
      outbound,
      pending,
      closed,
    }))
  }

  pub(crate) fn session_id(&self) -> Uuid {
    self.session_id
  }

  pub(crate) fn address(&self) -> &str {
    &self.address
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.is_cancelled()
  }

  /// Encodes the request, registers a response slot and queues the frame.
  ///
  /// Encoding errors are returned here and no slot is left behind.
  pub(crate) fn send(&self, msg: ClientMessage) -> Result<PendingResponse> {
    if self.is_closed() {
      return Err(Error::ConnectionLost);
    }
    let frame = Bytes::from(encode_message(&msg, self.encoding)?);
    let id = msg.id();
    let (tx, rx) = oneshot::channel();
    lock(&self.pending).insert(id, tx);
    let slot = PendingResponse {
      id,
      rx,
      pending: self.pending.clone(),
    };
    self.outbound.send(frame).map_err(|_| Error::ConnectionLost)?;
    Ok(slot)
  }

  pub(crate) fn close(&self) {
    if !self.closed.is_cancelled() {
      debug!("Closing connection to {}", self.address);
      self.closed.cancel();
    }
  }
}

impl Drop for Connection {
  fn drop(&mut self) {
    self.closed.cancel();
  }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A response slot. Dropping it before the response arrives unregisters it.
pub(crate) struct PendingResponse {
  id: u64,
  rx: oneshot::Receiver<ServerMessage>,
  pending: PendingMap,
}

impl PendingResponse {
  pub(crate) async fn recv(mut self) -> Result<ServerMessage> {
    (&mut self.rx).await.map_err(|_| Error::ConnectionLost)
  }
}

impl Drop for PendingResponse {
  fn drop(&mut self) {
    lock(&self.pending).remove(&self.id);
  }
}

async fn tls_connect(
  tcp: TcpStream,
  host: &str,
  ssl: &SslOptions,
) -> Result<tokio_native_tls::TlsStream<TcpStream>> {
  let mut builder = native_tls::TlsConnector::builder();
  builder
    .danger_accept_invalid_certs(!ssl.validate_certificate_chain)
    .danger_accept_invalid_hostnames(!ssl.validate_certificate_name)
    .min_protocol_version(Some(match ssl.protocol {
      TlsProtocol::Tls10 => native_tls::Protocol::Tlsv10,
      TlsProtocol::Tls11 => native_tls::Protocol::Tlsv11,
      TlsProtocol::Tls12 => native_tls::Protocol::Tlsv12,
    }));

  if let Some(path) = &ssl.certificate_path {
    let der = std::fs::read(path)
      .map_err(|e| Error::Config(format!("cannot read certificate {}: {e}", path.display())))?;
    let password = ssl.certificate_password.as_deref().unwrap_or("");
    let identity = native_tls::Identity::from_pkcs12(&der, password)
      .map_err(|e| Error::TlsHandshake(format!("invalid client certificate: {e}")))?;
    builder.identity(identity);
  }

  let connector = builder
    .build()
    .map_err(|e| Error::TlsHandshake(e.to_string()))?;
  tokio_native_tls::TlsConnector::from(connector)
    .connect(host, tcp)
    .await
    .map_err(|e| Error::TlsHandshake(e.to_string()))
}

async fn handshake(stream: &mut BoxedStream, config: &ClientConfig) -> Result<ServerHello> {
  let hello = ClientHello {
    version: PROTOCOL_VERSION,
    flags: ProtocolFlags {
      messagepack: config.networking.use_messagepack,
      json_fallback: config.networking.json_fallback,
    },
  };
  stream.write_all(&hello.to_bytes()).await?;
  stream.flush().await?;

  let mut buf = [0u8; ServerHello::SIZE];
  stream
    .read_exact(&mut buf)
    .await
    .map_err(|e| Error::Handshake(format!("no server hello: {e}")))?;
  let reply = ServerHello::from_bytes(&buf)?;

  match reply.status {
    HandshakeStatus::Success => {}
    HandshakeStatus::VersionMismatch => {
      return Err(Error::VersionMismatch {
        server: reply.version,
        client: PROTOCOL_VERSION,
      })
    }
    HandshakeStatus::BadMagic => {
      return Err(Error::Handshake("server rejected protocol magic".to_string()))
    }
  }
  debug!("Handshake complete, encoding {:?}", reply.encoding);
  Ok(reply)
}

async fn authenticate(
  framed: &mut Framed<BoxedStream, LengthDelimitedCodec>,
  config: &ClientConfig,
  hello: &ServerHello,
) -> Result<Uuid> {
  let proof = match &config.networking.cloud.discovery_token {
    Some(token) => Some(auth_proof(token, &hello.nonce)?),
    None => None,
  };
  let request = ClientMessage::Authenticate {
    id: AUTH_REQUEST_ID,
    cluster_name: config.cluster_name.clone(),
    client_name: config
      .client_name
      .clone()
      .unwrap_or_else(|| format!("kvgrid-client-{}", &Uuid::new_v4().simple().to_string()[..8])),
    proof,
    statistics_enabled: config.metrics.enabled,
  };
  framed
    .send(Bytes::from(encode_message(&request, hello.encoding)?))
    .await?;

  let frame = framed
    .next()
    .await
    .ok_or_else(|| Error::Handshake("connection closed during authentication".to_string()))??;
  match decode_message::<ServerMessage>(&frame, hello.encoding)? {
    ServerMessage::Authenticated { session_id, .. } => Ok(session_id),
    ServerMessage::Error { code, message, .. } => Err(Error::from_server(code, message)),
    other => Err(Error::Handshake(format!(
      "unexpected authentication response: {other:?}"
    ))),
  }
}

async fn write_loop<S>(
  mut sink: S,
  mut outbound: mpsc::UnboundedReceiver<Bytes>,
  closed: CancellationToken,
) where
  S: futures::Sink<Bytes, Error = std::io::Error> + Unpin,
{
  loop {
    tokio::select! {
      _ = closed.cancelled() => break,
      frame = outbound.recv() => {
        let Some(frame) = frame else { break };
        if let Err(e) = sink.send(frame).await {
          warn!("Write error: {}", e);
          break;
        }
      }
    }
  }
  let _ = sink.close().await;
  closed.cancel();
}

async fn read_loop<S>(
  mut source: S,
  encoding: Encoding,
  pending: PendingMap,
  closed: CancellationToken,
  address: String,
) where
  S: futures::Stream<Item = std::io::Result<bytes::BytesMut>> + Unpin,
{
  loop {
    let frame = tokio::select! {
      _ = closed.cancelled() => break,
      frame = source.next() => frame,
    };
    match frame {
      Some(Ok(frame)) => match decode_message::<ServerMessage>(&frame, encoding) {
        Ok(msg) => {
          let id = msg.id();
          match lock(&pending).remove(&id) {
            Some(tx) => {
              let _ = tx.send(msg);
            }
            None => debug!("Dropping response for abandoned request {}", id),
          }
        }
        Err(e) => {
          warn!("Undecodable response from {}: {}", address, e);
          break;
        }
      },
      Some(Err(e)) => {
        warn!("Read error from {}: {}", address, e);
        break;
      }
      None => {
        debug!("Connection to {} closed by peer", address);
        break;
      }
    }
  }
  if !closed.is_cancelled() {
    warn!("Lost connection to {}", address);
  }
  closed.cancel();
  // Dropping the senders fails every waiting request with ConnectionLost.
  lock(&pending).clear();
}
