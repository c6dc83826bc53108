//! Wire protocol types and serialization for kvgrid.
//!
//! A session starts with a fixed-size hello exchange ([`ClientHello`],
//! [`ServerHello`]). After that both sides exchange length-delimited frames
//! whose payload is a [`ClientMessage`] or [`ServerMessage`] encoded with the
//! negotiated [`Encoding`].

use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::serialization::Data;

/// Protocol magic bytes
pub const MAGIC: &[u8; 4] = b"KVGR";

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the nonce the server sends in its hello
pub const NONCE_SIZE: usize = 16;

/// Handshake status codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HandshakeStatus {
  Success = 0x00,
  VersionMismatch = 0x01,
  BadMagic = 0x02,
}

impl TryFrom<u8> for HandshakeStatus {
  type Error = ();
  fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
    match v {
      0x00 => Ok(Self::Success),
      0x01 => Ok(Self::VersionMismatch),
      0x02 => Ok(Self::BadMagic),
      _ => Err(()),
    }
  }
}

/// Encoding formats
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Encoding {
  #[default]
  MessagePack = 0x01,
  Json = 0x02,
}

impl TryFrom<u8> for Encoding {
  type Error = ();
  fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
    match v {
      0x01 => Ok(Self::MessagePack),
      0x02 => Ok(Self::Json),
      _ => Err(()),
    }
  }
}

/// Protocol flags in handshake
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolFlags {
  pub messagepack: bool,
  pub json_fallback: bool,
}

impl ProtocolFlags {
  /// The encoding a server picks for a client advertising these flags.
  pub fn negotiate(self) -> Option<Encoding> {
    if self.messagepack {
      Some(Encoding::MessagePack)
    } else if self.json_fallback {
      Some(Encoding::Json)
    } else {
      None
    }
  }
}

impl From<u8> for ProtocolFlags {
  fn from(byte: u8) -> Self {
    Self {
      messagepack: byte & 0x01 != 0,
      json_fallback: byte & 0x02 != 0,
    }
  }
}

impl From<ProtocolFlags> for u8 {
  fn from(flags: ProtocolFlags) -> u8 {
    let mut byte = 0u8;
    if flags.messagepack {
      byte |= 0x01;
    }
    if flags.json_fallback {
      byte |= 0x02;
    }
    byte
  }
}

/// First bytes sent by a client: magic, version, capability flags.
#[derive(Debug, Clone, Copy)]
pub struct ClientHello {
  pub version: u8,
  pub flags: ProtocolFlags,
}

impl ClientHello {
  pub const SIZE: usize = 6;

  pub fn to_bytes(&self) -> [u8; Self::SIZE] {
    let mut buf = [0u8; Self::SIZE];
    buf[..4].copy_from_slice(MAGIC);
    buf[4] = self.version;
    buf[5] = self.flags.into();
    buf
  }

  /// Parses a client hello. Returns `None` when the magic does not match.
  pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Option<Self> {
    if &buf[..4] != MAGIC {
      return None;
    }
    Some(Self {
      version: buf[4],
      flags: ProtocolFlags::from(buf[5]),
    })
  }
}

/// Server answer to a [`ClientHello`].
#[derive(Debug, Clone, Copy)]
pub struct ServerHello {
  pub status: HandshakeStatus,
  pub version: u8,
  pub encoding: Encoding,
  pub nonce: [u8; NONCE_SIZE],
}

impl ServerHello {
  pub const SIZE: usize = 3 + NONCE_SIZE;

  pub fn to_bytes(&self) -> [u8; Self::SIZE] {
    let mut buf = [0u8; Self::SIZE];
    buf[0] = self.status as u8;
    buf[1] = self.version;
    buf[2] = self.encoding as u8;
    buf[3..].copy_from_slice(&self.nonce);
    buf
  }

  pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Result<Self> {
    let status = HandshakeStatus::try_from(buf[0])
      .map_err(|_| Error::Handshake(format!("unknown handshake status 0x{:02x}", buf[0])))?;
    let encoding = Encoding::try_from(buf[2])
      .map_err(|_| Error::Handshake(format!("unknown encoding 0x{:02x}", buf[2])))?;
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&buf[3..]);
    Ok(Self {
      status,
      version: buf[1],
      encoding,
      nonce,
    })
  }
}

/// Proof of possession of a discovery token: hex HMAC-SHA256 of the nonce.
pub fn auth_proof(token: &str, nonce: &[u8]) -> Result<String> {
  let mut mac = Hmac::<Sha256>::new_from_slice(token.as_bytes())
    .map_err(|e| Error::Handshake(format!("invalid token: {e}")))?;
  mac.update(nonce);
  Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a proof produced by [`auth_proof`] in constant time.
pub fn verify_auth_proof(token: &str, nonce: &[u8], proof: &str) -> bool {
  let Ok(expected) = hex::decode(proof) else {
    return false;
  };
  let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(token.as_bytes()) else {
    return false;
  };
  mac.update(nonce);
  mac.verify_slice(&expected).is_ok()
}

/// Which kind of result a SQL statement is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlExpectedResult {
  #[default]
  Any,
  Rows,
  UpdateCount,
}

/// Column types reported in SQL row metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlColumnType {
  Varchar,
  Boolean,
  Integer,
  Bigint,
  Double,
  Object,
  Null,
}

/// Name and type of one result column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlColumn {
  pub name: String,
  #[serde(rename = "type")]
  pub column_type: SqlColumnType,
  pub nullable: bool,
}

/// Error codes carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
  AuthenticationFailed,
  SqlSyntax,
  MappingNotFound,
  MappingExists,
  SqlTypeMismatch,
  DuplicateKey,
  UnexpectedResult,
  QueryNotFound,
  Serialization,
  Protocol,
  Internal,
}

/// Client-to-server message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
  Authenticate {
    id: u64,
    cluster_name: String,
    client_name: String,
    proof: Option<String>,
    statistics_enabled: bool,
  },
  MapPut {
    id: u64,
    map: String,
    key: Data,
    value: Data,
  },
  MapGet {
    id: u64,
    map: String,
    key: Data,
  },
  MapRemove {
    id: u64,
    map: String,
    key: Data,
  },
  MapContainsKey {
    id: u64,
    map: String,
    key: Data,
  },
  MapSize {
    id: u64,
    map: String,
  },
  SqlExecute {
    id: u64,
    sql: String,
    params: Vec<Data>,
    cursor_buffer_size: u32,
    expected: SqlExpectedResult,
  },
  SqlFetch {
    id: u64,
    query_id: Uuid,
    cursor_buffer_size: u32,
  },
  SqlClose {
    id: u64,
    query_id: Uuid,
  },
  Ping {
    id: u64,
  },
}

impl ClientMessage {
  pub fn id(&self) -> u64 {
    match self {
      ClientMessage::Authenticate { id, .. }
      | ClientMessage::MapPut { id, .. }
      | ClientMessage::MapGet { id, .. }
      | ClientMessage::MapRemove { id, .. }
      | ClientMessage::MapContainsKey { id, .. }
      | ClientMessage::MapSize { id, .. }
      | ClientMessage::SqlExecute { id, .. }
      | ClientMessage::SqlFetch { id, .. }
      | ClientMessage::SqlClose { id, .. }
      | ClientMessage::Ping { id } => *id,
    }
  }
}

/// Server-to-client message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
  Authenticated {
    id: u64,
    session_id: Uuid,
    cluster_name: String,
  },
  Value {
    id: u64,
    value: Option<Data>,
  },
  Bool {
    id: u64,
    value: bool,
  },
  Size {
    id: u64,
    size: u64,
  },
  Ack {
    id: u64,
  },
  SqlPage {
    id: u64,
    query_id: Option<Uuid>,
    columns: Vec<SqlColumn>,
    rows: Vec<Vec<Data>>,
    last: bool,
    update_count: i64,
  },
  Error {
    id: u64,
    code: ErrorCode,
    message: String,
  },
  Pong {
    id: u64,
  },
}

impl ServerMessage {
  pub fn id(&self) -> u64 {
    match self {
      ServerMessage::Authenticated { id, .. }
      | ServerMessage::Value { id, .. }
      | ServerMessage::Bool { id, .. }
      | ServerMessage::Size { id, .. }
      | ServerMessage::Ack { id }
      | ServerMessage::SqlPage { id, .. }
      | ServerMessage::Error { id, .. }
      | ServerMessage::Pong { id } => *id,
    }
  }

  pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
    ServerMessage::Error {
      id,
      code,
      message: message.into(),
    }
  }
}

/// Encodes a message body with the negotiated encoding.
pub fn encode_message<T: Serialize>(msg: &T, encoding: Encoding) -> Result<Vec<u8>> {
  let bytes = match encoding {
    Encoding::MessagePack => rmp_serde::to_vec_named(msg)?,
    Encoding::Json => serde_json::to_vec(msg)?,
  };
  if bytes.len() > MAX_MESSAGE_SIZE as usize {
    return Err(Error::Serialization(format!(
      "message of {} bytes exceeds the {} byte limit",
      bytes.len(),
      MAX_MESSAGE_SIZE
    )));
  }
  Ok(bytes)
}

/// Decodes a message body with the negotiated encoding.
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8], encoding: Encoding) -> Result<T> {
  Ok(match encoding {
    Encoding::MessagePack => rmp_serde::from_slice(bytes)?,
    Encoding::Json => serde_json::from_slice(bytes)?,
  })
}

#[derive(Deserialize)]
struct Envelope {
  id: u64,
}

/// Reads only the correlation id of a message, for replying to requests the
/// full decoder rejects.
pub fn peek_message_id(bytes: &[u8], encoding: Encoding) -> Option<u64> {
  decode_message::<Envelope>(bytes, encoding)
    .ok()
    .map(|envelope| envelope.id)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_hello_round_trip() {
    let hello = ClientHello {
      version: PROTOCOL_VERSION,
      flags: ProtocolFlags {
        messagepack: true,
        json_fallback: true,
      },
    };
    let bytes = hello.to_bytes();
    assert_eq!(&bytes[..4], b"KVGR");
    let parsed = ClientHello::from_bytes(&bytes).unwrap();
    assert_eq!(parsed.version, PROTOCOL_VERSION);
    assert!(parsed.flags.messagepack);
  }

  #[test]
  fn test_hello_rejects_bad_magic() {
    let bytes = *b"HTTP\x01\x01";
    assert!(ClientHello::from_bytes(&bytes).is_none());
  }

  #[test]
  fn test_auth_proof_verifies() {
    let nonce = [7u8; NONCE_SIZE];
    let proof = auth_proof("secret", &nonce).unwrap();
    assert!(verify_auth_proof("secret", &nonce, &proof));
    assert!(!verify_auth_proof("other", &nonce, &proof));
    assert!(!verify_auth_proof("secret", &nonce, "not-hex"));
  }

  #[test]
  fn test_negotiate_prefers_messagepack() {
    assert_eq!(ProtocolFlags::from(0x03).negotiate(), Some(Encoding::MessagePack));
    assert_eq!(ProtocolFlags::from(0x02).negotiate(), Some(Encoding::Json));
    assert_eq!(ProtocolFlags::from(0x00).negotiate(), None);
  }
}
