//! Error types for the kvgrid client SDK.

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Broad category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Connection,
  Serialization,
  Query,
  Resource,
  Config,
  Cancelled,
  Io,
  Server,
}

#[derive(Error, Debug)]
pub enum Error {
  #[error("Unreachable: {0}")]
  Unreachable(String),

  #[error("Handshake failed: {0}")]
  Handshake(String),

  #[error("Protocol version mismatch: server={server}, client={client}")]
  VersionMismatch { server: u8, client: u8 },

  #[error("Authentication failed: {0}")]
  AuthFailed(String),

  #[error("TLS handshake failed: {0}")]
  TlsHandshake(String),

  #[error("Timeout")]
  Timeout,

  #[error("Connection lost")]
  ConnectionLost,

  #[error("No serializer registered for type {0}")]
  NoSerializer(String),

  #[error("A serializer is already registered for type {0}")]
  DuplicateSerializer(String),

  #[error("Serialization error: {0}")]
  Serialization(String),

  #[error("SQL syntax error: {0}")]
  SqlSyntax(String),

  #[error("No mapping for {0}")]
  MappingNotFound(String),

  #[error("Cannot convert column {column} of type {actual} to {expected}")]
  TypeCoercion {
    column: String,
    expected: String,
    actual: String,
  },

  #[error("Column not found: {0}")]
  ColumnNotFound(String),

  #[error("SQL error: {0}")]
  Sql(String),

  #[error("Client is closed")]
  ClientClosed,

  #[error("Query result is closed")]
  QueryClosed,

  #[error("Configuration error: {0}")]
  Config(String),

  #[error("Operation cancelled")]
  Cancelled,

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Server error: {0}")]
  Server(String),
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::Unreachable(_)
      | Error::Handshake(_)
      | Error::VersionMismatch { .. }
      | Error::AuthFailed(_)
      | Error::TlsHandshake(_)
      | Error::Timeout
      | Error::ConnectionLost => ErrorKind::Connection,
      Error::NoSerializer(_) | Error::DuplicateSerializer(_) | Error::Serialization(_) => {
        ErrorKind::Serialization
      }
      Error::SqlSyntax(_)
      | Error::MappingNotFound(_)
      | Error::TypeCoercion { .. }
      | Error::ColumnNotFound(_)
      | Error::Sql(_) => ErrorKind::Query,
      Error::ClientClosed | Error::QueryClosed => ErrorKind::Resource,
      Error::Config(_) => ErrorKind::Config,
      Error::Cancelled => ErrorKind::Cancelled,
      Error::Io(_) => ErrorKind::Io,
      Error::Server(_) => ErrorKind::Server,
    }
  }

  /// Maps an error reported by the store back onto a typed variant.
  pub fn from_server(code: ErrorCode, message: String) -> Self {
    match code {
      ErrorCode::AuthenticationFailed => Error::AuthFailed(message),
      ErrorCode::SqlSyntax => Error::SqlSyntax(message),
      ErrorCode::MappingNotFound => Error::MappingNotFound(message),
      ErrorCode::MappingExists
      | ErrorCode::SqlTypeMismatch
      | ErrorCode::DuplicateKey
      | ErrorCode::UnexpectedResult
      | ErrorCode::QueryNotFound => Error::Sql(message),
      ErrorCode::Serialization => Error::Serialization(message),
      ErrorCode::Protocol | ErrorCode::Internal => Error::Server(message),
    }
  }
}

impl From<rmp_serde::encode::Error> for Error {
  fn from(e: rmp_serde::encode::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

impl From<rmp_serde::decode::Error> for Error {
  fn from(e: rmp_serde::decode::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;
