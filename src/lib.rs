//! kvgrid Rust Client SDK
//!
//! A native TCP/TLS client for kvgrid distributed maps, with compact and JSON
//! value serialization and a SQL query façade.
//!
//! # Example
//!
//! ```no_run
//! use kvgrid::{ClientConfig, GridClient};
//!
//! #[tokio::main]
//! async fn main() -> kvgrid::Result<()> {
//!     let config = ClientConfig::builder()
//!         .with_args(std::env::args().skip(1))
//!         .build()?;
//!
//!     // Connect to the cluster
//!     let client = GridClient::connect(config).await?;
//!
//!     // Put and get a value
//!     let map = client.get_map::<String, String>("map");
//!     map.put(&"key".to_string(), &"value".to_string()).await?;
//!     println!("Got: {:?}", map.get(&"key".to_string()).await?);
//!
//!     // Query with SQL
//!     let mut result = client.sql().execute_query("SELECT * FROM cities").await?;
//!     while let Some(row) = result.next_row().await? {
//!         println!("Row: {:?}", row);
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

mod client;
pub mod config;
mod connection;
mod error;
mod map;
pub mod protocol;
pub mod serialization;
pub mod server;
pub mod sql;

pub use client::{cancellable, ClientStatistics, GridClient};
pub use config::{ClientConfig, ClientConfigBuilder, ReconnectMode, SslOptions, TlsProtocol};
pub use error::{Error, ErrorKind, Result};
pub use map::Map;
pub use protocol::{
  ClientMessage, Encoding, HandshakeStatus, ProtocolFlags, ServerMessage, SqlColumn,
  SqlColumnType, MAGIC, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use serialization::{
  Codec, CompactReader, CompactSerializer, CompactWriter, Data, DataKind, GenericRecord, Json,
  JsonValue, SerializationRegistry,
};
pub use sql::{QueryState, SqlResult, SqlRow, SqlRowMetadata, SqlService, SqlStatement};
pub use tokio_util::sync::CancellationToken;
