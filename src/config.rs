//! Client configuration.
//!
//! A [`ClientConfig`] is assembled by [`ClientConfigBuilder`] from up to four
//! layers, later layers winning:
//!
//! 1. defaults
//! 2. a JSON file (`{"kvgrid": {"clusterName": "dev", ...}}`)
//! 3. command-line `key=value` arguments (`kvgrid.clusterName=dev`)
//! 4. programmatic overrides
//!
//! The layer order is fixed, whatever order the builder methods are called in.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::serialization::{CompactSerializer, SerializationRegistry};

/// Default member address
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:5701";

/// Default cluster name
pub const DEFAULT_CLUSTER_NAME: &str = "dev";

/// Namespace of recognized option keys
pub const OPTION_PREFIX: &str = "kvgrid.";

/// What the client does when its session is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectMode {
  /// Close the client.
  DoNotReconnect,
  /// Try once per loss, then close the client.
  ReconnectOnce,
  /// Retry with backoff until connected or closed.
  #[default]
  ReconnectForever,
}

impl FromStr for ReconnectMode {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "off" | "never" | "donotreconnect" => Ok(Self::DoNotReconnect),
      "once" | "reconnect-once" | "reconnectonce" => Ok(Self::ReconnectOnce),
      "forever" | "reconnect-forever" | "reconnectforever" => Ok(Self::ReconnectForever),
      other => Err(Error::Config(format!("unknown reconnect mode: {other}"))),
    }
  }
}

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsProtocol {
  Tls10,
  Tls11,
  #[default]
  Tls12,
}

impl FromStr for TlsProtocol {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().replace(['.', '_', ' '], "").as_str() {
      "tls10" | "tls1" | "tlsv1" | "tlsv10" => Ok(Self::Tls10),
      "tls11" | "tlsv11" => Ok(Self::Tls11),
      "tls12" | "tlsv12" => Ok(Self::Tls12),
      other => Err(Error::Config(format!("unsupported TLS protocol: {other}"))),
    }
  }
}

#[derive(Debug, Clone)]
pub struct SslOptions {
  pub enabled: bool,
  pub validate_certificate_chain: bool,
  pub validate_certificate_name: bool,
  /// PKCS#12 client identity.
  pub certificate_path: Option<PathBuf>,
  pub certificate_password: Option<String>,
  pub protocol: TlsProtocol,
}

impl Default for SslOptions {
  fn default() -> Self {
    Self {
      enabled: false,
      validate_certificate_chain: true,
      validate_certificate_name: false,
      certificate_path: None,
      certificate_password: None,
      protocol: TlsProtocol::default(),
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct CloudOptions {
  pub discovery_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkingOptions {
  pub addresses: Vec<String>,
  pub connection_timeout: Duration,
  pub invocation_timeout: Duration,
  pub reconnect_mode: ReconnectMode,
  pub use_messagepack: bool,
  pub json_fallback: bool,
  pub cloud: CloudOptions,
  pub ssl: SslOptions,
}

impl Default for NetworkingOptions {
  fn default() -> Self {
    Self {
      addresses: vec![DEFAULT_ADDRESS.to_string()],
      connection_timeout: Duration::from_secs(5),
      invocation_timeout: Duration::from_secs(120),
      reconnect_mode: ReconnectMode::default(),
      use_messagepack: true,
      json_fallback: true,
      cloud: CloudOptions::default(),
      ssl: SslOptions::default(),
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsOptions {
  pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
  pub cluster_name: String,
  pub client_name: Option<String>,
  pub networking: NetworkingOptions,
  pub metrics: MetricsOptions,
  pub serialization: SerializationRegistry,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
      client_name: None,
      networking: NetworkingOptions::default(),
      metrics: MetricsOptions::default(),
      serialization: SerializationRegistry::new(),
    }
  }
}

impl ClientConfig {
  pub fn builder() -> ClientConfigBuilder {
    ClientConfigBuilder::new()
  }

  /// Sets one option by key. Keys are matched case-insensitively, with or
  /// without the `kvgrid.` prefix.
  pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
    let lower = key.to_ascii_lowercase();
    let name = lower.strip_prefix(OPTION_PREFIX).unwrap_or(&lower);
    let net = &mut self.networking;
    match name {
      "clustername" => self.cluster_name = value.to_string(),
      "clientname" => self.client_name = Some(value.to_string()),
      "networking.addresses" => {
        net.addresses = value
          .split(',')
          .map(str::trim)
          .filter(|a| !a.is_empty())
          .map(str::to_string)
          .collect();
      }
      "networking.connectiontimeoutmilliseconds" => {
        net.connection_timeout = Duration::from_millis(parse_value(key, value)?);
      }
      "networking.invocationtimeoutmilliseconds" => {
        net.invocation_timeout = Duration::from_millis(parse_value(key, value)?);
      }
      "networking.reconnectmode" => net.reconnect_mode = value.parse()?,
      "networking.messagepack" => net.use_messagepack = parse_value(key, value)?,
      "networking.jsonfallback" => net.json_fallback = parse_value(key, value)?,
      "networking.cloud.discoverytoken" => net.cloud.discovery_token = Some(value.to_string()),
      "networking.ssl.enabled" => net.ssl.enabled = parse_value(key, value)?,
      "networking.ssl.validatecertificatechain" => {
        net.ssl.validate_certificate_chain = parse_value(key, value)?;
      }
      "networking.ssl.validatecertificatename" => {
        net.ssl.validate_certificate_name = parse_value(key, value)?;
      }
      "networking.ssl.certificatepath" => net.ssl.certificate_path = Some(PathBuf::from(value)),
      "networking.ssl.certificatepassword" => {
        net.ssl.certificate_password = Some(value.to_string());
      }
      "networking.ssl.protocol" => net.ssl.protocol = value.parse()?,
      "metrics.enabled" => self.metrics.enabled = parse_value(key, value)?,
      _ => return Err(Error::Config(format!("unknown option: {key}"))),
    }
    Ok(())
  }

  /// Registers a compact serializer.
  pub fn add_serializer<S: CompactSerializer>(&mut self, serializer: S) -> Result<()> {
    self.serialization.register(serializer)
  }

  /// Checks the configuration before any network attempt.
  pub fn validate(&self) -> Result<()> {
    if self.cluster_name.trim().is_empty() {
      return Err(Error::Config("cluster name must not be empty".to_string()));
    }
    if self.networking.addresses.is_empty() {
      return Err(Error::Config("at least one address is required".to_string()));
    }
    for address in &self.networking.addresses {
      split_address(address)?;
    }
    if self.networking.connection_timeout.is_zero() {
      return Err(Error::Config("connection timeout must be positive".to_string()));
    }
    if self.networking.invocation_timeout.is_zero() {
      return Err(Error::Config("invocation timeout must be positive".to_string()));
    }
    if !self.networking.use_messagepack && !self.networking.json_fallback {
      return Err(Error::Config("no wire encoding enabled".to_string()));
    }
    let ssl = &self.networking.ssl;
    if ssl.certificate_password.is_some() && ssl.certificate_path.is_none() {
      return Err(Error::Config(
        "certificate password given without a certificate path".to_string(),
      ));
    }
    Ok(())
  }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
  value
    .trim()
    .parse()
    .map_err(|_| Error::Config(format!("invalid value for {key}: {value}")))
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub(crate) fn split_address(address: &str) -> Result<(&str, u16)> {
  let (host, port) = address
    .rsplit_once(':')
    .ok_or_else(|| Error::Config(format!("address {address} has no port")))?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.is_empty() {
    return Err(Error::Config(format!("address {address} has no host")));
  }
  let port = port
    .parse::<u16>()
    .map_err(|_| Error::Config(format!("invalid port in address {address}")))?;
  Ok((host, port))
}

type Override = Box<dyn FnOnce(&mut ClientConfig) -> Result<()> + Send>;

/// Builds a [`ClientConfig`] from layered sources.
#[derive(Default)]
pub struct ClientConfigBuilder {
  file: Option<PathBuf>,
  args: Vec<(String, String)>,
  overrides: Vec<Override>,
}

impl ClientConfigBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Reads options from a JSON file.
  pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
    self.file = Some(path.as_ref().to_path_buf());
    self
  }

  /// Reads `key=value` command-line arguments. Arguments without `=` (such as
  /// `-n100`) are skipped.
  pub fn with_args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    for arg in args {
      if let Some((key, value)) = arg.as_ref().split_once('=') {
        self.args.push((key.trim().to_string(), value.trim().to_string()));
      }
    }
    self
  }

  /// Sets one option in the programmatic layer.
  pub fn with_option(self, key: impl Into<String>, value: impl Into<String>) -> Self {
    let (key, value) = (key.into(), value.into());
    self.with(move |config| config.set_option(&key, &value))
  }

  /// Applies a closure in the programmatic layer.
  pub fn with<F>(mut self, f: F) -> Self
  where
    F: FnOnce(&mut ClientConfig) -> Result<()> + Send + 'static,
  {
    self.overrides.push(Box::new(f));
    self
  }

  pub fn build(self) -> Result<ClientConfig> {
    let mut config = ClientConfig::default();

    if let Some(path) = &self.file {
      let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
      let json: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("invalid JSON in {}: {e}", path.display())))?;
      let mut options = Vec::new();
      flatten_json("", &json, &mut options);
      apply_options(&mut config, &options)?;
    }

    apply_options(&mut config, &self.args)?;

    for f in self.overrides {
      f(&mut config)?;
    }

    config.validate()?;
    Ok(config)
  }
}

/// Applies options in the `kvgrid.` namespace, skipping all others.
fn apply_options(config: &mut ClientConfig, options: &[(String, String)]) -> Result<()> {
  for (key, value) in options {
    if key.to_ascii_lowercase().starts_with(OPTION_PREFIX) {
      config.set_option(key, value)?;
    } else {
      debug!("Ignoring option outside the kvgrid namespace: {}", key);
    }
  }
  Ok(())
}

/// Flattens nested objects to dotted keys; arrays become comma-separated.
fn flatten_json(prefix: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
  use serde_json::Value;

  match value {
    Value::Object(map) => {
      for (k, v) in map {
        let key = if prefix.is_empty() {
          k.clone()
        } else {
          format!("{prefix}.{k}")
        };
        flatten_json(&key, v, out);
      }
    }
    Value::Array(items) => {
      let joined = items
        .iter()
        .map(|item| match item {
          Value::String(s) => s.clone(),
          other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",");
      out.push((prefix.to_string(), joined));
    }
    Value::String(s) => out.push((prefix.to_string(), s.clone())),
    Value::Null => {}
    other => out.push((prefix.to_string(), other.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = ClientConfig::builder().build().unwrap();
    assert_eq!(config.cluster_name, "dev");
    assert_eq!(config.networking.addresses, vec![DEFAULT_ADDRESS.to_string()]);
    assert!(!config.networking.ssl.enabled);
    assert!(config.networking.ssl.validate_certificate_chain);
    assert_eq!(config.networking.reconnect_mode, ReconnectMode::ReconnectForever);
  }

  #[test]
  fn test_args_are_parsed_and_non_options_skipped() {
    let config = ClientConfig::builder()
      .with_args([
        "-n100",
        "kvgrid.clusterName=prod",
        "kvgrid.networking.ssl.enabled=true",
        "kvgrid.networking.ssl.protocol=Tls12",
        "kvgrid.networking.addresses=10.0.0.1:5701, 10.0.0.2:5701",
        "logging:logLevel:kvgrid=Information",
      ])
      .build()
      .unwrap();
    assert_eq!(config.cluster_name, "prod");
    assert!(config.networking.ssl.enabled);
    assert_eq!(config.networking.addresses.len(), 2);
  }

  #[test]
  fn test_unknown_option_in_namespace_fails() {
    let err = ClientConfig::builder()
      .with_args(["kvgrid.networking.bogus=1"])
      .build()
      .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
  }

  #[test]
  fn test_bad_value_fails_fast() {
    let err = ClientConfig::builder()
      .with_args(["kvgrid.networking.ssl.enabled=maybe"])
      .build()
      .unwrap_err();
    assert!(err.to_string().contains("ssl.enabled"));
  }

  #[test]
  fn test_override_beats_args() {
    let config = ClientConfig::builder()
      .with_option("kvgrid.clusterName", "from-code")
      .with_args(["kvgrid.clusterName=from-args"])
      .build()
      .unwrap();
    assert_eq!(config.cluster_name, "from-code");
  }

  #[test]
  fn test_flatten_json() {
    let json = serde_json::json!({
      "kvgrid": {
        "clusterName": "a",
        "networking": { "addresses": ["h1:1", "h2:2"], "ssl": { "enabled": true } },
        "clientName": null
      }
    });
    let mut out = Vec::new();
    flatten_json("", &json, &mut out);
    out.sort();
    assert_eq!(
      out,
      vec![
        ("kvgrid.clusterName".to_string(), "a".to_string()),
        ("kvgrid.networking.addresses".to_string(), "h1:1,h2:2".to_string()),
        ("kvgrid.networking.ssl.enabled".to_string(), "true".to_string()),
      ]
    );
  }

  #[test]
  fn test_split_address() {
    assert_eq!(split_address("localhost:5701").unwrap(), ("localhost", 5701));
    assert_eq!(split_address("[::1]:5701").unwrap(), ("::1", 5701));
    assert!(split_address("localhost").is_err());
    assert!(split_address("localhost:http").is_err());
  }

  #[test]
  fn test_reconnect_mode_parse() {
    assert_eq!("off".parse::<ReconnectMode>().unwrap(), ReconnectMode::DoNotReconnect);
    assert_eq!("reconnect-once".parse::<ReconnectMode>().unwrap(), ReconnectMode::ReconnectOnce);
    assert!("sometimes".parse::<ReconnectMode>().is_err());
  }
}
