// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire-level types exchanged with the relay and the registry service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod proxy_http;
pub mod proxy_tcp;

/// Application protocol spoken by the tunneled target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  #[default]
  Tcp,
  Tls,
  Http,
  Https,
}

impl std::str::FromStr for Protocol {
  type Err = UnknownProtocol;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "tcp" => Ok(Self::Tcp),
      "tls" => Ok(Self::Tls),
      "http" => Ok(Self::Http),
      "https" => Ok(Self::Https),
      _ => Err(UnknownProtocol(s.to_string())),
    }
  }
}

impl std::fmt::Display for Protocol {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Self::Tcp => "tcp",
      Self::Tls => "tls",
      Self::Http => "http",
      Self::Https => "https",
    })
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown protocol {0:?}; expected one of tcp, tls, http, https")]
pub struct UnknownProtocol(pub String);

/// Handshake payload presented to the relay as the SSH username
///
/// Field order is part of the wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
  pub id: String,
  pub key: String,
  pub name: String,
  pub target: String,
  pub tls: bool,
  pub started: bool,
  pub reconnect: bool,
}

impl Header {
  pub fn to_username(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }
}

/// A named preset stored in the registry service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
  pub name: String,
  pub protocol: Protocol,
  pub prefix: String,
  pub hostname: String,
  pub domain: String,
  pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
  Online,
  Reconnecting,
}

/// Public state of a tunnel, as published locally and to the registry service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
  pub id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hostname: Option<String>,
  /// Port bound by the relay; zero until the tunnel first comes online
  pub port: u32,
  pub target_address: String,
  #[serde(default)]
  pub remote_uri: Option<String>,
  pub protocol: Protocol,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<ConnectionStatus>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub connected_at: Option<DateTime<Utc>>,
}

/// Body of a non-success response from the registry service
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiErrorBody {
  pub code: i64,
  pub message: String,
}
