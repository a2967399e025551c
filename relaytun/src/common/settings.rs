// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use super::session::DEFAULT_RELAY_PORT;

/// Address the relay binds remote listeners on unless told otherwise
pub const DEFAULT_REMOTE_HOST: &str = "0.0.0.0";

/// Process-wide settings shared by every tunnel
#[derive(Clone, Eq, PartialEq)]
pub struct ClientSettings {
  /// Base URL of the registry service
  pub api_url: String,
  pub api_key: String,
  /// Relay host used when neither the request nor its configuration names one
  pub hostname: String,
  pub relay_port: u16,
  pub remote_host: String,
}

impl ClientSettings {
  pub fn new(
    api_url: impl Into<String>,
    api_key: impl Into<String>,
    hostname: impl Into<String>,
  ) -> Self {
    Self {
      api_url: api_url.into(),
      api_key: api_key.into(),
      hostname: hostname.into(),
      relay_port: DEFAULT_RELAY_PORT,
      remote_host: DEFAULT_REMOTE_HOST.to_string(),
    }
  }
}

impl std::fmt::Debug for ClientSettings {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ClientSettings")
      .field("api_url", &self.api_url)
      .field("api_key", &"<redacted>")
      .field("hostname", &self.hostname)
      .field("relay_port", &self.relay_port)
      .field("remote_host", &self.remote_host)
      .finish()
  }
}
