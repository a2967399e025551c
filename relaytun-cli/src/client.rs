// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use relaytun::{
  common::{
    connection::ConnectRequest,
    daemon::TunnelDaemon,
    protocol::Protocol,
    registry::api::HttpRegistryApi,
    session::{
      host_key::{FixedHostKey, DEFAULT_RELAY_HOST_KEY},
      ssh::SshRelayDialer,
    },
    settings::ClientSettings,
  },
  ConnectionStatus,
};
use std::sync::Arc;

#[derive(Eq, PartialEq, Clone)]
pub struct ConnectArgs {
  pub target: String,
  pub protocol: Protocol,
  pub name: Option<String>,
  pub hostname: String,
  pub api_url: String,
  pub api_key: String,
  pub relay_host_key: Option<String>,
}

impl std::fmt::Debug for ConnectArgs {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectArgs")
      .field("target", &self.target)
      .field("protocol", &self.protocol)
      .field("name", &self.name)
      .field("hostname", &self.hostname)
      .field("api_url", &self.api_url)
      .field("relay_host_key", &self.relay_host_key.is_some())
      .finish_non_exhaustive()
  }
}

pub async fn client_main(config: ConnectArgs) -> Result<()> {
  let host_key = FixedHostKey::from_authorized_key(
    config
      .relay_host_key
      .as_deref()
      .unwrap_or(DEFAULT_RELAY_HOST_KEY),
  )
  .context("Failed parsing relay host key")?;
  tracing::debug!(fingerprint = host_key.fingerprint(), "trusting relay host key");
  let dialer = SshRelayDialer::from_env(Arc::new(host_key))
    .context("Invalid HTTP proxy in environment")?;
  let api = HttpRegistryApi::new(&config.api_url, &config.api_key);
  let settings = ClientSettings::new(config.api_url, config.api_key, config.hostname);
  let daemon = TunnelDaemon::new(settings, Arc::new(dialer), Arc::new(api));

  let pending = daemon
    .start(ConnectRequest {
      address: config.target,
      protocol: config.protocol,
      name: config.name,
      hostname: None,
    })
    .await
    .context("Failed starting tunnel")?;
  let starting = pending.handle.clone();
  let handle = tokio::select! {
    res = tokio::signal::ctrl_c() => {
      res.context("Failed listening for Ctrl+C")?;
      tracing::info!("Received Ctrl+C before the tunnel came online, stopping tunnel");
      starting.stop().await;
      return Ok(());
    }
    online = pending.online() => online.context("Tunnel failed to come online")?,
  };
  let info = handle.info();
  tracing::info!(
    id = %info.id,
    remote_port = info.port,
    remote_uri = ?info.remote_uri,
    "Tunnel online; press Ctrl+C to stop"
  );

  tokio::select! {
    res = tokio::signal::ctrl_c() => {
      res.context("Failed listening for Ctrl+C")?;
      tracing::info!("Received Ctrl+C, stopping tunnel");
      daemon.shutdown().await;
    }
    _ = handle.terminated() => {
      if handle.info().status != Some(ConnectionStatus::Online) {
        anyhow::bail!("Tunnel {} gave up reconnecting", handle.id());
      }
    }
  }
  Ok(())
}
