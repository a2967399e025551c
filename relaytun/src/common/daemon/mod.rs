// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use futures::future;
use std::sync::Arc;
use tokio::{sync::oneshot, task::JoinHandle};

use crate::common::{
  connection::{
    self, ConnectRequest, ConnectionExit, ConnectionHandle, CreateError, TunnelConnection,
  },
  protocol::ConnectionInfo,
  registry::{
    api::{RegistryApi, RegistryApiError},
    ConnectionRegistry,
  },
  session::RelayDialer,
  settings::ClientSettings,
};

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
  #[error(transparent)]
  Create(#[from] CreateError),
  #[error("Tunnel ended before coming online: {0:?}")]
  NotEstablished(ConnectionExit),
  #[error("Tunnel lifecycle task failed")]
  Lifecycle(#[from] tokio::task::JoinError),
  #[error("No connection named {0:?}")]
  NotFound(String),
  #[error("Failed to delete connection")]
  Delete(#[from] RegistryApiError),
}

/// A spawned tunnel that may not have come online yet
pub struct PendingTunnel {
  pub handle: ConnectionHandle,
  ready: oneshot::Receiver<()>,
  task: JoinHandle<ConnectionExit>,
}

impl PendingTunnel {
  /// Waits for the tunnel to come online, or for its lifecycle to end first
  pub async fn online(self) -> Result<ConnectionHandle, DaemonError> {
    match self.ready.await {
      Ok(()) => Ok(self.handle),
      Err(_) => Err(DaemonError::NotEstablished(self.task.await?)),
    }
  }
}

/// Owns every tunnel started by this process
pub struct TunnelDaemon<D, A> {
  settings: ClientSettings,
  dialer: Arc<D>,
  api: Arc<A>,
  registry: Arc<ConnectionRegistry>,
}

impl<D, A> TunnelDaemon<D, A>
where
  D: RelayDialer,
  A: RegistryApi,
{
  pub fn new(settings: ClientSettings, dialer: Arc<D>, api: Arc<A>) -> Self {
    Self {
      settings,
      dialer,
      api,
      registry: Arc::new(ConnectionRegistry::new()),
    }
  }

  pub fn settings(&self) -> &ClientSettings {
    &self.settings
  }

  pub fn registry(&self) -> &Arc<ConnectionRegistry> {
    &self.registry
  }

  /// Spawns a tunnel without waiting for it
  ///
  /// The handle can stop the tunnel even before it first comes online, which is the
  /// only way to reach it then, since it is not yet in the registry.
  pub async fn start(&self, request: ConnectRequest) -> Result<PendingTunnel, DaemonError> {
    tracing::info!(target_address = %request.address, protocol = %request.protocol, "starting tunnel");
    let tunnel = TunnelConnection::create(
      request,
      &self.settings,
      Arc::clone(&self.dialer),
      Arc::clone(&self.api),
      Arc::clone(&self.registry),
    )
    .await?;
    let (handle, ready, task) = tunnel.spawn();
    Ok(PendingTunnel {
      handle,
      ready,
      task,
    })
  }

  /// Starts a tunnel and waits until it is first online
  ///
  /// Once this returns, the tunnel keeps reconnecting in the background until it is
  /// stopped, deleted, or abandoned after exhausting its retries.
  pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectionHandle, DaemonError> {
    self.start(request).await?.online().await
  }

  /// Stops the named tunnel, leaving it known to the registry service
  pub async fn stop(&self, key: &str) -> Result<ConnectionHandle, DaemonError> {
    let handle = self
      .registry
      .lookup(key)
      .ok_or_else(|| DaemonError::NotFound(key.to_string()))?;
    handle.stop().await;
    Ok(handle)
  }

  /// Stops the named tunnel and removes it from the registry service
  pub async fn delete(&self, key: &str) -> Result<(), DaemonError> {
    let handle = self.stop(key).await?;
    connection::delete_connection(self.api.as_ref(), &self.registry, &handle).await?;
    Ok(())
  }

  pub fn connections(&self) -> Vec<ConnectionInfo> {
    self.registry.snapshot()
  }

  /// Stops every running tunnel
  pub async fn shutdown(&self) {
    let handles = self.registry.handles();
    tracing::info!(count = handles.len(), "stopping all tunnels");
    future::join_all(handles.iter().map(|handle| handle.stop())).await;
  }
}
