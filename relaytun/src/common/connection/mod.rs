// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Lifecycle of a single tunnel: dial, listen, dispatch, reconnect, stop
//!
//! A [`TunnelConnection`] runs as one control task. Each successful dial starts a
//! *generation*: one relay session plus one accept-dispatch task feeding the control
//! loop. A generation ends when the remote listener fails or a stop is requested,
//! and its dispatch task is joined before another dial is attempted.

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{
  protocol::{proxy_tcp, Configuration, ConnectionInfo, ConnectionStatus, Header, Protocol},
  registry::{
    api::{RegistryApi, RegistryApiError},
    ConnectionRegistry,
  },
  session::{
    DialError, ListenerOf, RelayDialer, RelaySession, RemoteListener, SessionError, StreamOf,
  },
  settings::ClientSettings,
};

/// Reconnect attempts allowed after a failure before the tunnel is abandoned
pub const MAX_RETRIES: u32 = 5;

/// Remote port requested for HTTPS tunnels; every other protocol lets the relay choose
pub const HTTPS_REMOTE_PORT: u32 = 80;

/// Delay before reconnect attempt `retries`, growing quadratically
pub fn backoff_delay(retries: u32) -> Duration {
  let retries = u64::from(retries);
  Duration::from_secs(retries * retries)
}

/// A request to expose `address` through the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
  pub address: String,
  pub protocol: Protocol,
  /// Named configuration to fetch from the registry service
  pub name: Option<String>,
  /// Relay host override
  pub hostname: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum CreateError {
  #[error(transparent)]
  Lookup(#[from] RegistryApiError),
}

/// How a tunnel lifecycle ended
#[derive(Debug)]
pub enum ConnectionExit {
  /// A stop was requested
  Stopped,
  /// Reconnect attempts were exhausted and the tunnel was deleted
  Abandoned,
  /// The relay refused the remote listener
  ListenFailed(SessionError),
  /// Another connection holds this tunnel's name locally
  RegistrationFailed(super::registry::RegistrationError),
  /// Dialing failed in a way that retrying cannot fix
  Fatal(DialError),
}

/// Everything about a tunnel that follows from its request and optional configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTunnel {
  pub header: Header,
  pub name: String,
  pub protocol: Protocol,
  pub relay_address: String,
  pub remote_host: String,
  pub remote_port: u32,
}

impl ResolvedTunnel {
  pub fn resolve(
    id: &str,
    request: &ConnectRequest,
    configuration: Option<&Configuration>,
    settings: &ClientSettings,
  ) -> Self {
    let name = request.name.clone().unwrap_or_default();
    let protocol = configuration.map_or(request.protocol, |c| c.protocol);
    let remote_port = if protocol == Protocol::Https {
      HTTPS_REMOTE_PORT
    } else {
      0
    };
    // Header TLS is only requested for ad-hoc tunnels; named configurations carry their own
    let tls = configuration.is_none() && request.protocol == Protocol::Tls;
    let relay_host = configuration
      .map(|c| c.hostname.as_str())
      .filter(|h| !h.is_empty())
      .or(request.hostname.as_deref().filter(|h| !h.is_empty()))
      .unwrap_or(settings.hostname.as_str());
    Self {
      header: Header {
        id: id.to_string(),
        key: settings.api_key.clone(),
        name: name.clone(),
        target: request.address.clone(),
        tls,
        started: false,
        reconnect: false,
      },
      name,
      protocol,
      relay_address: format!("{}:{}", relay_host, settings.relay_port),
      remote_host: settings.remote_host.clone(),
      remote_port,
    }
  }
}

/// Shared view of a running tunnel
#[derive(Clone)]
pub struct ConnectionHandle {
  id: Arc<str>,
  key: Arc<str>,
  info: Arc<ArcSwap<ConnectionInfo>>,
  stop: CancellationToken,
  terminated: CancellationToken,
}

impl ConnectionHandle {
  pub fn new(info: ConnectionInfo) -> Self {
    let key = if info.name.is_empty() {
      info.id.clone()
    } else {
      info.name.clone()
    };
    Self {
      id: info.id.as_str().into(),
      key: key.into(),
      info: Arc::new(ArcSwap::from_pointee(info)),
      stop: CancellationToken::new(),
      terminated: CancellationToken::new(),
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  /// Key under which the tunnel is held in the [`ConnectionRegistry`]
  pub fn registry_key(&self) -> String {
    self.key.to_string()
  }

  pub fn info(&self) -> ConnectionInfo {
    self.info.load().as_ref().clone()
  }

  pub fn is_terminated(&self) -> bool {
    self.terminated.is_cancelled()
  }

  /// Resolves once the lifecycle task has exited, for any reason
  pub async fn terminated(&self) {
    self.terminated.cancelled().await
  }

  /// Requests a graceful stop and waits until the control loop has acted on it
  pub async fn stop(&self) {
    tracing::warn!(name = %self.key, "stopping connection");
    self.stop.cancel();
    self.terminated.cancelled().await
  }
}

impl std::fmt::Debug for ConnectionHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectionHandle")
      .field("id", &self.id)
      .field("key", &self.key)
      .field("terminated", &self.is_terminated())
      .finish()
  }
}

enum GenerationExit {
  Stopped,
  ListenerFailed(SessionError),
}

pub struct TunnelConnection<D, A> {
  id: String,
  name: String,
  hostname: Option<String>,
  target_address: String,
  relay_address: String,
  remote_host: String,
  remote_port: u32,
  protocol: Protocol,
  status: Option<ConnectionStatus>,
  connected_at: Option<DateTime<Utc>>,
  retries: u32,
  header: Header,
  configuration: Option<Configuration>,
  remote_uri: Option<String>,
  bound_port: u32,
  handle: ConnectionHandle,
  ready: Option<oneshot::Sender<()>>,
  dialer: Arc<D>,
  api: Arc<A>,
  registry: Arc<ConnectionRegistry>,
}

impl<D, A> TunnelConnection<D, A>
where
  D: RelayDialer,
  A: RegistryApi,
{
  /// Builds a tunnel for `request`, fetching its named configuration if one is given
  pub async fn create(
    request: ConnectRequest,
    settings: &ClientSettings,
    dialer: Arc<D>,
    api: Arc<A>,
    registry: Arc<ConnectionRegistry>,
  ) -> Result<Self, CreateError> {
    let configuration = match request.name.as_deref().filter(|n| !n.is_empty()) {
      Some(name) => Some(api.find_configuration(name).await.map_err(|e| {
        tracing::error!(name, error = %e, "configuration lookup failed");
        e
      })?),
      None => None,
    };
    let id = uuid::Uuid::new_v4().simple().to_string();
    Ok(Self::new(
      id,
      request,
      configuration,
      settings,
      dialer,
      api,
      registry,
    ))
  }

  pub fn new(
    id: String,
    request: ConnectRequest,
    configuration: Option<Configuration>,
    settings: &ClientSettings,
    dialer: Arc<D>,
    api: Arc<A>,
    registry: Arc<ConnectionRegistry>,
  ) -> Self {
    let resolved = ResolvedTunnel::resolve(&id, &request, configuration.as_ref(), settings);
    let handle = ConnectionHandle::new(ConnectionInfo {
      id: id.clone(),
      name: resolved.name.clone(),
      hostname: request.hostname.clone(),
      port: 0,
      target_address: request.address.clone(),
      remote_uri: None,
      protocol: resolved.protocol,
      status: None,
      connected_at: None,
    });
    Self {
      id,
      name: resolved.name,
      hostname: request.hostname,
      target_address: request.address,
      relay_address: resolved.relay_address,
      remote_host: resolved.remote_host,
      remote_port: resolved.remote_port,
      protocol: resolved.protocol,
      status: None,
      connected_at: None,
      retries: 0,
      header: resolved.header,
      configuration,
      remote_uri: None,
      bound_port: 0,
      handle,
      ready: None,
      dialer,
      api,
      registry,
    }
  }

  pub fn handle(&self) -> &ConnectionHandle {
    &self.handle
  }

  pub fn header(&self) -> &Header {
    &self.header
  }

  pub fn remote_port(&self) -> u32 {
    self.remote_port
  }

  pub fn configuration(&self) -> Option<&Configuration> {
    self.configuration.as_ref()
  }

  fn snapshot(&self) -> ConnectionInfo {
    ConnectionInfo {
      id: self.id.clone(),
      name: self.name.clone(),
      hostname: self.hostname.clone(),
      port: self.bound_port,
      target_address: self.target_address.clone(),
      remote_uri: self.remote_uri.clone(),
      protocol: self.protocol,
      status: self.status,
      connected_at: self.connected_at,
    }
  }

  fn publish(&self) {
    self.handle.info.store(Arc::new(self.snapshot()));
  }

  /// Spawns the lifecycle task
  ///
  /// The returned receiver resolves the first time the tunnel comes online, and errors
  /// if the lifecycle ends before that ever happens.
  pub fn spawn(
    mut self,
  ) -> (
    ConnectionHandle,
    oneshot::Receiver<()>,
    tokio::task::JoinHandle<ConnectionExit>,
  ) {
    let (ready_tx, ready_rx) = oneshot::channel();
    self.ready = Some(ready_tx);
    let handle = self.handle.clone();
    let span = tracing::span!(tracing::Level::INFO, "tunnel", id = %self.id, name = %self.name);
    let task = tokio::task::spawn(
      async move {
        let _terminated = self.handle.terminated.clone().drop_guard();
        let exit = self.run().await;
        match &exit {
          ConnectionExit::Stopped => tracing::info!("tunnel stopped"),
          ConnectionExit::Abandoned => tracing::warn!("tunnel abandoned"),
          other => tracing::error!(exit = ?other, "tunnel lifecycle failed"),
        }
        exit
      }
      .instrument(span),
    );
    (handle, ready_rx, task)
  }

  /// Runs the reconnect loop until the tunnel stops or is given up on
  pub async fn run(&mut self) -> ConnectionExit {
    let stop = self.handle.stop.clone();
    loop {
      if self.header.reconnect {
        self.retries += 1;
        if self.retries > MAX_RETRIES {
          tracing::error!(name = %self.name, "failed to reconnect connection");
          if let Err(e) = self.delete().await {
            tracing::error!(error = %e, "failed to delete abandoned connection");
          }
          return ConnectionExit::Abandoned;
        }
        tokio::select! {
          biased;
          _ = stop.cancelled() => return ConnectionExit::Stopped,
          _ = tokio::time::sleep(backoff_delay(self.retries)) => {}
        }
        self.status = Some(ConnectionStatus::Reconnecting);
        self.publish();
        let updated = tokio::select! {
          biased;
          _ = stop.cancelled() => return ConnectionExit::Stopped,
          updated = self.update() => updated,
        };
        if let Err(e) = updated {
          tracing::error!(error = %e, "failed to report reconnecting status");
        }
        tracing::warn!(name = %self.name, retry = self.retries, "reconnecting connection");
      }

      let dialed = tokio::select! {
        biased;
        _ = stop.cancelled() => return ConnectionExit::Stopped,
        dialed = self.dialer.dial(&self.relay_address, &self.header) => dialed,
      };
      let mut session = match dialed {
        Ok(session) => session,
        Err(e) if e.is_fatal() => {
          tracing::error!(error = %e, relay = %self.relay_address, "cannot open new session");
          return ConnectionExit::Fatal(e);
        }
        Err(e) => {
          tracing::error!(error = %e, relay = %self.relay_address, "failed to dial relay");
          self.header.reconnect = true;
          continue;
        }
      };

      let listener = match session.listen(&self.remote_host, self.remote_port).await {
        Ok(listener) => listener,
        Err(e) => {
          tracing::error!(error = %e, "failed to listen on remote host");
          session.close().await;
          return ConnectionExit::ListenFailed(e);
        }
      };
      self.bound_port = listener.bound_port();
      if let Err(e) = self.registry.register(self.handle.clone()) {
        tracing::error!(error = %e, "failed to register connection");
        session.close().await;
        return ConnectionExit::RegistrationFailed(e);
      }

      self.header.reconnect = false;
      self.retries = 0;
      self.status = Some(ConnectionStatus::Online);
      self.connected_at = Some(Utc::now());
      self.publish();
      tracing::info!(
        relay = %self.relay_address,
        remote_port = self.bound_port,
        target = %self.target_address,
        "connection online"
      );
      if !self.header.started {
        self.header.started = true;
        if let Some(ready) = self.ready.take() {
          let _ = ready.send(());
        }
      }

      let generation = self.serve(listener, &stop).await;
      tracing::info!(name = %self.name, "closing connection");
      session.close().await;
      match generation {
        GenerationExit::Stopped => return ConnectionExit::Stopped,
        GenerationExit::ListenerFailed(e) => {
          tracing::warn!(error = %e, "remote listener failed");
          self.status = Some(ConnectionStatus::Reconnecting);
          self.publish();
          self.header.reconnect = true;
        }
      }
    }
  }

  /// Drives one generation: dispatches accepted streams until stop or listener failure
  async fn serve(&self, listener: ListenerOf<D>, stop: &CancellationToken) -> GenerationExit {
    let (accepted_tx, mut accepted_rx) = mpsc::channel(1);
    let (failed_tx, mut failed_rx) = oneshot::channel();
    let dispatch = tokio::task::spawn(
      accept_dispatch(listener, accepted_tx, failed_tx)
        .instrument(tracing::span!(tracing::Level::DEBUG, "accept_dispatch")),
    );

    let exit = loop {
      tokio::select! {
        biased;
        _ = stop.cancelled() => break GenerationExit::Stopped,
        Some(inbound) = accepted_rx.recv() => self.spawn_proxy(inbound),
        failed = &mut failed_rx => {
          break GenerationExit::ListenerFailed(failed.unwrap_or(SessionError::ListenerClosed));
        }
      }
    };

    dispatch.abort();
    let _ = dispatch.await;
    exit
  }

  fn spawn_proxy(&self, inbound: StreamOf<D>) {
    let target = self.target_address.clone();
    tokio::task::spawn(
      async move { proxy_tcp::proxy_to_target(inbound, &target).await }
        .instrument(tracing::span!(tracing::Level::DEBUG, "proxy_tcp")),
    );
  }

  async fn update(&mut self) -> Result<(), RegistryApiError> {
    let echoed = self.api.update_connection(&self.handle.info()).await?;
    if echoed.remote_uri.is_some() {
      self.remote_uri = echoed.remote_uri;
      self.publish();
    }
    Ok(())
  }

  async fn delete(&self) -> Result<(), RegistryApiError> {
    delete_connection(self.api.as_ref(), &self.registry, &self.handle).await
  }
}

/// Removes a tunnel from the registry service, then from the local registry
pub async fn delete_connection<A: RegistryApi + ?Sized>(
  api: &A,
  registry: &ConnectionRegistry,
  handle: &ConnectionHandle,
) -> Result<(), RegistryApiError> {
  tracing::warn!(name = %handle.registry_key(), "removing connection");
  api.delete_connection(handle.id()).await?;
  registry.deregister_connection(&handle.registry_key(), handle.id());
  Ok(())
}

/// Accepts inbound streams until the first accept error, which is reported once
async fn accept_dispatch<L: RemoteListener>(
  mut listener: L,
  accepted: mpsc::Sender<L::Stream>,
  failed: oneshot::Sender<SessionError>,
) {
  loop {
    match listener.accept().await {
      Ok(inbound) => {
        if accepted.send(inbound).await.is_err() {
          return;
        }
      }
      Err(e) => {
        let _ = failed.send(e);
        return;
      }
    }
  }
}

#[cfg(test)]
mod tests;
