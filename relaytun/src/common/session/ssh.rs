// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use russh::{
  client::{self, Handle, Msg},
  Channel, ChannelStream, Disconnect,
};
use russh_keys::key::PublicKey;
use tokio::{net::TcpStream, sync::mpsc};
use url::Url;

use super::{
  host_key::TrustStore, DialError, RelayDialer, RelaySession, RemoteListener, SessionError,
};
use crate::common::protocol::{proxy_http, Header};

/// Sent in the password slot; the relay authorizes on the key inside the [`Header`]
pub const PLACEHOLDER_PASSWORD: &str = "password";

/// Dials relays over SSH, optionally through an HTTP `CONNECT` proxy
pub struct SshRelayDialer {
  config: Arc<client::Config>,
  trust: Arc<dyn TrustStore>,
  http_proxy: Option<Url>,
}

impl SshRelayDialer {
  pub fn new(trust: Arc<dyn TrustStore>, http_proxy: Option<Url>) -> Self {
    Self {
      config: Arc::new(client::Config::default()),
      trust,
      http_proxy,
    }
  }

  /// Builds a dialer honoring the proxy configured in the process environment
  pub fn from_env(trust: Arc<dyn TrustStore>) -> Result<Self, proxy_http::ProxyError> {
    let http_proxy = proxy_http::http_proxy_from_env()?;
    if let Some(proxy) = &http_proxy {
      tracing::info!(proxy = %proxy.host_str().unwrap_or_default(), "Dialing relays through HTTP proxy");
    }
    Ok(Self::new(trust, http_proxy))
  }
}

impl RelayDialer for SshRelayDialer {
  type Session = SshRelaySession;

  fn dial<'a>(
    &'a self,
    relay: &'a str,
    header: &'a Header,
  ) -> BoxFuture<'a, Result<Self::Session, DialError>> {
    async move {
      let username = header.to_username()?;
      let stream = match &self.http_proxy {
        Some(proxy) => proxy_http::connect_via_proxy(proxy, relay).await?,
        None => TcpStream::connect(relay)
          .await
          .map_err(|source| DialError::Connect {
            address: relay.to_string(),
            source,
          })?,
      };
      let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();
      let handler = RelayClientHandler {
        relay: relay.to_string(),
        trust: Arc::clone(&self.trust),
        forwarded: forwarded_tx,
      };
      let mut handle = client::connect_stream(Arc::clone(&self.config), stream, handler)
        .await
        .map_err(DialError::Handshake)?;
      let authenticated = handle
        .authenticate_password(username, PLACEHOLDER_PASSWORD)
        .await
        .map_err(DialError::Handshake)?;
      if !authenticated {
        return Err(DialError::AuthenticationRejected);
      }
      tracing::debug!(relay, "Relay session established");
      Ok(SshRelaySession {
        handle,
        forwarded: Some(forwarded_rx),
      })
    }
    .boxed()
  }
}

struct RelayClientHandler {
  relay: String,
  trust: Arc<dyn TrustStore>,
  forwarded: mpsc::UnboundedSender<Channel<Msg>>,
}

#[async_trait::async_trait]
impl client::Handler for RelayClientHandler {
  type Error = russh::Error;

  async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
    let trusted = self.trust.is_trusted(&self.relay, server_public_key);
    if !trusted {
      tracing::warn!(
        relay = %self.relay,
        fingerprint = %server_public_key.fingerprint(),
        "Relay presented an untrusted host key"
      );
    }
    Ok(trusted)
  }

  async fn server_channel_open_forwarded_tcpip(
    &mut self,
    channel: Channel<Msg>,
    connected_address: &str,
    connected_port: u32,
    originator_address: &str,
    originator_port: u32,
    _session: &mut client::Session,
  ) -> Result<(), Self::Error> {
    tracing::trace!(
      remote = %format!("{connected_address}:{connected_port}"),
      origin = %format!("{originator_address}:{originator_port}"),
      "Forwarded stream opened by relay"
    );
    if self.forwarded.send(channel).is_err() {
      tracing::debug!("Forwarded stream arrived with no listener attached; dropping");
    }
    Ok(())
  }
}

pub struct SshRelaySession {
  handle: Handle<RelayClientHandler>,
  forwarded: Option<mpsc::UnboundedReceiver<Channel<Msg>>>,
}

impl RelaySession for SshRelaySession {
  type Listener = SshRemoteListener;

  fn listen<'a>(
    &'a mut self,
    host: &'a str,
    port: u32,
  ) -> BoxFuture<'a, Result<Self::Listener, SessionError>> {
    async move {
      if self.forwarded.is_none() {
        return Err(SessionError::AlreadyListening);
      }
      let bound_port = self
        .handle
        .tcpip_forward(host, port)
        .await
        .map_err(SessionError::ListenRefused)?;
      let forwarded = self
        .forwarded
        .take()
        .ok_or(SessionError::AlreadyListening)?;
      Ok(SshRemoteListener {
        forwarded,
        bound_port,
      })
    }
    .boxed()
  }

  fn close(self) -> BoxFuture<'static, ()> {
    async move {
      if let Err(e) = self
        .handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
      {
        tracing::debug!(error = %e, "Relay session was already closed");
      }
    }
    .boxed()
  }
}

/// Streams the relay forwards to us after a `tcpip-forward` request
///
/// The sending half lives in the session's handler, so the channel closes exactly
/// when the session ends.
pub struct SshRemoteListener {
  forwarded: mpsc::UnboundedReceiver<Channel<Msg>>,
  bound_port: u32,
}

impl RemoteListener for SshRemoteListener {
  type Stream = ChannelStream<Msg>;

  fn bound_port(&self) -> u32 {
    self.bound_port
  }

  fn accept(&mut self) -> BoxFuture<'_, Result<Self::Stream, SessionError>> {
    async move {
      self
        .forwarded
        .recv()
        .await
        .map(Channel::into_stream)
        .ok_or(SessionError::ListenerClosed)
    }
    .boxed()
  }
}
