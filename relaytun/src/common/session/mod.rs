// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Secure sessions to the relay and the remote listeners they expose
//!
//! The traits here separate the tunnel lifecycle from the SSH transport, so that the
//! lifecycle can be driven against in-memory sessions as well as [`ssh::SshRelayDialer`].

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use super::protocol::{proxy_http::ProxyError, Header};

pub mod host_key;
pub mod ssh;
#[cfg(test)]
pub(crate) mod testing;

/// Port on which relays accept SSH sessions
pub const DEFAULT_RELAY_PORT: u16 = 22222;

#[derive(thiserror::Error, Debug)]
pub enum DialError {
  #[error("Failed to connect to relay {address}")]
  Connect {
    address: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Proxy traversal failed")]
  Proxy(#[from] ProxyError),
  #[error("SSH handshake with relay failed")]
  Handshake(#[source] russh::Error),
  #[error("Relay rejected the handshake payload")]
  AuthenticationRejected,
  #[error("Handshake payload could not be serialized")]
  Payload(#[from] serde_json::Error),
}

impl DialError {
  /// Fatal errors end the tunnel rather than entering the reconnect path
  pub fn is_fatal(&self) -> bool {
    matches!(self, Self::Proxy(_) | Self::Payload(_))
  }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
  #[error("Relay refused the remote listener request")]
  ListenRefused(#[source] russh::Error),
  #[error("Session already has an active remote listener")]
  AlreadyListening,
  #[error("Remote listener closed")]
  ListenerClosed,
}

/// A listener bound on the relay's side of a session
pub trait RemoteListener: Send + 'static {
  type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

  /// Port the relay actually bound, which differs from the request when it was zero
  fn bound_port(&self) -> u32;

  /// Waits for the next inbound stream; an error means the session is gone
  fn accept(&mut self) -> BoxFuture<'_, Result<Self::Stream, SessionError>>;
}

/// One established, authenticated session with the relay
pub trait RelaySession: Send + 'static {
  type Listener: RemoteListener;

  fn listen<'a>(
    &'a mut self,
    host: &'a str,
    port: u32,
  ) -> BoxFuture<'a, Result<Self::Listener, SessionError>>;

  fn close(self) -> BoxFuture<'static, ()>;
}

/// Establishes sessions with the relay, presenting `header` as the session identity
pub trait RelayDialer: Send + Sync + 'static {
  type Session: RelaySession;

  fn dial<'a>(
    &'a self,
    relay: &'a str,
    header: &'a Header,
  ) -> BoxFuture<'a, Result<Self::Session, DialError>>;
}

pub type ListenerOf<D> = <<D as RelayDialer>::Session as RelaySession>::Listener;
pub type StreamOf<D> = <ListenerOf<D> as RemoteListener>::Stream;
