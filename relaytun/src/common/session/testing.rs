// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-memory sessions for driving tunnel lifecycles without a relay
use std::{
  collections::VecDeque,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
  },
};

use futures::future::{BoxFuture, FutureExt};
use tokio::{io::DuplexStream, sync::mpsc};

use super::{DialError, RelayDialer, RelaySession, RemoteListener, SessionError};
use crate::common::protocol::{proxy_http::ProxyError, Header};

pub type Inbound = Result<DuplexStream, SessionError>;

pub struct FakeListener {
  inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl RemoteListener for FakeListener {
  type Stream = DuplexStream;

  fn bound_port(&self) -> u32 {
    40080
  }

  fn accept(&mut self) -> BoxFuture<'_, Result<DuplexStream, SessionError>> {
    async move {
      match self.inbound.recv().await {
        Some(inbound) => inbound,
        None => Err(SessionError::ListenerClosed),
      }
    }
    .boxed()
  }
}

pub fn fake_listener() -> (FakeListener, mpsc::UnboundedSender<Inbound>) {
  let (tx, rx) = mpsc::unbounded_channel();
  (FakeListener { inbound: rx }, tx)
}

pub struct FakeSession {
  listener: Option<Result<FakeListener, SessionError>>,
  closed: Arc<AtomicUsize>,
  listened_on: Arc<Mutex<Vec<(String, u32)>>>,
}

impl RelaySession for FakeSession {
  type Listener = FakeListener;

  fn listen<'a>(
    &'a mut self,
    host: &'a str,
    port: u32,
  ) -> BoxFuture<'a, Result<FakeListener, SessionError>> {
    self
      .listened_on
      .lock()
      .unwrap()
      .push((host.to_string(), port));
    let listener = self
      .listener
      .take()
      .unwrap_or(Err(SessionError::AlreadyListening));
    futures::future::ready(listener).boxed()
  }

  fn close(self) -> BoxFuture<'static, ()> {
    self.closed.fetch_add(1, Ordering::SeqCst);
    futures::future::ready(()).boxed()
  }
}

pub enum Outcome {
  Fail,
  Fatal,
  Session(Result<FakeListener, SessionError>),
}

/// Plays back scripted outcomes, failing every dial once the script runs out
#[derive(Default)]
pub struct FakeDialer {
  script: Mutex<VecDeque<Outcome>>,
  pub headers: Mutex<Vec<Header>>,
  dials: AtomicUsize,
  closed: Arc<AtomicUsize>,
  pub listened_on: Arc<Mutex<Vec<(String, u32)>>>,
}

impl FakeDialer {
  pub fn scripted(outcomes: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
    Arc::new(Self {
      script: Mutex::new(outcomes.into_iter().collect()),
      ..Default::default()
    })
  }

  pub fn dials(&self) -> usize {
    self.dials.load(Ordering::SeqCst)
  }

  pub fn closed(&self) -> usize {
    self.closed.load(Ordering::SeqCst)
  }
}

impl RelayDialer for FakeDialer {
  type Session = FakeSession;

  fn dial<'a>(
    &'a self,
    relay: &'a str,
    header: &'a Header,
  ) -> BoxFuture<'a, Result<FakeSession, DialError>> {
    self.dials.fetch_add(1, Ordering::SeqCst);
    self.headers.lock().unwrap().push(header.clone());
    let outcome = self
      .script
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or(Outcome::Fail);
    let result = match outcome {
      Outcome::Fail => Err(DialError::Connect {
        address: relay.to_string(),
        source: std::io::ErrorKind::ConnectionRefused.into(),
      }),
      Outcome::Fatal => Err(DialError::Proxy(ProxyError::Refused(407))),
      Outcome::Session(listener) => Ok(FakeSession {
        listener: Some(listener),
        closed: Arc::clone(&self.closed),
        listened_on: Arc::clone(&self.listened_on),
      }),
    };
    futures::future::ready(result).boxed()
  }
}
