// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{sync::Arc, time::Duration};

use futures::future::FutureExt;
use tokio::{
  io::{duplex, AsyncReadExt, AsyncWriteExt},
  net::TcpListener,
  sync::mpsc,
};

use super::*;
use crate::common::{
  registry::api::MockRegistryApi,
  session::testing::{fake_listener, FakeDialer, Inbound, Outcome},
};

fn settings() -> ClientSettings {
  ClientSettings::new("http://registry.invalid", "api-key", "relay.test")
}

fn request(protocol: Protocol) -> ConnectRequest {
  ConnectRequest {
    address: "127.0.0.1:3000".into(),
    protocol,
    name: None,
    hostname: None,
  }
}

fn tunnel(
  request: ConnectRequest,
  dialer: &Arc<FakeDialer>,
  api: MockRegistryApi,
  registry: &Arc<ConnectionRegistry>,
) -> TunnelConnection<FakeDialer, MockRegistryApi> {
  TunnelConnection::new(
    "conn-1".into(),
    request,
    None,
    &settings(),
    Arc::clone(dialer),
    Arc::new(api),
    Arc::clone(registry),
  )
}

fn echo_update(api: &mut MockRegistryApi, times: usize) {
  api
    .expect_update_connection()
    .times(times)
    .returning(|info| futures::future::ready(Ok(info.clone())).boxed());
}

/// Starts a loopback server echoing every connection back to itself
async fn echo_target() -> String {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap().to_string();
  tokio::task::spawn(async move {
    while let Ok((mut socket, _)) = listener.accept().await {
      tokio::task::spawn(async move {
        let (mut r, mut w) = socket.split();
        let _ = tokio::io::copy(&mut r, &mut w).await;
      });
    }
  });
  addr
}

async fn round_trip(relay: &mpsc::UnboundedSender<Inbound>, payload: &[u8]) -> Vec<u8> {
  let (inbound, mut remote) = duplex(1024);
  relay.send(Ok(inbound)).unwrap();
  remote.write_all(payload).await.unwrap();
  let mut buf = vec![0u8; payload.len()];
  tokio::time::timeout(Duration::from_secs(10), remote.read_exact(&mut buf))
    .await
    .expect("proxied bytes must come back")
    .unwrap();
  buf
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
  tokio::time::timeout(Duration::from_secs(10), async {
    while !condition() {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .expect("condition was not reached in time")
}

#[test]
fn backoff_grows_with_square_of_retries() {
  let delays: Vec<u64> = (1..=MAX_RETRIES)
    .map(|r| backoff_delay(r).as_secs())
    .collect();
  assert_eq!(delays, vec![1, 4, 9, 16, 25]);
}

#[test]
fn ad_hoc_tls_tunnel_requests_tls_and_ephemeral_port() {
  let resolved = ResolvedTunnel::resolve("id", &request(Protocol::Tls), None, &settings());
  assert!(resolved.header.tls);
  assert_eq!(resolved.remote_port, 0);
  assert_eq!(resolved.remote_host, "0.0.0.0");
  assert_eq!(resolved.relay_address, "relay.test:22222");
  assert_eq!(resolved.header.key, "api-key");
  assert_eq!(resolved.header.target, "127.0.0.1:3000");
}

#[test]
fn named_https_configuration_fixes_port_80() {
  let mut req = request(Protocol::Tcp);
  req.name = Some("site".into());
  req.hostname = Some("ignored.test".into());
  let configuration = Configuration {
    name: "site".into(),
    protocol: Protocol::Https,
    hostname: "edge.test".into(),
    ..Default::default()
  };
  let resolved = ResolvedTunnel::resolve("id", &req, Some(&configuration), &settings());
  assert_eq!(resolved.remote_port, HTTPS_REMOTE_PORT);
  assert_eq!(resolved.protocol, Protocol::Https);
  assert!(!resolved.header.tls);
  assert_eq!(resolved.header.name, "site");
  assert_eq!(resolved.relay_address, "edge.test:22222");
}

#[test]
fn named_tls_configuration_does_not_request_header_tls() {
  let mut req = request(Protocol::Tls);
  req.name = Some("site".into());
  let configuration = Configuration {
    protocol: Protocol::Tls,
    ..Default::default()
  };
  let resolved = ResolvedTunnel::resolve("id", &req, Some(&configuration), &settings());
  assert!(!resolved.header.tls);
  assert_eq!(resolved.remote_port, 0);
}

#[test]
fn only_https_binds_a_fixed_port() {
  for protocol in [Protocol::Tcp, Protocol::Tls, Protocol::Http] {
    let resolved = ResolvedTunnel::resolve("id", &request(protocol), None, &settings());
    assert_eq!(resolved.remote_port, 0, "{protocol}");
  }
  let resolved = ResolvedTunnel::resolve("id", &request(Protocol::Https), None, &settings());
  assert_eq!(resolved.remote_port, 80);
}

#[tokio::test]
async fn named_tunnel_creation_fails_when_lookup_fails() {
  let mut api = MockRegistryApi::new();
  api
    .expect_find_configuration()
    .withf(|name| name == "missing")
    .times(1)
    .returning(|_| {
      futures::future::ready(Err(RegistryApiError::Lookup("not found".into()))).boxed()
    });
  let mut req = request(Protocol::Tcp);
  req.name = Some("missing".into());
  let created = TunnelConnection::create(
    req,
    &settings(),
    FakeDialer::scripted([]),
    Arc::new(api),
    Arc::new(ConnectionRegistry::new()),
  )
  .await;
  assert!(matches!(
    created,
    Err(CreateError::Lookup(RegistryApiError::Lookup(_)))
  ));
}

#[tokio::test(start_paused = true)]
async fn abandons_tunnel_after_five_failed_reconnects() {
  let dialer = FakeDialer::scripted([]);
  let registry = Arc::new(ConnectionRegistry::new());
  let mut api = MockRegistryApi::new();
  echo_update(&mut api, MAX_RETRIES as usize);
  api
    .expect_delete_connection()
    .withf(|id| id == "conn-1")
    .times(1)
    .returning(|_| futures::future::ready(Ok(())).boxed());

  let started = tokio::time::Instant::now();
  let (handle, ready, task) = tunnel(request(Protocol::Tcp), &dialer, api, &registry).spawn();
  let exit = task.await.unwrap();

  assert!(matches!(exit, ConnectionExit::Abandoned));
  // The initial attempt plus five retries; the sixth retry is never dialed
  assert_eq!(dialer.dials(), 6);
  assert!(started.elapsed() >= Duration::from_secs(1 + 4 + 9 + 16 + 25));
  assert!(ready.await.is_err());
  assert!(handle.is_terminated());
  assert!(registry.is_empty());

  let headers = dialer.headers.lock().unwrap();
  assert!(!headers[0].reconnect);
  assert!(headers[1..].iter().all(|h| h.reconnect && !h.started));
}

#[tokio::test(start_paused = true)]
async fn stop_during_backoff_terminates_without_deleting() {
  let dialer = FakeDialer::scripted([]);
  let registry = Arc::new(ConnectionRegistry::new());
  let (handle, _ready, task) = tunnel(
    request(Protocol::Tcp),
    &dialer,
    MockRegistryApi::new(),
    &registry,
  )
  .spawn();

  while dialer.dials() == 0 {
    tokio::task::yield_now().await;
  }
  handle.stop().await;

  assert!(matches!(task.await.unwrap(), ConnectionExit::Stopped));
  assert_eq!(dialer.dials(), 1);
  assert!(handle.is_terminated());
}

#[tokio::test(start_paused = true)]
async fn stop_wins_over_stalled_status_update() {
  let dialer = FakeDialer::scripted([]);
  let registry = Arc::new(ConnectionRegistry::new());
  let updating = Arc::new(std::sync::atomic::AtomicBool::new(false));
  let mut api = MockRegistryApi::new();
  {
    let updating = Arc::clone(&updating);
    api.expect_update_connection().returning(move |_| {
      updating.store(true, std::sync::atomic::Ordering::SeqCst);
      futures::future::pending().boxed()
    });
  }
  let (handle, _ready, task) = tunnel(request(Protocol::Tcp), &dialer, api, &registry).spawn();

  while !updating.load(std::sync::atomic::Ordering::SeqCst) {
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  tokio::time::timeout(Duration::from_secs(5), handle.stop())
    .await
    .expect("stop must not wait on the registry service");

  assert!(matches!(task.await.unwrap(), ConnectionExit::Stopped));
  assert_eq!(dialer.dials(), 1);
}

#[tokio::test]
async fn proxies_streams_and_reconnects_after_listener_failure() {
  let target = echo_target().await;
  let (first_listener, first_relay) = fake_listener();
  let (second_listener, second_relay) = fake_listener();
  let dialer = FakeDialer::scripted([
    Outcome::Session(Ok(first_listener)),
    Outcome::Session(Ok(second_listener)),
  ]);
  let registry = Arc::new(ConnectionRegistry::new());
  let mut api = MockRegistryApi::new();
  echo_update(&mut api, 1);

  let mut req = request(Protocol::Tcp);
  req.address = target;
  let (handle, ready, task) = tunnel(req, &dialer, api, &registry).spawn();
  tokio::time::timeout(Duration::from_secs(10), ready)
    .await
    .unwrap()
    .expect("tunnel must come online");

  let info = handle.info();
  assert_eq!(info.status, Some(ConnectionStatus::Online));
  assert_eq!(info.port, 40080);
  assert!(info.connected_at.is_some());
  assert_eq!(registry.lookup("conn-1").unwrap().id(), "conn-1");
  assert_eq!(round_trip(&first_relay, b"first").await, b"first");

  first_relay.send(Err(SessionError::ListenerClosed)).unwrap();
  wait_until(|| dialer.dials() == 2 && handle.info().status == Some(ConnectionStatus::Online))
    .await;
  assert_eq!(dialer.closed(), 1);
  assert_eq!(round_trip(&second_relay, b"second").await, b"second");

  {
    let headers = dialer.headers.lock().unwrap();
    assert!(!headers[0].started && !headers[0].reconnect);
    assert!(headers[1].started && headers[1].reconnect);
  }
  assert_eq!(
    dialer.listened_on.lock().unwrap().as_slice(),
    &[("0.0.0.0".to_string(), 0), ("0.0.0.0".to_string(), 0)]
  );

  handle.stop().await;
  assert!(matches!(task.await.unwrap(), ConnectionExit::Stopped));
  assert_eq!(dialer.closed(), 2);
  // Stopping leaves deletion to the caller
  assert!(registry.lookup("conn-1").is_some());
}

#[tokio::test]
async fn unreachable_target_leaves_tunnel_online() {
  let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let closed_addr = closed.local_addr().unwrap().to_string();
  drop(closed);

  let (listener, relay) = fake_listener();
  let dialer = FakeDialer::scripted([Outcome::Session(Ok(listener))]);
  let registry = Arc::new(ConnectionRegistry::new());
  let mut req = request(Protocol::Tcp);
  req.address = closed_addr;
  let (handle, ready, task) = tunnel(req, &dialer, MockRegistryApi::new(), &registry).spawn();
  ready.await.unwrap();

  let (inbound, mut remote) = duplex(1024);
  relay.send(Ok(inbound)).unwrap();
  let mut buf = Vec::new();
  let read = tokio::time::timeout(Duration::from_secs(10), remote.read_to_end(&mut buf))
    .await
    .expect("inbound stream must be released")
    .unwrap();
  assert_eq!(read, 0);

  assert!(!handle.is_terminated());
  assert_eq!(handle.info().status, Some(ConnectionStatus::Online));
  assert_eq!(dialer.dials(), 1);

  handle.stop().await;
  assert!(matches!(task.await.unwrap(), ConnectionExit::Stopped));
}

#[tokio::test]
async fn listener_refusal_is_not_retried() {
  let dialer = FakeDialer::scripted([Outcome::Session(Err(SessionError::ListenerClosed))]);
  let registry = Arc::new(ConnectionRegistry::new());
  let (_handle, ready, task) = tunnel(
    request(Protocol::Https),
    &dialer,
    MockRegistryApi::new(),
    &registry,
  )
  .spawn();

  assert!(matches!(
    task.await.unwrap(),
    ConnectionExit::ListenFailed(_)
  ));
  assert!(ready.await.is_err());
  assert_eq!(dialer.dials(), 1);
  assert_eq!(dialer.closed(), 1);
  assert_eq!(
    dialer.listened_on.lock().unwrap().as_slice(),
    &[("0.0.0.0".to_string(), 80)]
  );
  assert!(registry.is_empty());
}

#[tokio::test]
async fn fatal_dial_error_ends_lifecycle() {
  let dialer = FakeDialer::scripted([Outcome::Fatal]);
  let (_handle, _ready, task) = tunnel(
    request(Protocol::Tcp),
    &dialer,
    MockRegistryApi::new(),
    &Arc::new(ConnectionRegistry::new()),
  )
  .spawn();

  assert!(matches!(
    task.await.unwrap(),
    ConnectionExit::Fatal(DialError::Proxy(_))
  ));
  assert_eq!(dialer.dials(), 1);
}

#[tokio::test]
async fn name_held_by_another_connection_aborts_attempt() {
  let (listener, _relay) = fake_listener();
  let dialer = FakeDialer::scripted([Outcome::Session(Ok(listener))]);
  let registry = Arc::new(ConnectionRegistry::new());
  registry
    .register(ConnectionHandle::new(ConnectionInfo {
      id: "other".into(),
      name: "conn-1".into(),
      hostname: None,
      port: 0,
      target_address: String::new(),
      remote_uri: None,
      protocol: Protocol::Tcp,
      status: None,
      connected_at: None,
    }))
    .unwrap();
  let (_handle, ready, task) = tunnel(
    request(Protocol::Tcp),
    &dialer,
    MockRegistryApi::new(),
    &registry,
  )
  .spawn();

  assert!(matches!(
    task.await.unwrap(),
    ConnectionExit::RegistrationFailed(_)
  ));
  assert!(ready.await.is_err());
  assert_eq!(dialer.closed(), 1);
}
