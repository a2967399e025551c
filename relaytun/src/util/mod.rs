// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{self, Either};
use tokio::io::{AsyncRead, AsyncWrite};

pub mod validators;

const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

/// Which side of a proxied pair finished first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCompletion {
  /// `a` reached end-of-stream after this many bytes were forwarded to `b`
  AToB(u64),
  /// `b` reached end-of-stream after this many bytes were forwarded to `a`
  BToA(u64),
}

/// Copies `a` into `b` and `b` into `a` until either direction completes
///
/// The remaining direction is not drained; both streams are dropped when this returns,
/// which closes them regardless of how far the other copy had progressed. Errors are
/// only returned, never logged above debug; callers decide how severe they are.
#[tracing::instrument(level = "trace", skip(a, b))]
pub async fn proxy_until_first_close<A, B>(a: A, b: B) -> Result<ProxyCompletion, std::io::Error>
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  let (reader_a, mut sender_a) = tokio::io::split(a);
  let (reader_b, mut sender_b) = tokio::io::split(b);
  let mut reader_a = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader_a);
  let mut reader_b = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader_b);
  let proxy_a2b = tokio::io::copy_buf(&mut reader_a, &mut sender_b);
  let proxy_b2a = tokio::io::copy_buf(&mut reader_b, &mut sender_a);
  futures::pin_mut!(proxy_a2b, proxy_b2a);
  tracing::trace!("polling");
  let res = match future::select(proxy_a2b, proxy_b2a).await {
    Either::Left((a_to_b, _)) => a_to_b.map(ProxyCompletion::AToB),
    Either::Right((b_to_a, _)) => b_to_a.map(ProxyCompletion::BToA),
  };
  if let Err(e) = &res {
    tracing::debug!(error = ?e, "Proxy connection copy with error {:#?}", e);
  }
  res
}

/// End-of-stream surfaced as an error by some transports; not a failure of the proxy
pub fn is_end_of_stream(err: &std::io::Error) -> bool {
  err.kind() == std::io::ErrorKind::UnexpectedEof
}
