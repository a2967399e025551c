// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::TcpStream,
};

use crate::util::{is_end_of_stream, proxy_until_first_close};

/// Proxies one stream accepted on the relay to the local target
///
/// Failures are contained here; nothing is reported to the owning tunnel.
pub async fn proxy_to_target<S>(inbound: S, target_address: &str)
where
  S: AsyncRead + AsyncWrite + Send + Unpin,
{
  tracing::debug!(
    target = "proxy_tcp_connecting",
    address = target_address,
    "Connecting to proxy destination"
  );
  let outbound = match TcpStream::connect(target_address).await {
    Ok(outbound) => outbound,
    Err(e) => {
      tracing::warn!(address = target_address, error = %e, "failed to connect to target");
      return;
    }
  };
  tracing::debug!(target = "proxy_tcp_streaming", "Performing proxy streaming");

  match proxy_until_first_close(inbound, outbound).await {
    Ok(completion) => tracing::debug!(?completion, "Stream finished"),
    Err(e) if is_end_of_stream(&e) => tracing::debug!("Stream reached end of input"),
    Err(e) => tracing::error!(error = %e, "failed to copy"),
  }
  tracing::info!(target = "proxy_tcp_close", "Closing stream");
}
