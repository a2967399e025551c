// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Reverse tunnels through an SSH relay
//!
//! A tunnel dials the relay, asks it for a remote listener, and proxies every stream
//! the relay forwards to a local target address, reconnecting with backoff when the
//! session drops.

pub mod common;
pub mod util;

pub use common::{
  connection::{ConnectRequest, ConnectionExit, ConnectionHandle, TunnelConnection},
  daemon::{DaemonError, PendingTunnel, TunnelDaemon},
  protocol::{ConnectionInfo, ConnectionStatus, Protocol},
  settings::ClientSettings,
};
