// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use crate::common::protocol::{Protocol, UnknownProtocol};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
  #[error("Address must be of the form host:port")]
  MissingPort,
  #[error("Address host component was empty")]
  EmptyHost,
  #[error("Address port component was not a valid u16")]
  InvalidPort,
}

/// Splits a `host:port` pair, accepting bracketed IPv6 hosts
pub fn parse_host_port(v: &str) -> Result<(String, u16), AddressError> {
  let (host, port) = v.rsplit_once(':').ok_or(AddressError::MissingPort)?;
  let host = host
    .strip_prefix('[')
    .and_then(|rest| rest.strip_suffix(']'))
    .unwrap_or(host);
  if host.is_empty() {
    return Err(AddressError::EmptyHost);
  }
  let port = port.parse::<u16>().map_err(|_| AddressError::InvalidPort)?;
  Ok((host.to_string(), port))
}

pub fn parse_protocol(v: &str) -> Result<Protocol, UnknownProtocol> {
  v.parse()
}

pub fn validate_host_port(v: &str) -> Result<(), String> {
  parse_host_port(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_protocol(v: &str) -> Result<(), String> {
  parse_protocol(v).map(|_| ()).map_err(|e| e.to_string())
}
