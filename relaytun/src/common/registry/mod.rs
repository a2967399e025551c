// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The in-process table of live tunnels, and the remote registry service they report to

use dashmap::{mapref::entry::Entry, DashMap};

use super::{connection::ConnectionHandle, protocol::ConnectionInfo};

pub mod api;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
  #[error("Tunnel name {name:?} is already held by connection {holder}")]
  NameInUse { name: String, holder: String },
}

/// Live tunnels keyed by name, or by identifier for unnamed tunnels
///
/// Operations are atomic per key, so concurrent lifecycles may register and
/// deregister without further coordination.
#[derive(Default)]
pub struct ConnectionRegistry {
  connections: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
  pub fn new() -> Self {
    Self {
      connections: Default::default(),
    }
  }

  /// Inserts `handle` under its key unless another connection already holds it
  ///
  /// Re-registering the same connection, as happens after every reconnect, succeeds.
  pub fn register(&self, handle: ConnectionHandle) -> Result<(), RegistrationError> {
    match self.connections.entry(handle.registry_key()) {
      Entry::Occupied(existing) if existing.get().id() != handle.id() => {
        Err(RegistrationError::NameInUse {
          name: existing.key().clone(),
          holder: existing.get().id().to_string(),
        })
      }
      Entry::Occupied(mut existing) => {
        existing.insert(handle);
        Ok(())
      }
      Entry::Vacant(vacant) => {
        vacant.insert(handle);
        Ok(())
      }
    }
  }

  pub fn lookup(&self, key: &str) -> Option<ConnectionHandle> {
    self.connections.get(key).map(|entry| entry.value().clone())
  }

  pub fn deregister(&self, key: &str) -> Option<ConnectionHandle> {
    self.connections.remove(key).map(|(_, handle)| handle)
  }

  /// Removes the entry for `key` only while it still belongs to connection `id`
  pub fn deregister_connection(&self, key: &str, id: &str) -> Option<ConnectionHandle> {
    self
      .connections
      .remove_if(key, |_, handle| handle.id() == id)
      .map(|(_, handle)| handle)
  }

  pub fn handles(&self) -> Vec<ConnectionHandle> {
    self
      .connections
      .iter()
      .map(|entry| entry.value().clone())
      .collect()
  }

  pub fn snapshot(&self) -> Vec<ConnectionInfo> {
    self
      .connections
      .iter()
      .map(|entry| entry.value().info())
      .collect()
  }

  pub fn len(&self) -> usize {
    self.connections.len()
  }

  pub fn is_empty(&self) -> bool {
    self.connections.is_empty()
  }
}
