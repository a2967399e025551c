// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, Response};

use crate::common::protocol::{ApiErrorBody, Configuration, ConnectionInfo};

#[derive(thiserror::Error, Debug)]
pub enum RegistryApiError {
  #[error("failed to find the configuration: {0}")]
  Lookup(String),
  #[error("failed to update the connection: name={name}, error={message}")]
  Update { name: String, message: String },
  #[error("failed to delete the connection: {0}")]
  Delete(String),
  #[error("registry service request failed")]
  Transport(#[from] reqwest::Error),
}

/// Calls made against the remote registry service
#[cfg_attr(test, mockall::automock)]
pub trait RegistryApi: Send + Sync + 'static {
  fn find_configuration(&self, name: &str)
    -> BoxFuture<'static, Result<Configuration, RegistryApiError>>;

  /// Publishes the current state of a connection, returning the service's view of it
  fn update_connection(
    &self,
    info: &ConnectionInfo,
  ) -> BoxFuture<'static, Result<ConnectionInfo, RegistryApiError>>;

  fn delete_connection(&self, id: &str) -> BoxFuture<'static, Result<(), RegistryApiError>>;
}

/// [`RegistryApi`] over HTTP, authenticated with the account's API key
#[derive(Clone)]
pub struct HttpRegistryApi {
  client: Client,
  base_url: String,
  api_key: String,
}

impl HttpRegistryApi {
  pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
    Self::with_client(Client::new(), base_url, api_key)
  }

  pub fn with_client(
    client: Client,
    base_url: impl Into<String>,
    api_key: impl Into<String>,
  ) -> Self {
    let base_url: String = base_url.into();
    Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
      api_key: api_key.into(),
    }
  }

  fn url(&self, path: &str) -> String {
    format!("{}/{}", self.base_url, path)
  }
}

/// Extracts the service's error message, falling back to the status line
async fn error_message(response: Response) -> String {
  let status = response.status();
  match response.json::<ApiErrorBody>().await {
    Ok(body) if !body.message.is_empty() => body.message,
    _ => status.to_string(),
  }
}

impl RegistryApi for HttpRegistryApi {
  fn find_configuration(
    &self,
    name: &str,
  ) -> BoxFuture<'static, Result<Configuration, RegistryApiError>> {
    let request = self
      .client
      .get(self.url(&format!("configurations/{}", name)))
      .bearer_auth(&self.api_key);
    async move {
      let response = request.send().await?;
      if !response.status().is_success() {
        return Err(RegistryApiError::Lookup(error_message(response).await));
      }
      Ok(response.json::<Configuration>().await?)
    }
    .boxed()
  }

  fn update_connection(
    &self,
    info: &ConnectionInfo,
  ) -> BoxFuture<'static, Result<ConnectionInfo, RegistryApiError>> {
    let name = info.name.clone();
    let request = self
      .client
      .put(self.url(&format!("connections/{}", info.id)))
      .bearer_auth(&self.api_key)
      .json(info);
    async move {
      let response = request.send().await?;
      if !response.status().is_success() {
        return Err(RegistryApiError::Update {
          name,
          message: error_message(response).await,
        });
      }
      Ok(response.json::<ConnectionInfo>().await?)
    }
    .boxed()
  }

  fn delete_connection(&self, id: &str) -> BoxFuture<'static, Result<(), RegistryApiError>> {
    let request = self
      .client
      .delete(self.url(&format!("connections/{}", id)))
      .bearer_auth(&self.api_key);
    async move {
      let response = request.send().await?;
      if !response.status().is_success() {
        return Err(RegistryApiError::Delete(error_message(response).await));
      }
      Ok(())
    }
    .boxed()
  }
}
