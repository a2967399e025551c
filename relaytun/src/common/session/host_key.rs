// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use russh_keys::key::PublicKey;

/// Host identity of the public relay fleet, in `authorized_keys` form
pub const DEFAULT_RELAY_HOST_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAACAQDoSLknvlFrFzroOlh1cqvcIFelHO+Wvj1UZ/p3J9bgsJGiKfh3DmBqEw1DOEwpHJz4zuV375TyjGuHuGZ4I4xztnwauhFplfEvriVHQkIDs6UnGwJVr15XUQX04r0i6mLbJs5KqIZTZuZ9ZGOj7ZWnaA7C07nPHGrERKV2Fm67rPvT6/qFikdWUbCt7KshbzdwwfxUohmv+NI7vw2X6vPU8pDaNEY7vS3YgwD/WlvQx+WDF2+iwLVW8OWWjFuQso6Eg1BSLygfPNhAHoiOWjDkijc8U9LYkUn7qsDCnvJxCoTTNmdECukeHfzrUjTSw72KZoM5KCRV78Wrctai1Qn6yRQz9BOSguxewLfzHtnT43/MLdwFXirJ/Ajquve2NAtYmyGCq5HcvpDAyi7lQ0nFBnrWv5zU3YxrISIpjovVyJjfPx8SCRlYZwVeUq6N2yAxCzJxbElZPtaTSoXBIFtoas2NXnCWPgenBa/2bbLQqfgbN8VQ9RaUISKNuYDIn4+eO72+RxF9THzZeV17pnhTVK88XU4asHot1gXwAt4vEhSjdUBC9KUIkfukI6F4JFxtvuO96octRahdV1Qg0vF+D0+SPy2HxqjgZWgPE2Xh/NmuIXwbE0wkymR2wrgj8Hd4C92keo2NBRh9dD7D2negnVYaYsC+3k/si5HNuCHnHQ== tunnel@labstack.com";

#[derive(thiserror::Error, Debug)]
pub enum HostKeyError {
  #[error("Host key must be of the form `<algorithm> <base64> [comment]`")]
  Malformed,
  #[error("Host key could not be decoded")]
  Decode(#[source] russh_keys::Error),
}

/// Decides which relay host keys are accepted
pub trait TrustStore: Send + Sync + 'static {
  fn is_trusted(&self, relay: &str, key: &PublicKey) -> bool;
}

/// Trusts exactly one key, for any relay address
#[derive(Debug, Clone)]
pub struct FixedHostKey {
  fingerprint: String,
}

impl FixedHostKey {
  pub fn from_authorized_key(line: &str) -> Result<Self, HostKeyError> {
    let mut fields = line.split_whitespace();
    let (_algorithm, encoded) = match (fields.next(), fields.next()) {
      (Some(algorithm), Some(encoded)) => (algorithm, encoded),
      _ => return Err(HostKeyError::Malformed),
    };
    let key = russh_keys::parse_public_key_base64(encoded).map_err(HostKeyError::Decode)?;
    Ok(Self::from_key(&key))
  }

  pub fn from_key(key: &PublicKey) -> Self {
    Self {
      fingerprint: key.fingerprint(),
    }
  }

  pub fn fingerprint(&self) -> &str {
    &self.fingerprint
  }
}

impl TrustStore for FixedHostKey {
  fn is_trusted(&self, _relay: &str, key: &PublicKey) -> bool {
    key.fingerprint() == self.fingerprint
  }
}
