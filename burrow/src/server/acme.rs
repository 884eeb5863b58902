// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The boundary consumed by the external ACME/TLS terminator: a certificate
//! cache and the host policy restricting issuance to the apex and single
//! labels directly beneath it.

use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;

use futures::future::{self, BoxFuture};
use futures::FutureExt as _;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
  /// The key has no entry; callers fall through to fresh issuance.
  #[error("certificate cache miss")]
  Miss,
  #[error("certificate cache failure: {0}")]
  Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Certificate storage for the ACME manager. `get` answers with
/// [CacheError::Miss] for unknown keys; `delete` of an absent key succeeds.
pub trait Cache: Send + Sync {
  fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>, CacheError>>;
  fn put<'a>(&'a self, key: &'a str, data: Vec<u8>) -> BoxFuture<'a, Result<(), CacheError>>;
  fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>>;
}

/// Process-local cache; certificates are re-provisioned on restart.
#[derive(Default)]
pub struct MemoryCache {
  data: StdRwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Cache for MemoryCache {
  fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>, CacheError>> {
    let data = self.data.read().expect("cache lock poisoned");
    future::ready(data.get(key).cloned().ok_or(CacheError::Miss)).boxed()
  }

  fn put<'a>(&'a self, key: &'a str, data: Vec<u8>) -> BoxFuture<'a, Result<(), CacheError>> {
    self
      .data
      .write()
      .expect("cache lock poisoned")
      .insert(key.to_string(), data);
    future::ready(Ok(())).boxed()
  }

  fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
    self.data.write().expect("cache lock poisoned").remove(key);
    future::ready(Ok(())).boxed()
  }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HostPolicyError {
  #[error("host {0:?} is not an allowed host")]
  NotAllowed(String),
  #[error("host {0:?} is not a valid domain name")]
  InvalidDomain(String),
}

/// Issuance policy for the ingress TLS terminator: the apex itself, or
/// exactly one label directly under it. This check intentionally overlaps
/// with registration-time id validation; both must agree.
pub fn host_policy(apex: &str, host: &str) -> Result<(), HostPolicyError> {
  if host.eq_ignore_ascii_case(apex) {
    return Ok(());
  }
  let normalized = idna::domain_to_ascii(host)
    .map_err(|_| HostPolicyError::InvalidDomain(host.to_string()))?;
  let suffix = format!(".{}", apex.to_ascii_lowercase());
  let Some(label) = normalized.strip_suffix(&suffix) else {
    return Err(HostPolicyError::NotAllowed(host.to_string()));
  };
  if label.is_empty() || label.contains('.') {
    return Err(HostPolicyError::NotAllowed(host.to_string()));
  }
  Ok(())
}
