// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Session naming: the `{id, nonce}` pair carried inside a SPIFFE-style
//! URI SAN, binding a tunnel's subdomain slot to one credential issuance.

use rand::Rng;

const SPIFFE_SCHEME: &str = "spiffe://";

/// Digits used by the base-32 nonce rendering, least significant last.
const BASE32_DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Names a single session instance: `id` is the subdomain slot, `nonce`
/// discriminates successive sessions for the same id. Equality uses both
/// fields, so a certificate from a reaped session no longer matches.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
  id: String,
  nonce: String,
}

impl SessionIdentity {
  pub fn new<TId: Into<String>, TNonce: Into<String>>(id: TId, nonce: TNonce) -> Self {
    Self {
      id: id.into(),
      nonce: nonce.into(),
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn nonce(&self) -> &str {
    &self.nonce
  }

  /// Renders the identity as the URI SAN embedded in issued leaf certs.
  ///
  /// An empty nonce renders without a path segment, which is the form the
  /// server's own leaf uses.
  pub fn to_uri(&self) -> String {
    if self.nonce.is_empty() {
      format!("{}{}", SPIFFE_SCHEME, self.id)
    } else {
      format!("{}{}/{}", SPIFFE_SCHEME, self.id, self.nonce)
    }
  }

  /// Parses a URI SAN back into an identity; the host is the id and the
  /// path, with its leading slash stripped, is the nonce.
  pub fn from_uri(uri: &str) -> Option<Self> {
    let rest = uri.strip_prefix(SPIFFE_SCHEME)?;
    let (id, nonce) = match rest.split_once('/') {
      Some((id, nonce)) => (id, nonce),
      None => (rest, ""),
    };
    if id.is_empty() {
      return None;
    }
    Some(Self::new(id, nonce))
  }
}

impl std::fmt::Debug for SessionIdentity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "({}/{})", &self.id, &self.nonce)
  }
}

impl std::fmt::Display for SessionIdentity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.to_uri())
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidLabel {
  #[error("an id must be non-empty")]
  Empty,
  #[error("no '.' characters are allowed in an id")]
  ContainsDot,
  #[error("an id must be a single URL path segment")]
  ContainsSlash,
}

/// Checks that an id is usable both as a single DNS label under the apex
/// and as the host component of a SPIFFE URI.
pub fn validate_label(id: &str) -> Result<(), InvalidLabel> {
  if id.is_empty() {
    return Err(InvalidLabel::Empty);
  }
  if id.contains('.') {
    return Err(InvalidLabel::ContainsDot);
  }
  if id.contains('/') {
    return Err(InvalidLabel::ContainsSlash);
  }
  Ok(())
}

/// Produces a fresh random nonce: a base-32 rendering of an integer drawn
/// uniformly below 2^80, matching the serial-number space of issued certs.
pub fn fresh_nonce() -> String {
  let value = rand::thread_rng().gen::<u128>() & ((1u128 << 80) - 1);
  to_base32(value)
}

fn to_base32(mut value: u128) -> String {
  if value == 0 {
    return "0".to_string();
  }
  let mut digits = Vec::new();
  while value > 0 {
    digits.push(BASE32_DIGITS[(value % 32) as usize]);
    value /= 32;
  }
  digits.reverse();
  String::from_utf8(digits).expect("base-32 digits are ASCII")
}

#[cfg(test)]
mod tests {
  use super::{fresh_nonce, to_base32, validate_label, InvalidLabel, SessionIdentity};

  #[test]
  fn uri_roundtrip() {
    let identity = SessionIdentity::new("foo", "abc123");
    assert_eq!(identity.to_uri(), "spiffe://foo/abc123");
    assert_eq!(
      SessionIdentity::from_uri("spiffe://foo/abc123"),
      Some(identity)
    );
  }

  #[test]
  fn server_identity_has_no_path() {
    let identity = SessionIdentity::new("server", "");
    assert_eq!(identity.to_uri(), "spiffe://server");
    assert_eq!(
      SessionIdentity::from_uri("spiffe://server"),
      Some(SessionIdentity::new("server", ""))
    );
  }

  #[test]
  fn non_spiffe_uris_are_rejected() {
    assert_eq!(SessionIdentity::from_uri("https://foo/abc"), None);
    assert_eq!(SessionIdentity::from_uri("spiffe:///nonce-only"), None);
  }

  #[test]
  fn label_validation() {
    assert_eq!(validate_label("foo"), Ok(()));
    assert_eq!(validate_label(""), Err(InvalidLabel::Empty));
    assert_eq!(validate_label("a.b"), Err(InvalidLabel::ContainsDot));
    assert_eq!(validate_label("a/b"), Err(InvalidLabel::ContainsSlash));
  }

  #[test]
  fn base32_rendering() {
    assert_eq!(to_base32(0), "0");
    assert_eq!(to_base32(31), "v");
    assert_eq!(to_base32(32), "10");
  }

  #[test]
  fn nonces_are_fresh() {
    // Collisions over an 80-bit space would indicate a broken generator
    let first = fresh_nonce();
    let second = fresh_nonce();
    assert_ne!(first, second);
    assert!(first.len() <= 16);
  }
}
