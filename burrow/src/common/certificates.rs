// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The tunnel's internal certificate authority.
//!
//! Each server instance owns one self-signed EC P-256 root, valid for ten
//! years, used for exactly two things: signing its own `server` leaf and
//! minting per-session client leaves whose SPIFFE URI SAN binds an id to a
//! registration nonce. Both sides of the RPC plane verify against this root
//! and nothing else.

use std::sync::Arc;

use rcgen::{
  BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
  ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rand::RngCore;
use time::{Duration, OffsetDateTime};

use super::identity::SessionIdentity;

/// DNS SAN of the server-side leaf, and the SNI clients dial with.
pub const SERVER_NAME: &str = "server";

const LEAF_ORGANIZATION: &str = "Tunnel";
const CA_ORGANIZATION: &str = "Tunnel CA";

#[derive(thiserror::Error, Debug)]
pub enum CertificateError {
  #[error("certificate generation failed: {0}")]
  Generation(#[from] rcgen::RcgenError),
  #[error("certificate material rejected: {0}")]
  Material(#[from] rustls::Error),
  #[error("failure reading PEM bundle: {0}")]
  Pem(#[from] std::io::Error),
  #[error("no certificate found in PEM bundle")]
  EmptyBundle,
  #[error("no private key found in PEM bundle")]
  MissingKey,
}

/// PEM bundle for one issued leaf, as returned from registration.
/// The private key is PKCS#8-encoded.
pub struct IssuedCertificate {
  pub certificate_pem: Vec<u8>,
  pub private_key_pem: Vec<u8>,
}

pub struct CertificateAuthority {
  certificate: Certificate,
  ca_pem: Vec<u8>,
  ca_der: Vec<u8>,
  server_tls: Arc<rustls::ServerConfig>,
}

impl CertificateAuthority {
  /// Generates a fresh root and the server's own leaf, and assembles the
  /// rustls server credentials requiring verified client certificates.
  pub fn new() -> Result<Self, CertificateError> {
    let certificate = Certificate::from_params(ca_params())?;
    let ca_pem = certificate.serialize_pem()?.into_bytes();
    let ca_der = certificate.serialize_der()?;

    let server_leaf = Certificate::from_params(leaf_params(SERVER_NAME, ""))?;
    let leaf_der = server_leaf.serialize_der_with_signer(&certificate)?;
    let leaf_key_der = server_leaf.serialize_private_key_der();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(&rustls::Certificate(ca_der.clone()))?;
    let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots).boxed();
    let server_tls = rustls::ServerConfig::builder()
      .with_safe_defaults()
      .with_client_cert_verifier(verifier)
      .with_single_cert(
        vec![
          rustls::Certificate(leaf_der),
          rustls::Certificate(ca_der.clone()),
        ],
        rustls::PrivateKey(leaf_key_der),
      )?;

    Ok(Self {
      certificate,
      ca_pem,
      ca_der,
      server_tls: Arc::new(server_tls),
    })
  }

  /// The root certificate in PEM form, as handed to registering clients.
  pub fn ca_pem(&self) -> &[u8] {
    &self.ca_pem
  }

  pub fn ca_der(&self) -> &[u8] {
    &self.ca_der
  }

  /// Server-side TLS credentials: presents the `server` leaf, requires and
  /// verifies client certificates against this authority.
  pub fn server_tls_config(&self) -> Arc<rustls::ServerConfig> {
    Arc::clone(&self.server_tls)
  }

  /// Issues a leaf binding `id` and `nonce`. Callers must ensure both are
  /// URL-safe single segments; the registration path validates ids before
  /// reaching here.
  pub fn generate(&self, id: &str, nonce: &str) -> Result<IssuedCertificate, CertificateError> {
    let leaf = Certificate::from_params(leaf_params(id, nonce))?;
    let certificate_pem = leaf
      .serialize_pem_with_signer(&self.certificate)?
      .into_bytes();
    let private_key_pem = leaf.serialize_private_key_pem().into_bytes();
    Ok(IssuedCertificate {
      certificate_pem,
      private_key_pem,
    })
  }

  /// Signs a leaf that chains to this authority but carries no SPIFFE URI,
  /// for exercising the unauthenticated rejection path.
  #[cfg(test)]
  pub(crate) fn issue_without_identity(&self) -> Result<IssuedCertificate, CertificateError> {
    let mut params = leaf_params("anonymous", "");
    params.subject_alt_names = vec![SanType::DnsName("anonymous".to_string())];
    let leaf = Certificate::from_params(params)?;
    let certificate_pem = leaf
      .serialize_pem_with_signer(&self.certificate)?
      .into_bytes();
    let private_key_pem = leaf.serialize_private_key_pem().into_bytes();
    Ok(IssuedCertificate {
      certificate_pem,
      private_key_pem,
    })
  }
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority").finish_non_exhaustive()
  }
}

/// Client-side TLS credentials from a registration's PEM bundle: trusts the
/// tunnel CA alone and presents the issued leaf for client authentication.
pub fn client_tls_config(
  ca_pem: &[u8],
  certificate_pem: &[u8],
  private_key_pem: &[u8],
) -> Result<rustls::ClientConfig, CertificateError> {
  let mut roots = rustls::RootCertStore::empty();
  let mut found_root = false;
  for der in rustls_pemfile::certs(&mut &ca_pem[..])? {
    roots.add(&rustls::Certificate(der))?;
    found_root = true;
  }
  if !found_root {
    return Err(CertificateError::EmptyBundle);
  }

  let certificates: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut &certificate_pem[..])?
    .into_iter()
    .map(rustls::Certificate)
    .collect();
  if certificates.is_empty() {
    return Err(CertificateError::EmptyBundle);
  }
  let key = rustls_pemfile::pkcs8_private_keys(&mut &private_key_pem[..])?
    .into_iter()
    .next()
    .ok_or(CertificateError::MissingKey)?;

  let config = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_root_certificates(roots)
    .with_client_auth_cert(certificates, rustls::PrivateKey(key))?;
  Ok(config)
}

/// Scans a verified peer certificate chain for a SPIFFE URI SAN and maps it
/// to the session identity it names.
pub fn peer_identity(certificates: &[rustls::Certificate]) -> Option<SessionIdentity> {
  for certificate in certificates {
    let Ok((_, parsed)) = x509_parser::parse_x509_certificate(&certificate.0) else {
      continue;
    };
    let Ok(Some(san)) = parsed.subject_alternative_name() else {
      continue;
    };
    for name in &san.value.general_names {
      if let x509_parser::extensions::GeneralName::URI(uri) = name {
        if let Some(identity) = SessionIdentity::from_uri(uri) {
          return Some(identity);
        }
      }
    }
  }
  None
}

fn distinguished_name(organization: &str) -> DistinguishedName {
  let mut name = DistinguishedName::new();
  name.push(DnType::OrganizationName, organization);
  name
}

fn random_serial() -> SerialNumber {
  // Random integers in [0, 2^80)
  let mut bytes = [0u8; 10];
  rand::thread_rng().fill_bytes(&mut bytes);
  SerialNumber::from_slice(&bytes)
}

fn ca_params() -> CertificateParams {
  let mut params = CertificateParams::default();
  params.alg = &PKCS_ECDSA_P256_SHA256;
  params.distinguished_name = distinguished_name(CA_ORGANIZATION);
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![KeyUsagePurpose::KeyCertSign];
  params.serial_number = Some(random_serial());
  params.not_before = OffsetDateTime::now_utc() - Duration::minutes(10);
  params.not_after = OffsetDateTime::now_utc() + Duration::days(10 * 365);
  params
}

fn leaf_params(id: &str, nonce: &str) -> CertificateParams {
  let uri = SessionIdentity::new(id, nonce).to_uri();
  let mut params = CertificateParams::default();
  params.alg = &PKCS_ECDSA_P256_SHA256;
  params.distinguished_name = distinguished_name(LEAF_ORGANIZATION);
  params.subject_alt_names = vec![SanType::DnsName(id.to_string()), SanType::URI(uri)];
  params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
  params.extended_key_usages = vec![
    ExtendedKeyUsagePurpose::ClientAuth,
    ExtendedKeyUsagePurpose::ServerAuth,
  ];
  params.serial_number = Some(random_serial());
  params.not_before = OffsetDateTime::now_utc() - Duration::minutes(2);
  params.not_after = OffsetDateTime::now_utc() + Duration::days(365);
  params
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pem_to_der(pem: &[u8]) -> Vec<u8> {
    rustls_pemfile::certs(&mut &pem[..])
      .unwrap()
      .into_iter()
      .next()
      .unwrap()
  }

  #[test]
  fn issued_leaves_carry_the_session_identity() {
    let ca = CertificateAuthority::new().unwrap();
    let issued = ca.generate("foo", "abc123").unwrap();
    let der = pem_to_der(&issued.certificate_pem);
    let (_, parsed) = x509_parser::parse_x509_certificate(&der).unwrap();

    let san = parsed.subject_alternative_name().unwrap().unwrap();
    let mut dns = Vec::new();
    let mut uris = Vec::new();
    for name in &san.value.general_names {
      match name {
        x509_parser::extensions::GeneralName::DNSName(name) => dns.push(name.to_string()),
        x509_parser::extensions::GeneralName::URI(uri) => uris.push(uri.to_string()),
        _ => {}
      }
    }
    assert_eq!(dns, vec!["foo"]);
    assert_eq!(uris, vec!["spiffe://foo/abc123"]);

    let organization = parsed
      .subject()
      .iter_organization()
      .next()
      .unwrap()
      .as_str()
      .unwrap();
    assert_eq!(organization, "Tunnel");
  }

  #[test]
  fn peer_identity_extraction() {
    let ca = CertificateAuthority::new().unwrap();
    let issued = ca.generate("foo", "n1").unwrap();
    let identity = peer_identity(&[rustls::Certificate(pem_to_der(&issued.certificate_pem))]);
    assert_eq!(identity, Some(SessionIdentity::new("foo", "n1")));
  }

  #[test]
  fn certificates_without_a_spiffe_uri_yield_no_identity() {
    let plain = rcgen::generate_simple_self_signed(vec!["nobody.example".to_string()]).unwrap();
    let der = plain.serialize_der().unwrap();
    assert_eq!(peer_identity(&[rustls::Certificate(der)]), None);
  }

  #[test]
  fn issued_bundles_assemble_into_client_credentials() {
    let ca = CertificateAuthority::new().unwrap();
    let issued = ca.generate("foo", "n1").unwrap();
    client_tls_config(
      ca.ca_pem(),
      &issued.certificate_pem,
      &issued.private_key_pem,
    )
    .expect("issued material must produce a client config");
  }

  #[test]
  fn fresh_authorities_do_not_share_roots() {
    let first = CertificateAuthority::new().unwrap();
    let second = CertificateAuthority::new().unwrap();
    assert_ne!(first.ca_der(), second.ca_der());
  }
}
