// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Public-facing HTTP ingress.
//!
//! One listener serves two virtual hosts: the apex carries the control
//! plane (`POST /connect`, everything else 404), and every other host is
//! treated as `<id>.<apex>` and forwarded through the matching session.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::server::conn::AddrIncoming;
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, StatusCode};

use crate::common::api::{
  self, ConnectRequest, ConnectResponse, RequestEncodeError,
};
use crate::common::certificates::CertificateAuthority;
use crate::common::identity::validate_label;
use crate::server::channel::ChannelError;
use crate::server::registry::TunnelRegistry;
use crate::util::cancellation::CancellationListener;

const TOKEN_HEADER: &str = "x-tunnel-token";

pub(crate) struct Ingress {
  apex: String,
  token: Option<String>,
  rpc_port: u16,
  registry: Arc<TunnelRegistry>,
  ca: Arc<CertificateAuthority>,
  /// Parent of every per-request context handed to rendezvous sends, so
  /// server shutdown still unblocks requests parked in a session.
  shutdown: CancellationListener,
}

impl Ingress {
  pub(crate) fn new(
    apex: String,
    token: Option<String>,
    rpc_port: u16,
    registry: Arc<TunnelRegistry>,
    ca: Arc<CertificateAuthority>,
    shutdown: CancellationListener,
  ) -> Self {
    Self {
      apex: apex.to_ascii_lowercase(),
      token,
      rpc_port,
      registry,
      ca,
      shutdown,
    }
  }

  async fn route(self: Arc<Self>, request: Request<Body>) -> Response<Body> {
    let host = host_label(&request);
    if host == self.apex {
      if request.method() == Method::POST && request.uri().path() == "/connect" {
        self.connect(request).await
      } else {
        status_response(StatusCode::NOT_FOUND)
      }
    } else {
      let id = host
        .strip_suffix(&format!(".{}", self.apex))
        .unwrap_or(&host)
        .to_string();
      self.forward(&id, request).await
    }
  }

  /// Control plane: mints a session and returns the credential bundle.
  async fn connect(&self, request: Request<Body>) -> Response<Body> {
    if let Some(expected) = &self.token {
      let presented = request
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
      if presented != Some(expected.as_str()) {
        return status_response(StatusCode::UNAUTHORIZED);
      }
    }

    let body = match hyper::body::to_bytes(request.into_body()).await {
      Ok(body) => body,
      Err(error) => {
        tracing::debug!(%error, "failure reading /connect body");
        return status_response(StatusCode::BAD_REQUEST);
      }
    };
    let Ok(connect) = serde_json::from_slice::<ConnectRequest>(&body) else {
      return status_response(StatusCode::BAD_REQUEST);
    };
    if let Err(error) = validate_label(&connect.id) {
      tracing::debug!(id = %connect.id, %error, "rejecting registration");
      return status_response(StatusCode::BAD_REQUEST);
    }

    let Some(nonce) = self.registry.create_session(&connect.id) else {
      tracing::debug!(id = %connect.id, "registration rejected: id already in use");
      return status_response(StatusCode::BAD_REQUEST);
    };
    let issued = match self.ca.generate(&connect.id, &nonce) {
      Ok(issued) => issued,
      Err(error) => {
        tracing::error!(id = %connect.id, %error, "leaf issuance failed");
        return status_response(StatusCode::INTERNAL_SERVER_ERROR);
      }
    };

    let response = ConnectResponse {
      port: self.rpc_port,
      ca: self.ca.ca_pem().to_vec(),
      private_key: issued.private_key_pem,
      certificate: issued.certificate_pem,
    };
    match serde_json::to_vec(&response) {
      Ok(encoded) => {
        tracing::info!(id = %connect.id, "session registered");
        let mut response = Response::new(Body::from(encoded));
        response.headers_mut().insert(
          header::CONTENT_TYPE,
          header::HeaderValue::from_static("application/json"),
        );
        response
      }
      Err(error) => {
        tracing::error!(%error, "failure encoding /connect response");
        status_response(StatusCode::INTERNAL_SERVER_ERROR)
      }
    }
  }

  /// Data plane: pairs the inbound request with its tunneled response.
  async fn forward(&self, id: &str, request: Request<Body>) -> Response<Body> {
    let Some(session) = self.registry.session_by_id(id) else {
      return status_response(StatusCode::NOT_FOUND);
    };
    let encoded = match api::request_to_proto(request).await {
      Ok(encoded) => encoded,
      Err(RequestEncodeError::TooLarge) => {
        return status_response(StatusCode::PAYLOAD_TOO_LARGE)
      }
      Err(error) => {
        tracing::warn!(id, %error, "failure buffering inbound request");
        return status_response(StatusCode::INTERNAL_SERVER_ERROR);
      }
    };

    // Each request gets its own context: cancelled when this handler is
    // dropped (the caller went away), or transitively by server shutdown.
    // Session teardown is the rendezvous's second, independent source.
    let request_token = self.shutdown.child_token();
    let request_ctx = CancellationListener::from(&request_token);
    let _cancel_on_drop = request_token.drop_guard();

    match session.channel().send(&request_ctx, encoded).await {
      Ok(response) => match api::proto_to_response(response) {
        Ok(response) => response,
        Err(error) => {
          tracing::warn!(id, %error, "tunneled response failed to convert");
          status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
      },
      // The tunnel went away mid-flight; indistinguishable from an
      // unknown subdomain as far as the public caller is concerned
      Err(ChannelError::EndOfStream) => status_response(StatusCode::NOT_FOUND),
    }
  }
}

/// Runs the ingress on an already-bound listener until `shutdown` fires.
pub(crate) async fn serve(
  listener: tokio::net::TcpListener,
  ingress: Arc<Ingress>,
  shutdown: CancellationListener,
) -> Result<(), hyper::Error> {
  let make_service = make_service_fn(move |_connection| {
    let ingress = Arc::clone(&ingress);
    async move {
      Ok::<_, Infallible>(service_fn(move |request| {
        let ingress = Arc::clone(&ingress);
        async move { Ok::<_, Infallible>(ingress.route(request).await) }
      }))
    }
  });
  let incoming = AddrIncoming::from_listener(listener)?;
  hyper::Server::builder(incoming)
    .serve(make_service)
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}

/// The Host header's name component, lowercased with any port stripped.
fn host_label(request: &Request<Body>) -> String {
  request
    .headers()
    .get(header::HOST)
    .and_then(|value| value.to_str().ok())
    .map(|host| host.rsplit_once(':').map_or(host, |(name, _)| name))
    .unwrap_or_default()
    .to_ascii_lowercase()
}

fn status_response(status: StatusCode) -> Response<Body> {
  let mut response = Response::new(Body::empty());
  *response.status_mut() = status;
  response
}

#[cfg(test)]
mod tests {
  use super::host_label;
  use hyper::{header, Body, Request};

  fn request_with_host(host: &str) -> Request<Body> {
    Request::builder()
      .uri("/")
      .header(header::HOST, host)
      .body(Body::empty())
      .unwrap()
  }

  #[test]
  fn host_labels_are_normalized() {
    assert_eq!(host_label(&request_with_host("Foo.T.Example")), "foo.t.example");
    assert_eq!(host_label(&request_with_host("foo.t.example:8080")), "foo.t.example");
    assert_eq!(host_label(&Request::new(Body::empty())), "");
  }
}
