// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The tunnel server: ingress HTTP, authenticated RPC plane, and the
//! session registry binding them together.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::common::certificates::{CertificateAuthority, CertificateError};
use crate::server::ingress::Ingress;
use crate::server::registry::TunnelRegistry;
use crate::util::cancellation::{CancellationListener, CloseReason};

pub mod acme;
pub mod channel;
pub mod registry;

mod ingress;
mod rpc;

pub use rpc::TransportError;

#[derive(Clone, Debug)]
pub struct ServerConfig {
  /// Apex host name; the control plane lives here, sessions under it.
  pub host: String,
  /// Bind address for both listeners.
  pub address: IpAddr,
  /// Public ingress port; 0 picks an ephemeral port.
  pub http_port: u16,
  /// RPC port clients dial with issued credentials; 0 picks one.
  pub rpc_port: u16,
  /// When set, `/connect` requires this bearer token.
  pub token: Option<String>,
  /// Contact email for the external ACME manager; enables TLS termination
  /// on the ingress when the deployment wires one up.
  pub acme_email: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
  #[error("failed binding listener: {0}")]
  Bind(#[source] std::io::Error),
  #[error(transparent)]
  Certificate(#[from] CertificateError),
  #[error("ingress failure: {0}")]
  Ingress(#[from] hyper::Error),
  #[error("rpc listener failure: {0}")]
  Rpc(#[source] std::io::Error),
  #[error("server task failed to rejoin: {0}")]
  Join(#[from] tokio::task::JoinError),
}

/// A bound-but-not-yet-serving tunnel server. Binding is separate from
/// serving so callers can learn the ephemeral ports before traffic starts.
pub struct Server {
  config: ServerConfig,
  registry: Arc<TunnelRegistry>,
  ca: Arc<CertificateAuthority>,
  http_listener: TcpListener,
  rpc_listener: TcpListener,
  http_addr: SocketAddr,
  rpc_addr: SocketAddr,
}

impl Server {
  /// Binds both listeners and constructs this instance's certificate
  /// authority and registry.
  pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
    let ca = Arc::new(CertificateAuthority::new()?);
    let registry = Arc::new(TunnelRegistry::new());
    let http_listener = TcpListener::bind((config.address, config.http_port))
      .await
      .map_err(ServerError::Bind)?;
    let rpc_listener = TcpListener::bind((config.address, config.rpc_port))
      .await
      .map_err(ServerError::Bind)?;
    let http_addr = http_listener.local_addr().map_err(ServerError::Bind)?;
    let rpc_addr = rpc_listener.local_addr().map_err(ServerError::Bind)?;
    tracing::info!(
      host = %config.host,
      %http_addr,
      %rpc_addr,
      acme = config.acme_email.is_some(),
      "tunnel server bound"
    );
    Ok(Self {
      config,
      registry,
      ca,
      http_listener,
      rpc_listener,
      http_addr,
      rpc_addr,
    })
  }

  pub fn http_addr(&self) -> SocketAddr {
    self.http_addr
  }

  pub fn rpc_addr(&self) -> SocketAddr {
    self.rpc_addr
  }

  pub fn registry(&self) -> &Arc<TunnelRegistry> {
    &self.registry
  }

  /// Runs ingress, RPC, and the reaper until `shutdown` fires or one of
  /// them fails; all sessions are closed with [CloseReason::Shutdown] on
  /// the way out.
  pub async fn serve(self, shutdown: CancellationListener) -> Result<(), ServerError> {
    let local = shutdown.child_token();
    let signal = CancellationListener::from(&local);

    let ingress = Arc::new(Ingress::new(
      self.config.host.clone(),
      self.config.token.clone(),
      self.rpc_addr.port(),
      Arc::clone(&self.registry),
      Arc::clone(&self.ca),
      signal.clone(),
    ));
    let mut ingress_task = tokio::spawn(ingress::serve(
      self.http_listener,
      ingress,
      signal.clone(),
    ));
    let mut rpc_task = tokio::spawn(rpc::serve(
      self.rpc_listener,
      Arc::clone(&self.registry),
      self.ca.server_tls_config(),
      signal.clone(),
    ));
    let mut reaper_task = {
      let registry = Arc::clone(&self.registry);
      let signal = signal.clone();
      tokio::spawn(async move { registry.reap(signal).await })
    };

    let result: Result<(), ServerError> = tokio::select! {
      _ = signal.cancelled() => Ok(()),
      ingress = &mut ingress_task => ingress
        .map_err(ServerError::Join)
        .and_then(|served| served.map_err(ServerError::Ingress)),
      rpc = &mut rpc_task => rpc
        .map_err(ServerError::Join)
        .and_then(|served| served.map_err(ServerError::Rpc)),
    };

    // Stop the survivors and drain them before tearing sessions down
    local.cancel();
    if !ingress_task.is_finished() {
      let _ = (&mut ingress_task).await;
    }
    if !rpc_task.is_finished() {
      let _ = (&mut rpc_task).await;
    }
    let _ = (&mut reaper_task).await;
    self.registry.clear_all(CloseReason::Shutdown);
    tracing::info!("tunnel server stopped");
    result
  }
}

/// Binds and serves in one step, for drivers that don't need the bound
/// addresses.
pub async fn run_server(
  config: ServerConfig,
  shutdown: CancellationListener,
) -> Result<(), ServerError> {
  Server::bind(config).await?.serve(shutdown).await
}

#[cfg(test)]
mod tests {
  use std::net::{IpAddr, Ipv4Addr};
  use std::sync::{Arc, Mutex as StdMutex};
  use std::time::Duration;

  use bytes::Bytes;
  use futures::FutureExt;
  use tokio_util::sync::CancellationToken;

  use super::{Server, ServerConfig};
  use crate::client::{self, ClientConfig, RequestHandler};
  use crate::common::api::MAX_REQUEST_SIZE;
  use crate::util::cancellation::CancellationListener;

  fn config(host: &str, token: Option<&str>) -> ServerConfig {
    ServerConfig {
      host: host.to_string(),
      address: IpAddr::V4(Ipv4Addr::LOCALHOST),
      http_port: 0,
      rpc_port: 0,
      token: token.map(str::to_string),
      acme_email: None,
    }
  }

  /// Captured view of what the tunneled handler observed.
  #[derive(Default)]
  struct Observed {
    requests: Vec<(String, String, Option<String>, Option<String>)>,
  }

  struct TeapotHandler {
    observed: Arc<StdMutex<Observed>>,
  }

  impl RequestHandler for TeapotHandler {
    fn handle(
      &self,
      request: http::Request<Bytes>,
    ) -> futures::future::BoxFuture<'_, http::Response<Bytes>> {
      let observed = Arc::clone(&self.observed);
      async move {
        observed.lock().unwrap().requests.push((
          request.method().to_string(),
          request.uri().path().to_string(),
          request.uri().query().map(str::to_string),
          request
            .headers()
            .get("x-trace")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        ));
        http::Response::builder()
          .status(418)
          .body(Bytes::from_static(b"hi\n"))
          .unwrap()
      }
      .boxed()
    }
  }

  async fn request_until_not_404(
    http: &reqwest::Client,
    url: &str,
    host: &str,
  ) -> reqwest::Response {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
      let response = http
        .get(url)
        .header("host", host)
        .header("x-trace", "42")
        .send()
        .await
        .unwrap();
      if response.status() != 404 {
        return response;
      }
      assert!(
        tokio::time::Instant::now() < deadline,
        "tunnel never became reachable"
      );
      tokio::time::sleep(Duration::from_millis(25)).await;
    }
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn end_to_end_tunnel() {
    // The apex must match the Host header the registering client sends,
    // which for a loopback server URL is the bare address
    let server = Server::bind(config("127.0.0.1", None)).await.unwrap();
    let http_addr = server.http_addr();
    let shutdown = CancellationToken::new();
    let server_task = {
      let listener = CancellationListener::from(&shutdown);
      tokio::spawn(server.serve(listener))
    };

    let observed = Arc::new(StdMutex::new(Observed::default()));
    let client_shutdown = shutdown.child_token();
    let client_task = {
      let handler = TeapotHandler {
        observed: Arc::clone(&observed),
      };
      let listener = CancellationListener::from(&client_shutdown);
      tokio::spawn(client::connect(
        ClientConfig {
          server: format!("http://{http_addr}"),
          token: None,
          id: "foo".to_string(),
        },
        handler,
        listener,
      ))
    };

    let http = reqwest::Client::new();
    let base = format!("http://{http_addr}");

    // Happy path: request through the subdomain reaches the handler
    let response =
      request_until_not_404(&http, &format!("{base}/hello?x=1"), "foo.127.0.0.1").await;
    assert_eq!(response.status(), 418);
    assert_eq!(response.bytes().await.unwrap(), Bytes::from_static(b"hi\n"));
    {
      let observed = observed.lock().unwrap();
      assert_eq!(
        observed.requests.as_slice(),
        &[(
          "GET".to_string(),
          "/hello".to_string(),
          Some("x=1".to_string()),
          Some("42".to_string()),
        )]
      );
    }

    // Duplicate registration while the session is live; the default Host
    // header of the base URL is the apex itself
    let duplicate = http
      .post(format!("{base}/connect"))
      .json(&serde_json::json!({"id": "foo"}))
      .send()
      .await
      .unwrap();
    assert_eq!(duplicate.status(), 400);

    // Unknown subdomain
    let missing = http
      .get(format!("{base}/"))
      .header("host", "bar.127.0.0.1")
      .send()
      .await
      .unwrap();
    assert_eq!(missing.status(), 404);

    // Oversized ingress body is rejected before touching the client
    let oversize = http
      .post(format!("{base}/upload"))
      .header("host", "foo.127.0.0.1")
      .body(vec![0u8; MAX_REQUEST_SIZE + 1])
      .send()
      .await
      .unwrap();
    assert_eq!(oversize.status(), 413);
    assert_eq!(observed.lock().unwrap().requests.len(), 1);

    // Apex paths other than /connect are 404
    let apex = http.get(format!("{base}/anything")).send().await.unwrap();
    assert_eq!(apex.status(), 404);

    shutdown.cancel();
    let _ = client_task.await.unwrap();
    server_task.await.unwrap().unwrap();
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn connect_requires_the_configured_token() {
    let server = Server::bind(config("t.example", Some("secret"))).await.unwrap();
    let http_addr = server.http_addr();
    let shutdown = CancellationToken::new();
    let server_task = {
      let listener = CancellationListener::from(&shutdown);
      tokio::spawn(server.serve(listener))
    };

    let http = reqwest::Client::new();
    let base = format!("http://{http_addr}");
    let body = serde_json::json!({"id": "foo"});

    let unauthenticated = http
      .post(format!("{base}/connect"))
      .header("host", "t.example")
      .json(&body)
      .send()
      .await
      .unwrap();
    assert_eq!(unauthenticated.status(), 401);

    let wrong = http
      .post(format!("{base}/connect"))
      .header("host", "t.example")
      .header("x-tunnel-token", "guess")
      .json(&body)
      .send()
      .await
      .unwrap();
    assert_eq!(wrong.status(), 401);

    let authorized = http
      .post(format!("{base}/connect"))
      .header("host", "t.example")
      .header("x-tunnel-token", "secret")
      .json(&body)
      .send()
      .await
      .unwrap();
    assert_eq!(authorized.status(), 200);

    shutdown.cancel();
    server_task.await.unwrap().unwrap();
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn malformed_and_invalid_registrations_are_rejected() {
    let server = Server::bind(config("t.example", None)).await.unwrap();
    let http_addr = server.http_addr();
    let shutdown = CancellationToken::new();
    let server_task = {
      let listener = CancellationListener::from(&shutdown);
      tokio::spawn(server.serve(listener))
    };

    let http = reqwest::Client::new();
    let base = format!("http://{http_addr}");

    let malformed = http
      .post(format!("{base}/connect"))
      .header("host", "t.example")
      .body("{not json")
      .send()
      .await
      .unwrap();
    assert_eq!(malformed.status(), 400);

    let dotted = http
      .post(format!("{base}/connect"))
      .header("host", "t.example")
      .json(&serde_json::json!({"id": "a.b"}))
      .send()
      .await
      .unwrap();
    assert_eq!(dotted.status(), 400);

    shutdown.cancel();
    server_task.await.unwrap().unwrap();
  }
}
