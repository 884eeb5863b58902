// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use burrow::client::{self, ClientConfig, RequestHandler};
use burrow::util::cancellation::CancellationListener;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct ClientArgs {
  pub server: String,
  pub id: String,
  pub token: Option<String>,
  pub local_port: u16,
}

/// Headers that describe the proxy hop rather than the payload; forwarding
/// them would corrupt the re-framed response.
const HOP_BY_HOP_HEADERS: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Forwards each tunneled request to a local HTTP server and relays the
/// buffered response; an unreachable local server surfaces as a 502.
struct LocalProxy {
  http: reqwest::Client,
  base: String,
}

impl LocalProxy {
  fn new(local_port: u16) -> Self {
    Self {
      http: reqwest::Client::new(),
      base: format!("http://127.0.0.1:{local_port}"),
    }
  }

  async fn forward(&self, request: http::Request<Bytes>) -> Result<http::Response<Bytes>> {
    let url = format!(
      "{}{}",
      self.base,
      request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
    );
    let (parts, body) = request.into_parts();
    let mut outbound = self
      .http
      .request(parts.method, url)
      .body(body.to_vec());
    for (name, value) in parts.headers.iter() {
      if HOP_BY_HOP_HEADERS.contains(&name.as_str()) || name == &http::header::HOST {
        continue;
      }
      outbound = outbound.header(name, value);
    }

    let upstream = outbound.send().await.context("local server unreachable")?;
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let body = upstream
      .bytes()
      .await
      .context("failure reading local response body")?;

    let mut response = http::Response::new(body);
    *response.status_mut() = status;
    for (name, value) in headers.iter() {
      if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
        continue;
      }
      response.headers_mut().append(name, value.clone());
    }
    Ok(response)
  }
}

impl RequestHandler for LocalProxy {
  fn handle(&self, request: http::Request<Bytes>) -> BoxFuture<'_, http::Response<Bytes>> {
    async move {
      match self.forward(request).await {
        Ok(response) => response,
        Err(error) => {
          tracing::warn!(err = ?error, "local proxy failure");
          let mut response = http::Response::new(Bytes::from(error.to_string()));
          *response.status_mut() = http::StatusCode::BAD_GATEWAY;
          response
        }
      }
    }
    .boxed()
  }
}

pub async fn client_main(args: ClientArgs) -> Result<()> {
  let shutdown = CancellationToken::new();
  let sigint_handler_task = {
    let shutdown = shutdown.clone();
    tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      shutdown.cancel();
    })
  };

  let handler = LocalProxy::new(args.local_port);
  let result = client::connect(
    ClientConfig {
      server: args.server,
      token: args.token,
      id: args.id,
    },
    handler,
    CancellationListener::from(&shutdown),
  )
  .await;
  sigint_handler_task.abort();
  tracing::info!("Disconnecting...");
  result.context("tunnel session ended")
}
