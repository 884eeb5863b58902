// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The client half of a tunnel.
//!
//! [connect] registers an id with the server's control plane, dials the RPC
//! port with the issued credentials, keeps the session alive with
//! heartbeats, and serves inbound requests through a caller-supplied
//! [RequestHandler] until the stream ends. Reconnect policy belongs to the
//! driver program, not here.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::common::api::{
  self, ApiRequest, ConnectRequest, ConnectResponse, ConvertError, Empty, RpcMethod, RpcStatus,
  StatusCode, StreamHeader, MAX_MESSAGE,
};
use crate::common::certificates::{self, CertificateError, SERVER_NAME};
use crate::common::identity::{validate_label, InvalidLabel};
use crate::common::HEARTBEAT_INTERVAL;
use crate::util::cancellation::CancellationListener;
use crate::util::framed::{read_framed_message, write_framed_message, MessageReadError, WriteError};

const TOKEN_HEADER: &str = "X-Tunnel-Token";
const CONTROL_FRAME_MAX: usize = 1024;

/// Serves one tunneled request. Implementations are infallible the way an
/// HTTP handler is: failures become whatever response they choose.
pub trait RequestHandler: Send + Sync {
  fn handle(&self, request: http::Request<Bytes>) -> BoxFuture<'_, http::Response<Bytes>>;
}

impl<F> RequestHandler for F
where
  F: Fn(http::Request<Bytes>) -> BoxFuture<'static, http::Response<Bytes>> + Send + Sync,
{
  fn handle(&self, request: http::Request<Bytes>) -> BoxFuture<'_, http::Response<Bytes>> {
    (self)(request)
  }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
  /// Base URL of the server's apex, e.g. `http://t.example`.
  pub server: String,
  /// Static bearer token, when the server requires one.
  pub token: Option<String>,
  /// Requested subdomain label; IDNA-normalized before use.
  pub id: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
  #[error(transparent)]
  InvalidId(#[from] InvalidLabel),
  #[error("id {0:?} is not a valid domain label")]
  IdnaMapping(String),
  #[error("invalid server url {0:?}")]
  InvalidServer(String),
  #[error("registration request failed: {0}")]
  Registration(#[from] reqwest::Error),
  #[error("remote error: {0}")]
  RemoteStatus(u16),
  #[error(transparent)]
  Certificate(#[from] CertificateError),
  #[error("rpc connection failed: {0}")]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Read(#[from] MessageReadError),
  #[error(transparent)]
  Write(#[from] WriteError),
  #[error("rpc stream rejected: {message:?} ({code:?})")]
  Rejected {
    code: Option<StatusCode>,
    message: String,
  },
  #[error(transparent)]
  Convert(#[from] ConvertError),
}

type FramedStream = (
  ReadHalf<TlsStream<TcpStream>>,
  WriteHalf<TlsStream<TcpStream>>,
);

/// Registers with the server and serves the tunnel until the stream ends,
/// an error surfaces, or `shutdown` fires.
pub async fn connect<THandler: RequestHandler>(
  config: ClientConfig,
  handler: THandler,
  shutdown: CancellationListener,
) -> Result<(), ClientError> {
  let id = idna::domain_to_ascii(&config.id)
    .map_err(|_| ClientError::IdnaMapping(config.id.clone()))?;
  validate_label(&id)?;

  let mut endpoint = reqwest::Url::parse(&config.server)
    .map_err(|_| ClientError::InvalidServer(config.server.clone()))?;
  let rpc_host = endpoint
    .host_str()
    .ok_or_else(|| ClientError::InvalidServer(config.server.clone()))?
    .to_string();
  endpoint.set_path("/connect");

  let http = reqwest::Client::new();
  let mut registration = http.post(endpoint).json(&ConnectRequest { id: id.clone() });
  if let Some(token) = &config.token {
    registration = registration.header(TOKEN_HEADER, token.as_str());
  }
  let response = registration.send().await?;
  if !response.status().is_success() {
    return Err(ClientError::RemoteStatus(response.status().as_u16()));
  }
  let bundle: ConnectResponse = response.json().await?;
  tracing::info!(id, port = bundle.port, "registered tunnel session");

  let tls = Arc::new(certificates::client_tls_config(
    &bundle.ca,
    &bundle.certificate,
    &bundle.private_key,
  )?);

  let heartbeat = open_stream(&rpc_host, bundle.port, &tls, RpcMethod::Heartbeat).await?;
  let heartbeat_token = shutdown.child_token();
  let heartbeat_task = {
    let listener = CancellationListener::from(&heartbeat_token);
    tokio::spawn(heartbeat_loop(heartbeat, listener))
  };

  let serving = open_stream(&rpc_host, bundle.port, &tls, RpcMethod::ReverseServe).await?;
  let result = serve_loop(serving, &handler, &shutdown).await;

  heartbeat_token.cancel();
  let _ = heartbeat_task.await;
  result
}

/// Dials the RPC port, announces the method, and waits for the server's
/// acceptance before handing the stream back.
async fn open_stream(
  host: &str,
  port: u16,
  tls: &Arc<rustls::ClientConfig>,
  method: RpcMethod,
) -> Result<FramedStream, ClientError> {
  let tcp = TcpStream::connect((host, port)).await?;
  let server_name = rustls::ServerName::try_from(SERVER_NAME)
    .map_err(|_| ClientError::InvalidServer(SERVER_NAME.to_string()))?;
  let stream = TlsConnector::from(Arc::clone(tls))
    .connect(server_name, tcp)
    .await?;
  let (mut reader, mut writer) = tokio::io::split(stream);

  write_framed_message(
    &mut writer,
    &StreamHeader {
      method: method as i32,
    },
    Some(CONTROL_FRAME_MAX),
  )
  .await?;
  let status: RpcStatus = read_framed_message(&mut reader, Some(CONTROL_FRAME_MAX)).await?;
  match status.status_code() {
    Some(StatusCode::Ok) => Ok((reader, writer)),
    code => Err(ClientError::Rejected {
      code,
      message: status.message,
    }),
  }
}

/// Sends one empty ping per interval until the session or the send dies.
async fn heartbeat_loop(stream: FramedStream, shutdown: CancellationListener) {
  let (_reader, mut writer) = stream;
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => return,
      _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
        if let Err(error) =
          write_framed_message(&mut writer, &Empty {}, Some(CONTROL_FRAME_MAX)).await
        {
          tracing::debug!(%error, "heartbeat send failed; stopping pings");
          return;
        }
      }
    }
  }
}

/// Receive a request, run the handler, send the buffered response; repeats
/// until the stream errors or `shutdown` fires. Any receive or send failure
/// propagates; a reaped session surfaces here as a failed receive.
async fn serve_loop<THandler: RequestHandler>(
  stream: FramedStream,
  handler: &THandler,
  shutdown: &CancellationListener,
) -> Result<(), ClientError> {
  let (mut reader, mut writer) = stream;
  loop {
    let request: ApiRequest = tokio::select! {
      _ = shutdown.cancelled() => return Ok(()),
      request = read_framed_message(&mut reader, Some(MAX_MESSAGE)) => request?,
    };
    let request = api::proto_to_request(request)?;
    tracing::debug!(method = %request.method(), path = request.uri().path(), "handling tunneled request");
    let response = handler.handle(request).await;
    let encoded = api::response_to_proto(response);
    write_framed_message(&mut writer, &encoded, Some(MAX_MESSAGE)).await?;
  }
}

#[cfg(test)]
mod tests {
  use bytes::Bytes;
  use futures::FutureExt;

  use super::{connect, ClientConfig, ClientError, RequestHandler};
  use crate::util::cancellation::CancellationListener;

  fn noop_handler() -> impl RequestHandler {
    |_request: http::Request<Bytes>| {
      async { http::Response::new(Bytes::new()) }.boxed()
    }
  }

  #[tokio::test]
  async fn ids_are_validated_before_any_network_activity() {
    let rejected = connect(
      ClientConfig {
        server: "http://127.0.0.1:1".to_string(),
        token: None,
        id: "not.allowed".to_string(),
      },
      noop_handler(),
      CancellationListener::default(),
    )
    .await;
    assert!(matches!(rejected, Err(ClientError::InvalidId(_))));

    let empty = connect(
      ClientConfig {
        server: "http://127.0.0.1:1".to_string(),
        token: None,
        id: String::new(),
      },
      noop_handler(),
      CancellationListener::default(),
    )
    .await;
    assert!(matches!(
      empty,
      Err(ClientError::InvalidId(_)) | Err(ClientError::IdnaMapping(_))
    ));
  }

  #[tokio::test]
  async fn invalid_server_urls_are_rejected() {
    let result = connect(
      ClientConfig {
        server: "not a url".to_string(),
        token: None,
        id: "foo".to_string(),
      },
      noop_handler(),
      CancellationListener::default(),
    )
    .await;
    assert!(matches!(result, Err(ClientError::InvalidServer(_))));
  }
}
