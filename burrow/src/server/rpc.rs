// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The authenticated RPC plane.
//!
//! Clients dial with their issued leaf; the TLS layer verifies it against
//! the tunnel CA and the first frame names the method. The SPIFFE URI SAN
//! on the peer certificate is the sole identity carried from registration
//! into this channel: no URI means `UNAUTHENTICATED`, an identity with no
//! live session means `NOT_FOUND`.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::common::api::{
  ApiRequest, ApiResponse, Empty, RpcMethod, RpcStatus, StatusCode, StreamHeader, MAX_MESSAGE,
};
use crate::common::certificates;
use crate::common::identity::SessionIdentity;
use crate::server::channel::{HandleError, Responder};
use crate::server::registry::TunnelRegistry;
use crate::util::cancellation::{CancellationListener, CloseReason};
use crate::util::framed::{self, MessageReadError, WriteError};

/// Frame ceiling for the establishment exchange and heartbeat pings; real
/// payloads get [MAX_MESSAGE].
const CONTROL_FRAME_MAX: usize = 1024;

#[derive(thiserror::Error, Debug)]
pub(crate) enum RpcError {
  #[error("stream i/o failure: {0}")]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Read(#[from] MessageReadError),
  #[error(transparent)]
  Write(#[from] WriteError),
}

impl RpcError {
  fn is_clean_disconnect(&self) -> bool {
    matches!(self, RpcError::Read(read) if read.is_clean_eof())
  }
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error(transparent)]
  Read(#[from] MessageReadError),
  #[error(transparent)]
  Write(#[from] WriteError),
}

impl From<TransportError> for RpcError {
  fn from(error: TransportError) -> Self {
    match error {
      TransportError::Read(read) => RpcError::Read(read),
      TransportError::Write(write) => RpcError::Write(write),
    }
  }
}

/// Drives one exchange over the serving stream: request out, response in.
struct StreamResponder<'a, R, W> {
  reader: &'a mut R,
  writer: &'a mut W,
}

impl<R, W> Responder for StreamResponder<'_, R, W>
where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  type Error = TransportError;

  fn respond(&mut self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, TransportError>> {
    async move {
      framed::write_framed_message(&mut *self.writer, &request, Some(MAX_MESSAGE)).await?;
      let response = framed::read_framed_message(&mut *self.reader, Some(MAX_MESSAGE)).await?;
      Ok(response)
    }
    .boxed()
  }
}

/// Accept loop for the RPC listener; one task per stream.
pub(crate) async fn serve(
  listener: TcpListener,
  registry: Arc<TunnelRegistry>,
  tls: Arc<rustls::ServerConfig>,
  shutdown: CancellationListener,
) -> std::io::Result<()> {
  let acceptor = TlsAcceptor::from(tls);
  loop {
    let (stream, remote) = tokio::select! {
      _ = shutdown.cancelled() => return Ok(()),
      accepted = listener.accept() => accepted?,
    };
    let registry = Arc::clone(&registry);
    let acceptor = acceptor.clone();
    tokio::spawn(async move {
      match handle_connection(registry, acceptor, stream).await {
        Ok(()) => {}
        Err(error) if error.is_clean_disconnect() => {
          tracing::debug!(%remote, "rpc stream closed");
        }
        Err(error) => {
          tracing::warn!(%remote, %error, "rpc stream failed");
        }
      }
    });
  }
}

async fn handle_connection(
  registry: Arc<TunnelRegistry>,
  acceptor: TlsAcceptor,
  stream: tokio::net::TcpStream,
) -> Result<(), RpcError> {
  let stream = acceptor.accept(stream).await?;
  let identity = {
    let (_, connection) = stream.get_ref();
    connection
      .peer_certificates()
      .and_then(certificates::peer_identity)
  };
  let (mut reader, mut writer) = tokio::io::split(stream);

  let header: StreamHeader =
    framed::read_framed_message(&mut reader, Some(CONTROL_FRAME_MAX)).await?;
  let Some(identity) = identity else {
    tracing::debug!("rejecting rpc stream without a spiffe identity");
    return reject(&mut writer, StatusCode::Unauthenticated, "unable to authenticate request")
      .await;
  };

  match RpcMethod::try_from(header.method) {
    Ok(RpcMethod::ReverseServe) => reverse_serve(registry, identity, reader, writer).await,
    Ok(RpcMethod::Heartbeat) => heartbeat(registry, identity, reader, writer).await,
    Err(_) => reject(&mut writer, StatusCode::Internal, "unknown rpc method").await,
  }
}

async fn reject<W: AsyncWrite + Unpin>(
  writer: &mut W,
  code: StatusCode,
  message: &str,
) -> Result<(), RpcError> {
  framed::write_framed_message(
    writer,
    &RpcStatus::new(code, message),
    Some(CONTROL_FRAME_MAX),
  )
  .await?;
  Ok(())
}

async fn accept<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), RpcError> {
  framed::write_framed_message(writer, &RpcStatus::ok(), Some(CONTROL_FRAME_MAX)).await?;
  Ok(())
}

/// Binds the stream to its session and serves the rendezvous until either
/// side goes away; teardown of the session is deferred to every exit path.
async fn reverse_serve<R, W>(
  registry: Arc<TunnelRegistry>,
  identity: SessionIdentity,
  mut reader: R,
  mut writer: W,
) -> Result<(), RpcError>
where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  let Some(session) = registry.get(&identity) else {
    tracing::debug!(session = %identity, "reverse-serve for unknown session");
    return reject(&mut writer, StatusCode::NotFound, "client not found").await;
  };
  if session.channel().is_active() {
    return reject(&mut writer, StatusCode::NotFound, "session already bound").await;
  }
  accept(&mut writer).await?;
  tracing::info!(session = %identity, "serving stream bound");

  let result = {
    let mut responder = StreamResponder {
      reader: &mut reader,
      writer: &mut writer,
    };
    session.channel().handle(&mut responder).await
  };
  match result {
    // Lost a binding race; the winning stream owns the session
    Err(HandleError::AlreadyBound) => Ok(()),
    Err(HandleError::EndOfStream) => {
      registry.clear(&identity, CloseReason::Disconnected);
      tracing::debug!(session = %identity, "serving stream ended");
      Ok(())
    }
    Err(HandleError::Responder(error)) => {
      registry.clear(&identity, CloseReason::Disconnected);
      Err(error.into())
    }
    Ok(()) => {
      registry.clear(&identity, CloseReason::Disconnected);
      Ok(())
    }
  }
}

/// Consumes keepalive pings, refreshing the session stamp per message.
async fn heartbeat<R, W>(
  registry: Arc<TunnelRegistry>,
  identity: SessionIdentity,
  mut reader: R,
  mut writer: W,
) -> Result<(), RpcError>
where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  let Some(session) = registry.get(&identity) else {
    tracing::debug!(session = %identity, "heartbeat for unknown session");
    return reject(&mut writer, StatusCode::NotFound, "client not found").await;
  };
  accept(&mut writer).await?;

  let cancelled = session.channel().cancelled_listener();
  loop {
    tokio::select! {
      _ = cancelled.cancelled() => return Ok(()),
      frame = framed::read_framed_message::<_, Empty>(&mut reader, Some(CONTROL_FRAME_MAX)) => {
        match frame {
          Ok(_) => session.touch(),
          Err(error) if error.is_clean_eof() => return Ok(()),
          Err(error) => return Err(error.into()),
        }
      }
    }
  }
}
