// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Per-session rendezvous between ingress handlers and the serving stream.
//!
//! Ingress tasks call [RequestChannel::send]; the one serving stream drives
//! [RequestChannel::handle]. A sender gate keeps exactly one request
//! outstanding per session, so the wire protocol stays strictly
//! request/response ordered with no correlation ids. Every blocking step
//! selects over both the caller's context and the session's cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::common::api::{ApiRequest, ApiResponse};
use crate::util::cancellation::{CancellationListener, CloseReason, ReasonedCancellation};

/// One in-flight exchange: the request and the slot its response lands in.
/// If the sender gives up between phases the slot is gone and the eventual
/// response is discarded instead of being delivered to a later caller.
type Exchange = (ApiRequest, oneshot::Sender<ApiResponse>);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
  /// Terminal: the caller's context or the session ended. Never logged as
  /// a failure; ingress maps it to 404.
  #[error("end of stream")]
  EndOfStream,
}

#[derive(thiserror::Error, Debug)]
pub enum HandleError<E: std::error::Error> {
  #[error("end of stream")]
  EndOfStream,
  #[error("a serving stream already claimed this session")]
  AlreadyBound,
  #[error(transparent)]
  Responder(E),
}

/// The serving stream's side of an exchange: forward one request to the
/// remote client and produce its response.
pub trait Responder {
  type Error: std::error::Error + Send + Sync + 'static;

  fn respond(&mut self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, Self::Error>>;
}

pub struct RequestChannel {
  requests: mpsc::Sender<Exchange>,
  serving: StdMutex<Option<mpsc::Receiver<Exchange>>>,
  send_gate: Mutex<()>,
  active: AtomicBool,
  cancellation: ReasonedCancellation,
}

impl RequestChannel {
  pub fn new() -> Self {
    let (requests, receiver) = mpsc::channel(1);
    Self {
      requests,
      serving: StdMutex::new(Some(receiver)),
      send_gate: Mutex::new(()),
      active: AtomicBool::new(false),
      cancellation: ReasonedCancellation::new(),
    }
  }

  /// Fires the session's cancellation; idempotent, first reason wins.
  pub fn close(&self, reason: CloseReason) {
    self.cancellation.cancel(reason);
  }

  pub fn is_closed(&self) -> bool {
    self.cancellation.is_cancelled()
  }

  pub fn close_reason(&self) -> Option<CloseReason> {
    self.cancellation.reason()
  }

  /// True once a serving stream has claimed this session.
  pub fn is_active(&self) -> bool {
    self.active.load(Ordering::Relaxed)
  }

  pub fn cancelled_listener(&self) -> CancellationListener {
    self.cancellation.listener()
  }

  /// Carries one request to the serving stream and waits for its paired
  /// response. Two distinct suspension points: enqueueing the request, then
  /// awaiting the reply; cancellation of either context at either point
  /// returns [ChannelError::EndOfStream].
  pub async fn send(
    &self,
    ctx: &CancellationListener,
    request: ApiRequest,
  ) -> Result<ApiResponse, ChannelError> {
    let _gate = tokio::select! {
      _ = ctx.cancelled() => return Err(ChannelError::EndOfStream),
      _ = self.cancellation.cancelled() => return Err(ChannelError::EndOfStream),
      gate = self.send_gate.lock() => gate,
    };

    let (reply, response) = oneshot::channel();
    tokio::select! {
      _ = ctx.cancelled() => return Err(ChannelError::EndOfStream),
      _ = self.cancellation.cancelled() => return Err(ChannelError::EndOfStream),
      enqueued = self.requests.send((request, reply)) => {
        if enqueued.is_err() {
          return Err(ChannelError::EndOfStream);
        }
      }
    }

    tokio::select! {
      _ = ctx.cancelled() => Err(ChannelError::EndOfStream),
      _ = self.cancellation.cancelled() => Err(ChannelError::EndOfStream),
      response = response => response.map_err(|_| ChannelError::EndOfStream),
    }
  }

  /// Runs the serving loop: receive a request, let `responder` produce the
  /// response, deliver it to the waiting sender. Returns
  /// [HandleError::EndOfStream] once the session is cancelled, or the
  /// responder's own error verbatim. At most one caller may ever claim a
  /// given channel.
  pub async fn handle<TResponder: Responder>(
    &self,
    responder: &mut TResponder,
  ) -> Result<(), HandleError<TResponder::Error>> {
    let mut requests = self
      .serving
      .lock()
      .expect("serving claim lock poisoned")
      .take()
      .ok_or(HandleError::AlreadyBound)?;
    self.active.store(true, Ordering::Relaxed);

    loop {
      let exchange = tokio::select! {
        _ = self.cancellation.cancelled() => return Err(HandleError::EndOfStream),
        exchange = requests.recv() => exchange,
      };
      let Some((request, reply)) = exchange else {
        return Err(HandleError::EndOfStream);
      };
      let response = responder
        .respond(request)
        .await
        .map_err(HandleError::Responder)?;
      // A sender cancelled between its two phases abandoned the reply slot;
      // its response is dropped here rather than handed to anyone else.
      let _ = reply.send(response);
    }
  }
}

impl Default for RequestChannel {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for RequestChannel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RequestChannel")
      .field("active", &self.is_active())
      .field("closed", &self.is_closed())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use std::convert::Infallible;
  use std::sync::Arc;

  use bytes::Bytes;
  use futures::future::BoxFuture;
  use futures::FutureExt;
  use tokio_util::sync::CancellationToken;

  use super::{ChannelError, HandleError, RequestChannel, Responder};
  use crate::common::api::{ApiRequest, ApiResponse};
  use crate::util::cancellation::{CancellationListener, CloseReason};

  fn request(body: &str) -> ApiRequest {
    ApiRequest {
      method: "GET".to_string(),
      url: "/".to_string(),
      headers: Vec::new(),
      parameters: Vec::new(),
      body: Bytes::from(body.to_string()),
    }
  }

  /// Reflects each request body back with a 200.
  struct Echo;

  impl Responder for Echo {
    type Error = Infallible;

    fn respond(&mut self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, Infallible>> {
      async move {
        Ok(ApiResponse {
          status: 200,
          headers: Vec::new(),
          body: request.body,
        })
      }
      .boxed()
    }
  }

  /// Parks on a gate before responding, so tests can interleave precisely.
  struct Gated {
    entered: tokio::sync::mpsc::UnboundedSender<()>,
    release: tokio::sync::mpsc::UnboundedReceiver<()>,
  }

  impl Responder for Gated {
    type Error = Infallible;

    fn respond(&mut self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, Infallible>> {
      async move {
        self.entered.send(()).unwrap();
        let _ = self.release.recv().await;
        Ok(ApiResponse {
          status: 200,
          headers: Vec::new(),
          body: request.body,
        })
      }
      .boxed()
    }
  }

  fn never_cancelled() -> CancellationListener {
    CancellationListener::from(CancellationToken::new())
  }

  #[tokio::test]
  async fn each_sender_receives_its_own_response() {
    let channel = Arc::new(RequestChannel::new());
    let serving = {
      let channel = Arc::clone(&channel);
      tokio::spawn(async move { channel.handle(&mut Echo).await })
    };

    let mut senders = Vec::new();
    for index in 0..8 {
      let channel = Arc::clone(&channel);
      senders.push(tokio::spawn(async move {
        let body = format!("payload-{index}");
        let response = channel.send(&never_cancelled(), request(&body)).await?;
        Ok::<_, ChannelError>((body, response))
      }));
    }
    for sender in senders {
      let (body, response) = sender.await.unwrap().unwrap();
      assert_eq!(response.status, 200);
      assert_eq!(response.body, Bytes::from(body));
    }

    channel.close(CloseReason::Disconnected);
    let outcome = serving.await.unwrap();
    assert!(matches!(outcome, Err(HandleError::EndOfStream)));
  }

  #[tokio::test]
  async fn closing_mid_exchange_returns_end_of_stream_and_discards_the_response() {
    let channel = Arc::new(RequestChannel::new());
    let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
    let (release_tx, release_rx) = tokio::sync::mpsc::unbounded_channel();
    let serving = {
      let channel = Arc::clone(&channel);
      let mut gated = Gated {
        entered: entered_tx,
        release: release_rx,
      };
      tokio::spawn(async move { channel.handle(&mut gated).await })
    };

    let sender = {
      let channel = Arc::clone(&channel);
      tokio::spawn(async move { channel.send(&never_cancelled(), request("orphaned")).await })
    };

    // The serving stream holds the request; the sender is parked in its
    // response phase when the session is torn down.
    entered_rx.recv().await.unwrap();
    channel.close(CloseReason::Reaped);
    assert_eq!(sender.await.unwrap(), Err(ChannelError::EndOfStream));

    // The handler finishes its in-flight response after the teardown; the
    // delivery is silently dropped and the loop observes the cancellation.
    release_tx.send(()).unwrap();
    assert!(matches!(
      serving.await.unwrap(),
      Err(HandleError::EndOfStream)
    ));
    assert_eq!(channel.close_reason(), Some(CloseReason::Reaped));
  }

  #[tokio::test]
  async fn sender_context_cancellation_unblocks_send() {
    let channel = Arc::new(RequestChannel::new());
    let ctx = CancellationToken::new();
    let sender = {
      let channel = Arc::clone(&channel);
      let listener = CancellationListener::from(&ctx);
      tokio::spawn(async move { channel.send(&listener, request("doomed")).await })
    };
    // No serving stream exists; the send is parked until its context fires.
    ctx.cancel();
    assert_eq!(sender.await.unwrap(), Err(ChannelError::EndOfStream));
  }

  #[tokio::test]
  async fn send_after_close_is_end_of_stream() {
    let channel = RequestChannel::new();
    channel.close(CloseReason::Shutdown);
    assert_eq!(
      channel.send(&never_cancelled(), request("late")).await,
      Err(ChannelError::EndOfStream)
    );
  }

  #[tokio::test]
  async fn only_one_serving_stream_may_claim_a_session() {
    let channel = Arc::new(RequestChannel::new());
    let first = {
      let channel = Arc::clone(&channel);
      tokio::spawn(async move { channel.handle(&mut Echo).await })
    };
    // Give the first claim time to land
    tokio::task::yield_now().await;
    assert!(matches!(
      channel.handle(&mut Echo).await,
      Err(HandleError::AlreadyBound)
    ));
    assert!(channel.is_active());

    channel.close(CloseReason::Disconnected);
    assert!(matches!(
      first.await.unwrap(),
      Err(HandleError::EndOfStream)
    ));
  }
}
