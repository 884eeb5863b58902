// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::OnceLock;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A [CancellationToken] that cannot be triggered by its recipient
///
/// Child tokens can be produced from it, allowing sub-cancellation,
/// but the interface does not expose a way to cancel the inner token.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

impl From<&CancellationToken> for CancellationListener {
  fn from(token: &CancellationToken) -> Self {
    Self {
      token: token.clone(),
    }
  }
}

/// Why a session's cancellation fired.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseReason {
  /// The serving stream returned; the remote went away.
  Disconnected,
  /// The reaper removed the session after heartbeat staleness.
  Reaped,
  /// The owning server is shutting down.
  Shutdown,
}

/// A cancellation source that records the first reason it was fired with.
///
/// Firing is idempotent; only the first reason is retained, so observers on
/// either side of the session see a consistent cause.
#[derive(Debug, Default)]
pub struct ReasonedCancellation {
  token: CancellationToken,
  reason: OnceLock<CloseReason>,
}

impl ReasonedCancellation {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self, reason: CloseReason) {
    let _ = self.reason.set(reason);
    self.token.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn reason(&self) -> Option<CloseReason> {
    self.reason.get().copied()
  }

  pub fn listener(&self) -> CancellationListener {
    CancellationListener::from(&self.token)
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}
