// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The live-session table.
//!
//! Two maps under one lock: `id -> identity` for the ingress hot path and
//! `identity -> session` for the RPC path. Removal clears both together, and
//! always closes the session before dropping it from the maps so any task
//! already holding a reference observes the cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use tokio::time::Instant;

use crate::common::identity::{fresh_nonce, SessionIdentity};
use crate::common::HEARTBEAT_INTERVAL;
use crate::server::channel::RequestChannel;
use crate::util::cancellation::{CancellationListener, CloseReason};

pub struct Session {
  identity: SessionIdentity,
  created: Instant,
  // Its own lock, so heartbeat refreshes never contend with the registry
  last_heartbeat: StdMutex<Instant>,
  channel: RequestChannel,
}

impl Session {
  fn new(identity: SessionIdentity) -> Arc<Self> {
    let now = Instant::now();
    Arc::new(Self {
      identity,
      created: now,
      last_heartbeat: StdMutex::new(now),
      channel: RequestChannel::new(),
    })
  }

  pub fn identity(&self) -> &SessionIdentity {
    &self.identity
  }

  pub fn created(&self) -> Instant {
    self.created
  }

  pub fn channel(&self) -> &RequestChannel {
    &self.channel
  }

  /// Stamps the session as alive; called for every heartbeat message.
  pub fn touch(&self) {
    *self
      .last_heartbeat
      .lock()
      .expect("heartbeat lock poisoned") = Instant::now();
  }

  pub fn heartbeat_age(&self) -> std::time::Duration {
    self
      .last_heartbeat
      .lock()
      .expect("heartbeat lock poisoned")
      .elapsed()
  }

  fn close(&self, reason: CloseReason) {
    self.channel.close(reason);
  }
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("identity", &self.identity)
      .field("channel", &self.channel)
      .finish()
  }
}

#[derive(Default)]
struct SessionMaps {
  ids: HashMap<String, SessionIdentity>,
  sessions: HashMap<SessionIdentity, Arc<Session>>,
}

#[derive(Default)]
pub struct TunnelRegistry {
  maps: StdRwLock<SessionMaps>,
}

impl TunnelRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Reserves the subdomain slot `id` and returns the fresh nonce naming
  /// the new session, or `None` while a live session already holds the id.
  pub fn create_session(&self, id: &str) -> Option<String> {
    let mut maps = self.maps.write().expect("registry lock poisoned");
    if let Some(identity) = maps.ids.get(id) {
      if maps.sessions.contains_key(identity) {
        return None;
      }
    }
    let nonce = fresh_nonce();
    let identity = SessionIdentity::new(id, nonce.as_str());
    maps.ids.insert(id.to_string(), identity.clone());
    maps.sessions.insert(identity.clone(), Session::new(identity));
    Some(nonce)
  }

  /// Ingress path: both-hop lookup from the subdomain label.
  pub fn session_by_id(&self, id: &str) -> Option<Arc<Session>> {
    let maps = self.maps.read().expect("registry lock poisoned");
    let identity = maps.ids.get(id)?;
    maps.sessions.get(identity).cloned()
  }

  /// RPC path: direct lookup by the authenticated identity.
  pub fn get(&self, identity: &SessionIdentity) -> Option<Arc<Session>> {
    let maps = self.maps.read().expect("registry lock poisoned");
    maps.sessions.get(identity).cloned()
  }

  /// Closes and removes a session. Idempotent; a no-op if the identity is
  /// already gone. The id entry is only removed while it still names this
  /// identity, so tearing down a stale session cannot orphan a successor
  /// that re-registered the same id.
  pub fn clear(&self, identity: &SessionIdentity, reason: CloseReason) {
    let mut maps = self.maps.write().expect("registry lock poisoned");
    if let Some(session) = maps.sessions.remove(identity) {
      session.close(reason);
    }
    if maps.ids.get(identity.id()) == Some(identity) {
      maps.ids.remove(identity.id());
    }
  }

  /// Tears down every session; used at server shutdown.
  pub fn clear_all(&self, reason: CloseReason) {
    let mut maps = self.maps.write().expect("registry lock poisoned");
    for session in maps.sessions.values() {
      session.close(reason);
    }
    maps.sessions.clear();
    maps.ids.clear();
  }

  pub fn len(&self) -> usize {
    self.maps.read().expect("registry lock poisoned").sessions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Background loop removing sessions whose heartbeat went stale. Runs
  /// every half heartbeat interval and prunes anything older than two full
  /// intervals; exits when `shutdown` fires.
  pub async fn reap(&self, shutdown: CancellationListener) {
    let tick = HEARTBEAT_INTERVAL / 2;
    let staleness = HEARTBEAT_INTERVAL * 2;
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = tokio::time::sleep(tick) => {}
      }
      let stale: Vec<SessionIdentity> = {
        let maps = self.maps.read().expect("registry lock poisoned");
        maps
          .sessions
          .values()
          .filter(|session| session.heartbeat_age() > staleness)
          .map(|session| session.identity().clone())
          .collect()
      };
      for identity in stale {
        tracing::info!(session = %identity, "pruning stale session");
        self.clear(&identity, CloseReason::Reaped);
      }
    }
  }
}
