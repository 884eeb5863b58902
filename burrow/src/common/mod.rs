// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

pub mod api;
pub mod certificates;
pub mod identity;

/// Cadence at which clients ping their session; the server reaps sessions
/// whose last ping is older than twice this.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
