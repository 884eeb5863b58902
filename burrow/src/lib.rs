// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Reverse HTTP tunneling over subdomains.
//!
//! A public server accepts HTTP on subdomains of an apex host and forwards
//! each request, over a persistent mutually-authenticated RPC stream, to a
//! registered client behind NAT; the client answers through a user-supplied
//! handler. Registration mints a short-lived per-session identity whose
//! SPIFFE-style URI SAN both names the tunnel and prevents stale-credential
//! reuse.

pub mod common;
pub mod util;

pub mod client;
pub mod server;
