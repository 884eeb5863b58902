// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::IpAddr;

use anyhow::{Context as AnyhowContext, Result};
use burrow::server::{run_server, ServerConfig};
use burrow::util::cancellation::CancellationListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct ServerArgs {
  pub host: String,
  pub address: IpAddr,
  /// 0 selects the conventional port for the ingress scheme.
  pub http_port: u16,
  pub rpc_port: u16,
  pub token: Option<String>,
  pub acme_email: Option<String>,
}

pub async fn server_main(args: ServerArgs) -> Result<()> {
  let http_port = match args.http_port {
    0 if args.acme_email.is_some() => 443,
    0 => 80,
    port => port,
  };

  let shutdown = CancellationToken::new();
  let sigint_handler_task = {
    let shutdown = shutdown.clone();
    tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      shutdown.cancel();
    })
  };

  let result = run_server(
    ServerConfig {
      host: args.host,
      address: args.address,
      http_port,
      rpc_port: args.rpc_port,
      token: args.token,
      acme_email: args.acme_email,
    },
    CancellationListener::from(&shutdown),
  )
  .await;
  sigint_handler_task.abort();
  result.context("tunnel server ended")
}
