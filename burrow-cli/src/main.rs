// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};

mod client;
mod server;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rustls=warn,hyper=warn,info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("client")
        .alias("-c")
        .about("Expose a local HTTP port on a subdomain of the tunnel server")
        .arg(
          Arg::new("server")
            .long("server")
            .short('s')
            .takes_value(true)
            .default_value("http://localhost"),
        )
        .arg(
          Arg::new("id")
            .long("id")
            .short('i')
            .help("Subdomain label to claim")
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("token")
            .long("token")
            .short('t')
            .help("Token to use on connect")
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("port")
            .long("port")
            .short('p')
            .help("Local port to proxy to")
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Run the tunnel server")
        .arg(
          Arg::new("host")
            .long("host")
            .takes_value(true)
            .default_value("localhost"),
        )
        .arg(
          Arg::new("address")
            .long("address")
            .short('a')
            .help("Bind address for both listeners")
            .takes_value(true)
            .default_value("127.0.0.1"),
        )
        .arg(
          Arg::new("http")
            .long("http")
            .help("HTTP port, defaults to 80 or 443 if TLS is enabled")
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("rpc")
            .long("rpc")
            .help("Port that accepts tunneling clients with issued credentials")
            .takes_value(true)
            .default_value("8443"),
        )
        .arg(
          Arg::new("token")
            .long("token")
            .short('t')
            .help("Token to require on connect")
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("enable-acme-email")
            .long("enable-acme-email")
            .help("ACME email address to use (enables TLS)")
            .takes_value(true)
            .required(false),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  let local_port: u16 = args
    .value_of("port")
    .expect("port argument is required")
    .parse()
    .context("port must be a valid TCP port")?;
  Ok(client::ClientArgs {
    server: args.value_of("server").unwrap_or_default().to_string(),
    id: args.value_of("id").expect("id argument is required").to_string(),
    token: args.value_of("token").map(str::to_string),
    local_port,
  })
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  let address = args
    .value_of("address")
    .expect("address has a default")
    .parse()
    .context("address must be a valid IP address")?;
  let http_port: u16 = match args.value_of("http") {
    Some(port) => port.parse().context("http must be a valid TCP port")?,
    None => 0,
  };
  let rpc_port: u16 = args
    .value_of("rpc")
    .expect("rpc has a default")
    .parse()
    .context("rpc must be a valid TCP port")?;
  Ok(server::ServerArgs {
    host: args.value_of("host").expect("host has a default").to_string(),
    address,
    http_port,
    rpc_port,
    token: args.value_of("token").map(str::to_string),
    acme_email: args.value_of("enable-acme-email").map(str::to_string),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("server", opts) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as server with config {:?}", config);
      server::server_main(config).await
    }
    ("client", opts) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:?}", config);
      client::client_main(config).await
    }
    (_, _) => unreachable!(),
  }
}
