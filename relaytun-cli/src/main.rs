// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use relaytun::util;
use std::process::ExitCode;

use util::validators::{parse_protocol, validate_host_port, validate_protocol};

mod client;

fn main() -> ExitCode {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("russh=warn,info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("connect")
        .alias("-c")
        .about("Expose a local address through the relay")
        .arg(
          Arg::new("target")
            .long("target")
            .short('t')
            .validator(validate_host_port)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("protocol")
            .long("protocol")
            .short('p')
            .validator(validate_protocol)
            .default_value("tcp")
            .takes_value(true),
        )
        .arg(
          Arg::new("name")
            .help("Named configuration to fetch from the registry service")
            .long("name")
            .short('n')
            .takes_value(true),
        )
        .arg(
          Arg::new("hostname")
            .help("Relay host to dial")
            .long("hostname")
            .env("RELAYTUN_HOSTNAME")
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("api-url")
            .long("api-url")
            .env("RELAYTUN_API_URL")
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("api-key")
            .long("api-key")
            .env("RELAYTUN_API_KEY")
            .hide_env_values(true)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("relay-host-key")
            .help("Relay host key in authorized_keys form, replacing the built-in key")
            .long("relay-host-key")
            .takes_value(true),
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
  let result = rt.block_on(handler);
  ExitCode::from(report_exit(mode, &result))
}

/// Logs the outcome of a command and maps it to the process exit status
fn report_exit(mode: &str, result: &Result<()>) -> u8 {
  match result {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      1
    }
    Ok(_) => {
      tracing::info!("{} exited successfully", mode);
      0
    }
  }
}

pub fn connect_arg_handling(args: &'_ ArgMatches) -> Result<client::ConnectArgs> {
  let required = |name: &str| {
    args
      .value_of(name)
      .map(String::from)
      .with_context(|| format!("Missing required argument {}", name))
  };
  Ok(client::ConnectArgs {
    target: required("target")?,
    protocol: parse_protocol(&required("protocol")?)?,
    name: args.value_of("name").map(String::from),
    hostname: required("hostname")?,
    api_url: required("api-url")?,
    api_key: required("api-key")?,
    relay_host_key: args.value_of("relay-host-key").map(String::from),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("connect", opts) => {
      let config = connect_arg_handling(opts)?;
      tracing::info!("Running as client with config {:#?}", config);
      client::client_main(config).await
    }
    (_, _) => unreachable!(),
  }
}
