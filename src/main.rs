//! herdcrack binary: mode dispatch and exit codes.
//!
//! 0 key found, 1 usage error, 2 i/o error, 3 protocol error,
//! 4 graceful shutdown without a result.

use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use herdcrack::config::Config;
use herdcrack::net::client::{self, ClientOutcome};
use herdcrack::net::protocol::ProtocolError;
use herdcrack::net::server;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = match Config::try_parse() {
        Ok(cfg) => cfg,
        Err(e) => {
            // clap prints its own message (also for --help/--version)
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(1),
            };
        }
    };
    if let Err(e) = cfg.validate() {
        error!("{e}");
        return ExitCode::from(1);
    }

    if cfg.server {
        match server::run(&cfg) {
            Ok(Some(solution)) => {
                println!("{}", solution.private_key);
                ExitCode::SUCCESS
            }
            Ok(None) => {
                info!("server stopped without a result");
                ExitCode::from(4)
            }
            Err(e) => failure(e),
        }
    } else {
        match client::run(&cfg) {
            Ok(ClientOutcome::Found(key)) => {
                println!("{}", hex::encode(key));
                ExitCode::SUCCESS
            }
            Ok(ClientOutcome::Drained) => {
                info!("worker drained without a result");
                ExitCode::from(4)
            }
            Err(e) => failure(e),
        }
    }
}

fn failure(e: anyhow::Error) -> ExitCode {
    error!("{e:#}");
    match e.downcast_ref::<ProtocolError>() {
        Some(ProtocolError::Io(_)) => ExitCode::from(2),
        Some(_) => ExitCode::from(3),
        // plain i/o, corrupt checkpoint, bad target file
        None => ExitCode::from(2),
    }
}
