//! AxoShare binary.
//!
//! `serve` runs the multipart share server: uploads are split into parts,
//! assembled into objects and served back by id, optionally behind a
//! password. `upload` is the matching client that plans parts, pushes them
//! with bounded concurrency and prints the resulting download URL.

mod access;
mod atomic;
mod background;
mod client;
mod config;
mod coordinator;
mod error;
mod etag;
mod handlers;
mod http;
mod locking;
mod logging;
mod metadata;
mod models;
mod rate_limit;
mod server;
mod storage;
mod tls;

use clap::Parser;
use std::process::ExitCode;
use tracing::error;

use crate::config::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(cli.debug);

    let result = match cli.command {
        Command::Serve(args) => server::serve(args).await.map_err(|err| err.to_string()),
        Command::Upload(args) => client::upload::run(args)
            .await
            .map_err(|err| err.to_string()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            ExitCode::FAILURE
        }
    }
}
