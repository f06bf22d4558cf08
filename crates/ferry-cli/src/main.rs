//! Ferry CLI - peer-to-peer managed file transfers
//!
//! Ferry moves files between daemons under named transfer rules, with
//! durable records and resume after interruption.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the daemon
//! ferry serve --config ferry.toml
//!
//! # Queue a transfer for the commander
//! ferry submit --rule backup --to beta --file report.tar
//!
//! # Or run one right now, bypassing the poll loop
//! ferry send --rule backup --to beta --file report.tar
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => commands::serve::run(args).await,
        Command::Submit(args) => commands::submit::run(args).await,
        Command::Send(args) => commands::send::run(args).await,
        Command::Status(args) => commands::status::run(args).await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,ferry=info,ferry_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
