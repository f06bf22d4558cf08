//! The `send` command: run one transfer immediately, bypassing the poll
//! loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use ferry_core::record::{TransferMode, TransferRecord};
use ferry_core::runner::ClientRunner;

use super::serve::TcpConnectionProvider;

/// Arguments for `ferry send`.
#[derive(Args)]
pub struct SendArgs {
    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Transfer rule to use
    #[arg(short, long)]
    pub rule: String,

    /// Requested host id
    #[arg(short = 't', long = "to")]
    pub requested: String,

    /// File to transfer
    #[arg(short, long)]
    pub file: String,

    /// Free-form information transmitted with the request
    #[arg(short, long, default_value = "")]
    pub info: String,

    /// Block size in bytes (defaults to the server setting)
    #[arg(short, long)]
    pub block_size: Option<u32>,
}

/// Run the transfer and report the outcome through the exit code.
pub async fn run(args: SendArgs) -> Result<()> {
    let config = super::load_config(args.config.as_ref())?;
    let (ctx, _store) = super::build_context(&config).await?;

    let mode = config
        .rules
        .get(&args.rule)
        .map_or(TransferMode::Send, |rule| rule.mode);

    let mut record = TransferRecord::new(
        &args.rule,
        &config.server.host_id,
        &args.requested,
        mode,
        &args.file,
        args.block_size
            .unwrap_or_else(|| config.server.effective_block_size()),
    );
    record.file_information = args.info;

    let runner = ClientRunner::new(
        ctx,
        Arc::new(TcpConnectionProvider),
        config.server.retry_limit,
        config.server.retry_delay,
        config.server.integrity_restart,
    );

    let outcome = runner.run_direct(record).await?;
    if outcome.success {
        println!(
            "transfer complete: {} blocks ({})",
            outcome.final_rank, outcome.message
        );
        Ok(())
    } else {
        anyhow::bail!(
            "transfer failed at rank {}: {} [{}]",
            outcome.final_rank,
            outcome.message,
            outcome.code.as_char()
        );
    }
}
