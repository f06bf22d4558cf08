//! The `submit` command: queue a transfer record for the commander.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use ferry_core::record::{TransferMode, TransferRecord};

/// Arguments for `ferry submit`.
#[derive(Args)]
pub struct SubmitArgs {
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

    /// Resume point: first block index to transfer
    #[arg(long, default_value_t = 0)]
    pub start_rank: u32,
}

/// Insert a `ToSubmit` record; the next commander cycle picks it up.
pub async fn run(args: SubmitArgs) -> Result<()> {
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
    record.rank = args.start_rank;

    let id = ctx.store.insert(record).await?;
    println!("queued transfer {id} ({} -> {})", args.rule, args.requested);
    Ok(())
}
