//! The `status` command: inspect transfer records.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

/// Arguments for `ferry status`.
#[derive(Args)]
pub struct StatusArgs {
    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Show one record by its id
    #[arg(long)]
    pub id: Option<i64>,

    /// Emit records as JSON
    #[arg(long)]
    pub json: bool,
}

/// Print the record snapshot.
pub async fn run(args: StatusArgs) -> Result<()> {
    let config = super::load_config(args.config.as_ref())?;
    let (ctx, _store) = super::build_context(&config).await?;

    let records = match args.id {
        Some(id) => ctx.store.select(id).await?.into_iter().collect(),
        None => ctx.store.all().await?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("no transfer records");
        return Ok(());
    }

    println!(
        "{:>8}  {:<12} {:<10} {:<10} {:>6}  {:<12} {}",
        "id", "rule", "requester", "requested", "rank", "status", "file"
    );
    for record in records {
        println!(
            "{:>8}  {:<12} {:<10} {:<10} {:>6}  {:<12} {}",
            record.special_id,
            record.rule_id,
            record.requester,
            record.requested,
            record.rank,
            format!("{:?}", record.status),
            record.filename,
        );
    }
    Ok(())
}
