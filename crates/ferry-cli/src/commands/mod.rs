//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use ferry_core::channel::ActiveChannels;
use ferry_core::config::Config;
use ferry_core::directory::LogTaskHook;
use ferry_core::session::SessionContext;
use ferry_core::store::{snapshot_path, MemoryStore};

pub mod send;
pub mod serve;
pub mod status;
pub mod submit;

/// Ferry - peer-to-peer managed file transfers
#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Run the transfer daemon (listener + commander)
    Serve(serve::ServeArgs),

    /// Queue a transfer record for the commander
    Submit(submit::SubmitArgs),

    /// Run one transfer right now, bypassing the poll loop
    Send(send::SendArgs),

    /// Show transfer records
    Status(status::StatusArgs),
}

/// Load configuration from an explicit path, or the platform default.
pub fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            Config::load_from(path).with_context(|| format!("loading {}", path.display()))
        }
        None => Config::load().context("loading default configuration"),
    }
}

/// Build the session context and snapshot-backed store a command works on.
pub async fn build_context(config: &Config) -> anyhow::Result<(Arc<SessionContext>, Arc<MemoryStore>)> {
    tokio::fs::create_dir_all(&config.server.data_dir)
        .await
        .with_context(|| format!("creating {}", config.server.data_dir.display()))?;
    let store = Arc::new(
        MemoryStore::with_snapshot(snapshot_path(&config.server.data_dir))
            .await
            .context("opening record snapshot")?,
    );

    let ctx = Arc::new(SessionContext {
        host_id: config.server.host_id.clone(),
        host_key: config.server.host_key.clone(),
        version: ferry_core::VERSION.to_string(),
        hosts: Arc::new(config.host_lookup()),
        rules: Arc::new(config.rule_lookup()),
        store: store.clone(),
        tasks: Arc::new(LogTaskHook),
        active: Arc::new(ActiveChannels::new()),
        shutdown: AtomicBool::new(false),
        blocked: AtomicBool::new(false),
    });
    Ok((ctx, store))
}
