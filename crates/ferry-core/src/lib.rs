//! # Ferry Core Library
//!
//! `ferry-core` is the engine of Ferry, a peer-to-peer managed file
//! transfer daemon. Two hosts negotiate authentication, agree on a
//! transfer rule, stream a file in fixed-size blocks over a custom binary
//! protocol, and track progress durably so interrupted transfers resume
//! from the last acknowledged block.
//!
//! ## Modules
//!
//! - [`packet`] - wire framing and the closed packet catalog
//! - [`state`] - session state machines with fixed transition tables
//! - [`session`] - requester and requested transfer sessions
//! - [`runner`] - per-transfer client runner with bounded connection retry
//! - [`commander`] - the poll-cycle scheduler and its worker pool
//! - [`record`] - durable transfer records
//! - [`store`] - record persistence seam
//! - [`directory`] - host, rule and task directories
//! - [`blockfile`] - block-oriented file access with rank seeking
//! - [`channel`] - local channels, packet streams, dedup registry
//! - [`config`] - TOML configuration
//!
//! ## Example
//!
//! ```rust,ignore
//! use ferry_core::record::{TransferMode, TransferRecord};
//!
//! // Queue a transfer for the commander to pick up
//! let record = TransferRecord::new("backup", "alpha", "beta",
//!     TransferMode::Send, "report.tar", 65536);
//! store.insert(record).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod blockfile;
pub mod channel;
pub mod commander;
pub mod config;
pub mod directory;
pub mod error;
pub mod packet;
pub mod record;
pub mod runner;
pub mod session;
pub mod state;
pub mod store;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default daemon port
pub const DEFAULT_PORT: u16 = 6566;

/// Default block size for file transfers (64 KB)
pub const DEFAULT_BLOCK_SIZE: u32 = 65536;
