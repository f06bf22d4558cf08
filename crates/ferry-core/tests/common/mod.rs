//! Shared fixtures for the end-to-end protocol tests.
//!
//! Transfers run over in-memory duplex channels; each simulated host gets
//! its own store, directories and rule tree under a scratch dir.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use ferry_core::channel::{
    ActiveChannels, ChannelStream, ConnectionProvider, PacketStream,
};
use ferry_core::config::IntegrityRestartPolicy;
use ferry_core::directory::{
    HostAuth, LogTaskHook, RuleConfig, StaticHostLookup, StaticRuleLookup,
};
use ferry_core::error::{Error, Result};
use ferry_core::record::{TransferMode, TransferRecord};
use ferry_core::runner::ClientRunner;
use ferry_core::session::{self, SessionContext};
use ferry_core::store::MemoryStore;

/// Shared secret every test host authenticates with.
pub const TEST_KEY: &str = "s3cret";

/// One simulated host: context, store and scratch directories.
pub struct TestHost {
    pub ctx: Arc<SessionContext>,
    pub store: Arc<MemoryStore>,
    pub send_dir: PathBuf,
    pub recv_dir: PathBuf,
    pub work_dir: PathBuf,
    _scratch: TempDir,
}

impl TestHost {
    /// A host knowing `peers`, with one rule `backup` of the given mode.
    pub fn new(host_id: &str, peers: &[&str], mode: TransferMode) -> Self {
        let scratch = tempfile::tempdir().expect("scratch dir");
        let send_dir = scratch.path().join("out");
        let recv_dir = scratch.path().join("in");
        let work_dir = scratch.path().join("work");
        std::fs::create_dir_all(&send_dir).expect("send dir");

        let mut hosts = vec![HostAuth {
            host_id: host_id.to_string(),
            address: "mem".to_string(),
            port: 0,
            ssl: false,
            key: TEST_KEY.to_string(),
        }];
        for peer in peers {
            hosts.push(HostAuth {
                host_id: (*peer).to_string(),
                address: "mem".to_string(),
                port: 0,
                ssl: false,
                key: TEST_KEY.to_string(),
            });
        }

        let rule = RuleConfig {
            rule_id: "backup".to_string(),
            mode,
            recv_path: recv_dir.clone(),
            send_path: send_dir.clone(),
            archive_path: None,
            work_path: work_dir.clone(),
            pre_tasks: Vec::new(),
            post_tasks: Vec::new(),
            error_tasks: Vec::new(),
            allowed_hosts: Vec::new(),
        };

        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(SessionContext {
            host_id: host_id.to_string(),
            host_key: TEST_KEY.to_string(),
            version: ferry_core::VERSION.to_string(),
            hosts: Arc::new(StaticHostLookup::new(hosts)),
            rules: Arc::new(StaticRuleLookup::new([rule])),
            store: store.clone(),
            tasks: Arc::new(LogTaskHook),
            active: Arc::new(ActiveChannels::new()),
            shutdown: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
        });

        Self {
            ctx,
            store,
            send_dir,
            recv_dir,
            work_dir,
            _scratch: scratch,
        }
    }

    /// Put a source file of `len` patterned bytes into the send dir.
    pub fn seed_file(&self, name: &str, len: usize) -> Vec<u8> {
        #[allow(clippy::cast_possible_truncation)]
        let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(self.send_dir.join(name), &content).expect("seed file");
        content
    }
}

/// Connects every dial to a fresh in-memory channel served by `peer`.
pub struct DuplexProvider {
    peer: Arc<SessionContext>,
}

impl DuplexProvider {
    pub fn new(peer: Arc<SessionContext>) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl ConnectionProvider for DuplexProvider {
    async fn connect(&self, _host: &HostAuth) -> Result<Box<dyn ChannelStream>> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let peer = Arc::clone(&self.peer);
        tokio::spawn(session::serve_requested(
            PacketStream::new(Box::new(server)),
            peer,
        ));
        Ok(Box::new(client))
    }
}

/// Every dial fails, for retry budget tests.
pub struct FailingProvider;

#[async_trait]
impl ConnectionProvider for FailingProvider {
    async fn connect(&self, host: &HostAuth) -> Result<Box<dyn ChannelStream>> {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("no route to {}", host.host_id),
        )))
    }
}

/// Hands the server end of every dialed channel to the test, which plays
/// the requested host by hand.
pub struct HarnessProvider {
    server_tx: mpsc::UnboundedSender<PacketStream>,
    capacity: usize,
}

impl HarnessProvider {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PacketStream>) {
        Self::with_capacity(64 * 1024)
    }

    /// A harness whose channels buffer at most `capacity` bytes per
    /// direction. A tiny capacity makes the sender block on the harness
    /// actually reading, which pins down where an interruption lands.
    pub fn with_capacity(capacity: usize) -> (Self, mpsc::UnboundedReceiver<PacketStream>) {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        (Self { server_tx, capacity }, server_rx)
    }
}

#[async_trait]
impl ConnectionProvider for HarnessProvider {
    async fn connect(&self, _host: &HostAuth) -> Result<Box<dyn ChannelStream>> {
        let (client, server) = tokio::io::duplex(self.capacity);
        self.server_tx
            .send(PacketStream::new(Box::new(server)))
            .map_err(|_| Error::Internal("harness went away".into()))?;
        Ok(Box::new(client))
    }
}

/// A runner for `host` dialing through `provider`, with a short retry delay
/// so tests stay fast.
pub fn make_runner(host: &TestHost, provider: Arc<dyn ConnectionProvider>) -> Arc<ClientRunner> {
    Arc::new(ClientRunner::new(
        Arc::clone(&host.ctx),
        provider,
        3,
        Duration::from_millis(5),
        IntegrityRestartPolicy::FromLastGood,
    ))
}

/// A fresh send-mode record from `requester` to `requested`.
pub fn send_record(requester: &str, requested: &str, filename: &str, block_size: u32) -> TransferRecord {
    TransferRecord::new(
        "backup",
        requester,
        requested,
        TransferMode::Send,
        filename,
        block_size,
    )
}

/// Wait until `check` passes or the deadline expires.
pub async fn wait_for<F>(mut check: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait until the store's records satisfy `check` or the deadline expires.
pub async fn wait_for_records<F>(store: &Arc<MemoryStore>, mut check: F, what: &str)
where
    F: FnMut(&[TransferRecord]) -> bool,
{
    use ferry_core::store::TransferStore;
    for _ in 0..200 {
        let records = store.all().await.expect("store readable");
        if check(&records) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
