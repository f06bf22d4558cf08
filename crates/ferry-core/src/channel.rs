//! Local channels.
//!
//! A local channel is one logical transfer conversation: a framed packet
//! stream plus the session state machine bound to it. Many local channels
//! may be multiplexed over one network connection between a pair of hosts;
//! the engine only sees them individually, as streams of packets.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use async_trait::async_trait;

use crate::directory::HostAuth;
use crate::error::Result;
use crate::packet::{read_packet_with_timeout, write_packet_with_timeout, Packet};
use crate::record::StepCode;

/// Default per-packet read/write timeout.
pub const DEFAULT_PACKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Byte stream a local channel can run over.
pub trait ChannelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChannelStream for T {}

/// Framed packet transport over any [`ChannelStream`].
pub struct PacketStream {
    inner: Box<dyn ChannelStream>,
    timeout: Duration,
}

impl PacketStream {
    /// Wrap a byte stream with the default timeout.
    #[must_use]
    pub fn new(stream: Box<dyn ChannelStream>) -> Self {
        Self {
            inner: stream,
            timeout: DEFAULT_PACKET_TIMEOUT,
        }
    }

    /// Wrap a byte stream with an explicit per-packet timeout.
    #[must_use]
    pub fn with_timeout(stream: Box<dyn ChannelStream>, timeout: Duration) -> Self {
        Self {
            inner: stream,
            timeout,
        }
    }

    /// Read the next packet.
    pub async fn read(&mut self) -> Result<Packet> {
        let packet = read_packet_with_timeout(&mut self.inner, self.timeout).await?;
        tracing::trace!(packet = %packet, "Received packet");
        Ok(packet)
    }

    /// Write one packet.
    pub async fn write(&mut self, packet: &Packet) -> Result<()> {
        tracing::trace!(packet = %packet, "Sending packet");
        write_packet_with_timeout(&mut self.inner, packet, self.timeout).await
    }

    /// Write one packet, swallowing failures. Used on error paths where the
    /// channel may no longer be writable.
    pub async fn write_best_effort(&mut self, packet: &Packet) {
        if let Err(e) = self.write(packet).await {
            tracing::debug!(error = %e, "Could not send final packet");
        }
    }
}

impl std::fmt::Debug for PacketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketStream")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Resolve a peer host to a connected byte stream.
///
/// The daemon provides a TCP implementation (wrapping it in the secure
/// transport when the host entry asks for it); tests provide in-memory
/// duplex streams.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Open a stream to `host`.
    async fn connect(&self, host: &HostAuth) -> Result<Box<dyn ChannelStream>>;
}

/// Final result of one transfer attempt, resolved exactly once when the
/// session reaches a terminal state.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Whether the session closed on the success path
    pub success: bool,
    /// Final step code
    pub code: StepCode,
    /// Human-readable summary
    pub message: String,
    /// Rank reached when the session ended
    pub final_rank: u32,
}

impl TransferOutcome {
    /// A successful outcome.
    #[must_use]
    pub fn completed(final_rank: u32) -> Self {
        Self {
            success: true,
            code: StepCode::CompleteOk,
            message: "transfer complete".to_string(),
            final_rank,
        }
    }

    /// A failed outcome.
    #[must_use]
    pub fn failed(code: StepCode, message: impl Into<String>, final_rank: u32) -> Self {
        Self {
            success: false,
            code,
            message: message.into(),
            final_rank,
        }
    }
}

/// Registry of live local channels keyed by transfer dedup key.
///
/// Claiming a key that is already live fails, which is what guarantees
/// at-most-one concurrent execution per `(requested, requester, specialId)`
/// system-wide.
#[derive(Debug, Default)]
pub struct ActiveChannels {
    live: Arc<Mutex<HashSet<String>>>,
}

impl ActiveChannels {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a channel is live for `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.live.lock().expect("registry lock").contains(key)
    }

    /// Claim `key`. Returns a guard that releases the claim on drop, or
    /// `None` when a channel is already live for it.
    #[must_use]
    pub fn try_claim(&self, key: &str) -> Option<ChannelClaim> {
        let mut live = self.live.lock().expect("registry lock");
        if !live.insert(key.to_string()) {
            return None;
        }
        Some(ChannelClaim {
            live: Arc::clone(&self.live),
            key: key.to_string(),
        })
    }

    /// Number of live channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.lock().expect("registry lock").len()
    }

    /// Whether no channel is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive claim on a dedup key, released when dropped.
#[derive(Debug)]
pub struct ChannelClaim {
    live: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl ChannelClaim {
    /// The claimed key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ChannelClaim {
    fn drop(&mut self) {
        self.live.lock().expect("registry lock").remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::StartupPacket;

    #[tokio::test]
    async fn test_packet_stream_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut sender = PacketStream::new(Box::new(client));
        let mut receiver = PacketStream::new(Box::new(server));

        let packet = Packet::Startup(StartupPacket { local_id: 5 });
        sender.write(&packet).await.unwrap();
        let read = receiver.read().await.unwrap();
        assert_eq!(read, packet);
    }

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let registry = ActiveChannels::new();
        let claim = registry.try_claim("beta alpha 1").expect("first claim");
        assert!(registry.contains("beta alpha 1"));
        assert!(registry.try_claim("beta alpha 1").is_none());
        assert!(registry.try_claim("beta alpha 2").is_some());

        drop(claim);
        assert!(!registry.contains("beta alpha 1"));
        assert!(registry.try_claim("beta alpha 1").is_some());
    }
}
