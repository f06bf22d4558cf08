//! Durable transfer records.
//!
//! A [`TransferRecord`] is the unit of persistent state for one transfer:
//! which rule, which hosts, which file, how many blocks have been
//! acknowledged, and which lifecycle phase the transfer is in. Records are
//! created when a transfer is requested, mutated at every step boundary, and
//! kept as history once finished.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Special id value of a record that has not been assigned one yet.
pub const ILLEGAL_SPECIAL_ID: i64 = i64::MIN;

/// Transfer mode carried in the Request packet.
///
/// The numeric values are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum TransferMode {
    /// Mode not negotiated yet
    Unknown = 0,
    /// Requester sends the file
    Send = 1,
    /// Requester receives the file
    Recv = 2,
    /// Send with per-block integrity keys
    SendWithIntegrity = 3,
    /// Receive with per-block integrity keys
    RecvWithIntegrity = 4,
    /// Send in streaming (pass-through) mode
    SendThrough = 5,
    /// Receive in streaming (pass-through) mode
    RecvThrough = 6,
    /// Streaming send with per-block integrity keys
    SendThroughWithIntegrity = 7,
    /// Streaming receive with per-block integrity keys
    RecvThroughWithIntegrity = 8,
}

impl TransferMode {
    /// Parse a wire mode value.
    #[must_use]
    pub const fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Send),
            2 => Some(Self::Recv),
            3 => Some(Self::SendWithIntegrity),
            4 => Some(Self::RecvWithIntegrity),
            5 => Some(Self::SendThrough),
            6 => Some(Self::RecvThrough),
            7 => Some(Self::SendThroughWithIntegrity),
            8 => Some(Self::RecvThroughWithIntegrity),
            _ => None,
        }
    }

    /// Wire value of this mode.
    #[must_use]
    pub const fn as_wire(self) -> i32 {
        self as i32
    }

    /// Whether the requester receives the file in this mode.
    #[must_use]
    pub const fn is_recv(self) -> bool {
        matches!(
            self,
            Self::Recv
                | Self::RecvWithIntegrity
                | Self::RecvThrough
                | Self::RecvThroughWithIntegrity
        )
    }

    /// Whether the requester sends the file in this mode.
    #[must_use]
    pub const fn is_send(self) -> bool {
        !self.is_recv()
    }

    /// Whether each block carries a content key to verify.
    #[must_use]
    pub const fn is_integrity_checked(self) -> bool {
        matches!(
            self,
            Self::SendWithIntegrity
                | Self::RecvWithIntegrity
                | Self::SendThroughWithIntegrity
                | Self::RecvThroughWithIntegrity
        )
    }

    /// Whether the file content streams through without landing on disk first.
    #[must_use]
    pub const fn is_through(self) -> bool {
        matches!(
            self,
            Self::SendThrough
                | Self::RecvThrough
                | Self::SendThroughWithIntegrity
                | Self::RecvThroughWithIntegrity
        )
    }

    /// The integrity-checked counterpart of this mode.
    #[must_use]
    pub const fn with_integrity(self) -> Self {
        match self {
            Self::Send => Self::SendWithIntegrity,
            Self::Recv => Self::RecvWithIntegrity,
            Self::SendThrough => Self::SendThroughWithIntegrity,
            Self::RecvThrough => Self::RecvThroughWithIntegrity,
            other => other,
        }
    }

    /// Two modes are compatible when both sides agree on the data direction.
    #[must_use]
    pub const fn is_compatible(self, other: Self) -> bool {
        self.is_recv() == other.is_recv()
    }
}

/// Scheduling status of a transfer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatedInfo {
    /// Status unknown (fresh record)
    Unknown,
    /// Record validated, nothing pending
    NotUpdated,
    /// Eligible for the next commander poll cycle
    ToSubmit,
    /// Claimed by a runner, about to start
    ToRun,
    /// Transfer attempt in progress
    Running,
    /// Stopped before completion; will not be rescheduled automatically
    Interrupted,
    /// Finished successfully
    Done,
    /// Finished in error
    InError,
}

/// Lifecycle phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalStep {
    /// No task started yet
    NoTask,
    /// Pre-transfer tasks
    PreTask,
    /// Block streaming in progress
    Transfer,
    /// Post-transfer tasks
    PostTask,
    /// Everything finished
    AllDone,
    /// Error tasks running after a failure
    ErrorTask,
}

/// Step outcome codes recorded on transfer records and carried in
/// Error/EndRequest packets.
///
/// Each code has a stable single-character wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepCode {
    /// Initialization succeeded
    InitOk,
    /// Pre-tasks succeeded
    PreProcessingOk,
    /// Data phase succeeded
    TransferOk,
    /// Post-tasks succeeded
    PostProcessingOk,
    /// Whole transfer succeeded
    CompleteOk,
    /// Could not connect to the peer
    ConnectionImpossible,
    /// Peer refused work because it is overloaded
    ServerOverloaded,
    /// Authentication failed
    BadAuthent,
    /// External task execution failed
    ExternalOp,
    /// Data phase failed
    TransferError,
    /// Block content key mismatch
    IntegrityError,
    /// Connection lost mid-transfer
    Disconnection,
    /// Peer is shutting down
    RemoteShutdown,
    /// Finalization failed
    FinalOp,
    /// Feature not implemented by the peer
    Unimplemented,
    /// Local shutdown in progress
    Shutdown,
    /// Peer reported an unspecified error
    RemoteError,
    /// Internal error
    Internal,
    /// Transfer stopped by operator
    StoppedTransfer,
    /// Transfer cancelled by operator
    CanceledTransfer,
    /// Finished with a warning
    Warning,
    /// Unknown outcome
    Unknown,
    /// The peer already finished this query
    QueryAlreadyFinished,
    /// The peer is still running this query
    QueryStillRunning,
    /// Host not known
    NotKnownHost,
    /// Requester and requested host are the same
    LoopSelfRequestedHost,
    /// Peer does not know this query
    QueryRemotelyUnknown,
    /// File missing
    FileNotFound,
    /// Command not recognized
    IncorrectCommand,
    /// File not allowed by the rule
    FileNotAllowed,
    /// File size not allowed by the rule
    SizeNotAllowed,
    /// Transfer attempt currently running
    Running,
}

impl StepCode {
    /// Stable single-character wire form.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::InitOk => 'i',
            Self::PreProcessingOk => 'B',
            Self::TransferOk => 'X',
            Self::PostProcessingOk => 'P',
            Self::CompleteOk => 'O',
            Self::ConnectionImpossible => 'C',
            Self::ServerOverloaded => 'l',
            Self::BadAuthent => 'A',
            Self::ExternalOp => 'E',
            Self::TransferError => 'T',
            Self::IntegrityError => 'M',
            Self::Disconnection => 'D',
            Self::RemoteShutdown => 'r',
            Self::FinalOp => 'F',
            Self::Unimplemented => 'U',
            Self::Shutdown => 'S',
            Self::RemoteError => 'R',
            Self::Internal => 'I',
            Self::StoppedTransfer => 'H',
            Self::CanceledTransfer => 'K',
            Self::Warning => 'W',
            Self::Unknown => '-',
            Self::QueryAlreadyFinished => 'Q',
            Self::QueryStillRunning => 's',
            Self::NotKnownHost => 'N',
            Self::LoopSelfRequestedHost => 'L',
            Self::QueryRemotelyUnknown => 'u',
            Self::FileNotFound => 'f',
            Self::IncorrectCommand => 'n',
            Self::FileNotAllowed => 'a',
            Self::SizeNotAllowed => 'd',
            Self::Running => 'z',
        }
    }

    /// Parse the single-character wire form.
    #[must_use]
    pub const fn from_char(c: char) -> Option<Self> {
        match c {
            'i' => Some(Self::InitOk),
            'B' => Some(Self::PreProcessingOk),
            'X' => Some(Self::TransferOk),
            'P' => Some(Self::PostProcessingOk),
            'O' => Some(Self::CompleteOk),
            'C' => Some(Self::ConnectionImpossible),
            'l' => Some(Self::ServerOverloaded),
            'A' => Some(Self::BadAuthent),
            'E' => Some(Self::ExternalOp),
            'T' => Some(Self::TransferError),
            'M' => Some(Self::IntegrityError),
            'D' => Some(Self::Disconnection),
            'r' => Some(Self::RemoteShutdown),
            'F' => Some(Self::FinalOp),
            'U' => Some(Self::Unimplemented),
            'S' => Some(Self::Shutdown),
            'R' => Some(Self::RemoteError),
            'I' => Some(Self::Internal),
            'H' => Some(Self::StoppedTransfer),
            'K' => Some(Self::CanceledTransfer),
            'W' => Some(Self::Warning),
            '-' => Some(Self::Unknown),
            'Q' => Some(Self::QueryAlreadyFinished),
            's' => Some(Self::QueryStillRunning),
            'N' => Some(Self::NotKnownHost),
            'L' => Some(Self::LoopSelfRequestedHost),
            'u' => Some(Self::QueryRemotelyUnknown),
            'f' => Some(Self::FileNotFound),
            'n' => Some(Self::IncorrectCommand),
            'a' => Some(Self::FileNotAllowed),
            'd' => Some(Self::SizeNotAllowed),
            'z' => Some(Self::Running),
            _ => None,
        }
    }
}

/// One transfer's persistent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Rule governing this transfer
    pub rule_id: String,
    /// Host that initiated the request
    pub requester: String,
    /// Host that received the request
    pub requested: String,
    /// Transfer mode
    pub mode: TransferMode,
    /// Filename as originally requested
    pub original_filename: String,
    /// Filename after reception/renaming
    pub filename: String,
    /// Free-form information transmitted with the request
    pub file_information: String,
    /// Block size in bytes
    pub block_size: u32,
    /// Number of blocks acknowledged; also the next block index to transfer
    pub rank: u32,
    /// Unique id of this transfer instance
    pub special_id: i64,
    /// Scheduling status
    pub status: UpdatedInfo,
    /// Lifecycle phase
    pub global_step: GlobalStep,
    /// Sub-step within the phase
    pub step: u32,
    /// Outcome code of the last step
    pub step_code: StepCode,
    /// Whether the requester retrieves the file (receive side)
    pub retrieve: bool,
    /// When the transfer was first submitted
    pub started_at: DateTime<Utc>,
    /// Last state change
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Create a fresh record ready for submission.
    #[must_use]
    pub fn new(
        rule_id: &str,
        requester: &str,
        requested: &str,
        mode: TransferMode,
        filename: &str,
        block_size: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            rule_id: rule_id.to_string(),
            requester: requester.to_string(),
            requested: requested.to_string(),
            mode,
            original_filename: filename.to_string(),
            filename: filename.to_string(),
            file_information: String::new(),
            block_size,
            rank: 0,
            special_id: ILLEGAL_SPECIAL_ID,
            status: UpdatedInfo::ToSubmit,
            global_step: GlobalStep::NoTask,
            step: 0,
            step_code: StepCode::InitOk,
            retrieve: mode.is_recv(),
            started_at: now,
            updated_at: now,
        }
    }

    /// The key guaranteeing at-most-one concurrent execution of this transfer.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!("{} {} {}", self.requested, self.requester, self.special_id)
    }

    /// Whether the requester and requested host are the same.
    #[must_use]
    pub fn is_self_requested(&self) -> bool {
        self.requester == self.requested
    }

    /// Label identifying this transfer attempt in logs and span names.
    #[must_use]
    pub fn transfer_id_label(&self) -> String {
        if self.special_id == ILLEGAL_SPECIAL_ID {
            format!("{}_{}_NEWTRANSFER", self.rule_id, self.mode.as_wire())
        } else {
            format!("{}_{}_{}", self.rule_id, self.mode.as_wire(), self.special_id)
        }
    }

    /// Advance the acknowledged-block count. Regressions within an attempt
    /// are ignored; rank only moves forward.
    pub fn advance_rank(&mut self, rank: u32) {
        if rank > self.rank {
            self.rank = rank;
            self.updated_at = Utc::now();
        }
    }

    /// The block index at which a resumed attempt re-validates its work file.
    #[must_use]
    pub const fn restart_rank(&self) -> u32 {
        self.rank.saturating_sub(1)
    }

    /// Change status and step code, stamping the update time.
    pub fn change_status(&mut self, status: UpdatedInfo, code: StepCode) {
        self.status = status;
        self.step_code = code;
        self.updated_at = Utc::now();
    }

    /// Move to a new lifecycle phase.
    pub fn set_global_step(&mut self, step: GlobalStep) {
        self.global_step = step;
        self.step = 0;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_wire_values() {
        assert_eq!(TransferMode::Send.as_wire(), 1);
        assert_eq!(TransferMode::Recv.as_wire(), 2);
        assert_eq!(TransferMode::RecvThroughWithIntegrity.as_wire(), 8);
        for v in 0..=8 {
            assert_eq!(TransferMode::from_wire(v).unwrap().as_wire(), v);
        }
        assert!(TransferMode::from_wire(9).is_none());
    }

    #[test]
    fn test_mode_predicates() {
        assert!(TransferMode::Recv.is_recv());
        assert!(TransferMode::RecvWithIntegrity.is_recv());
        assert!(TransferMode::Send.is_send());
        assert!(TransferMode::SendThrough.is_through());
        assert!(!TransferMode::Send.is_through());
        assert!(TransferMode::SendWithIntegrity.is_integrity_checked());
        assert!(!TransferMode::Recv.is_integrity_checked());
    }

    #[test]
    fn test_mode_with_integrity() {
        assert_eq!(
            TransferMode::Send.with_integrity(),
            TransferMode::SendWithIntegrity
        );
        assert_eq!(
            TransferMode::RecvThrough.with_integrity(),
            TransferMode::RecvThroughWithIntegrity
        );
        assert_eq!(
            TransferMode::SendWithIntegrity.with_integrity(),
            TransferMode::SendWithIntegrity
        );
    }

    #[test]
    fn test_mode_compatibility() {
        assert!(TransferMode::Send.is_compatible(TransferMode::SendWithIntegrity));
        assert!(TransferMode::Recv.is_compatible(TransferMode::RecvThrough));
        assert!(!TransferMode::Send.is_compatible(TransferMode::Recv));
    }

    #[test]
    fn test_step_code_roundtrip() {
        let codes = [
            StepCode::InitOk,
            StepCode::CompleteOk,
            StepCode::IntegrityError,
            StepCode::ConnectionImpossible,
            StepCode::LoopSelfRequestedHost,
            StepCode::SizeNotAllowed,
            StepCode::Running,
        ];
        for code in codes {
            assert_eq!(StepCode::from_char(code.as_char()), Some(code));
        }
        assert!(StepCode::from_char('?').is_none());
    }

    #[test]
    fn test_dedup_key_and_label() {
        let mut record =
            TransferRecord::new("backup", "alpha", "beta", TransferMode::Send, "f.bin", 4096);
        assert!(record.transfer_id_label().ends_with("_NEWTRANSFER"));
        record.special_id = 42;
        assert_eq!(record.dedup_key(), "beta alpha 42");
        assert_eq!(record.transfer_id_label(), "backup_1_42");
        assert!(!record.is_self_requested());
        record.requested = "alpha".to_string();
        assert!(record.is_self_requested());
    }

    #[test]
    fn test_rank_is_monotonic() {
        let mut record =
            TransferRecord::new("backup", "alpha", "beta", TransferMode::Send, "f.bin", 4096);
        record.advance_rank(3);
        record.advance_rank(1);
        assert_eq!(record.rank, 3);
        record.advance_rank(4);
        assert_eq!(record.rank, 4);
        assert_eq!(record.restart_rank(), 3);
    }
}
