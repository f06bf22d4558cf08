//! Per-transfer client runner.
//!
//! A [`ClientRunner`] drives one transfer attempt end to end: claim the
//! record, resolve the requested host, open a connection with bounded
//! retry, hand the channel to a requester session, wait for the session to
//! reach a terminal state, and write the final status back to the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::channel::{ConnectionProvider, PacketStream, TransferOutcome};
use crate::config::IntegrityRestartPolicy;
use crate::error::{Error, Result};
use crate::record::{StepCode, TransferRecord, UpdatedInfo, ILLEGAL_SPECIAL_ID};
use crate::session::{self, SessionContext};

/// Connection attempts consumed per transfer before it is deferred.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Process-wide connection attempt counter, keyed by transfer dedup key.
#[derive(Debug, Default)]
pub struct RetryCounter {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryCounter {
    /// An empty counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more attempt for `key`. Returns `true` while the count
    /// stays below `limit`; at the limit the entry is removed and `false`
    /// is returned.
    #[must_use]
    pub fn increment_and_check(&self, key: &str, limit: u32) -> bool {
        let mut attempts = self.attempts.lock().expect("counter lock");
        let tries = attempts.get(key).copied().unwrap_or(0) + 1;
        if tries >= limit {
            attempts.remove(key);
            false
        } else {
            attempts.insert(key.to_string(), tries);
            true
        }
    }

    /// Forget the attempts for `key` (on success).
    pub fn clear(&self, key: &str) {
        self.attempts.lock().expect("counter lock").remove(key);
    }

    /// Attempts recorded for `key`.
    #[must_use]
    pub fn count(&self, key: &str) -> u32 {
        self.attempts
            .lock()
            .expect("counter lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

/// Drives single transfer attempts against the network.
pub struct ClientRunner {
    ctx: Arc<SessionContext>,
    connections: Arc<dyn ConnectionProvider>,
    retries: Arc<RetryCounter>,
    retry_limit: u32,
    retry_delay: Duration,
    integrity_restart: IntegrityRestartPolicy,
    next_local_id: AtomicI32,
}

impl ClientRunner {
    /// A runner bound to a session context and a connection provider.
    #[must_use]
    pub fn new(
        ctx: Arc<SessionContext>,
        connections: Arc<dyn ConnectionProvider>,
        retry_limit: u32,
        retry_delay: Duration,
        integrity_restart: IntegrityRestartPolicy,
    ) -> Self {
        Self {
            ctx,
            connections,
            retries: Arc::new(RetryCounter::new()),
            retry_limit,
            retry_delay,
            integrity_restart,
            next_local_id: AtomicI32::new(1),
        }
    }

    /// The shared retry counter, for inspection.
    #[must_use]
    pub fn retries(&self) -> Arc<RetryCounter> {
        Arc::clone(&self.retries)
    }

    /// The session context this runner works in.
    #[must_use]
    pub fn context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.ctx)
    }

    /// Insert a fresh record and run it immediately, bypassing the poll
    /// loop. The client entry point.
    pub async fn run_direct(&self, mut record: TransferRecord) -> Result<TransferOutcome> {
        if record.special_id == ILLEGAL_SPECIAL_ID {
            let id = self.ctx.store.insert(record.clone()).await?;
            record.special_id = id;
        }
        self.run_transfer(record).await
    }

    /// Drive one transfer attempt for an already-stored record.
    ///
    /// Retryable connection failures surface as
    /// [`Error::NotYetConnected`] after the record was marked for a later
    /// poll cycle; exhausted retries surface as [`Error::NoConnection`].
    pub async fn run_transfer(&self, mut record: TransferRecord) -> Result<TransferOutcome> {
        let label = record.transfer_id_label();
        tracing::info!(transfer = %label, "Will run transfer");

        record.change_status(UpdatedInfo::ToRun, StepCode::Running);
        self.update_record(&record).await;

        if record.is_self_requested() {
            tracing::warn!("Requested host cannot initiate its own request");
            record.change_status(UpdatedInfo::InError, StepCode::LoopSelfRequestedHost);
            self.update_record(&record).await;
            return Err(Error::RunnerConfig(
                "requested host cannot initiate itself the request".into(),
            ));
        }

        let Some(host) = self.ctx.hosts.resolve(&record.requested) else {
            tracing::warn!(host = %record.requested, "Requested host cannot be found");
            record.change_status(UpdatedInfo::InError, StepCode::NotKnownHost);
            self.update_record(&record).await;
            return Err(Error::HostNotFound(record.requested.clone()));
        };

        let key = record.dedup_key();
        let Some(claim) = self.ctx.active.try_claim(&key) else {
            tracing::info!("Transfer already in flight, skipping");
            return Err(Error::RunnerConfig(format!(
                "transfer {key} already in flight"
            )));
        };

        let stream = match self.connections.connect(&host).await {
            Ok(stream) => stream,
            Err(e) => {
                drop(claim);
                return self.handle_connection_failure(&mut record, &key, &e).await;
            }
        };
        self.retries.clear(&key);

        if record.rank > 0 {
            tracing::info!(rank = record.rank, "Resuming from the restart marker");
        }
        record.change_status(UpdatedInfo::Running, StepCode::Running);
        self.update_record(&record).await;

        // the session resolves the completion exactly once on reaching a
        // terminal state; the runner blocks here until then
        let (tx, rx) = oneshot::channel();
        let ctx = Arc::clone(&self.ctx);
        let local_id = self.next_local_id.fetch_add(1, Ordering::SeqCst);
        let mut session_record = record.clone();
        let session_task = tokio::spawn(async move {
            let mut packets = PacketStream::new(stream);
            let outcome =
                session::run_requester(&mut packets, &mut session_record, &ctx, local_id).await;
            let _ = tx.send((outcome, session_record));
        });

        let (outcome, session_record) = match rx.await {
            Ok(resolved) => resolved,
            Err(_) => {
                session_task.abort();
                drop(claim);
                record.change_status(UpdatedInfo::InError, StepCode::Internal);
                self.update_record(&record).await;
                return Err(Error::Internal("session ended without resolving".into()));
            }
        };
        drop(claim);

        tracing::info!(
            transfer = %label,
            success = outcome.success,
            code = ?outcome.code,
            "Request done"
        );

        // best-effort reload: a light client may already have forgotten the
        // record, which is tolerated
        let mut final_record = match self.ctx.store.select(record.special_id).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                tracing::info!("Record vanished from the store before finalization");
                session_record
            }
            Err(e) => {
                tracing::info!(error = %e, "Cannot reload record for finalization");
                session_record
            }
        };

        if outcome.success {
            final_record.change_status(UpdatedInfo::Done, StepCode::CompleteOk);
        } else {
            if outcome.code == StepCode::IntegrityError
                && self.integrity_restart == IntegrityRestartPolicy::FromZero
            {
                final_record.rank = 0;
            }
            match final_record.status {
                UpdatedInfo::Done | UpdatedInfo::InError | UpdatedInfo::Interrupted => {}
                _ => final_record.change_status(UpdatedInfo::InError, outcome.code),
            }
        }
        self.update_record(&final_record).await;
        Ok(outcome)
    }

    /// Connection failed: consult the retry budget and mark the record for
    /// a later poll cycle, or give up on automatic rescheduling.
    async fn handle_connection_failure(
        &self,
        record: &mut TransferRecord,
        key: &str,
        cause: &Error,
    ) -> Result<TransferOutcome> {
        if self.retries.increment_and_check(key, self.retry_limit) {
            tracing::info!(error = %cause, "Cannot connect, will retry");
            tokio::time::sleep(self.retry_delay).await;
            record.change_status(UpdatedInfo::ToSubmit, StepCode::ConnectionImpossible);
            self.update_record(record).await;
            Err(Error::NotYetConnected(record.requested.clone()))
        } else {
            tracing::info!(error = %cause, "Connection attempt limit reached, giving up");
            record.change_status(UpdatedInfo::ToRun, StepCode::ConnectionImpossible);
            self.update_record(record).await;
            Err(Error::NoConnection(record.requested.clone()))
        }
    }

    async fn update_record(&self, record: &TransferRecord) {
        if let Err(e) = self.ctx.store.update(record).await {
            tracing::debug!(error = %e, "Could not persist record state");
        }
    }
}

impl std::fmt::Debug for ClientRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRunner")
            .field("retry_limit", &self.retry_limit)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}
