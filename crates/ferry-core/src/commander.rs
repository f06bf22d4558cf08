//! Transfer scheduling: the commander poll loop and its worker pool.
//!
//! On a fixed period the commander asks the store for records ready to run
//! and dispatches each to a bounded worker pool, skipping work that is
//! already in flight. Saturation never drops a record silently; a record
//! that cannot be dispatched is marked in error so an operator (or a later
//! cycle) can see and retry it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::Result;
use crate::record::{StepCode, UpdatedInfo};
use crate::runner::ClientRunner;

/// Records considered per poll cycle.
pub const SUBMIT_LIMIT: usize = 100;

/// Floor on the worker pool size.
pub const MIN_RUNNER_THREADS: usize = 10;

/// The retry/backoff driver.
pub struct Commander {
    runner: Arc<ClientRunner>,
    pool: Arc<Semaphore>,
    delay_commander: Duration,
    delay_between_submissions: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Commander {
    /// A commander over a runner with a pool of `runner_threads` workers
    /// (floored at [`MIN_RUNNER_THREADS`]).
    #[must_use]
    pub fn new(
        runner: Arc<ClientRunner>,
        runner_threads: usize,
        delay_commander: Duration,
        delay_between_submissions: Duration,
    ) -> Self {
        Self {
            runner,
            pool: Arc::new(Semaphore::new(runner_threads.max(MIN_RUNNER_THREADS))),
            delay_commander,
            delay_between_submissions,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle used to stop the poll loop. Stopping does not cancel
    /// in-flight runners; they run to their natural end.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Whether the loop has been asked to stop.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.runner.context().is_shutdown()
    }

    /// Startup recovery: reschedule work a previous process left behind.
    pub async fn recover_from_startup(&self) -> Result<usize> {
        let reset = self.runner.context().store.reset_to_submit().await?;
        if reset > 0 {
            tracing::info!(count = reset, "Rescheduled transfers left from a previous run");
        }
        Ok(reset)
    }

    /// Run poll cycles until shutdown, leaving unprocessed records for the
    /// next startup.
    pub async fn run(&self) {
        tracing::info!("Commander started");
        while !self.is_shutdown() {
            if let Err(e) = self.run_cycle().await {
                tracing::error!(error = %e, "Commander cycle failed");
            }
            tokio::time::sleep(self.delay_commander).await;
        }
        tracing::info!("Commander stopped");
    }

    /// One poll cycle. Returns how many records were dispatched.
    pub async fn run_cycle(&self) -> Result<usize> {
        let ctx = self.runner.context();
        let store = &ctx.store;
        let eligible = store.next_to_submit(SUBMIT_LIMIT).await?;
        let mut submitted = 0;

        for mut record in eligible {
            if self.is_shutdown() {
                break;
            }

            let key = record.dedup_key();
            if ctx.active.contains(&key) {
                tracing::debug!(key = %key, "Already running, skipping");
                continue;
            }

            // a host cannot be both ends of one request
            if record.is_self_requested() {
                tracing::warn!(key = %key, "Self-requested transfer interrupted");
                record.change_status(UpdatedInfo::Interrupted, StepCode::LoopSelfRequestedHost);
                store.update(&record).await?;
                continue;
            }

            // saturation is observable, never a silent drop
            let Ok(permit) = Arc::clone(&self.pool).try_acquire_owned() else {
                tracing::warn!(key = %key, "Worker pool saturated, marking record in error");
                record.change_status(UpdatedInfo::InError, StepCode::Unknown);
                store.update(&record).await?;
                continue;
            };

            record.change_status(UpdatedInfo::Running, StepCode::Running);
            store.update(&record).await?;

            let runner = Arc::clone(&self.runner);
            tokio::spawn(async move {
                let _permit = permit;
                let label = record.transfer_id_label();
                match runner.run_transfer(record).await {
                    Ok(outcome) => {
                        tracing::info!(
                            transfer = %label,
                            success = outcome.success,
                            "Transfer finished"
                        );
                    }
                    Err(e) if e.is_recoverable() => {
                        tracing::info!(transfer = %label, error = %e, "Transfer rescheduled");
                    }
                    Err(e) => {
                        tracing::warn!(transfer = %label, error = %e, "Transfer failed");
                    }
                }
            });
            submitted += 1;

            // spread submissions so connection attempts do not burst
            tokio::time::sleep(self.delay_between_submissions).await;
        }
        Ok(submitted)
    }

    /// Workers currently available in the pool.
    #[must_use]
    pub fn available_workers(&self) -> usize {
        self.pool.available_permits()
    }
}

impl std::fmt::Debug for Commander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commander")
            .field("delay_commander", &self.delay_commander)
            .field("available_workers", &self.available_workers())
            .finish_non_exhaustive()
    }
}
