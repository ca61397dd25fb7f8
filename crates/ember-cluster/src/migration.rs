//! Incoming migration coordinator.
//!
//! [`IncomingMigration`] owns one drain flow per source shard and the
//! shared countdown latch they signal. The coordinator tracks the migration
//! state machine:
//!
//! ```text
//! Connecting ──init──► Sync ──join(attempt) accepted──► Finished
//!                       │
//!                       └── flow reports OOM ──► Fatal (absorbing)
//! ```
//!
//! `Fatal` is absorbing: once entered, [`stop`](IncomingMigration::stop)
//! cancels without waiting on the latch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ember_core::context::{ContextError, ExecutionContext};
use ember_core::ids::ShardId;
use ember_core::latch::CountdownLatch;
use ember_core::slots::SlotRanges;
use ember_journal::executor::CommandExecutor;

use crate::config::MigrationConfig;
use crate::flow::ShardFlow;
use crate::socket::MigrationSocket;

const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Lifecycle state of an incoming migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Created, flows not yet initialized.
    Connecting,
    /// Flows draining journal streams.
    Sync,
    /// Finalization handshake accepted.
    Finished,
    /// Unrecoverable error (notably OOM). Absorbing.
    Fatal,
}

/// Errors from coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Flow index outside the initialized set.
    #[error("flow {shard} out of range: migration has {num_flows} flows")]
    FlowOutOfRange {
        /// The requested source shard.
        shard: ShardId,
        /// Number of initialized flows.
        num_flows: usize,
    },
}

struct StateInner {
    state: MigrationState,
    keys_number: usize,
}

/// State shared between the coordinator and its flows.
pub(crate) struct MigrationCore {
    source_id: String,
    slots: SlotRanges,
    executor: Arc<dyn CommandExecutor>,
    cntx: ExecutionContext,
    state: Mutex<StateInner>,
}

impl MigrationCore {
    pub(crate) fn state(&self) -> MigrationState {
        self.state.lock().state
    }

    /// Records a non-fatal error on the migration context.
    pub(crate) fn report_error(&self, err: ContextError) {
        tracing::warn!(source = %self.source_id, error = %err, "incoming migration error");
        self.cntx.report_error(err);
    }

    /// Forces the absorbing fatal state and records the error.
    pub(crate) fn report_fatal_error(&self, err: ContextError) {
        {
            let mut state = self.state.lock();
            state.state = MigrationState::Fatal;
        }
        tracing::warn!(source = %self.source_id, error = %err, "incoming migration fatal error");
        self.cntx.report_error(err);
    }
}

struct Runtime {
    flows: Vec<Arc<ShardFlow>>,
    latch: CountdownLatch,
}

/// Per-migration state machine across all incoming flows.
pub struct IncomingMigration {
    core: Arc<MigrationCore>,
    config: MigrationConfig,
    runtime: Mutex<Runtime>,
}

impl IncomingMigration {
    /// Creates a coordinator for a migration from `source_id` covering
    /// `slots`. Flows are created by [`init`](Self::init).
    #[must_use]
    pub fn new(
        source_id: String,
        slots: SlotRanges,
        executor: Arc<dyn CommandExecutor>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            core: Arc::new(MigrationCore {
                source_id,
                slots,
                executor,
                cntx: ExecutionContext::new(),
                state: Mutex::new(StateInner {
                    state: MigrationState::Connecting,
                    keys_number: 0,
                }),
            }),
            config,
            runtime: Mutex::new(Runtime {
                flows: Vec::new(),
                latch: CountdownLatch::new(0),
            }),
        }
    }

    /// Source node identifier, used in log lines.
    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.core.source_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MigrationState {
        self.core.state()
    }

    /// Error recorded on the migration context, if any.
    #[must_use]
    pub fn error(&self) -> Option<ContextError> {
        self.core.cntx.error()
    }

    /// Resets the context and creates one flow per source shard; the latch
    /// starts at the flow count and the state moves to `Sync`.
    pub fn init(&self, num_flows: usize) {
        let mut state = self.core.state.lock();
        self.core.cntx.reset();
        state.state = MigrationState::Sync;

        let latch = CountdownLatch::new(num_flows as u64);
        let flows = (0..num_flows)
            .map(|i| {
                #[allow(clippy::cast_possible_truncation)] // flow count is shard count
                let shard = i as ShardId;
                Arc::new(ShardFlow::new(
                    shard,
                    Arc::clone(&self.core.executor),
                    Arc::clone(&self.core),
                    latch.clone(),
                ))
            })
            .collect();

        *self.runtime.lock() = Runtime { flows, latch };
    }

    /// Runs the FLOW step for one source shard on the calling thread,
    /// draining `socket` until finalization or cancellation. Escalates to
    /// [`stop`](Self::stop) if the migration went fatal meanwhile.
    ///
    /// # Errors
    ///
    /// Returns an error if `shard` has no initialized flow.
    pub fn start_flow(
        &self,
        shard: ShardId,
        socket: Arc<dyn MigrationSocket>,
    ) -> Result<(), MigrationError> {
        let flow = {
            let runtime = self.runtime.lock();
            runtime
                .flows
                .get(usize::from(shard))
                .cloned()
                .ok_or(MigrationError::FlowOutOfRange {
                    shard,
                    num_flows: runtime.flows.len(),
                })?
        };

        flow.start(&self.core.cntx, socket);

        let state = self.state();
        tracing::debug!(
            shard,
            source = %self.core.source_id,
            finished = state == MigrationState::Finished,
            "incoming flow completed"
        );
        if state == MigrationState::Fatal {
            self.stop();
        }
        Ok(())
    }

    /// Pauses or resumes every flow.
    pub fn pause(&self, pause: bool) {
        tracing::debug!(source = %self.core.source_id, pause, "pausing migration");
        for flow in &self.runtime.lock().flows {
            flow.set_pause(pause);
        }
    }

    /// Joins the finalization attempt: waits until every flow has quiesced
    /// at exactly `attempt` and the latch reads zero.
    ///
    /// Returns true on acceptance, transitioning to `Finished` and caching
    /// the key count of the migrated slots. Returns false on timeout, on a
    /// fatal migration, or when data arriving after the quiescence marker
    /// invalidated the attempt.
    #[must_use]
    pub fn join(&self, attempt: i64) -> bool {
        let start = Instant::now();
        let timeout = self.config.finalization_timeout;
        let (flows, latch) = self.runtime_snapshot();

        loop {
            let passed = start.elapsed();
            if passed >= timeout {
                tracing::warn!(source = %self.core.source_id, "can't join migration in time");
                self.core
                    .report_error(ContextError::Generic("can't join migration in time".into()));
                return false;
            }

            // Any flow reporting fatal (OOM) fails the join outright.
            if self.state() == MigrationState::Fatal {
                return false;
            }

            // If data was sent after the quiescence marker the latch wait
            // keeps failing; the attempt check decides whether that is a
            // stale attempt (keep polling) or a failed join.
            let wait_time = (timeout - passed).min(WAIT_SLICE);
            let is_attempt_correct = flows.iter().all(|flow| flow.last_attempt() == attempt);
            let wait_res = latch.wait_for(wait_time);

            if is_attempt_correct {
                if wait_res {
                    let mut state = self.core.state.lock();
                    state.state = MigrationState::Finished;
                    state.keys_number = self.core.executor.key_count(&self.core.slots);
                } else {
                    tracing::warn!(
                        source = %self.core.source_id,
                        attempt,
                        "can't join migration: data arrived after the quiescence marker"
                    );
                    self.core
                        .report_error(ContextError::Generic("can't join migration in time".into()));
                }
                return wait_res;
            }
        }
    }

    /// Stops the migration: cancels the context, cancels every flow, and
    /// (unless the migration is fatal) waits for the flows to drain within
    /// the finalization timeout. Never blocks indefinitely.
    pub fn stop(&self) {
        let state = self.core.state.lock();
        let finishing = state.state == MigrationState::Finished;
        tracing::info!(
            source = %self.core.source_id,
            slots = %self.core.slots,
            action = if finishing { "finishing" } else { "cancelling" },
            "stopping incoming migration"
        );
        self.core.cntx.cancel();

        let (flows, latch) = self.runtime_snapshot();
        for flow in &flows {
            if let Err(err) = flow.cancel() {
                tracing::debug!(source = %self.core.source_id, error = %err, "error during flow stop");
            }
        }

        // Don't wait if we reached the fatal state.
        if state.state == MigrationState::Fatal {
            return;
        }

        // Joining the flows here prevents data corruption from a drain
        // racing the caller's teardown.
        let start = Instant::now();
        let timeout = self.config.finalization_timeout;
        loop {
            let passed = start.elapsed();
            if latch.wait_for(timeout.saturating_sub(passed)) {
                return;
            }
            if start.elapsed() >= timeout {
                tracing::error!(source = %self.core.source_id, "can't stop migration in time");
                return;
            }
        }
    }

    /// Number of keys in the migrated slots: the cached count once
    /// `Finished`, a live recount otherwise.
    #[must_use]
    pub fn get_key_count(&self) -> usize {
        {
            let state = self.core.state.lock();
            if state.state == MigrationState::Finished {
                return state.keys_number;
            }
        }
        self.core.executor.key_count(&self.core.slots)
    }

    fn runtime_snapshot(&self) -> (Vec<Arc<ShardFlow>>, CountdownLatch) {
        let runtime = self.runtime.lock();
        (runtime.flows.clone(), runtime.latch.clone())
    }
}
