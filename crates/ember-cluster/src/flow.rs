//! Per-source-shard drain flow.
//!
//! One flow exists per source shard on the target node; it runs the FLOW
//! step of an incoming migration. The flow reads transactions off its
//! socket, replays them through the executor, and handles the sender's
//! LSN-quiescence markers.
//!
//! The shared countdown latch is decremented exactly once per flow across
//! the union of clean finalization, loop exit, and never-started cancel.
//! Attempt retries are balanced: the decrement at a quiescence marker is
//! re-raised when new data invalidates the attempt.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use ember_core::context::{ContextError, ExecutionContext};
use ember_core::ids::ShardId;
use ember_core::latch::CountdownLatch;
use ember_journal::executor::{CommandExecutor, ExecuteError};
use ember_journal::reader::JournalReader;
use ember_journal::tx_reader::{TransactionData, TransactionReader};
use ember_journal::Op;

use crate::migration::{MigrationCore, MigrationState};
use crate::socket::{MigrationSocket, SocketReader};

const PAUSE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, PartialEq, Eq)]
enum FlowExit {
    // Quiesced at an attempt; the latch decrement stands.
    Finalized,
    // Loop exit without finalization; the caller owes one latch decrement.
    Canceled,
}

#[derive(Debug, PartialEq, Eq)]
enum TxOutcome {
    Done,
    OutOfMemory,
}

struct FlowGuarded {
    is_finished: bool,
    socket: Option<Arc<dyn MigrationSocket>>,
}

/// Receiving end of one source shard's migration stream.
pub(crate) struct ShardFlow {
    source_shard_id: ShardId,
    executor: Arc<dyn CommandExecutor>,
    core: Arc<MigrationCore>,
    latch: CountdownLatch,
    guarded: Mutex<FlowGuarded>,
    last_attempt: AtomicI64,
    pause: AtomicBool,
}

impl ShardFlow {
    pub(crate) fn new(
        source_shard_id: ShardId,
        executor: Arc<dyn CommandExecutor>,
        core: Arc<MigrationCore>,
        latch: CountdownLatch,
    ) -> Self {
        Self {
            source_shard_id,
            executor,
            core,
            latch,
            guarded: Mutex::new(FlowGuarded {
                is_finished: false,
                socket: None,
            }),
            last_attempt: AtomicI64::new(-1),
            pause: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_pause(&self, pause: bool) {
        self.pause.store(pause, Ordering::Relaxed);
    }

    pub(crate) fn last_attempt(&self) -> i64 {
        self.last_attempt.load(Ordering::SeqCst)
    }

    /// Drains the stream until finalization or cancellation. At most one
    /// `start` per flow ever runs; later calls return immediately.
    pub(crate) fn start(&self, cntx: &ExecutionContext, socket: Arc<dyn MigrationSocket>) {
        {
            let mut guarded = self.guarded.lock();
            if guarded.is_finished {
                return;
            }
            guarded.is_finished = true;
            guarded.socket = Some(Arc::clone(&socket));
        }

        let exit = self.drain(cntx, &socket);

        // Cleared on every exit path so a late cancel() does not touch a
        // dead stream.
        self.guarded.lock().socket = None;

        if exit == FlowExit::Canceled {
            tracing::debug!(shard = self.source_shard_id, "flow canceled");
            self.latch.dec(); // allow joining the flow
        }
    }

    /// Requests the flow to stop: half-closes a bound socket, or releases
    /// the latch slot of a flow that never started.
    pub(crate) fn cancel(&self) -> io::Result<()> {
        let mut guarded = self.guarded.lock();
        if let Some(socket) = guarded.socket.as_ref() {
            if socket.is_open() {
                // Forbids further I/O but does not destroy the socket.
                let res = socket.shutdown();
                if let Err(err) = &res {
                    tracing::warn!(
                        shard = self.source_shard_id,
                        error = %err,
                        socket = %socket.diagnostics(),
                        "error shutting down migration socket"
                    );
                }
                return res;
            }
            return Ok(());
        }

        if !guarded.is_finished {
            guarded.is_finished = true;
            self.latch.dec(); // allow joining a flow whose start() never ran
        }
        Ok(())
    }

    fn drain(&self, cntx: &ExecutionContext, socket: &Arc<dyn MigrationSocket>) -> FlowExit {
        let mut reader = JournalReader::new(SocketReader::new(Arc::clone(socket)));
        let mut tx_reader = TransactionReader::new();

        while cntx.is_running() {
            if self.pause.load(Ordering::Relaxed) {
                thread::sleep(PAUSE_SLEEP);
                continue;
            }

            let Some(mut tx) = tx_reader.next_tx(&mut reader, cntx) else {
                if let Some(err) = cntx.error() {
                    tracing::warn!(
                        shard = self.source_shard_id,
                        error = %err,
                        socket = %socket.diagnostics(),
                        "error reading from migration socket"
                    );
                }
                break;
            };

            // The sender proposes finalizing at tx.lsn; the flow is drained
            // to that attempt until the stream produces more data.
            while tx.opcode == Op::Lsn {
                tracing::debug!(
                    shard = self.source_shard_id,
                    attempt = tx.lsn,
                    "attempt to finalize flow"
                );
                self.last_attempt
                    .store(i64::try_from(tx.lsn).unwrap_or(i64::MAX), Ordering::SeqCst);
                self.latch.dec(); // the flow can be joined now

                let Some(next) = tx_reader.next_tx(&mut reader, cntx) else {
                    tracing::debug!(shard = self.source_shard_id, "finalized flow");
                    return FlowExit::Finalized;
                };

                if self.core.state() == MigrationState::Fatal {
                    tracing::debug!(
                        shard = self.source_shard_id,
                        "flow finalization canceled: migration reached fatal state"
                    );
                    return FlowExit::Finalized;
                }

                if let Some(name) = next.first_command_name() {
                    tracing::debug!(
                        shard = self.source_shard_id,
                        command = name,
                        "flow finalization failed by new data"
                    );
                } else {
                    tracing::debug!(
                        shard = self.source_shard_id,
                        opcode = ?next.opcode,
                        "flow finalization failed by opcode"
                    );
                }

                self.latch.add(); // the flow isn't finished, lock it again
                tx = next;
            }

            if tx.opcode == Op::Ping {
                // Liveness marker; nothing to replay.
            } else if self.execute_tx(&tx, cntx) == TxOutcome::OutOfMemory {
                cntx.report_error(ContextError::OutOfMemory);
                self.core.report_fatal_error(ContextError::OutOfMemory);
                break;
            }
        }

        FlowExit::Canceled
    }

    fn execute_tx(&self, tx: &TransactionData, cntx: &ExecutionContext) -> TxOutcome {
        if !cntx.is_running() {
            return TxOutcome::Done;
        }

        for command in &tx.commands {
            if self.executor.is_global_command(command) {
                let error = ContextError::UnsupportedCommand(command.name_lossy());
                tracing::error!(shard = self.source_shard_id, %error, "rejecting global command");
                cntx.report_error(error.clone());
                self.core.report_error(error);
                return TxOutcome::Done;
            }

            match self.executor.execute(tx.dbid, command) {
                Ok(()) => {}
                Err(ExecuteError::OutOfMemory) => return TxOutcome::OutOfMemory,
                Err(ExecuteError::Internal(message)) => {
                    cntx.report_error(ContextError::Generic(message));
                    return TxOutcome::Done;
                }
            }
        }

        TxOutcome::Done
    }
}
