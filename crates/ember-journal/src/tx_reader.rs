//! Reassembly of multi-entry transactions from the entry stream.
//!
//! [`TransactionReader`] pulls entries from a [`JournalReader`] and groups
//! them into [`TransactionData`]: a single `Command` entry yields a
//! transaction immediately, `MultiCommand` entries accumulate per txid until
//! the closing `Exec`, and marker opcodes pass through as zero-command
//! pseudo-transactions. Interleaved transactions from one stream reassemble
//! independently.

use std::io::Read;

use fxhash::FxHashMap;
use smallvec::SmallVec;

use ember_core::context::ExecutionContext;
use ember_core::ids::{DbIndex, Lsn, TxId};

use crate::entry::{Entry, Op};
use crate::reader::JournalReader;

/// One command: an argv vector of opaque byte strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandData {
    /// Command name followed by its arguments.
    pub args: SmallVec<[Vec<u8>; 4]>,
}

impl CommandData {
    /// Builds a command from an entry payload.
    #[must_use]
    pub fn from_args(args: Vec<Vec<u8>>) -> Self {
        Self {
            args: SmallVec::from_vec(args),
        }
    }

    /// The command name, when present.
    #[must_use]
    pub fn name(&self) -> Option<&[u8]> {
        self.args.first().map(Vec::as_slice)
    }

    /// The command name as lossy UTF-8, for diagnostics.
    #[must_use]
    pub fn name_lossy(&self) -> String {
        self.name()
            .map_or_else(|| "<empty>".to_string(), |n| String::from_utf8_lossy(n).into_owned())
    }
}

/// A reassembled transaction (or a marker pseudo-transaction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionData {
    /// Opcode that produced this transaction.
    pub opcode: Op,
    /// Transaction identifier; zero for non-transactional entries.
    pub txid: TxId,
    /// Logical database the commands apply to.
    pub dbid: DbIndex,
    /// Number of shards participating in the enclosing transaction.
    pub shard_cnt: u32,
    /// For [`Op::Lsn`] markers, the sender's finalization target.
    pub lsn: Lsn,
    /// Commands to replay; empty for markers.
    pub commands: Vec<CommandData>,
}

impl TransactionData {
    fn from_entry(entry: Entry) -> Self {
        let commands = if entry.payload.is_empty() {
            Vec::new()
        } else {
            vec![CommandData::from_args(entry.payload)]
        };
        Self {
            opcode: entry.opcode,
            txid: entry.txid,
            dbid: entry.dbid,
            shard_cnt: entry.shard_cnt,
            lsn: entry.lsn,
            commands,
        }
    }

    /// Returns true for zero-command marker transactions.
    #[must_use]
    pub fn is_marker(&self) -> bool {
        self.commands.is_empty()
    }

    /// Name of the first command, for diagnostics.
    #[must_use]
    pub fn first_command_name(&self) -> Option<String> {
        self.commands.first().map(CommandData::name_lossy)
    }
}

#[derive(Debug)]
struct PendingTx {
    dbid: DbIndex,
    shard_cnt: u32,
    commands: Vec<CommandData>,
}

/// Groups a journal entry stream into transactions.
#[derive(Debug, Default)]
pub struct TransactionReader {
    accumulated: FxHashMap<TxId, PendingTx>,
}

impl TransactionReader {
    /// Creates a reader with no pending transactions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pulls entries until a complete transaction (or marker) is available.
    ///
    /// Returns `None` when the stream ends; if the end was not a clean close
    /// of a running context, the underlying error is recorded on `cntx`.
    /// A stream ending mid-transaction discards the partial accumulation.
    pub fn next_tx<R: Read>(
        &mut self,
        reader: &mut JournalReader<R>,
        cntx: &ExecutionContext,
    ) -> Option<TransactionData> {
        loop {
            let entry = match reader.read_entry(cntx) {
                Ok(entry) => entry,
                Err(err) => {
                    // Cancellation is not an error; only a running context
                    // records the failure.
                    if cntx.is_running() {
                        cntx.report_error(err.to_context_error());
                    }
                    return None;
                }
            };

            match entry.opcode {
                Op::Noop => {}
                Op::Command => return Some(TransactionData::from_entry(entry)),
                Op::MultiCommand => {
                    let pending =
                        self.accumulated
                            .entry(entry.txid)
                            .or_insert_with(|| PendingTx {
                                dbid: entry.dbid,
                                shard_cnt: entry.shard_cnt,
                                commands: Vec::new(),
                            });
                    if !entry.payload.is_empty() {
                        pending.commands.push(CommandData::from_args(entry.payload));
                    }
                }
                Op::Exec => {
                    let txid = entry.txid;
                    if let Some(pending) = self.accumulated.remove(&txid) {
                        return Some(TransactionData {
                            opcode: Op::Exec,
                            txid,
                            dbid: pending.dbid,
                            shard_cnt: pending.shard_cnt,
                            lsn: entry.lsn,
                            commands: pending.commands,
                        });
                    }
                    tracing::warn!(txid, "exec marker without accumulated steps");
                    return Some(TransactionData::from_entry(entry));
                }
                Op::Select | Op::Ping | Op::Lsn | Op::Fin => {
                    return Some(TransactionData::from_entry(entry));
                }
            }
        }
    }
}
