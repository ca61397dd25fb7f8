//! Command executor contract.
//!
//! The executor that actually applies mutations lives outside this crate;
//! journal replay and slot migration drive it through this trait.

use ember_core::ids::DbIndex;
use ember_core::slots::SlotRanges;

use crate::tx_reader::CommandData;

/// Errors an executor can report while applying a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    /// The store cannot allocate for the command. Migration escalates this
    /// to its fatal state.
    #[error("not enough memory to apply command")]
    OutOfMemory,

    /// Any other execution failure, carried as text. Surfaced on the
    /// execution context but not escalated.
    #[error("command execution failed: {0}")]
    Internal(String),
}

/// Applies replayed commands against shard-local storage.
pub trait CommandExecutor: Send + Sync {
    /// Applies one command to the given logical database.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::OutOfMemory`] when the store is out of
    /// memory, or [`ExecuteError::Internal`] for any other failure.
    fn execute(&self, dbid: DbIndex, command: &CommandData) -> Result<(), ExecuteError>;

    /// Returns true for commands that require global coordination and so
    /// cannot be replayed on a single shard during migration.
    fn is_global_command(&self, command: &CommandData) -> bool;

    /// Number of keys currently stored under the given slot ranges.
    fn key_count(&self, slots: &SlotRanges) -> usize;
}
