//! # `emberdb` Journal
//!
//! Per-shard write-ahead journaling: every mutating command is recorded as an
//! [`Entry`] addressed by a monotonically increasing log sequence number. A
//! thread-local [`slice`](crate::slice) keeps the most recent entries in a
//! bounded ring and fans every append out to registered consumers
//! synchronously; the process-wide [`Journal`] facade wires each thread's
//! slice into shard-local state. The [`reader`](crate::reader) and
//! [`tx_reader`](crate::tx_reader) decode the same framed format back into
//! entries and transactions on the receiving side of replication and slot
//! migration.
//!
//! ## Data flow
//!
//! ```text
//! produce:  command ──► Journal::record_entry ──► JournalSlice::add_log_record
//!                                                   ├─► ring buffer
//!                                                   └─► consumers (LSN order)
//!
//! receive:  socket ──► JournalReader ──► TransactionReader ──► executor
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Journal entry model and framed serialization
pub mod entry;

/// Error types for journal operations
pub mod error;

/// Bounded LSN-indexed ring of recent serialized entries
pub mod ring;

/// Thread-local journal slice - append, LSN allocation, consumer fanout
pub mod slice;

/// Process-wide journal facade over per-thread slices
pub mod journal;

/// Framed decoder of a journal byte stream
pub mod reader;

/// Reassembly of multi-entry transactions from the entry stream
pub mod tx_reader;

/// Command executor contract (external collaborator)
pub mod executor;

/// Journal configuration
pub mod config;

// Re-export key types
pub use config::JournalConfig;
pub use entry::{Entry, Op};
pub use error::JournalError;
pub use executor::{CommandExecutor, ExecuteError};
pub use journal::{Journal, JournalFlushGuard};
pub use reader::JournalReader;
pub use slice::{consumer_fn, JournalConsumer, JournalItem, JournalSlice};
pub use tx_reader::{CommandData, TransactionData, TransactionReader};
