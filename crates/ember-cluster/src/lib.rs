//! # `emberdb` Cluster
//!
//! Receiving side of live re-sharding. For each source shard, a dedicated
//! flow drains a journal stream over a socket, replays decoded transactions
//! through the external executor, and participates in the LSN-quiescence
//! finalization handshake. The
//! [`IncomingMigration`](crate::migration::IncomingMigration) coordinator
//! owns the flows, the shared countdown latch, and the migration state
//! machine.
//!
//! ## Control flow
//!
//! ```text
//! init(n) ──► n flows, latch = n, state Sync
//! start_flow(i, socket) ──► flow i drains until quiesced or canceled
//! join(attempt) ──► true when every flow quiesced at exactly `attempt`
//! stop() ──► cancel context, half-close sockets, bounded latch wait
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Migration configuration
pub mod config;

/// Socket contract for migration streams
pub mod socket;

/// Incoming migration coordinator and state machine
pub mod migration;

// Per-source-shard drain flow; internal to the coordinator.
mod flow;

// Re-export key types
pub use config::MigrationConfig;
pub use migration::{IncomingMigration, MigrationError, MigrationState};
pub use socket::MigrationSocket;
