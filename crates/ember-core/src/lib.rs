//! # `emberdb` Core
//!
//! Runtime substrate shared by every `emberdb` crate: canonical identifier
//! types, the cooperative execution context, the countdown latch, and the
//! shard scheduler pool.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Canonical identifier types - LSN, transaction, database, slot, and shard ids
pub mod ids;

/// Execution context - cooperative cancellation and error slot
pub mod context;

/// Countdown latch - await quiescence across a set of workers
pub mod latch;

/// Shard scheduler pool - one closure-draining scheduler thread per shard
pub mod scheduler;

/// Cluster hash-slot ranges - keyspace partitions used by slot migration
pub mod slots;

// Re-export key types
pub use context::{ContextError, ExecutionContext};
pub use ids::{DbIndex, Lsn, ShardId, SlotId, TxId};
pub use latch::CountdownLatch;
pub use scheduler::{current_shard, SchedulerError, ShardPool, ShardPoolConfig};
pub use slots::{SlotRange, SlotRanges};
