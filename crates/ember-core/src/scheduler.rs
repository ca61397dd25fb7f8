//! Shard scheduler pool.
//!
//! One OS thread per shard, each draining an inbox of closures. All state a
//! shard owns (its keyspace slice, its journal slice) is touched only from
//! that shard's scheduler thread; cross-thread interaction goes through
//! [`ShardPool::run_on`] / [`ShardPool::await_on_all`].

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::ids::ShardId;
use crate::latch::CountdownLatch;

/// Errors from the shard scheduler pool.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid pool configuration.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Failed to spawn a scheduler thread.
    #[error("failed to spawn scheduler for shard {shard}: {message}")]
    SpawnFailed {
        /// The shard whose scheduler could not start.
        shard: ShardId,
        /// OS error text.
        message: String,
    },

    /// Shard index outside the pool.
    #[error("shard {shard} out of range: pool has {num_shards} shards")]
    ShardOutOfRange {
        /// The requested shard.
        shard: ShardId,
        /// Pool size.
        num_shards: usize,
    },

    /// The shard's scheduler thread has exited.
    #[error("scheduler for shard {shard} is no longer running")]
    Disconnected {
        /// The unreachable shard.
        shard: ShardId,
    },
}

/// Configuration for a [`ShardPool`].
#[derive(Debug, Clone)]
pub struct ShardPoolConfig {
    /// Number of shards (and scheduler threads).
    pub num_shards: usize,
}

impl Default for ShardPoolConfig {
    fn default() -> Self {
        Self {
            num_shards: num_cpus::get(),
        }
    }
}

impl ShardPoolConfig {
    /// Creates a configuration with an explicit shard count.
    #[must_use]
    pub fn new(num_shards: usize) -> Self {
        Self { num_shards }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard count is zero or exceeds the shard id
    /// space.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.num_shards == 0 {
            return Err(SchedulerError::InvalidConfig(
                "num_shards must be > 0".to_string(),
            ));
        }
        if self.num_shards > usize::from(ShardId::MAX) {
            return Err(SchedulerError::InvalidConfig(format!(
                "num_shards {} exceeds shard id space",
                self.num_shards
            )));
        }
        Ok(())
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

enum SchedulerMessage {
    Run(Task),
    Shutdown,
}

thread_local! {
    static CURRENT_SHARD: Cell<Option<ShardId>> = const { Cell::new(None) };
}

/// Returns the shard owning the current thread, if this is a scheduler thread.
#[must_use]
pub fn current_shard() -> Option<ShardId> {
    CURRENT_SHARD.with(Cell::get)
}

struct ShardHandle {
    id: ShardId,
    sender: mpsc::Sender<SchedulerMessage>,
    thread: Option<JoinHandle<()>>,
}

/// Pool of per-shard scheduler threads.
///
/// Dropping the pool shuts every scheduler down and joins the threads.
pub struct ShardPool {
    shards: Vec<ShardHandle>,
}

impl ShardPool {
    /// Spawns the scheduler threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a thread cannot
    /// be spawned.
    pub fn new(config: &ShardPoolConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let mut shards = Vec::with_capacity(config.num_shards);
        for i in 0..config.num_shards {
            #[allow(clippy::cast_possible_truncation)] // bounded by validate()
            let id = i as ShardId;
            let (sender, receiver) = mpsc::channel();
            let thread = thread::Builder::new()
                .name(format!("shard-{id}"))
                .spawn(move || scheduler_main(id, &receiver))
                .map_err(|e| SchedulerError::SpawnFailed {
                    shard: id,
                    message: e.to_string(),
                })?;
            shards.push(ShardHandle {
                id,
                sender,
                thread: Some(thread),
            });
        }

        Ok(Self { shards })
    }

    /// Returns the number of shards in the pool.
    #[must_use]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Dispatches a closure onto one shard's scheduler without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard is out of range or its scheduler has
    /// exited.
    pub fn run_on<F>(&self, shard: ShardId, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.shards.get(usize::from(shard)).ok_or(
            SchedulerError::ShardOutOfRange {
                shard,
                num_shards: self.shards.len(),
            },
        )?;
        handle
            .sender
            .send(SchedulerMessage::Run(Box::new(f)))
            .map_err(|_| SchedulerError::Disconnected { shard })
    }

    /// Runs a closure on every shard's scheduler and waits for all of them
    /// to complete.
    ///
    /// # Errors
    ///
    /// Returns an error if any scheduler has exited; closures dispatched to
    /// the remaining schedulers still complete before the error is returned.
    pub fn await_on_all<F>(&self, f: F) -> Result<(), SchedulerError>
    where
        F: Fn(ShardId) + Send + Sync + 'static,
    {
        // Decrement through a drop guard so a panicking closure still
        // releases its latch slot.
        struct DecOnDrop(CountdownLatch);
        impl Drop for DecOnDrop {
            fn drop(&mut self) {
                self.0.dec();
            }
        }

        let f = std::sync::Arc::new(f);
        let latch = CountdownLatch::new(self.shards.len() as u64);
        let mut first_err = None;

        for handle in &self.shards {
            let f = std::sync::Arc::clone(&f);
            let guard = DecOnDrop(latch.clone());
            let id = handle.id;
            let sent = handle.sender.send(SchedulerMessage::Run(Box::new(move || {
                let _guard = guard;
                f(id);
            })));
            if sent.is_err() {
                // The unsent closure (and its guard) is dropped with the
                // send error, so the latch stays balanced.
                first_err.get_or_insert(SchedulerError::Disconnected { shard: id });
            }
        }

        latch.wait();
        first_err.map_or(Ok(()), Err)
    }

    /// Stops every scheduler and joins its thread. Idempotent.
    pub fn shutdown(&mut self) {
        for handle in &mut self.shards {
            let _ = handle.sender.send(SchedulerMessage::Shutdown);
            if let Some(thread) = handle.thread.take() {
                if thread.join().is_err() {
                    tracing::error!(shard = handle.id, "scheduler thread panicked");
                }
            }
        }
    }
}

impl Drop for ShardPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scheduler_main(id: ShardId, receiver: &mpsc::Receiver<SchedulerMessage>) {
    CURRENT_SHARD.with(|c| c.set(Some(id)));
    tracing::debug!(shard = id, "scheduler started");

    while let Ok(message) = receiver.recv() {
        match message {
            SchedulerMessage::Run(task) => {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!(shard = id, "panic in scheduled task");
                }
            }
            SchedulerMessage::Shutdown => break,
        }
    }

    tracing::debug!(shard = id, "scheduler stopped");
}
