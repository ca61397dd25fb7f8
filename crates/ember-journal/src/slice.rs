//! Thread-local journal slice.
//!
//! One slice exists per database thread. It allocates LSNs, keeps the most
//! recent serialized entries in a [`RingBuffer`], and fans every append out
//! to registered consumers synchronously, in registration order. The slice is
//! thread-confined by construction (`Rc`/`Cell` interior state, no `Send`),
//! so none of its operations lock.
//!
//! Fanout is a contract: consumers observe entries in LSN order before
//! [`add_log_record`](JournalSlice::add_log_record) returns to the caller,
//! modulo flush-mode batching. A consumer may unregister itself from inside
//! its own callback; fanout iterates over a snapshot of the registry and
//! re-checks liveness per consumer.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;

use ember_core::ids::Lsn;

use crate::config::JournalConfig;
use crate::entry::{Entry, Op};
use crate::error::JournalError;
use crate::ring::RingBuffer;

/// One appended journal record as observed by consumers.
#[derive(Debug, Clone)]
pub struct JournalItem {
    /// Assigned log sequence number.
    pub lsn: Lsn,
    /// Opcode of the underlying entry.
    pub opcode: Op,
    /// The framed record, as stored in the ring and sent on the wire.
    pub data: Bytes,
}

/// Observer of journal appends.
///
/// Consumers are invoked synchronously from `add_log_record` on the slice's
/// own thread; they must not block.
pub trait JournalConsumer {
    /// Called for every appended record, in LSN order.
    fn on_journal_entry(&mut self, item: &JournalItem);
}

/// Adapter that wraps a closure into a [`JournalConsumer`].
struct FnConsumer<F>(F);

impl<F: FnMut(&JournalItem)> JournalConsumer for FnConsumer<F> {
    fn on_journal_entry(&mut self, item: &JournalItem) {
        (self.0)(item);
    }
}

/// Wraps a closure into a boxed [`JournalConsumer`].
pub fn consumer_fn<F>(f: F) -> Box<dyn JournalConsumer>
where
    F: FnMut(&JournalItem) + 'static,
{
    Box::new(FnConsumer(f))
}

type ConsumerCell = Rc<RefCell<Box<dyn JournalConsumer>>>;

/// Thread-local journal state: LSN allocator, ring buffer, consumer
/// registry, and the flush-mode gate.
pub struct JournalSlice {
    initialized: Cell<bool>,
    cur_lsn: Cell<Lsn>,
    ring: RefCell<Option<RingBuffer>>,
    // Insertion order doubles as id order: ids are allocated monotonically.
    consumers: RefCell<Vec<(u32, ConsumerCell)>>,
    next_consumer_id: Cell<u32>,
    flush_enabled: Cell<bool>,
    backlog: RefCell<VecDeque<JournalItem>>,
}

impl Default for JournalSlice {
    fn default() -> Self {
        Self::new()
    }
}

impl JournalSlice {
    /// Creates an uninitialized slice; [`init`](Self::init) must run before
    /// the first append.
    #[must_use]
    pub fn new() -> Self {
        Self {
            initialized: Cell::new(false),
            cur_lsn: Cell::new(0),
            ring: RefCell::new(None),
            consumers: RefCell::new(Vec::new()),
            next_consumer_id: Cell::new(1),
            flush_enabled: Cell::new(true),
            backlog: RefCell::new(VecDeque::new()),
        }
    }

    /// Allocates the ring and arms the LSN allocator. Idempotent.
    pub fn init(&self, config: &JournalConfig) {
        if self.initialized.get() {
            return;
        }
        *self.ring.borrow_mut() = Some(RingBuffer::new(
            config.ring_capacity,
            config.ring_max_bytes,
        ));
        self.cur_lsn.set(1);
        self.initialized.set(true);
    }

    /// Returns true once [`init`](Self::init) has run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    /// The LSN the next append will receive.
    #[must_use]
    pub fn cur_lsn(&self) -> Lsn {
        self.cur_lsn.get()
    }

    /// Appends an entry: assigns the next LSN, serializes, and (flush mode
    /// permitting) stores the record in the ring and fans it out to every
    /// registered consumer.
    ///
    /// Returns the assigned LSN.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is uninitialized or serialization
    /// fails; the LSN is not consumed in either case.
    pub fn add_log_record(&self, mut entry: Entry) -> Result<Lsn, JournalError> {
        if !self.initialized.get() {
            return Err(JournalError::InvalidConfig(
                "journal slice is not initialized".to_string(),
            ));
        }

        let lsn = self.cur_lsn.get();
        entry.lsn = lsn;
        let data = entry.encode()?;
        self.cur_lsn.set(lsn + 1);

        let item = JournalItem {
            lsn,
            opcode: entry.opcode,
            data,
        };

        if self.flush_enabled.get() {
            self.publish(&item);
        } else {
            self.backlog.borrow_mut().push_back(item);
        }
        Ok(lsn)
    }

    /// Registers a consumer; it observes all subsequent appends (no
    /// backfill from the ring). Returns the consumer id.
    pub fn register_on_change(&self, consumer: Box<dyn JournalConsumer>) -> u32 {
        let id = self.next_consumer_id.get();
        self.next_consumer_id.set(id + 1);
        self.consumers
            .borrow_mut()
            .push((id, Rc::new(RefCell::new(consumer))));
        id
    }

    /// Removes a consumer by id. Safe to call from inside a consumer's own
    /// callback. Returns true if the id was registered.
    pub fn unregister_on_change(&self, id: u32) -> bool {
        let mut consumers = self.consumers.borrow_mut();
        let before = consumers.len();
        consumers.retain(|(cid, _)| *cid != id);
        consumers.len() != before
    }

    /// Returns true if any consumer is registered.
    #[must_use]
    pub fn has_registered_callbacks(&self) -> bool {
        !self.consumers.borrow().is_empty()
    }

    /// Toggles the flush gate. Disabling batches subsequent appends;
    /// re-enabling drains the backlog in append order before returning.
    pub fn set_flush_mode(&self, enabled: bool) {
        self.flush_enabled.set(enabled);
        if !enabled {
            return;
        }
        loop {
            let Some(item) = self.backlog.borrow_mut().pop_front() else {
                break;
            };
            self.publish(&item);
        }
    }

    /// Returns true if `lsn` is still held by the ring.
    #[must_use]
    pub fn is_lsn_in_buffer(&self, lsn: Lsn) -> bool {
        self.ring
            .borrow()
            .as_ref()
            .is_some_and(|ring| ring.contains(lsn))
    }

    /// Returns the framed record stored under `lsn`, if still in the ring.
    #[must_use]
    pub fn get_entry(&self, lsn: Lsn) -> Option<Bytes> {
        self.ring.borrow().as_ref().and_then(|ring| ring.get(lsn))
    }

    /// Number of records in the ring.
    #[must_use]
    pub fn ring_size(&self) -> usize {
        self.ring.borrow().as_ref().map_or(0, RingBuffer::size)
    }

    /// Aggregate ring payload in bytes.
    #[must_use]
    pub fn ring_bytes(&self) -> usize {
        self.ring.borrow().as_ref().map_or(0, RingBuffer::bytes)
    }

    /// Drops the ring contents. The LSN allocator and the consumer registry
    /// are untouched.
    pub fn reset_ring_buffer(&self) {
        if let Some(ring) = self.ring.borrow_mut().as_mut() {
            ring.reset();
        }
    }

    fn publish(&self, item: &JournalItem) {
        if let Some(ring) = self.ring.borrow_mut().as_mut() {
            ring.append(item.lsn, item.data.clone());
        }

        // Snapshot so a consumer can unregister (itself or a peer) from its
        // callback without invalidating the iteration.
        let snapshot: Vec<(u32, ConsumerCell)> = self
            .consumers
            .borrow()
            .iter()
            .map(|(id, cell)| (*id, Rc::clone(cell)))
            .collect();

        for (id, cell) in snapshot {
            let still_registered = self.consumers.borrow().iter().any(|(cid, _)| *cid == id);
            if still_registered {
                cell.borrow_mut().on_journal_entry(item);
            }
        }
    }
}
