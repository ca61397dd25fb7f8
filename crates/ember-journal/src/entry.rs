//! Journal entry model and framed serialization.
//!
//! Every mutating operation is logged as one [`Entry`]. Entries serialize to
//! a self-delimited record: a little-endian `u32` body length, a `crc32c`
//! checksum of the body, then the rkyv-archived entry. The frame words are
//! explicitly little-endian, so the format is independent of host
//! endianness and readable by [`JournalReader`](crate::reader::JournalReader)
//! on any peer.

use bytes::Bytes;

use ember_core::ids::{DbIndex, Lsn, SlotId, TxId};

use crate::error::JournalError;

/// Size of the record header (length + CRC32).
pub(crate) const RECORD_HEADER_SIZE: usize = 8;

/// Upper bound on a single record body. Anything larger is a framing bug,
/// not a legitimate entry.
pub(crate) const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

// Entry types with derive macros
mod entry_types {
    #![allow(missing_docs)] // Allow for derive-generated code

    use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

    use ember_core::ids::{DbIndex, Lsn, SlotId, TxId};

    /// Opcode of a journal entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
    pub enum Op {
        /// Padding entry with no effect.
        Noop,
        /// Logical database switch.
        Select,
        /// Single-shard mutation.
        Command,
        /// One step of a multi-entry transaction.
        MultiCommand,
        /// Transaction commit marker.
        Exec,
        /// Liveness marker, no data.
        Ping,
        /// Quiescence marker carrying a target LSN.
        Lsn,
        /// Stream end.
        Fin,
    }

    /// Canonical record of one logged operation.
    ///
    /// `lsn` is assigned by the journal slice at append time; for [`Op::Lsn`]
    /// markers it carries the sender's finalization target instead.
    #[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
    pub struct Entry {
        /// Transaction identifier; zero for non-transactional entries.
        pub txid: TxId,
        /// Operation code.
        pub opcode: Op,
        /// Logical database index.
        pub dbid: DbIndex,
        /// Number of shards participating in the enclosing transaction;
        /// one for shard-local entries.
        pub shard_cnt: u32,
        /// Slot identifier when the entry is migration-relevant.
        pub slot: Option<SlotId>,
        /// Opcode-dependent payload; the argv vector for commands.
        pub payload: Vec<Vec<u8>>,
        /// Log sequence number.
        pub lsn: Lsn,
    }
}

pub use entry_types::{Entry, Op};

impl Op {
    /// Returns true for marker opcodes that never carry command data.
    #[must_use]
    pub fn is_marker(self) -> bool {
        matches!(self, Self::Noop | Self::Ping | Self::Lsn | Self::Fin)
    }
}

impl Entry {
    /// Creates an entry with explicit fields; `lsn` starts unassigned.
    #[must_use]
    pub fn new(
        txid: TxId,
        opcode: Op,
        dbid: DbIndex,
        shard_cnt: u32,
        slot: Option<SlotId>,
        payload: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            txid,
            opcode,
            dbid,
            shard_cnt,
            slot,
            payload,
            lsn: 0,
        }
    }

    /// Creates a single-shard command entry.
    #[must_use]
    pub fn command(txid: TxId, dbid: DbIndex, slot: Option<SlotId>, args: Vec<Vec<u8>>) -> Self {
        Self::new(txid, Op::Command, dbid, 1, slot, args)
    }

    /// Creates one step of a multi-entry transaction.
    #[must_use]
    pub fn multi_command(
        txid: TxId,
        dbid: DbIndex,
        shard_cnt: u32,
        slot: Option<SlotId>,
        args: Vec<Vec<u8>>,
    ) -> Self {
        Self::new(txid, Op::MultiCommand, dbid, shard_cnt, slot, args)
    }

    /// Creates a transaction commit marker.
    #[must_use]
    pub fn exec(txid: TxId, shard_cnt: u32) -> Self {
        Self::new(txid, Op::Exec, 0, shard_cnt, None, Vec::new())
    }

    /// Creates a logical database switch.
    #[must_use]
    pub fn select(dbid: DbIndex) -> Self {
        Self::new(0, Op::Select, dbid, 1, None, Vec::new())
    }

    /// Creates a liveness marker.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(0, Op::Ping, 0, 1, None, Vec::new())
    }

    /// Creates a quiescence marker proposing finalization at `target`.
    #[must_use]
    pub fn lsn_marker(target: Lsn) -> Self {
        let mut entry = Self::new(0, Op::Lsn, 0, 1, None, Vec::new());
        entry.lsn = target;
        entry
    }

    /// Creates a stream-end marker.
    #[must_use]
    pub fn fin() -> Self {
        Self::new(0, Op::Fin, 0, 1, None, Vec::new())
    }

    /// Returns true if the entry carries command data.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    /// Serializes the entry into one framed record.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Serialization`] if archiving fails or the
    /// body exceeds the record size limit.
    pub fn encode(&self) -> Result<Bytes, JournalError> {
        let body = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| JournalError::Serialization(e.to_string()))?;
        if body.len() > MAX_RECORD_BYTES {
            return Err(JournalError::Serialization(format!(
                "entry body of {} bytes exceeds the record size limit",
                body.len()
            )));
        }

        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_RECORD_BYTES
        let len = body.len() as u32;
        let crc = crc32c::crc32c(&body);

        let mut framed = Vec::with_capacity(RECORD_HEADER_SIZE + body.len());
        framed.extend_from_slice(&len.to_le_bytes());
        framed.extend_from_slice(&crc.to_le_bytes());
        framed.extend_from_slice(&body);
        Ok(Bytes::from(framed))
    }
}
