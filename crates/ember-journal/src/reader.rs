//! Framed decoder of a journal byte stream.
//!
//! Wraps any [`io::Read`] byte source and yields [`Entry`] records. Each
//! record is validated against its CRC32 before decoding. The error taxonomy
//! drives the caller's recovery: [`JournalError::ShortRead`] is a clean close
//! at a record boundary, [`JournalError::Malformed`] is a framing violation
//! after which the stream must be aborted, and [`JournalError::Io`] is a
//! transport failure.

use std::io::{self, Read};

use ember_core::context::ExecutionContext;

use crate::entry::{Entry, MAX_RECORD_BYTES, RECORD_HEADER_SIZE};
use crate::error::JournalError;

/// Streaming decoder of framed journal records.
#[derive(Debug)]
pub struct JournalReader<R> {
    source: R,
}

impl<R: Read> JournalReader<R> {
    /// Wraps a byte source.
    pub fn new(source: R) -> Self {
        Self { source }
    }

    /// Reads the next entry from the stream.
    ///
    /// A cancelled context reads as a clean end of stream: blocking reads
    /// are unblocked externally (socket shutdown), and the boundary check
    /// here keeps a non-blocking caller from starting a new record.
    ///
    /// # Errors
    ///
    /// - [`JournalError::ShortRead`]: stream closed at a record boundary.
    /// - [`JournalError::Malformed`]: truncated record, oversized length
    ///   word, checksum mismatch, or undecodable body.
    /// - [`JournalError::Io`]: transport failure.
    pub fn read_entry(&mut self, cntx: &ExecutionContext) -> Result<Entry, JournalError> {
        if !cntx.is_running() {
            return Err(JournalError::ShortRead);
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        self.read_header(&mut header)?;

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[0..4]);
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&header[4..8]);
        let expected_crc = u32::from_le_bytes(crc_bytes);

        if len > MAX_RECORD_BYTES {
            return Err(JournalError::Malformed(format!(
                "record length {len} exceeds {MAX_RECORD_BYTES}-byte limit"
            )));
        }

        let mut body = vec![0u8; len];
        self.source.read_exact(&mut body).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                JournalError::Malformed(format!(
                    "stream ended inside a record body ({len} bytes expected)"
                ))
            } else {
                JournalError::Io(e)
            }
        })?;

        let actual_crc = crc32c::crc32c(&body);
        if actual_crc != expected_crc {
            return Err(JournalError::Malformed(format!(
                "record checksum mismatch: expected {expected_crc:#010x}, got {actual_crc:#010x}"
            )));
        }

        rkyv::from_bytes::<Entry, rkyv::rancor::Error>(&body)
            .map_err(|e| JournalError::Malformed(format!("undecodable entry body: {e}")))
    }

    // Reads the fixed header, distinguishing a clean close (zero bytes at
    // the record boundary) from a truncated header.
    fn read_header(&mut self, header: &mut [u8; RECORD_HEADER_SIZE]) -> Result<(), JournalError> {
        let mut filled = 0;
        while filled < header.len() {
            match self.source.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Err(JournalError::ShortRead),
                Ok(0) => {
                    return Err(JournalError::Malformed(format!(
                        "stream ended inside a record header ({filled} of {RECORD_HEADER_SIZE} bytes)"
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(JournalError::Io(e)),
            }
        }
        Ok(())
    }
}
