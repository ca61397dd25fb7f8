//! Socket contract for migration streams.
//!
//! A migration flow borrows its socket from the caller and only ever reads
//! from it; `shutdown` must be callable concurrently with an in-flight read
//! so that [`IncomingMigration::stop`](crate::migration::IncomingMigration::stop)
//! can unblock a draining flow. All methods therefore take `&self`, which
//! the standard TCP socket supports natively.

use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

/// Bidirectional byte stream feeding a migration flow.
pub trait MigrationSocket: Send + Sync {
    /// Reads into `buf`, blocking until data, end of stream, or shutdown.
    ///
    /// # Errors
    ///
    /// Returns the transport error; a half-closed socket fails in-flight
    /// and subsequent reads.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Half-closes the socket: forbids further I/O without destroying it.
    ///
    /// # Errors
    ///
    /// Returns the transport error reported by the shutdown.
    fn shutdown(&self) -> io::Result<()>;

    /// Returns true while the socket is usable.
    fn is_open(&self) -> bool;

    /// Human-readable socket state for log lines.
    fn diagnostics(&self) -> String;
}

impl MigrationSocket for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self;
        Read::read(&mut stream, buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn is_open(&self) -> bool {
        self.peer_addr().is_ok()
    }

    fn diagnostics(&self) -> String {
        format!(
            "local={:?} peer={:?}",
            self.local_addr(),
            self.peer_addr()
        )
    }
}

/// Adapts a shared [`MigrationSocket`] to the [`Read`] interface the journal
/// reader expects.
pub(crate) struct SocketReader {
    socket: Arc<dyn MigrationSocket>,
}

impl SocketReader {
    pub(crate) fn new(socket: Arc<dyn MigrationSocket>) -> Self {
        Self { socket }
    }
}

impl Read for SocketReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.read(buf)
    }
}
