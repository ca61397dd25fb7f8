//! End-to-end incoming migration scenarios over an in-memory socket.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};

use ember_cluster::{IncomingMigration, MigrationConfig, MigrationSocket, MigrationState};
use ember_core::context::ContextError;
use ember_core::ids::DbIndex;
use ember_core::slots::{SlotRange, SlotRanges};
use ember_journal::executor::{CommandExecutor, ExecuteError};
use ember_journal::tx_reader::CommandData;
use ember_journal::Entry;

// ---------------------------------------------------------------------------
// In-memory socket
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
    shut_down: bool,
}

/// One-directional in-memory stream with TCP-like close and shutdown.
#[derive(Default)]
struct TestSocket {
    state: Mutex<PipeState>,
    cond: Condvar,
}

impl TestSocket {
    fn send(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.data.extend(bytes.iter().copied());
        self.cond.notify_all();
    }

    fn send_entry(&self, entry: &Entry) {
        self.send(&entry.encode().unwrap());
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }
}

impl MigrationSocket for TestSocket {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        loop {
            if state.shut_down {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "socket shut down",
                ));
            }
            if !state.data.is_empty() {
                let n = buf.len().min(state.data.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.data.pop_front().unwrap();
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            self.cond.wait(&mut state);
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.shut_down = true;
        self.cond.notify_all();
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.state.lock().shut_down
    }

    fn diagnostics(&self) -> String {
        let state = self.state.lock();
        format!(
            "test socket: pending={} closed={} shutdown={}",
            state.data.len(),
            state.closed,
            state.shut_down
        )
    }
}

// ---------------------------------------------------------------------------
// Recording executor
// ---------------------------------------------------------------------------

/// Applies SET commands into a map; optionally fails the Nth execute with
/// out-of-memory.
#[derive(Default)]
struct RecordingExecutor {
    store: Mutex<FxHashMap<Vec<u8>, Vec<u8>>>,
    executed: AtomicUsize,
    oom_on_execute: Option<usize>,
}

impl RecordingExecutor {
    fn with_oom_on(n: usize) -> Self {
        Self {
            oom_on_execute: Some(n),
            ..Self::default()
        }
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.store.lock().get(key).cloned()
    }

    fn len(&self) -> usize {
        self.store.lock().len()
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(&self, _dbid: DbIndex, command: &CommandData) -> Result<(), ExecuteError> {
        let nth = self.executed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.oom_on_execute == Some(nth) {
            return Err(ExecuteError::OutOfMemory);
        }
        if command.name() == Some(b"SET") && command.args.len() == 3 {
            self.store
                .lock()
                .insert(command.args[1].clone(), command.args[2].clone());
        }
        Ok(())
    }

    fn is_global_command(&self, command: &CommandData) -> bool {
        command.name() == Some(b"FLUSHALL")
    }

    fn key_count(&self, _slots: &SlotRanges) -> usize {
        self.len()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn set_command(key: &str, value: &str) -> Entry {
    Entry::command(
        0,
        0,
        Some(1),
        vec![b"SET".to_vec(), key.as_bytes().to_vec(), value.as_bytes().to_vec()],
    )
}

fn migration_with(
    executor: Arc<RecordingExecutor>,
    timeout: Duration,
) -> Arc<IncomingMigration> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Arc::new(IncomingMigration::new(
        "source-node".to_string(),
        SlotRanges::new(vec![SlotRange::new(0, 1000)]),
        executor,
        MigrationConfig::new(timeout),
    ))
}

fn spawn_flow(
    migration: &Arc<IncomingMigration>,
    shard: u16,
    socket: &Arc<TestSocket>,
) -> thread::JoinHandle<()> {
    let migration = Arc::clone(migration);
    let socket: Arc<dyn MigrationSocket> = Arc::clone(socket) as Arc<dyn MigrationSocket>;
    thread::spawn(move || migration.start_flow(shard, socket).unwrap())
}

fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn single_shard_migration_clean_finalize() {
    let executor = Arc::new(RecordingExecutor::default());
    let migration = migration_with(Arc::clone(&executor), Duration::from_secs(5));
    migration.init(1);

    let socket = Arc::new(TestSocket::default());
    let flow = spawn_flow(&migration, 0, &socket);

    socket.send_entry(&set_command("a", "1"));
    socket.send_entry(&set_command("b", "2"));
    socket.send_entry(&Entry::lsn_marker(2));
    socket.close();

    assert!(migration.join(2));
    assert_eq!(migration.state(), MigrationState::Finished);
    flow.join().unwrap();

    assert_eq!(executor.get(b"a"), Some(b"1".to_vec()));
    assert_eq!(executor.get(b"b"), Some(b"2".to_vec()));
    assert_eq!(migration.get_key_count(), 2);

    // Finishing stop: every flow already drained, so this returns at once.
    let start = Instant::now();
    migration.stop();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn attempt_invalidated_by_late_write() {
    let executor = Arc::new(RecordingExecutor::default());
    let migration = migration_with(Arc::clone(&executor), Duration::from_millis(600));
    migration.init(1);

    let socket = Arc::new(TestSocket::default());
    let flow = spawn_flow(&migration, 0, &socket);

    socket.send_entry(&Entry::lsn_marker(5));
    socket.send_entry(&set_command("c", "3"));
    socket.send_entry(&Entry::lsn_marker(6));
    socket.close();

    // Let the flow consume the whole stream: attempt 5 is invalidated by
    // the late write, attempt 6 quiesces.
    flow.join().unwrap();

    assert!(!migration.join(5));
    assert_ne!(migration.state(), MigrationState::Finished);

    assert!(migration.join(6));
    assert_eq!(migration.state(), MigrationState::Finished);
    assert_eq!(executor.get(b"c"), Some(b"3".to_vec()));
}

#[test]
fn oom_escalates_to_fatal_and_stop_does_not_wait() {
    let executor = Arc::new(RecordingExecutor::with_oom_on(2));
    let migration = migration_with(Arc::clone(&executor), Duration::from_secs(5));
    migration.init(1);

    let socket = Arc::new(TestSocket::default());
    let flow = spawn_flow(&migration, 0, &socket);

    socket.send_entry(&set_command("a", "1"));
    socket.send_entry(&set_command("b", "2"));

    // start_flow escalates to stop() itself once the flow reports OOM.
    flow.join().unwrap();

    assert_eq!(migration.state(), MigrationState::Fatal);
    assert_eq!(migration.error(), Some(ContextError::OutOfMemory));
    assert_eq!(executor.get(b"a"), Some(b"1".to_vec()));
    assert_eq!(executor.get(b"b"), None);

    let start = Instant::now();
    migration.stop();
    assert!(start.elapsed() < Duration::from_secs(1));

    assert!(!migration.join(2));
}

#[test]
fn stop_before_any_flow_started_releases_the_latch() {
    let executor = Arc::new(RecordingExecutor::default());
    let migration = migration_with(executor, Duration::from_secs(5));
    migration.init(2);

    // Neither flow ever ran; cancel must release both latch slots instead
    // of waiting out the timeout.
    let start = Instant::now();
    migration.stop();
    assert!(start.elapsed() < Duration::from_secs(1));

    // A start after cancellation is a no-op on a finished flow.
    let socket = Arc::new(TestSocket::default());
    let flow = spawn_flow(&migration, 0, &socket);
    flow.join().unwrap();
    assert_ne!(migration.state(), MigrationState::Finished);
}

#[test]
fn pause_holds_the_stream_and_resume_drains_it() {
    let executor = Arc::new(RecordingExecutor::default());
    let migration = migration_with(Arc::clone(&executor), Duration::from_secs(5));
    migration.init(1);
    migration.pause(true);

    let socket = Arc::new(TestSocket::default());
    let flow = spawn_flow(&migration, 0, &socket);

    socket.send_entry(&set_command("a", "1"));
    thread::sleep(Duration::from_millis(150));
    assert_eq!(executor.len(), 0, "paused flow must not execute");

    migration.pause(false);
    assert!(wait_until(Duration::from_secs(2), || executor.len() == 1));
    assert_eq!(executor.get(b"a"), Some(b"1".to_vec()));

    socket.send_entry(&Entry::lsn_marker(1));
    socket.close();
    assert!(migration.join(1));
    flow.join().unwrap();
}

#[test]
fn global_command_is_rejected_without_fatal() {
    let executor = Arc::new(RecordingExecutor::default());
    let migration = migration_with(Arc::clone(&executor), Duration::from_secs(5));
    migration.init(1);

    let socket = Arc::new(TestSocket::default());
    let flow = spawn_flow(&migration, 0, &socket);

    socket.send_entry(&Entry::command(0, 0, None, vec![b"FLUSHALL".to_vec()]));
    socket.close();
    flow.join().unwrap();

    assert!(matches!(
        migration.error(),
        Some(ContextError::UnsupportedCommand(_))
    ));
    assert_ne!(migration.state(), MigrationState::Fatal);
    assert_eq!(executor.len(), 0);
}

#[test]
fn stop_unblocks_a_flow_parked_on_a_tcp_read() {
    use std::net::{TcpListener, TcpStream};

    let executor = Arc::new(RecordingExecutor::default());
    let migration = migration_with(executor, Duration::from_secs(5));
    migration.init(1);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();

    let migration_cb = Arc::clone(&migration);
    let socket: Arc<dyn MigrationSocket> = Arc::new(server);
    let flow = thread::spawn(move || migration_cb.start_flow(0, socket).unwrap());

    // The flow is now blocked reading an empty stream; a bounded stop must
    // half-close the socket and reap it.
    let released = Arc::new(AtomicBool::new(false));
    let released_cb = Arc::clone(&released);
    let migration_stop = Arc::clone(&migration);
    let stopper = thread::spawn(move || {
        migration_stop.stop();
        released_cb.store(true, Ordering::SeqCst);
    });

    assert!(wait_until(Duration::from_secs(3), || released
        .load(Ordering::SeqCst)));
    flow.join().unwrap();
    stopper.join().unwrap();
    drop(client);
}
