use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, Weak,
    },
    thread,
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    error::Error,
    mock::MockHub,
    serial::{
        lines::LineSplitter,
        source::{self, SerialSource},
    },
};

/// The baud rate used when a client doesn't say otherwise.
pub const DEFAULT_BAUD: u32 = 9600;

/// The trailing output window per device, in characters.
/// Oldest characters are dropped on overflow, never newest.
pub const OUTPUT_WINDOW: usize = 10_000;

/// Pause between polls when the port has nothing for us.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long `stop` waits for a reader thread to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Token identifying one registered output observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&str) + Send + Sync>;

/// The live half of one session: whatever `stop` needs to retire it.
struct Connection {
    stop: Arc<AtomicBool>,
    reader: thread::JoinHandle<()>,

    /// Closed by the reader thread on exit; lets `stop` wait with a bound.
    done: mpsc::Receiver<()>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<usize, Connection>,
    outputs: HashMap<usize, String>,
    observers: HashMap<usize, Vec<(ObserverId, Observer)>>,
    next_observer: u64,
}

/// Owns every serial session in the process.
///
/// At most one live session exists per device index: `start` always
/// retires any prior session for the index before opening the port.
/// All bookkeeping sits behind one mutex; anything that can block for
/// real (opening a port, waiting out a reader thread) happens outside
/// it, and observers are never called while it is held.
pub struct SessionManager {
    /// Serializes session lifecycle changes so two concurrent `start`s
    /// cannot both own the same index.
    lifecycle: Mutex<()>,

    inner: Mutex<Inner>,

    mocks: MockHub,
}

impl SessionManager {
    /// A manager with no sessions.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lifecycle: Mutex::new(()),
            inner: Mutex::new(Inner::default()),
            mocks: MockHub::new(),
        })
    }

    /// The hub backing this manager's `mock:` ports.
    pub fn mocks(&self) -> &MockHub {
        &self.mocks
    }

    /// Start reading the device at `index` from `port`.
    ///
    /// Any session already running for this index is stopped first,
    /// even if it was reading a different port. The buffer and
    /// observer list start out empty.
    pub fn start(self: &Arc<Self>, index: usize, port: &str, baud: u32) -> Result<(), Error> {
        let _lifecycle = self.lifecycle.lock().expect("Lock should not be poisoned");

        info!(%index, %port, %baud, "Starting serial session");
        self.retire(index);

        let source = source::open(port, baud, &self.mocks)?;

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();

        let manager = Arc::downgrade(self);
        let stop_flag = Arc::clone(&stop);
        let port_name = port.to_string();

        let reader = thread::Builder::new()
            .name(format!("serial-reader-{index}"))
            .spawn(move || {
                read_loop(index, &port_name, source, &stop_flag, &manager);
                drop(done_tx);
            })
            .map_err(|e| {
                error!(%index, "Could not spawn reader thread: {e}");
                Error::SessionStart(index)
            })?;

        let mut inner = self.inner.lock().expect("Lock should not be poisoned");
        inner.outputs.insert(index, String::new());
        inner.observers.insert(index, Vec::new());
        inner.connections.insert(
            index,
            Connection {
                stop,
                reader,
                done: done_rx,
            },
        );

        Ok(())
    }

    /// Stop reading the device at `index`.
    ///
    /// Idempotent: an index with no session returns `true` immediately
    /// and does no blocking work. Clears the index's buffer and
    /// observer list.
    pub fn stop(&self, index: usize) -> bool {
        let _lifecycle = self.lifecycle.lock().expect("Lock should not be poisoned");

        self.retire(index)
    }

    /// The retire half of `stop`/`start`. Caller holds the lifecycle lock.
    fn retire(&self, index: usize) -> bool {
        let connection = {
            let mut inner = self.inner.lock().expect("Lock should not be poisoned");

            let Some(connection) = inner.connections.remove(&index) else {
                return true;
            };

            connection.stop.store(true, Ordering::Relaxed);

            if let Some(output) = inner.outputs.get_mut(&index) {
                output.clear();
            }
            inner.observers.remove(&index);

            connection
        };

        // The waiting happens after the state lock is released; the
        // reader thread drops the port handle on its way out.
        match connection.done.recv_timeout(STOP_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Err(e) = connection.reader.join() {
                    warn!(%index, "Reader thread panicked: {e:?}");
                    return false;
                }
                debug!(%index, "Serial session stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(%index, "Reader thread still busy after {STOP_TIMEOUT:?}, detaching");
                true
            }
        }
    }

    /// Whether a session is currently running for `index`.
    pub fn is_connected(&self, index: usize) -> bool {
        self.inner
            .lock()
            .expect("Lock should not be poisoned")
            .connections
            .contains_key(&index)
    }

    /// Snapshot of the device's trailing output window.
    /// Empty if no session ever ran here.
    pub fn output(&self, index: usize) -> String {
        self.inner
            .lock()
            .expect("Lock should not be poisoned")
            .outputs
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop whatever output the device has accumulated.
    pub fn reset_output(&self, index: usize) {
        self.inner
            .lock()
            .expect("Lock should not be poisoned")
            .outputs
            .insert(index, String::new());

        info!(%index, "Reset output");
    }

    /// Register an observer for the device's output updates.
    ///
    /// Observers are invoked from the reader thread with the updated
    /// window snapshot, after the manager's lock has been released.
    pub fn observe(
        &self,
        index: usize,
        observer: impl Fn(&str) + Send + Sync + 'static,
    ) -> ObserverId {
        let mut inner = self.inner.lock().expect("Lock should not be poisoned");

        let id = ObserverId(inner.next_observer);
        inner.next_observer += 1;

        inner
            .observers
            .entry(index)
            .or_default()
            .push((id, Arc::new(observer)));

        id
    }

    /// Remove a previously registered observer. Unknown ids are fine.
    pub fn unobserve(&self, index: usize, id: ObserverId) {
        let mut inner = self.inner.lock().expect("Lock should not be poisoned");

        if let Some(observers) = inner.observers.get_mut(&index) {
            observers.retain(|(observer_id, _)| *observer_id != id);
        }
    }

    /// Stop every running session.
    pub fn shutdown_all(&self) {
        let indices: Vec<usize> = {
            self.inner
                .lock()
                .expect("Lock should not be poisoned")
                .connections
                .keys()
                .copied()
                .collect()
        };

        for index in indices {
            self.stop(index);
        }
    }

    /// Append a completed line and notify observers.
    ///
    /// Called from reader threads. The buffer mutation happens under
    /// the lock; the observer calls happen after it is released, so a
    /// slow observer can neither stall other devices' bookkeeping nor
    /// deadlock against a lock it takes itself.
    fn append_output(&self, index: usize, chunk: &str) {
        let (snapshot, observers) = {
            let mut inner = self.inner.lock().expect("Lock should not be poisoned");

            // The session may have been stopped while the reader was mid-line.
            let Some(output) = inner.outputs.get_mut(&index) else {
                return;
            };

            output.push_str(chunk);
            truncate_front_chars(output, OUTPUT_WINDOW);

            (
                output.clone(),
                inner.observers.get(&index).cloned().unwrap_or_default(),
            )
        };

        for (_, observer) in observers {
            observer(&snapshot);
        }
    }
}

/// Keep only the trailing `max` characters of `s`.
fn truncate_front_chars(s: &mut String, max: usize) {
    let count = s.chars().count();
    if count > max {
        let excess = count - max;
        let offset = s
            .char_indices()
            .nth(excess)
            .map(|(at, _)| at)
            .unwrap_or(s.len());
        s.drain(..offset);
    }
}

/// One device's reader: poll, read, assemble lines, hand them over.
///
/// Exits on the stop flag, on any transport error, or once the manager
/// itself is gone. The source (and with it the port handle) is dropped
/// on the way out, whatever the cause.
fn read_loop(
    index: usize,
    port: &str,
    mut source: Box<dyn SerialSource>,
    stop: &AtomicBool,
    manager: &Weak<SessionManager>,
) {
    let mut splitter = LineSplitter::new(b'\n');
    let mut scratch = [0u8; 512];

    while !stop.load(Ordering::Relaxed) {
        let available = match source.bytes_to_read() {
            Ok(n) => n,
            Err(e) => {
                error!(%index, %port, "Serial transport error: {e}");
                break;
            }
        };

        if available == 0 {
            thread::sleep(POLL_INTERVAL);
            continue;
        }

        let n = match source.read_bytes(&mut scratch) {
            Ok(n) => n,
            Err(e) => {
                error!(%index, %port, "Serial read error: {e}");
                break;
            }
        };

        splitter.extend(&scratch[..n]);

        while let Some(raw) = splitter.next_line() {
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();

            if line.is_empty() {
                continue;
            }

            let Some(manager) = manager.upgrade() else {
                info!(%index, %port, "Manager gone, reader exiting");
                return;
            };

            manager.append_output(index, &format!("{line}\n"));
        }
    }

    info!(%index, %port, "Serial reader loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFeeder;
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    fn start_mock(manager: &Arc<SessionManager>, index: usize, name: &str) -> MockFeeder {
        manager
            .start(index, &format!("mock:{name}"), DEFAULT_BAUD)
            .expect("Mock sessions should always start");

        manager
            .mocks()
            .feeder(name)
            .expect("Attach happens during start")
    }

    /// Wait for the predicate to hold, observing snapshots as they come in.
    fn wait_for_snapshot(
        snapshots: &mpsc::Receiver<String>,
        accept: impl Fn(&str) -> bool,
    ) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);

        while Instant::now() < deadline {
            match snapshots.recv_timeout(Duration::from_millis(100)) {
                Ok(snapshot) if accept(&snapshot) => return snapshot,
                Ok(_) | Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        panic!("No acceptable snapshot arrived in time");
    }

    fn observe_into_channel(
        manager: &Arc<SessionManager>,
        index: usize,
    ) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel();
        manager.observe(index, move |snapshot| {
            let _ = tx.send(snapshot.to_string());
        });
        rx
    }

    #[test]
    fn lines_reach_buffer_and_observers() {
        let manager = SessionManager::new();
        let feeder = start_mock(&manager, 0, "basic");
        let snapshots = observe_into_channel(&manager, 0);

        feeder.feed("hel".as_bytes().to_vec());
        feeder.feed("lo\nwor".as_bytes().to_vec());
        feeder.feed("ld\n".as_bytes().to_vec());

        let first = wait_for_snapshot(&snapshots, |s| s == "hello\n");
        assert_eq!(first, "hello\n");

        wait_for_snapshot(&snapshots, |s| s == "hello\nworld\n");
        assert_eq!(manager.output(0), "hello\nworld\n");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let manager = SessionManager::new();
        let feeder = start_mock(&manager, 0, "blanks");
        let snapshots = observe_into_channel(&manager, 0);

        feeder.feed(b"\r\n\n  \nreal\n".to_vec());

        let snapshot = wait_for_snapshot(&snapshots, |s| !s.is_empty());
        assert_eq!(snapshot, "real\n");
    }

    #[test]
    fn buffer_keeps_only_the_trailing_window() {
        let manager = SessionManager::new();
        let feeder = start_mock(&manager, 0, "window");
        let snapshots = observe_into_channel(&manager, 0);

        // 200 lines x 100 chars, far past the window.
        for n in 0..200 {
            let line = format!("{n:03}{}", "x".repeat(96));
            feeder.feed_line(&line);
        }

        let last_line = format!("199{}\n", "x".repeat(96));
        let tail = last_line.clone();
        let snapshot = wait_for_snapshot(&snapshots, move |s| s.ends_with(&tail));

        assert!(snapshot.chars().count() <= OUTPUT_WINDOW);
        assert!(snapshot.ends_with(&last_line));
        // The front was dropped, not the back.
        assert!(!snapshot.starts_with("000"));
    }

    #[test]
    fn start_retires_the_previous_session() {
        let manager = SessionManager::new();
        let old_feeder = start_mock(&manager, 0, "takeover");

        let new_feeder = start_mock(&manager, 0, "takeover");
        assert!(manager.is_connected(0));

        // The old reader is gone; its feed side is disconnected.
        assert!(!old_feeder.feed_line("into the void"));

        let snapshots = observe_into_channel(&manager, 0);
        assert!(new_feeder.feed_line("fresh session"));
        wait_for_snapshot(&snapshots, |s| s.contains("fresh session"));
    }

    #[test]
    fn stop_is_idempotent_and_fast_when_inactive() {
        let manager = SessionManager::new();

        let before = Instant::now();
        assert!(manager.stop(7));
        assert!(before.elapsed() < Duration::from_millis(100));

        let _feeder = start_mock(&manager, 3, "stopper");
        assert!(manager.stop(3));
        assert!(manager.stop(3));
        assert!(!manager.is_connected(3));
    }

    #[test]
    fn stop_clears_buffer_and_observers() {
        let manager = SessionManager::new();
        let feeder = start_mock(&manager, 0, "clearing");
        let snapshots = observe_into_channel(&manager, 0);

        feeder.feed_line("remember me");
        wait_for_snapshot(&snapshots, |s| s.contains("remember me"));

        assert!(manager.stop(0));
        assert_eq!(manager.output(0), "");

        // The observer went with the session.
        assert!(snapshots.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn transport_error_ends_the_session_loop() {
        let manager = SessionManager::new();
        let feeder = start_mock(&manager, 0, "unplugged");
        let snapshots = observe_into_channel(&manager, 0);

        feeder.feed_line("last words");
        wait_for_snapshot(&snapshots, |s| s.contains("last words"));

        // Reattaching drops the feeder side: the device "disappears" and
        // the reader loop exits on its own. `stop` must still be safe.
        let _replacement = manager.mocks().attach("unplugged");
        std::thread::sleep(Duration::from_millis(100));

        assert!(manager.stop(0));
    }

    #[test]
    fn unobserve_stops_notifications() {
        let manager = SessionManager::new();
        let feeder = start_mock(&manager, 0, "quieted");

        let (tx, rx) = mpsc::channel();
        let id = manager.observe(0, move |snapshot| {
            let _ = tx.send(snapshot.to_string());
        });

        feeder.feed_line("heard");
        wait_for_snapshot(&rx, |s| s.contains("heard"));

        manager.unobserve(0, id);
        feeder.feed_line("unheard");

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn output_of_unknown_index_is_empty() {
        let manager = SessionManager::new();
        assert_eq!(manager.output(42), "");
    }

    #[test]
    fn shutdown_all_stops_everything() {
        let manager = SessionManager::new();
        start_mock(&manager, 0, "one");
        start_mock(&manager, 1, "two");

        manager.shutdown_all();

        assert!(!manager.is_connected(0));
        assert!(!manager.is_connected(1));
    }

    #[test]
    fn truncation_keeps_the_tail() {
        let mut s = "abcdef".to_string();
        truncate_front_chars(&mut s, 4);
        assert_eq!(s, "cdef");

        let mut s = "ab".to_string();
        truncate_front_chars(&mut s, 4);
        assert_eq!(s, "ab");

        // Multi-byte characters are dropped whole.
        let mut s = "ééxyz".to_string();
        truncate_front_chars(&mut s, 4);
        assert_eq!(s, "éxyz");
    }
}
