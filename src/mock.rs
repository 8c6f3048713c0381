use std::{
    collections::HashMap,
    io,
    sync::{
        mpsc::{self, TryRecvError},
        Arc, Mutex,
    },
};

use tracing::debug;

use crate::{
    registry::{BoardModel, DeviceDescriptor, DeviceRegistry},
    serial::source::SerialSource,
};

/// Port paths with this prefix resolve to in-memory sources instead of
/// real serial ports.
pub const MOCK_SCHEME: &str = "mock:";

/// The mock's name, if the path is a mock path.
pub fn mock_name(path: &str) -> Option<&str> {
    path.strip_prefix(MOCK_SCHEME)
}

/// Hands out in-memory byte sources by name.
///
/// The session manager attaches a source when it "opens" a `mock:`
/// port; anyone holding the hub can then feed bytes into that source
/// as if a device were writing to the wire. Attaching again under the
/// same name (a restarted session) replaces the channel, so stale
/// feeders fail exactly like writes to an unplugged device.
#[derive(Debug, Default, Clone)]
pub struct MockHub {
    inner: Arc<Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>>,
}

impl MockHub {
    /// An empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// The device side: a fresh source for the named mock.
    pub(crate) fn attach(&self, name: &str) -> MockSource {
        let (tx, rx) = mpsc::channel();

        self.inner
            .lock()
            .expect("Lock should not be poisoned")
            .insert(name.to_string(), tx);

        debug!(%name, "Mock device attached");

        MockSource {
            rx,
            pending: Vec::new(),
        }
    }

    /// The test/demo side: a feeder for the named mock, if one is attached.
    pub fn feeder(&self, name: &str) -> Option<MockFeeder> {
        self.inner
            .lock()
            .expect("Lock should not be poisoned")
            .get(name)
            .cloned()
            .map(|tx| MockFeeder { tx })
    }
}

/// Writes bytes into an attached mock device.
#[derive(Debug, Clone)]
pub struct MockFeeder {
    tx: mpsc::Sender<Vec<u8>>,
}

impl MockFeeder {
    /// Feed raw bytes. `false` if the device side is gone.
    pub fn feed<B: Into<Vec<u8>>>(&self, bytes: B) -> bool {
        self.tx.send(bytes.into()).is_ok()
    }

    /// Feed one line, terminator included.
    pub fn feed_line(&self, line: &str) -> bool {
        self.feed(format!("{line}\n").into_bytes())
    }
}

/// The reading end of a mock device.
pub(crate) struct MockSource {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl SerialSource for MockSource {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        loop {
            match self.rx.try_recv() {
                Ok(bytes) => self.pending.extend(bytes),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.pending.is_empty() {
                        // The feeder side is gone: the "device" was unplugged.
                        return Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "mock feed disconnected",
                        ));
                    }
                    break;
                }
            }
        }

        Ok(self.pending.len() as u32)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Discovery over a fixed descriptor list. No hardware involved.
pub struct FixedRegistry {
    devices: Vec<DeviceDescriptor>,
}

impl FixedRegistry {
    /// A registry always reporting exactly these devices.
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self { devices }
    }

    /// A registry of mock devices, one per name, ports `mock:<name>`.
    pub fn mock(names: &[&str]) -> Self {
        Self::new(
            names
                .iter()
                .enumerate()
                .map(|(index, name)| DeviceDescriptor {
                    index,
                    board_model: BoardModel::Uno,
                    port_path: format!("{MOCK_SCHEME}{name}"),
                    description: Some("Mock device".into()),
                    manufacturer: Some("labport".into()),
                    serial_number: None,
                    vendor_id: None,
                    product_id: None,
                })
                .collect(),
        )
    }
}

impl DeviceRegistry for FixedRegistry {
    fn discover(&self) -> Vec<DeviceDescriptor> {
        self.devices.clone()
    }
}
