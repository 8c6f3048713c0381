use std::{io, io::Read, time::Duration};

use crate::{
    error::Error,
    mock::{self, MockHub},
};

/// How long a read against a real port may block.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// A session's byte source.
///
/// The reader loop polls `bytes_to_read` and only reads when something
/// is available, so neither implementation may block indefinitely.
pub(crate) trait SerialSource: Send {
    /// How many bytes a read would currently yield.
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Read into `buf`. `Ok(0)` means nothing arrived in time, not EOF.
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

struct PortSource {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialSource for PortSource {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(io::Error::from)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Open the byte source behind a port path.
///
/// `mock:` paths attach to the hub; anything else is opened as a real
/// serial port, 8 data bits, no parity, 1 stop bit.
pub(crate) fn open(path: &str, baud: u32, mocks: &MockHub) -> Result<Box<dyn SerialSource>, Error> {
    if let Some(name) = mock::mock_name(path) {
        return Ok(Box::new(mocks.attach(name)));
    }

    let port = serialport::new(path, baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(READ_TIMEOUT)
        .open()
        .map_err(|e| Error::PortOpen {
            path: path.to_string(),
            problem: e.to_string(),
        })?;

    Ok(Box::new(PortSource { port }))
}
