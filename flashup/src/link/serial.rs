//! Serial port link backed by the `serialport` crate.

use crate::error::{Error, Result};
use crate::link::Link;
use log::debug;
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::io::Read;
use std::time::Duration;

/// Baud rate used by the line-oriented update protocol.
pub const BAUD_RATE: u32 = 115_200;

/// Read timeout. Reads are preceded by a readiness check, so this only
/// bounds the rare race where pending bytes vanish between check and read.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// A serial port link. The port is opened lazily on [`Link::open`] so a
/// transport can exist for a device that is not plugged in yet.
pub struct SerialLink {
    port_name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialLink {
    /// Create an unopened link for the given port path.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            port: None,
        }
    }
}

impl Link for SerialLink {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let port = serialport::new(&self.port_name, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()?;

        debug!("Opened serial port {} at {} 8N1", self.port_name, BAUD_RATE);
        self.port = Some(port);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(port) = self.port.as_mut() else {
            return Err(Error::ConnectFailed("serial port is not open".into()));
        };

        let pending = port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(0);
        }

        let want = pending.min(buf.len());
        match port.read(&mut buf[..want]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let Some(port) = self.port.as_mut() else {
            return Err(Error::ConnectFailed("serial port is not open".into()));
        };
        std::io::Write::write_all(port, buf)?;
        std::io::Write::flush(port)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.port_name);
        }
    }

    fn endpoint(&self) -> &str {
        &self.port_name
    }
}
