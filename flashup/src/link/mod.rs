//! Byte-stream links underneath the device transports.
//!
//! The design separates wire I/O from protocol logic: transports own the
//! framing and request/response discipline, links move raw bytes. This keeps
//! the protocol layer testable against an in-memory link and portable across
//! endpoint types.
//!
//! ```text
//! +-------------------+     +-------------------+
//! |  SerialDevice     |     |  NetworkDevice    |
//! |  (line protocol)  |     |  (framed JSON)    |
//! +---------+---------+     +---------+---------+
//!           |                         |
//!           v                         v
//! +---------+---------+     +---------+---------+
//! |     Link trait    |     |     Link trait    |
//! +---------+---------+     +---------+---------+
//!           |                         |
//!           v                         v
//! +---------+---------+     +---------+---------+
//! |    SerialLink     |     |      TcpLink      |
//! |   (serialport)    |     |  (std::net, non-  |
//! |                   |     |   blocking)       |
//! +-------------------+     +-------------------+
//! ```
//!
//! Reads are polls: [`Link::read_available`] returns immediately with
//! whatever bytes are pending, `Ok(0)` when there are none. A broken link
//! (peer hangup, unplugged adapter) surfaces as an `Err`, never as a silent
//! empty read.

pub mod serial;
pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

use crate::error::Result;

/// A point-to-point byte stream that can be opened, polled and closed.
pub trait Link {
    /// Establish the underlying connection. A no-op when already open.
    fn open(&mut self) -> Result<()>;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;

    /// Read whatever bytes are pending without blocking.
    ///
    /// Returns the number of bytes placed into `buf`; `Ok(0)` means no data
    /// is available right now. A closed or failed link returns an error.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write the full buffer to the link.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Tear the connection down and release the endpoint. Idempotent.
    fn close(&mut self);

    /// Human-readable endpoint name for logs (port path or host:port).
    fn endpoint(&self) -> &str;
}

pub use serial::SerialLink;
pub use tcp::TcpLink;
