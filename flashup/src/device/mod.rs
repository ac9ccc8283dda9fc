//! Device transport capability.
//!
//! A transport owns exactly one device endpoint and exposes the update
//! verbs: connect, begin, chunk, finalize, cancel. Requests are accepted for
//! transmission synchronously; delivery confirmation and device-initiated
//! state changes arrive asynchronously as [`DeviceEvent`]s from
//! [`DeviceTransport::poll`].
//!
//! ## Pipelining discipline
//!
//! Every transport keeps at most one request in flight. Requests issued
//! while awaiting a response are queued FIFO and transmitted as responses
//! (or timeouts) free the slot. A timeout never retries at this layer; it
//! releases the slot, logs a warning and moves on. Retry policy belongs to
//! the update job.

pub mod network;
pub mod serial;

use std::collections::BTreeMap;
use std::time::Instant;

pub use network::NetworkDevice;
pub use serial::SerialDevice;

/// Connection lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection; the initial and post-disconnect state.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Link established and usable.
    Connected,
    /// The link failed; a new `connect` is required.
    Error,
}

/// Update-protocol state as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Device is idle, no update session open.
    Idle,
    /// Device acknowledged `begin_update` and awaits firmware data.
    Ready,
    /// Device is receiving firmware chunks.
    Updating,
    /// Device accepted the final image and is rebooting onto it.
    Rebooting,
}

/// Severity of protocol-level log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Protocol tracing.
    Debug = 0,
    /// Routine progress.
    Info = 1,
    /// Recoverable anomalies (timeouts, retries).
    Warning = 2,
    /// Failures.
    Error = 3,
}

/// Asynchronous notification from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The connection status changed.
    ConnectionStatusChanged(ConnectionStatus),
    /// The device reported a new update-protocol state.
    DeviceStateChanged(DeviceState),
    /// A protocol-level log line.
    Log(LogLevel, String),
}

/// The capability every concrete transport implements.
///
/// Transports are single-threaded and poll-driven: nothing happens between
/// calls, and [`DeviceTransport::poll`] is where inbound bytes are consumed,
/// timeouts fire and queued requests drain.
pub trait DeviceTransport {
    /// Stable identifier, `<scheme>:<address>[:<port>]`.
    fn device_id(&self) -> String;

    /// Static descriptor plus the live `status` entry.
    fn device_info(&self) -> BTreeMap<String, String>;

    /// Initiate the connection.
    ///
    /// Transitions the status through `Connecting` to `Connected` (or
    /// `Error`); the transitions are delivered as events on the next poll.
    fn connect(&mut self) -> crate::Result<()>;

    /// Release the endpoint, drop queued requests and clear the read
    /// buffer. Idempotent.
    fn disconnect(&mut self);

    /// Whether the link is currently established.
    fn is_connected(&self) -> bool;

    /// Current connection status.
    fn connection_status(&self) -> ConnectionStatus;

    /// Last update-protocol state reported by the device.
    fn device_state(&self) -> DeviceState;

    /// Ask the device to open an update session.
    ///
    /// Returns whether the request was accepted for transmission; the
    /// device's answer arrives as a `DeviceStateChanged` event.
    fn begin_update(&mut self) -> bool;

    /// Queue one firmware chunk at the given payload offset.
    fn send_firmware_chunk(&mut self, data: &[u8], offset: u64) -> bool;

    /// Ask the device to validate and commit the received image.
    fn finalize_update(&mut self) -> bool;

    /// Abort the update session on the device.
    fn cancel_update(&mut self) -> bool;

    /// Chunk size this transport moves efficiently, in bytes.
    fn optimal_chunk_size(&self) -> u64;

    /// Drive the transport: read pending bytes, parse complete frames, fire
    /// the in-flight timeout, drain the request queue. Returns the events
    /// produced since the last poll, in order. Never blocks.
    fn poll(&mut self, now: Instant) -> Vec<DeviceEvent>;
}
