//! Line-oriented serial transport.
//!
//! Requests are ASCII commands, `CMD:<payload>\n`. The chunk command carries
//! a binary tail: a 4-byte little-endian payload offset followed by the raw
//! chunk bytes. Responses are newline-delimited and matched by prefix:
//!
//! | Prefix       | Meaning                                     |
//! |--------------|---------------------------------------------|
//! | `ACK`        | last request accepted; next request may go  |
//! | `INFO:<txt>` | informational                               |
//! | `STATE:<s>`  | device state change (IDLE/READY/UPDATING/REBOOTING) |
//! | `ERROR:<txt>`| device-side failure                         |
//!
//! Carriage returns on input are tolerated and stripped.

use crate::device::{ConnectionStatus, DeviceEvent, DeviceState, DeviceTransport, LogLevel};
use crate::error::{Error, Result};
use crate::link::{Link, SerialLink};
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Per-command response timeout.
const COMMAND_TIMEOUT: Duration = Duration::from_millis(3000);

/// Chunk size the line protocol moves comfortably.
const CHUNK_SIZE: u64 = 1024;

/// Read size per poll iteration.
const READ_BLOCK: usize = 256;

/// Serial update transport, generic over the underlying [`Link`] so the
/// protocol engine can be exercised against an in-memory double.
pub struct SerialDevice<L: Link> {
    link: L,
    port_name: String,
    status: ConnectionStatus,
    state: DeviceState,
    buffer: Vec<u8>,
    pending: VecDeque<Vec<u8>>,
    in_flight: Option<Instant>,
    events: VecDeque<DeviceEvent>,
}

impl SerialDevice<SerialLink> {
    /// Transport for a native serial port at the conventional 115200 8N1.
    pub fn open_port(port_name: impl Into<String>) -> Self {
        let port_name = port_name.into();
        Self::new(SerialLink::new(port_name.clone()), port_name)
    }
}

impl<L: Link> SerialDevice<L> {
    /// Build a transport over an arbitrary link.
    pub fn new(link: L, port_name: impl Into<String>) -> Self {
        Self {
            link,
            port_name: port_name.into(),
            status: ConnectionStatus::Disconnected,
            state: DeviceState::Idle,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            in_flight: None,
            events: VecDeque::new(),
        }
    }

    fn emit(&mut self, event: DeviceEvent) {
        self.events.push_back(event);
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.emit(DeviceEvent::Log(level, message.into()));
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status;
            self.emit(DeviceEvent::ConnectionStatusChanged(status));
        }
    }

    fn set_state(&mut self, state: DeviceState) {
        self.state = state;
        self.emit(DeviceEvent::DeviceStateChanged(state));
    }

    /// `CMD:<payload>\n`
    fn encode_command(cmd: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(cmd.len() + 1 + payload.len() + 1);
        out.extend_from_slice(cmd.as_bytes());
        out.push(b':');
        out.extend_from_slice(payload);
        out.push(b'\n');
        out
    }

    /// Transmit a command or queue it behind the in-flight request.
    fn send_command(&mut self, cmd: Vec<u8>) -> bool {
        if !self.link.is_open() {
            return false;
        }

        if self.in_flight.is_some() {
            self.pending.push_back(cmd);
            return true;
        }

        self.transmit(cmd)
    }

    fn transmit(&mut self, cmd: Vec<u8>) -> bool {
        if let Err(e) = self.link.write_all(&cmd) {
            self.log(LogLevel::Error, format!("Failed to write command: {e}"));
            return false;
        }
        self.in_flight = Some(Instant::now() + COMMAND_TIMEOUT);
        true
    }

    /// Send the queue head once the in-flight slot is free.
    fn send_next(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        if let Some(cmd) = self.pending.pop_front() {
            self.transmit(cmd);
        }
    }

    /// Chunk sends are only meaningful inside an update session.
    fn in_update_session(&self) -> bool {
        matches!(self.state, DeviceState::Ready | DeviceState::Updating)
    }

    /// Consume complete lines from the receive buffer.
    fn process_buffer(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).take(pos).collect();
            let line = trim_line(&line);
            if line.is_empty() {
                continue;
            }
            self.handle_line(line.to_vec());
        }
    }

    fn handle_line(&mut self, line: Vec<u8>) {
        let text = String::from_utf8_lossy(&line).into_owned();
        self.log(LogLevel::Debug, format!("Serial response: {text}"));

        if line.starts_with(b"ACK") {
            self.in_flight = None;
            self.send_next();
        } else if let Some(info) = text.strip_prefix("INFO:") {
            self.log(LogLevel::Info, format!("Device info: {info}"));
        } else if let Some(state) = text.strip_prefix("STATE:") {
            match state {
                "IDLE" => self.set_state(DeviceState::Idle),
                "READY" => self.set_state(DeviceState::Ready),
                "UPDATING" => self.set_state(DeviceState::Updating),
                "REBOOTING" => self.set_state(DeviceState::Rebooting),
                other => self.log(
                    LogLevel::Error,
                    Error::ProtocolError(format!("unknown device state: {other}")).to_string(),
                ),
            }
        } else if let Some(msg) = text.strip_prefix("ERROR:") {
            self.log(LogLevel::Error, Error::DeviceError(msg.to_string()).to_string());
        } else {
            self.log(
                LogLevel::Error,
                Error::ProtocolError(format!("unrecognized response: {text}")).to_string(),
            );
        }
    }
}

impl<L: Link> DeviceTransport for SerialDevice<L> {
    fn device_id(&self) -> String {
        format!("serial:{}", self.port_name)
    }

    fn device_info(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        info.insert("type".to_string(), "Serial".to_string());
        info.insert("port".to_string(), self.port_name.clone());
        info.insert("baudRate".to_string(), crate::link::serial::BAUD_RATE.to_string());
        info.insert(
            "status".to_string(),
            if self.link.is_open() { "Connected" } else { "Disconnected" }.to_string(),
        );
        info
    }

    fn connect(&mut self) -> Result<()> {
        if self.link.is_open() {
            return Ok(());
        }

        self.log(
            LogLevel::Info,
            format!("Connecting to serial port {}...", self.port_name),
        );
        self.set_status(ConnectionStatus::Connecting);

        match self.link.open() {
            Ok(()) => {
                self.log(LogLevel::Info, "Connected to serial device");
                self.set_status(ConnectionStatus::Connected);
                // Initial handshake; the device answers with INFO lines.
                self.send_command(Self::encode_command("INFO", &[]));
                Ok(())
            }
            Err(e) => {
                self.log(LogLevel::Error, format!("Failed to open serial port: {e}"));
                self.set_status(ConnectionStatus::Error);
                Err(e)
            }
        }
    }

    fn disconnect(&mut self) {
        let was_open = self.link.is_open();
        self.link.close();
        self.buffer.clear();
        self.pending.clear();
        self.in_flight = None;

        if was_open || self.status != ConnectionStatus::Disconnected {
            self.set_status(ConnectionStatus::Disconnected);
            self.log(LogLevel::Info, "Disconnected from serial device");
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.status
    }

    fn device_state(&self) -> DeviceState {
        self.state
    }

    fn begin_update(&mut self) -> bool {
        if !self.is_connected() {
            self.log(LogLevel::Warning, "Cannot begin update: device not connected");
            return false;
        }

        self.log(LogLevel::Info, "Beginning firmware update...");
        if !self.send_command(Self::encode_command("UPDATE_BEGIN", &[])) {
            self.log(LogLevel::Warning, "Failed to send update begin command");
            return false;
        }
        true
    }

    fn send_firmware_chunk(&mut self, data: &[u8], offset: u64) -> bool {
        if !self.is_connected() || !self.in_update_session() {
            self.log(LogLevel::Warning, "Cannot send firmware: device not in update mode");
            return false;
        }

        let mut payload = Vec::with_capacity(4 + data.len());
        payload
            .write_u32::<LittleEndian>(offset as u32)
            .expect("writing to a Vec cannot fail");
        payload.extend_from_slice(data);

        if !self.send_command(Self::encode_command("CHUNK", &payload)) {
            self.log(
                LogLevel::Warning,
                format!("Failed to send firmware chunk at offset {offset}"),
            );
            return false;
        }
        true
    }

    fn finalize_update(&mut self) -> bool {
        if !self.is_connected() || !self.in_update_session() {
            self.log(LogLevel::Warning, "Cannot finalize update: device not in update mode");
            return false;
        }

        self.log(LogLevel::Info, "Finalizing firmware update...");
        if !self.send_command(Self::encode_command("UPDATE_END", &[])) {
            self.log(LogLevel::Warning, "Failed to send update end command");
            return false;
        }
        true
    }

    fn cancel_update(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }

        self.log(LogLevel::Info, "Canceling firmware update...");
        if !self.send_command(Self::encode_command("UPDATE_CANCEL", &[])) {
            self.log(LogLevel::Warning, "Failed to send update cancel command");
            return false;
        }

        self.set_state(DeviceState::Idle);
        true
    }

    fn optimal_chunk_size(&self) -> u64 {
        CHUNK_SIZE
    }

    fn poll(&mut self, now: Instant) -> Vec<DeviceEvent> {
        if self.link.is_open() {
            let mut buf = [0u8; READ_BLOCK];
            loop {
                match self.link.read_available(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => self.buffer.extend_from_slice(&buf[..n]),
                    Err(e) => {
                        self.log(LogLevel::Error, format!("Serial port error: {e}"));
                        self.link.close();
                        self.set_status(ConnectionStatus::Error);
                        break;
                    }
                }
            }
            self.process_buffer();
        }

        if self.in_flight.is_some_and(|deadline| now >= deadline) {
            self.log(LogLevel::Warning, "Command timeout");
            self.in_flight = None;
            self.send_next();
        }

        self.events.drain(..).collect()
    }
}

/// Strip trailing CR/LF and surrounding ASCII whitespace.
fn trim_line(line: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = line.len();
    while start < end && line[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && line[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::{MockHandle, MockLink};

    fn connected_device() -> (SerialDevice<MockLink>, MockHandle) {
        let (link, handle) = MockLink::new();
        let mut device = SerialDevice::new(link, "/dev/ttyUSB0");
        device.connect().unwrap();
        handle.clear_written();
        // Clear the handshake's in-flight slot.
        handle.push_inbound(b"ACK\n");
        device.poll(Instant::now());
        (device, handle)
    }

    fn ready_device() -> (SerialDevice<MockLink>, MockHandle) {
        let (mut device, handle) = connected_device();
        handle.push_inbound(b"STATE:READY\n");
        device.poll(Instant::now());
        (device, handle)
    }

    #[test]
    fn test_connect_sends_info_handshake() {
        let (link, handle) = MockLink::new();
        let mut device = SerialDevice::new(link, "/dev/ttyUSB0");

        device.connect().unwrap();
        assert!(device.is_connected());
        assert_eq!(handle.written(), b"INFO:\n");

        let events = device.poll(Instant::now());
        assert!(events.contains(&DeviceEvent::ConnectionStatusChanged(
            ConnectionStatus::Connecting
        )));
        assert!(events.contains(&DeviceEvent::ConnectionStatusChanged(
            ConnectionStatus::Connected
        )));
    }

    #[test]
    fn test_connect_failure_reports_error_status() {
        let (link, handle) = MockLink::new();
        handle.fail_open();
        let mut device = SerialDevice::new(link, "/dev/ttyUSB0");

        assert!(device.connect().is_err());
        assert_eq!(device.connection_status(), ConnectionStatus::Error);
    }

    #[test]
    fn test_device_id_and_info() {
        let (link, _) = MockLink::new();
        let device = SerialDevice::new(link, "/dev/ttyACM1");
        assert_eq!(device.device_id(), "serial:/dev/ttyACM1");

        let info = device.device_info();
        assert_eq!(info["type"], "Serial");
        assert_eq!(info["port"], "/dev/ttyACM1");
        assert_eq!(info["status"], "Disconnected");
    }

    #[test]
    fn test_single_request_in_flight_queues_rest() {
        let (mut device, handle) = ready_device();

        assert!(device.send_firmware_chunk(b"aaaa", 0));
        assert!(device.send_firmware_chunk(b"bbbb", 4));
        assert!(device.send_firmware_chunk(b"cccc", 8));

        // Only the first chunk hit the wire.
        let written = handle.written();
        assert_eq!(written.iter().filter(|&&b| b == b'\n').count(), 1);
        assert!(written.starts_with(b"CHUNK:"));

        // Each ACK releases exactly one queued request.
        handle.push_inbound(b"ACK\n");
        device.poll(Instant::now());
        assert_eq!(handle.written().iter().filter(|&&b| b == b'\n').count(), 2);

        handle.push_inbound(b"ACK\n");
        device.poll(Instant::now());
        assert_eq!(handle.written().iter().filter(|&&b| b == b'\n').count(), 3);
    }

    #[test]
    fn test_chunk_wire_format() {
        let (mut device, handle) = ready_device();

        assert!(device.send_firmware_chunk(&[0xDE, 0xAD], 1024));

        let mut expected = b"CHUNK:".to_vec();
        expected.extend_from_slice(&1024u32.to_le_bytes());
        expected.extend_from_slice(&[0xDE, 0xAD]);
        expected.push(b'\n');
        assert_eq!(handle.written(), expected);
    }

    #[test]
    fn test_chunk_rejected_outside_update_session() {
        let (mut device, _) = connected_device();
        assert_eq!(device.device_state(), DeviceState::Idle);
        assert!(!device.send_firmware_chunk(b"data", 0));
    }

    #[test]
    fn test_timeout_releases_slot_and_drains_queue() {
        let (mut device, handle) = ready_device();

        assert!(device.send_firmware_chunk(b"aaaa", 0));
        assert!(device.send_firmware_chunk(b"bbbb", 4));
        assert_eq!(handle.written().iter().filter(|&&b| b == b'\n').count(), 1);

        let events = device.poll(Instant::now() + Duration::from_secs(4));
        assert!(events
            .iter()
            .any(|e| matches!(e, DeviceEvent::Log(LogLevel::Warning, m) if m.contains("timeout") || m.contains("Timeout"))));
        // Queue head went out after the timeout released the slot.
        assert_eq!(handle.written().iter().filter(|&&b| b == b'\n').count(), 2);
    }

    #[test]
    fn test_state_lines_update_device_state() {
        let (mut device, handle) = connected_device();

        for (line, state) in [
            (&b"STATE:READY\n"[..], DeviceState::Ready),
            (&b"STATE:UPDATING\n"[..], DeviceState::Updating),
            (&b"STATE:REBOOTING\n"[..], DeviceState::Rebooting),
            (&b"STATE:IDLE\n"[..], DeviceState::Idle),
        ] {
            handle.push_inbound(line);
            let events = device.poll(Instant::now());
            assert!(events.contains(&DeviceEvent::DeviceStateChanged(state)));
            assert_eq!(device.device_state(), state);
        }
    }

    #[test]
    fn test_cr_tolerated_on_input() {
        let (mut device, handle) = connected_device();
        handle.push_inbound(b"STATE:READY\r\n");
        let events = device.poll(Instant::now());
        assert!(events.contains(&DeviceEvent::DeviceStateChanged(DeviceState::Ready)));
    }

    #[test]
    fn test_line_split_across_reads() {
        let (mut device, handle) = connected_device();
        handle.push_inbound(b"STA");
        handle.push_inbound(b"TE:REA");
        let events = device.poll(Instant::now());
        assert!(!events
            .iter()
            .any(|e| matches!(e, DeviceEvent::DeviceStateChanged(_))));

        handle.push_inbound(b"DY\n");
        let events = device.poll(Instant::now());
        assert!(events.contains(&DeviceEvent::DeviceStateChanged(DeviceState::Ready)));
    }

    #[test]
    fn test_malformed_lines_logged_and_discarded() {
        let (mut device, handle) = connected_device();
        handle.push_inbound(b"STATE:BOGUS\nGARBAGE LINE\n");
        let events = device.poll(Instant::now());

        let errors: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::Log(LogLevel::Error, _)))
            .collect();
        assert_eq!(errors.len(), 2);
        // Connection survives malformed traffic.
        assert!(device.is_connected());
        assert_eq!(device.device_state(), DeviceState::Idle);
    }

    #[test]
    fn test_error_lines_surface_at_level_error() {
        let (mut device, handle) = connected_device();
        handle.push_inbound(b"ERROR:flash write failed\n");
        let events = device.poll(Instant::now());
        assert!(events.iter().any(
            |e| matches!(e, DeviceEvent::Log(LogLevel::Error, m) if m.contains("flash write failed"))
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (mut device, handle) = ready_device();
        assert!(device.send_firmware_chunk(b"aaaa", 0));
        assert!(device.send_firmware_chunk(b"bbbb", 4));

        device.disconnect();
        let events = device.poll(Instant::now());
        let disconnects = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    DeviceEvent::ConnectionStatusChanged(ConnectionStatus::Disconnected)
                )
            })
            .count();
        assert_eq!(disconnects, 1);
        assert!(!device.is_connected());
        assert!(!handle.is_open());

        // Second disconnect produces no further events.
        device.disconnect();
        assert!(device.poll(Instant::now()).is_empty());
    }

    #[test]
    fn test_read_error_surfaces_error_status() {
        let (mut device, handle) = connected_device();
        handle.break_link();
        let events = device.poll(Instant::now());
        assert!(events.contains(&DeviceEvent::ConnectionStatusChanged(
            ConnectionStatus::Error
        )));
        assert!(!device.is_connected());
    }

    #[test]
    fn test_cancel_update_resets_state() {
        let (mut device, handle) = ready_device();
        handle.push_inbound(b"STATE:UPDATING\n");
        device.poll(Instant::now());

        assert!(device.cancel_update());
        assert_eq!(device.device_state(), DeviceState::Idle);
        let events = device.poll(Instant::now());
        assert!(events.contains(&DeviceEvent::DeviceStateChanged(DeviceState::Idle)));
    }

    #[test]
    fn test_write_failure_rejects_request() {
        let (mut device, handle) = ready_device();
        handle.fail_writes();

        assert!(!device.send_firmware_chunk(b"data", 0));
        let events = device.poll(Instant::now());
        assert!(events
            .iter()
            .any(|e| matches!(e, DeviceEvent::Log(LogLevel::Error, _))));
    }

    #[test]
    fn test_optimal_chunk_size() {
        let (link, _) = MockLink::new();
        let device = SerialDevice::new(link, "/dev/ttyUSB0");
        assert_eq!(device.optimal_chunk_size(), 1024);
    }
}
