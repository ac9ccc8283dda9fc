//! Length-prefixed JSON network transport.
//!
//! Every message on the wire is framed as:
//!
//! ```text
//! [ 4 bytes little-endian u32 = N ][ N bytes: UTF-8 JSON header, then optional binary data ]
//! ```
//!
//! Requests carry `{"command": "<cmd>", "data_size": <n>}` with the binary
//! tail (if any) immediately following the header inside the same frame.
//! Responses carry `{"status": "ok"|"error", ...}` plus optional `info`
//! (with a `state` field) or `update_status` (with `action` and `success`)
//! bodies. Partial frames stay buffered until the rest arrives; malformed
//! frames are logged and dropped without tearing the connection down.

use crate::device::{ConnectionStatus, DeviceEvent, DeviceState, DeviceTransport, LogLevel};
use crate::error::{Error, Result};
use crate::link::{Link, TcpLink};
use byteorder::{ByteOrder, LittleEndian};
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Default TCP port of the on-device update agent.
pub const DEFAULT_PORT: u16 = 8266;

/// Per-request response timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Chunk size the framed protocol moves comfortably.
const CHUNK_SIZE: u64 = 4096;

/// Read size per poll iteration.
const READ_BLOCK: usize = 1024;

/// Parsed response header.
#[derive(Debug, Deserialize)]
struct Response {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    info: Option<InfoBody>,
    #[serde(default)]
    update_status: Option<UpdateStatusBody>,
}

#[derive(Debug, Deserialize)]
struct InfoBody {
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateStatusBody {
    action: String,
    success: bool,
}

/// Network update transport, generic over the underlying [`Link`].
pub struct NetworkDevice<L: Link> {
    link: L,
    address: String,
    port: u16,
    status: ConnectionStatus,
    state: DeviceState,
    buffer: Vec<u8>,
    pending: VecDeque<Vec<u8>>,
    in_flight: Option<Instant>,
    events: VecDeque<DeviceEvent>,
}

impl NetworkDevice<TcpLink> {
    /// Transport for a TCP update agent at `address:port`.
    pub fn open_host(address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        Self::new(TcpLink::new(&address, port), address, port)
    }
}

impl<L: Link> NetworkDevice<L> {
    /// Build a transport over an arbitrary link.
    pub fn new(link: L, address: impl Into<String>, port: u16) -> Self {
        Self {
            link,
            address: address.into(),
            port,
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

    /// `[len:4][{"command":...,"data_size":...}][data]`
    fn encode_request(cmd: &str, data: &[u8]) -> Vec<u8> {
        let header = if data.is_empty() {
            serde_json::json!({ "command": cmd })
        } else {
            serde_json::json!({ "command": cmd, "data_size": data.len() })
        };
        let header = serde_json::to_vec(&header).expect("request header is serializable");

        let total = header.len() + data.len();
        let mut out = Vec::with_capacity(4 + total);
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        out
    }

    /// An `update` request with an embedded action body.
    fn encode_update_action(action: serde_json::Value, binary: &[u8]) -> Vec<u8> {
        let mut data = serde_json::to_vec(&action).expect("action body is serializable");
        if !binary.is_empty() {
            data.push(b'\n');
            data.extend_from_slice(binary);
        }
        Self::encode_request("update", &data)
    }

    fn send_request(&mut self, request: Vec<u8>) -> bool {
        if !self.link.is_open() {
            return false;
        }

        if self.in_flight.is_some() {
            self.pending.push_back(request);
            return true;
        }

        self.transmit(request)
    }

    fn transmit(&mut self, request: Vec<u8>) -> bool {
        if let Err(e) = self.link.write_all(&request) {
            self.log(LogLevel::Error, format!("Failed to write request: {e}"));
            return false;
        }
        self.in_flight = Some(Instant::now() + REQUEST_TIMEOUT);
        true
    }

    fn send_next(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        if let Some(request) = self.pending.pop_front() {
            self.transmit(request);
        }
    }

    fn in_update_session(&self) -> bool {
        matches!(self.state, DeviceState::Ready | DeviceState::Updating)
    }

    /// Pull complete frames out of the rolling receive buffer.
    fn process_buffer(&mut self) {
        while self.buffer.len() >= 4 {
            let frame_len = LittleEndian::read_u32(&self.buffer[..4]) as usize;
            if self.buffer.len() < 4 + frame_len {
                // Partial frame, wait for more bytes.
                return;
            }

            let frame: Vec<u8> = self.buffer.drain(..4 + frame_len).skip(4).collect();
            self.handle_frame(&frame);
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let response: Response = match serde_json::from_slice(frame) {
            Ok(response) => response,
            Err(_) => {
                self.log(
                    LogLevel::Error,
                    Error::ProtocolError("received invalid JSON response".into()).to_string(),
                );
                return;
            }
        };

        if response.status != "ok" {
            let reason = response.error.unwrap_or_else(|| "unspecified".to_string());
            self.log(LogLevel::Error, Error::DeviceError(reason).to_string());
            self.in_flight = None;
            self.send_next();
            return;
        }

        self.in_flight = None;

        if let Some(info) = response.info {
            if let Some(state) = info.state.as_deref() {
                match state {
                    "idle" => self.set_state(DeviceState::Idle),
                    "ready" => self.set_state(DeviceState::Ready),
                    "updating" => self.set_state(DeviceState::Updating),
                    "rebooting" => self.set_state(DeviceState::Rebooting),
                    other => self.log(
                        LogLevel::Error,
                        Error::ProtocolError(format!("unknown device state: {other}")).to_string(),
                    ),
                }
            }
            self.log(LogLevel::Info, "Received device info");
        }

        if let Some(update) = response.update_status {
            if update.success {
                match update.action.as_str() {
                    "begin_update" => self.set_state(DeviceState::Updating),
                    "end_update" => self.set_state(DeviceState::Rebooting),
                    _ => {}
                }
            }
            self.log(
                LogLevel::Info,
                format!(
                    "Update status: {} {}",
                    update.action,
                    if update.success { "ok" } else { "failed" }
                ),
            );
        }

        self.send_next();
    }

    /// Remote side went away: reset all per-connection state.
    fn handle_remote_close(&mut self) {
        self.log(LogLevel::Info, "Device disconnected");
        self.link.close();
        self.buffer.clear();
        self.pending.clear();
        self.in_flight = None;
        self.set_status(ConnectionStatus::Disconnected);
    }
}

impl<L: Link> DeviceTransport for NetworkDevice<L> {
    fn device_id(&self) -> String {
        format!("net:{}:{}", self.address, self.port)
    }

    fn device_info(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        info.insert("type".to_string(), "Network".to_string());
        info.insert("address".to_string(), self.address.clone());
        info.insert("port".to_string(), self.port.to_string());
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
            format!("Connecting to device at {}:{}...", self.address, self.port),
        );
        self.set_status(ConnectionStatus::Connecting);

        match self.link.open() {
            Ok(()) => {
                self.log(
                    LogLevel::Info,
                    format!("Connected to device at {}:{}", self.address, self.port),
                );
                self.set_status(ConnectionStatus::Connected);
                // Ask for the device descriptor; the reply also carries the
                // device's current state.
                self.send_request(Self::encode_request("info", &[]));
                Ok(())
            }
            Err(e) => {
                self.log(LogLevel::Error, format!("Socket error: {e}"));
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
            self.log(LogLevel::Info, "Disconnected from network device");
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
        let request =
            Self::encode_update_action(serde_json::json!({ "action": "begin_update" }), &[]);
        if !self.send_request(request) {
            self.log(LogLevel::Warning, "Failed to send update begin request");
            return false;
        }
        true
    }

    fn send_firmware_chunk(&mut self, data: &[u8], offset: u64) -> bool {
        if !self.is_connected() || !self.in_update_session() {
            self.log(LogLevel::Warning, "Cannot send firmware: device not in update mode");
            return false;
        }

        let action = serde_json::json!({
            "action": "write_chunk",
            "offset": offset,
            "size": data.len(),
        });
        if !self.send_request(Self::encode_update_action(action, data)) {
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
        let request =
            Self::encode_update_action(serde_json::json!({ "action": "end_update" }), &[]);
        if !self.send_request(request) {
            self.log(LogLevel::Warning, "Failed to send update finalize request");
            return false;
        }
        true
    }

    fn cancel_update(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }

        self.log(LogLevel::Info, "Canceling firmware update...");
        let request =
            Self::encode_update_action(serde_json::json!({ "action": "cancel_update" }), &[]);
        if !self.send_request(request) {
            self.log(LogLevel::Warning, "Failed to send update cancel request");
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
                    Err(Error::Io(ref e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        self.handle_remote_close();
                        break;
                    }
                    Err(e) => {
                        self.log(LogLevel::Error, format!("Socket error: {e}"));
                        self.link.close();
                        self.set_status(ConnectionStatus::Error);
                        break;
                    }
                }
            }
            self.process_buffer();
        }

        if self.in_flight.is_some_and(|deadline| now >= deadline) {
            self.log(LogLevel::Warning, "Request timeout");
            self.in_flight = None;
            self.send_next();
        }

        self.events.drain(..).collect()
    }
}
