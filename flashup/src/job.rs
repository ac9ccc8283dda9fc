//! Update job: drives one device through a firmware update.
//!
//! ```text
//! Idle ──start──► Connecting ──connected──► Preparing ──ready──► Uploading
//!                     │                          │                    │
//!                     │ error/timeout            │ error/timeout     │ offset==size
//!                     ▼                          ▼                    ▼
//!                   Failed                    Failed             Finalizing ──rebooting──► Complete
//!                                                                     │
//!                                                                     └─ error/timeout ──► Failed
//!
//! Any non-terminal ── cancel ──► Canceled
//! ```
//!
//! A job is single-use: it binds one transport and one firmware package at
//! construction and ends in exactly one terminal state. All timing is
//! deadline-based and driven through [`UpdateJob::poll`]; the owner routes
//! the transport's events in via [`UpdateJob::handle_device_event`] and
//! fans the returned [`JobEvent`]s out.

use crate::device::{ConnectionStatus, DeviceEvent, DeviceState, DeviceTransport, LogLevel};
use crate::package::FirmwarePackage;
use log::debug;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Retries per chunk before the job gives up.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay before re-sending a rejected chunk.
const RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Pacing delay between accepted chunks. Yields the loop between sends;
/// not a rate limit.
const CHUNK_INTERVAL: Duration = Duration::from_millis(10);

/// Floor applied when a transport reports no preferred chunk size.
const FALLBACK_CHUNK_SIZE: u64 = 4096;

/// Upper bound on waiting for the device's next state report: ready after
/// `begin_update`, rebooting after `finalize_update`. Longer than any
/// transport request timeout, so the transport gets to report first.
const DEVICE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// States of an update job. `Complete`, `Failed` and `Canceled` are
/// terminal and sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Constructed, not started.
    Idle,
    /// Waiting for the transport connection.
    Connecting,
    /// Update session requested, waiting for the device to become ready.
    Preparing,
    /// Chunks are being sent.
    Uploading,
    /// All chunks sent, waiting for the device to commit and reboot.
    Finalizing,
    /// The device rebooted onto the new image.
    Complete,
    /// The update failed.
    Failed,
    /// The update was canceled.
    Canceled,
}

impl JobState {
    /// Whether the state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Canceled)
    }
}

/// Event produced by a job, to be routed to subscribers keyed by device id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Progress or status-label change.
    Progress { percent: u8, status: String },
    /// A job-level log line.
    Log { level: LogLevel, message: String },
    /// Terminal outcome; emitted exactly once, after every other event.
    Completed { success: bool, message: String },
}

/// One run of the update state machine for one device.
pub struct UpdateJob {
    device: Rc<RefCell<dyn DeviceTransport>>,
    firmware: Rc<FirmwarePackage>,
    state: JobState,
    progress: u8,
    current_offset: u64,
    chunk_size: u64,
    retry_count: u32,
    max_retries: u32,
    next_chunk_at: Option<Instant>,
    retry_at: Option<Instant>,
    state_deadline: Option<Instant>,
    events: VecDeque<JobEvent>,
}

impl UpdateJob {
    /// Bind a job to a device and a firmware package.
    pub fn new(device: Rc<RefCell<dyn DeviceTransport>>, firmware: Rc<FirmwarePackage>) -> Self {
        let mut chunk_size = device.borrow().optimal_chunk_size();
        if chunk_size == 0 {
            chunk_size = FALLBACK_CHUNK_SIZE;
        }
        let device_id = device.borrow().device_id();

        let mut job = Self {
            device,
            firmware,
            state: JobState::Idle,
            progress: 0,
            current_offset: 0,
            chunk_size,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            next_chunk_at: None,
            retry_at: None,
            state_deadline: None,
            events: VecDeque::new(),
        };
        job.log(
            LogLevel::Debug,
            format!("Update job created for device {device_id}"),
        );
        job
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Progress, 0–100.
    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Next payload offset to send. Non-decreasing, never past the payload.
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// Begin the update. Connects first when the device is not connected
    /// yet; otherwise goes straight to preparing.
    pub fn start(&mut self, now: Instant) -> Vec<JobEvent> {
        if self.state != JobState::Idle {
            self.log(LogLevel::Warning, "Update already in progress");
            return self.take_events();
        }

        self.log(LogLevel::Info, "Starting update...");
        self.set_state(JobState::Connecting);
        self.set_progress(0);

        if self.device.borrow().is_connected() {
            self.enter_preparing(now);
        } else {
            let connected = self.device.borrow_mut().connect();
            if connected.is_err() {
                self.fail("Failed to connect to device");
            }
            // On success the Connected event drives the next transition.
        }
        self.take_events()
    }

    /// Cancel from any non-terminal state; a no-op after a terminal state.
    pub fn cancel(&mut self) -> Vec<JobEvent> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        self.log(LogLevel::Info, "Canceling update...");
        self.next_chunk_at = None;
        self.retry_at = None;
        self.state_deadline = None;

        let connected = self.device.borrow().is_connected();
        if connected {
            self.device.borrow_mut().cancel_update();
        }

        self.set_state(JobState::Canceled);
        self.complete_with(false, "Update canceled");
        self.take_events()
    }

    /// React to an event from the bound transport.
    pub fn handle_device_event(&mut self, event: &DeviceEvent, now: Instant) -> Vec<JobEvent> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        match event {
            DeviceEvent::ConnectionStatusChanged(status) => {
                debug!("Device connection status: {status:?}");
                match (self.state, status) {
                    (JobState::Connecting, ConnectionStatus::Connected) => {
                        self.enter_preparing(now);
                    }
                    (JobState::Connecting, ConnectionStatus::Error) => {
                        self.fail("Failed to connect to device");
                    }
                    (
                        JobState::Preparing | JobState::Uploading | JobState::Finalizing,
                        ConnectionStatus::Disconnected | ConnectionStatus::Error,
                    ) => {
                        self.fail("Device disconnected during update");
                    }
                    _ => {}
                }
            }
            DeviceEvent::DeviceStateChanged(state) => {
                debug!("Device state: {state:?}");
                match (self.state, state) {
                    (JobState::Preparing, DeviceState::Ready | DeviceState::Updating) => {
                        self.start_upload(now);
                    }
                    (JobState::Finalizing, DeviceState::Rebooting) => {
                        self.complete();
                    }
                    _ => {}
                }
            }
            // Transport logs are routed to subscribers by the orchestrator,
            // not re-emitted here. A device-reported failure while the
            // update is actively driving the device is terminal though.
            DeviceEvent::Log(level, _) => {
                if *level == LogLevel::Error
                    && matches!(
                        self.state,
                        JobState::Preparing | JobState::Uploading | JobState::Finalizing
                    )
                {
                    self.fail("Device reported an error");
                }
            }
        }
        self.take_events()
    }

    /// Fire due timers.
    pub fn poll(&mut self, now: Instant) -> Vec<JobEvent> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        if self.retry_at.is_some_and(|at| now >= at) {
            self.retry_at = None;
            self.upload_next_chunk(now);
        }
        if self.next_chunk_at.is_some_and(|at| now >= at) {
            self.next_chunk_at = None;
            self.upload_next_chunk(now);
        }
        if self.state_deadline.is_some_and(|at| now >= at) {
            self.state_deadline = None;
            match self.state {
                JobState::Preparing => self.fail("Timed out waiting for device to become ready"),
                JobState::Finalizing => self.fail("Timed out waiting for device to reboot"),
                _ => {}
            }
        }
        self.take_events()
    }

    fn enter_preparing(&mut self, now: Instant) {
        self.set_state(JobState::Preparing);
        let accepted = self.device.borrow_mut().begin_update();
        if !accepted {
            self.fail("Failed to initialize update on device");
            return;
        }

        // The ready notification may have raced ahead of us: check the live
        // state as well as waiting for the event.
        let state = self.device.borrow().device_state();
        if matches!(state, DeviceState::Ready | DeviceState::Updating) {
            self.start_upload(now);
        } else {
            self.state_deadline = Some(now + DEVICE_STATE_TIMEOUT);
        }
    }

    fn start_upload(&mut self, now: Instant) {
        if self.state == JobState::Uploading {
            return;
        }
        self.set_state(JobState::Uploading);
        self.set_progress(0);
        self.log(LogLevel::Info, "Starting firmware upload...");

        self.state_deadline = None;
        self.current_offset = 0;
        self.retry_count = 0;
        self.upload_next_chunk(now);
    }

    fn upload_next_chunk(&mut self, now: Instant) {
        if self.state != JobState::Uploading {
            return;
        }

        if self.current_offset >= self.firmware.size() {
            self.set_state(JobState::Finalizing);
            let accepted = self.device.borrow_mut().finalize_update();
            if !accepted {
                self.fail("Failed to finalize update");
                return;
            }
            self.state_deadline = Some(now + DEVICE_STATE_TIMEOUT);
            return;
        }

        let chunk = match self.firmware.get_chunk(self.current_offset, self.chunk_size) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.fail(&format!("Failed to read firmware chunk: {e}"));
                return;
            }
        };

        let accepted = self
            .device
            .borrow_mut()
            .send_firmware_chunk(&chunk, self.current_offset);

        if accepted {
            self.current_offset += chunk.len() as u64;
            self.retry_count = 0;

            let percent = (self.current_offset * 100 / self.firmware.size()) as u8;
            self.set_progress(percent);

            self.next_chunk_at = Some(now + CHUNK_INTERVAL);
        } else if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.log(
                LogLevel::Warning,
                format!(
                    "Failed to send chunk, retrying ({}/{})...",
                    self.retry_count, self.max_retries
                ),
            );
            self.retry_at = Some(now + RETRY_INTERVAL);
        } else {
            self.fail("Failed to send firmware chunk after maximum retries");
        }
    }

    fn fail(&mut self, reason: &str) {
        self.log(LogLevel::Error, format!("Update failed: {reason}"));
        self.next_chunk_at = None;
        self.retry_at = None;
        self.state_deadline = None;
        self.set_state(JobState::Failed);
        self.complete_with(false, reason);
    }

    fn complete(&mut self) {
        self.log(LogLevel::Info, "Update completed successfully");
        self.set_state(JobState::Complete);
        self.complete_with(true, "Firmware updated successfully");
    }

    fn complete_with(&mut self, success: bool, message: &str) {
        self.events.push_back(JobEvent::Completed {
            success,
            message: message.to_string(),
        });
    }

    fn set_state(&mut self, state: JobState) {
        if self.state == state {
            return;
        }
        self.state = state;
        let status = self.status_label();
        self.events.push_back(JobEvent::Progress {
            percent: self.progress,
            status: status.clone(),
        });
        self.log(LogLevel::Info, format!("Update state: {status}"));
    }

    fn set_progress(&mut self, percent: u8) {
        if self.progress == percent {
            return;
        }
        self.progress = percent;
        self.events.push_back(JobEvent::Progress {
            percent,
            status: self.status_label(),
        });
    }

    fn status_label(&self) -> String {
        match self.state {
            JobState::Idle => "Idle".to_string(),
            JobState::Connecting => "Connecting to device".to_string(),
            JobState::Preparing => "Preparing device".to_string(),
            JobState::Uploading => format!("Uploading firmware ({}%)", self.progress),
            JobState::Finalizing => "Finalizing update".to_string(),
            JobState::Complete => "Update complete".to_string(),
            JobState::Failed => "Update failed".to_string(),
            JobState::Canceled => "Update canceled".to_string(),
        }
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.events.push_back(JobEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn take_events(&mut self) -> Vec<JobEvent> {
        self.events.drain(..).collect()
    }
}
