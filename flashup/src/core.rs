//! Core orchestrator: known devices, the loaded firmware, active jobs and
//! the event stream to subscribers.
//!
//! The orchestrator never panics or returns errors for device-side
//! failures; it records them and emits events. Only firmware parsing
//! reports synchronously, through [`FlashUpCore::load_firmware`].

use crate::device::{DeviceEvent, DeviceTransport, LogLevel};
use crate::discovery::TransportFactory;
use crate::error::Result;
use crate::job::{JobEvent, UpdateJob};
use crate::package::FirmwarePackage;
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::rc::Rc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Pause between pump iterations in the blocking driver.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Event delivered to subscribers, in publish order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// A factory scan reported an endpoint.
    DeviceDiscovered {
        device_id: String,
        info: BTreeMap<String, String>,
    },
    /// A previously known endpoint disappeared from scans.
    DeviceLost { device_id: String },
    /// Progress for an active update, keyed by device.
    UpdateProgress {
        device_id: String,
        percent: u8,
        status: String,
    },
    /// Terminal outcome of an update, keyed by device.
    UpdateComplete {
        device_id: String,
        success: bool,
        message: String,
    },
    /// A protocol- or job-level log line.
    Log { level: LogLevel, message: String },
}

/// The update engine's front door.
///
/// Single-threaded and poll-driven: call [`FlashUpCore::pump`] from the
/// owning event loop, or [`FlashUpCore::run_until_idle`] to block until all
/// jobs finish.
pub struct FlashUpCore {
    factories: Vec<Box<dyn TransportFactory>>,
    devices: BTreeMap<String, Rc<RefCell<dyn DeviceTransport>>>,
    firmware: Option<Rc<FirmwarePackage>>,
    jobs: BTreeMap<String, UpdateJob>,
    subscribers: Vec<mpsc::Sender<CoreEvent>>,
}

impl FlashUpCore {
    /// An orchestrator with no transport factories registered yet.
    pub fn new() -> Self {
        info!("FlashUp core initialized");
        Self {
            factories: Vec::new(),
            devices: BTreeMap::new(),
            firmware: None,
            jobs: BTreeMap::new(),
            subscribers: Vec::new(),
        }
    }

    /// Register a transport factory consulted by discovery.
    pub fn register_factory(&mut self, factory: Box<dyn TransportFactory>) {
        debug!("Registered transport factory: {}", factory.name());
        self.factories.push(factory);
    }

    /// Open a subscription to the event stream. Events are delivered in
    /// publish order; dropped receivers are pruned automatically.
    pub fn subscribe(&mut self) -> mpsc::Receiver<CoreEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Run every factory scan, create transports for new endpoints and drop
    /// vanished ones (devices with an active job are kept regardless).
    pub fn discover_devices(&mut self) {
        self.log(LogLevel::Info, "Starting device discovery...");

        let mut seen = BTreeSet::new();
        let mut found = Vec::new();

        for i in 0..self.factories.len() {
            let discovered = self.factories[i].scan();
            for device in discovered {
                seen.insert(device.device_id.clone());
                if !self.devices.contains_key(&device.device_id) {
                    let transport = self.factories[i].open(&device.device_id);
                    if let Some(transport) = transport {
                        self.devices.insert(device.device_id.clone(), transport);
                    }
                }
                found.push(device);
            }
        }

        let stale: Vec<String> = self
            .devices
            .keys()
            .filter(|id| !seen.contains(*id) && !self.jobs.contains_key(*id))
            .cloned()
            .collect();
        for device_id in stale {
            self.devices.remove(&device_id);
            self.emit(CoreEvent::DeviceLost { device_id });
        }

        let count = found.len();
        for device in found {
            self.emit(CoreEvent::DeviceDiscovered {
                device_id: device.device_id,
                info: device.info,
            });
        }
        self.log(LogLevel::Info, format!("Found {count} devices"));
    }

    /// Ids of all known devices.
    pub fn available_devices(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Descriptor of a known device, including its live `status`.
    pub fn device_info(&self, device_id: &str) -> Option<BTreeMap<String, String>> {
        self.devices
            .get(device_id)
            .map(|device| device.borrow().device_info())
    }

    /// Parse and validate a firmware container, keeping it as the loaded
    /// package. Returns its metadata.
    pub fn load_firmware<P: AsRef<Path>>(
        &mut self,
        path: P,
    ) -> Result<BTreeMap<String, String>> {
        let path = path.as_ref();
        self.log(LogLevel::Info, format!("Loading firmware from {}", path.display()));

        match FirmwarePackage::from_file(path) {
            Ok(package) => {
                let metadata = package.metadata();
                self.log(
                    LogLevel::Info,
                    format!(
                        "Loaded firmware: {} v{}",
                        metadata.get("name").map(String::as_str).unwrap_or("?"),
                        metadata.get("version").map(String::as_str).unwrap_or("?"),
                    ),
                );
                self.firmware = Some(Rc::new(package));
                Ok(metadata)
            }
            Err(e) => {
                self.log(LogLevel::Error, format!("Failed to load firmware: {e}"));
                self.firmware = None;
                Err(e)
            }
        }
    }

    /// Metadata of the currently loaded firmware, if any.
    pub fn firmware_info(&self) -> Option<BTreeMap<String, String>> {
        self.firmware.as_ref().map(|fw| fw.metadata())
    }

    /// Start an update for a device. Loads `firmware_path` first when given;
    /// an already-active job for the device is canceled and replaced.
    ///
    /// Returns whether a job was started; failures after this point surface
    /// through `UpdateComplete` events.
    pub fn update_firmware(&mut self, device_id: &str, firmware_path: Option<&Path>) -> bool {
        if self.jobs.contains_key(device_id) {
            self.cancel_update(device_id);
        }

        if let Some(path) = firmware_path {
            if self.load_firmware(path).is_err() {
                self.log(LogLevel::Error, "Failed to load firmware file");
                return false;
            }
        }

        let Some(firmware) = self.firmware.clone() else {
            self.log(LogLevel::Error, "No firmware loaded");
            return false;
        };

        let Some(device) = self.devices.get(device_id).cloned() else {
            self.log(LogLevel::Error, format!("Unknown device: {device_id}"));
            return false;
        };

        let mut job = UpdateJob::new(device, firmware);
        let events = job.start(Instant::now());
        self.jobs.insert(device_id.to_string(), job);
        self.route_job_events(device_id, events);

        self.log(
            LogLevel::Info,
            format!("Started firmware update for device {device_id}"),
        );
        true
    }

    /// Cancel the active job for a device, if any.
    pub fn cancel_update(&mut self, device_id: &str) -> bool {
        if !self.jobs.contains_key(device_id) {
            self.log(
                LogLevel::Warning,
                format!("No active update job for device {device_id}"),
            );
            return false;
        }

        self.log(LogLevel::Info, format!("Canceling update for device {device_id}"));
        let job = self.jobs.get_mut(device_id).unwrap();
        let events = job.cancel();
        self.route_job_events(device_id, events);
        true
    }

    /// Whether any update job is still running.
    pub fn has_active_jobs(&self) -> bool {
        !self.jobs.is_empty()
    }

    /// One reactor step: poll transports, route their events to jobs and
    /// subscribers, then fire due job timers.
    pub fn pump(&mut self, now: Instant) {
        let device_ids: Vec<String> = self.devices.keys().cloned().collect();
        for device_id in device_ids {
            let events = match self.devices.get(&device_id) {
                Some(device) => device.borrow_mut().poll(now),
                None => continue,
            };
            for event in events {
                if let DeviceEvent::Log(level, message) = &event {
                    self.emit(CoreEvent::Log {
                        level: *level,
                        message: message.clone(),
                    });
                }
                let job_events = self
                    .jobs
                    .get_mut(&device_id)
                    .map(|job| job.handle_device_event(&event, now));
                if let Some(job_events) = job_events {
                    self.route_job_events(&device_id, job_events);
                }
            }
        }

        let job_ids: Vec<String> = self.jobs.keys().cloned().collect();
        for device_id in job_ids {
            let events = self
                .jobs
                .get_mut(&device_id)
                .map(|job| job.poll(now))
                .unwrap_or_default();
            self.route_job_events(&device_id, events);
        }
    }

    /// Pump until no job is active. Intended for headless drivers and tests.
    pub fn run_until_idle(&mut self) {
        while self.has_active_jobs() {
            self.pump(Instant::now());
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    fn route_job_events(&mut self, device_id: &str, events: Vec<JobEvent>) {
        for event in events {
            match event {
                JobEvent::Progress { percent, status } => {
                    self.emit(CoreEvent::UpdateProgress {
                        device_id: device_id.to_string(),
                        percent,
                        status,
                    });
                }
                JobEvent::Log { level, message } => {
                    self.emit(CoreEvent::Log { level, message });
                }
                JobEvent::Completed { success, message } => {
                    // The job is finished; release it before telling the world.
                    self.jobs.remove(device_id);
                    self.emit(CoreEvent::UpdateComplete {
                        device_id: device_id.to_string(),
                        success,
                        message,
                    });
                }
            }
        }
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.emit(CoreEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn emit(&mut self, event: CoreEvent) {
        if let CoreEvent::Log { level, message } = &event {
            match level {
                LogLevel::Debug => debug!("{message}"),
                LogLevel::Info => info!("{message}"),
                LogLevel::Warning => warn!("{message}"),
                LogLevel::Error => error!("{message}"),
            }
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for FlashUpCore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FlashUpCore {
    fn drop(&mut self) {
        // Cancel jobs first, then transports drop and disconnect.
        let active: Vec<String> = self.jobs.keys().cloned().collect();
        for device_id in active {
            self.cancel_update(&device_id);
        }
    }
}
