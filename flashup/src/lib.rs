//! # flashup
//!
//! A library for updating device firmware over serial and network
//! transports.
//!
//! This crate provides the core of the FlashUp updater:
//!
//! - FLASHUP firmware container parsing and writing (SHA-256 verified)
//! - A transport capability with serial (line protocol) and network
//!   (length-prefixed JSON) implementations
//! - An update job state machine with chunked upload, pacing, bounded
//!   retries and cancellation
//! - An orchestrator that tracks devices, runs jobs and fans out
//!   progress/log/completion events
//!
//! The whole engine is single-threaded and poll-driven: transports, timers
//! and jobs are all advanced by pumping the orchestrator from one event
//! loop.
//!
//! ## Example
//!
//! ```rust,no_run
//! use flashup::{FlashUpCore, CoreEvent, SerialFactory};
//!
//! fn main() -> flashup::Result<()> {
//!     let mut core = FlashUpCore::new();
//!     core.register_factory(Box::new(SerialFactory::new()));
//!
//!     let events = core.subscribe();
//!     core.discover_devices();
//!
//!     core.load_firmware("firmware.fup")?;
//!     core.update_firmware("serial:/dev/ttyUSB0", None);
//!     core.run_until_idle();
//!
//!     for event in events.try_iter() {
//!         if let CoreEvent::UpdateComplete { success, message, .. } = event {
//!             println!("{message} (success: {success})");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod core;
pub mod device;
pub mod discovery;
pub mod error;
pub mod job;
pub mod link;
pub mod package;

pub use {
    crate::core::{CoreEvent, FlashUpCore},
    device::{
        ConnectionStatus, DeviceEvent, DeviceState, DeviceTransport, LogLevel, NetworkDevice,
        SerialDevice,
    },
    discovery::{DiscoveredDevice, NetworkFactory, SerialFactory, TransportFactory},
    error::{Error, Result},
    job::{JobEvent, JobState, UpdateJob},
    link::{Link, SerialLink, TcpLink},
    package::{
        writer::{encode_package, write_package},
        FirmwarePackage, SignatureStatus,
    },
};
