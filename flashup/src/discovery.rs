//! Transport factories and device discovery.
//!
//! A factory knows how to find device endpoints of one transport family and
//! how to construct a transport for a previously reported id. The
//! orchestrator consults every registered factory on
//! [`crate::FlashUpCore::discover_devices`].

use crate::device::{DeviceTransport, NetworkDevice, SerialDevice};
use crate::device::network::DEFAULT_PORT;
use log::debug;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// One endpoint reported by a factory scan.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Stable id, `<scheme>:<address>[:<port>]`.
    pub device_id: String,
    /// Informational descriptor; never drives logic.
    pub info: BTreeMap<String, String>,
}

/// A source of discoverable devices plus a constructor for their transports.
pub trait TransportFactory {
    /// Short family name for logs.
    fn name(&self) -> &'static str;

    /// Enumerate currently visible endpoints.
    fn scan(&self) -> Vec<DiscoveredDevice>;

    /// Construct a transport for a device id this factory's scheme covers.
    /// Returns `None` for ids belonging to other factories.
    fn open(&self, device_id: &str) -> Option<Rc<RefCell<dyn DeviceTransport>>>;
}

/// Known USB-to-UART bridge chips, for friendlier descriptions.
const KNOWN_BRIDGES: &[(u16, &str)] = &[
    (0x1A86, "CH340 USB-Serial"),
    (0x10C4, "CP210x USB-Serial"),
    (0x0403, "FTDI USB-Serial"),
    (0x067B, "PL2303 USB-Serial"),
];

fn bridge_description(vid: u16) -> Option<&'static str> {
    KNOWN_BRIDGES
        .iter()
        .find(|(known, _)| *known == vid)
        .map(|(_, name)| *name)
}

/// Discovers serial endpoints through the host's port enumeration.
#[derive(Debug, Default)]
pub struct SerialFactory;

impl SerialFactory {
    /// A factory scanning the host's serial ports.
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for SerialFactory {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn scan(&self) -> Vec<DiscoveredDevice> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                debug!("Failed to enumerate serial ports: {e}");
                return Vec::new();
            }
        };

        ports
            .into_iter()
            .map(|port| {
                let mut info = BTreeMap::new();
                info.insert("type".to_string(), "Serial".to_string());
                info.insert("port".to_string(), port.port_name.clone());
                info.insert("protocol".to_string(), "flashup-serial".to_string());

                if let serialport::SerialPortType::UsbPort(usb) = &port.port_type {
                    let description = usb
                        .product
                        .clone()
                        .or_else(|| bridge_description(usb.vid).map(str::to_string));
                    if let Some(description) = description {
                        info.insert("description".to_string(), description);
                    }
                }

                DiscoveredDevice {
                    device_id: format!("serial:{}", port.port_name),
                    info,
                }
            })
            .collect()
    }

    fn open(&self, device_id: &str) -> Option<Rc<RefCell<dyn DeviceTransport>>> {
        let port = device_id.strip_prefix("serial:")?;
        Some(Rc::new(RefCell::new(SerialDevice::open_port(port))))
    }
}

/// Serves explicitly registered network endpoints.
///
/// Network discovery proper (mDNS and friends) is out of scope; hosts enter
/// through configuration or the command line.
#[derive(Debug, Default)]
pub struct NetworkFactory {
    hosts: Vec<(String, u16)>,
}

impl NetworkFactory {
    /// A factory with no registered hosts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device endpoint.
    pub fn add_host(&mut self, address: impl Into<String>, port: u16) {
        let address = address.into();
        if !self.hosts.iter().any(|(a, p)| *a == address && *p == port) {
            self.hosts.push((address, port));
        }
    }

    /// Parse `host[:port]`, defaulting to the conventional agent port.
    pub fn parse_host_spec(spec: &str) -> Option<(String, u16)> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        match spec.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                port.parse().ok().map(|port| (host.to_string(), port))
            }
            _ => Some((spec.to_string(), DEFAULT_PORT)),
        }
    }
}

impl TransportFactory for NetworkFactory {
    fn name(&self) -> &'static str {
        "network"
    }

    fn scan(&self) -> Vec<DiscoveredDevice> {
        self.hosts
            .iter()
            .map(|(address, port)| {
                let mut info = BTreeMap::new();
                info.insert("type".to_string(), "Network".to_string());
                info.insert("ip".to_string(), address.clone());
                info.insert("port".to_string(), port.to_string());
                info.insert("protocol".to_string(), "flashup-net".to_string());

                DiscoveredDevice {
                    device_id: format!("net:{address}:{port}"),
                    info,
                }
            })
            .collect()
    }

    fn open(&self, device_id: &str) -> Option<Rc<RefCell<dyn DeviceTransport>>> {
        let rest = device_id.strip_prefix("net:")?;
        let (address, port) = rest.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        Some(Rc::new(RefCell::new(NetworkDevice::open_host(
            address, port,
        ))))
    }
}
