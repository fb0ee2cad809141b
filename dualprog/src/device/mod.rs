//! Device discovery and pairing.
//!
//! Two buses are involved: the SWD probe enumerates on USB, the UART
//! control adapter enumerates as an OS serial port. Both come and go as the
//! board's relays re-route lines, so discovery always returns a fresh
//! snapshot and the pairing heuristic is isolated in [`pair`].

#[cfg(feature = "native")]
pub mod usb;

use {
    crate::error::{Error, Result},
    log::{debug, info, warn},
    serde::Serialize,
    std::fmt,
};

#[cfg(feature = "native")]
use log::trace;

/// USB vendor id of ST-Link probes.
pub const STLINK_VID: u16 = 0x0483;

/// Supported ST-Link product ids and their hardware generation.
pub const KNOWN_PROBES: &[(u16, ProbeModel)] = &[
    (0x3748, ProbeModel::V2),
    (0x374B, ProbeModel::V2_1),
    (0x374D, ProbeModel::V2_1),
    (0x374E, ProbeModel::V3),
    (0x374F, ProbeModel::V3),
];

/// USB vendor/product id of the board's UART adapter (CH340).
pub const UART_VID_PID: (u16, u16) = (0x1A86, 0x7523);

/// ST-Link hardware generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProbeModel {
    /// ST-Link/V2.
    V2,
    /// ST-Link/V2-1 (Nucleo/Discovery on-board).
    V2_1,
    /// STLINK-V3.
    V3,
}

impl ProbeModel {
    /// Look up the model of a supported probe.
    pub fn from_vid_pid(vid: u16, pid: u16) -> Option<Self> {
        if vid != STLINK_VID {
            return None;
        }
        KNOWN_PROBES
            .iter()
            .find(|(known, _)| *known == pid)
            .map(|(_, model)| *model)
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::V2 => "V2",
            Self::V2_1 => "V2-1",
            Self::V3 => "V3",
        }
    }
}

/// One SWD probe as seen during one enumeration pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeDevice {
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// Serial number string descriptor, when readable.
    pub serial: Option<String>,
    /// USB bus number.
    pub bus: Option<u8>,
    /// USB device address.
    pub address: Option<u8>,
}

impl ProbeDevice {
    /// Display name, e.g. `ST-Link 0483:374B SN:066DFF`.
    pub fn name(&self) -> String {
        let mut name = format!("ST-Link {:04X}:{:04X}", self.vid, self.pid);
        if let Some(serial) = &self.serial {
            name.push_str(" SN:");
            name.push_str(serial);
        }
        name
    }

    /// Stable identity used to remember which port belongs to this probe.
    ///
    /// The serial number survives re-plugging; the bus/address fallback only
    /// lasts until the probe re-enumerates.
    pub fn identity_key(&self) -> String {
        match &self.serial {
            Some(serial) => format!("serial:{serial}"),
            None => format!(
                "vidpid:{:04X}:{:04X}:bus{}:addr{}",
                self.vid,
                self.pid,
                self.bus.map_or_else(|| "?".to_string(), |b| b.to_string()),
                self.address.map_or_else(|| "?".to_string(), |a| a.to_string()),
            ),
        }
    }

    /// Hardware generation, if the product id is known.
    pub fn model(&self) -> Option<ProbeModel> {
        ProbeModel::from_vid_pid(self.vid, self.pid)
    }
}

impl fmt::Display for ProbeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// One serial port candidate for the UART control channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SerialPortInfo {
    /// OS port name (e.g. "/dev/ttyUSB0", "COM3").
    pub name: String,
    /// Hardware id string, `USB VID:PID=1A86:7523 SER=... LOCATION=...`.
    pub hwid: String,
    /// USB vendor id, when the port is a USB device.
    pub vid: Option<u16>,
    /// USB product id, when the port is a USB device.
    pub pid: Option<u16>,
    /// USB serial number.
    pub serial: Option<String>,
    /// Human-readable description (product string).
    pub description: Option<String>,
}

impl SerialPortInfo {
    /// Whether this port is the board's UART adapter.
    pub fn is_target_uart(&self) -> bool {
        let (vid, pid) = UART_VID_PID;
        if let (Some(v), Some(p)) = (self.vid, self.pid) {
            return v == vid && p == pid;
        }
        self.hwid
            .to_uppercase()
            .contains(&format!("VID:PID={vid:04X}:{pid:04X}"))
    }
}

/// Build a pyserial-style hardware id string for a USB serial port.
pub fn format_hwid(vid: u16, pid: u16, serial: Option<&str>, location: &str) -> String {
    let mut hwid = format!("USB VID:PID={vid:04X}:{pid:04X}");
    if let Some(serial) = serial {
        hwid.push_str(" SER=");
        hwid.push_str(serial);
    }
    if !location.is_empty() {
        hwid.push_str(" LOCATION=");
        hwid.push_str(location);
    }
    hwid
}

/// A probe together with the UART port believed to be wired to the same
/// board.
#[derive(Debug, Clone)]
pub struct DevicePairing {
    /// The probe.
    pub probe: ProbeDevice,
    /// The paired port, `None` when it could not be decided.
    pub port: Option<SerialPortInfo>,
}

/// Signals that tie a serial port to a probe, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingRule {
    /// Serial numbers contain one another.
    Serial,
    /// The probe's bus number appears in the port's hardware id.
    Bus,
    /// The probe's device address appears in the port's hardware id.
    Address,
    /// The port description names the probe brand.
    Description,
}

impl PairingRule {
    const ORDER: [Self; 4] = [Self::Serial, Self::Bus, Self::Address, Self::Description];

    fn matches(self, probe: &ProbeDevice, port: &SerialPortInfo) -> bool {
        let hwid = port.hwid.to_uppercase();
        match self {
            Self::Serial => match (&probe.serial, &port.serial) {
                (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => {
                    let (a, b) = (a.to_lowercase(), b.to_lowercase());
                    a.contains(&b) || b.contains(&a)
                },
                _ => false,
            },
            Self::Bus => probe.bus.is_some_and(|bus| {
                [
                    format!(":{bus:03}."),
                    format!(":{bus:03}:"),
                    format!("BUS{bus:03}"),
                    format!("BUS{bus}"),
                    format!("BUS {bus}"),
                ]
                .iter()
                .any(|p| hwid.contains(p.as_str()))
            }),
            Self::Address => probe.address.is_some_and(|addr| {
                [
                    format!(":{addr:03}."),
                    format!(":{addr:03}:"),
                    format!("ADDR{addr:03}"),
                ]
                .iter()
                .any(|p| hwid.contains(p.as_str()))
            }),
            Self::Description => port.description.as_ref().is_some_and(|d| {
                let d = d.to_uppercase();
                d.contains("ST-LINK") || d.contains("STLINK")
            }),
        }
    }
}

/// Pick the UART candidate wired to `probe`.
///
/// Rules are tried in [`PairingRule`] order. A rule that matches exactly one
/// candidate decides; a rule matching several narrows the pool for the
/// following rules. Without a deciding signal a single candidate is
/// returned as is and several candidates yield `None`: the caller must ask
/// for a manual choice.
pub fn pair(probe: &ProbeDevice, candidates: &[SerialPortInfo]) -> Option<SerialPortInfo> {
    let mut pool: Vec<&SerialPortInfo> = candidates.iter().collect();

    for rule in PairingRule::ORDER {
        let matched: Vec<&SerialPortInfo> = pool
            .iter()
            .copied()
            .filter(|port| rule.matches(probe, port))
            .collect();
        match matched.len() {
            0 => {},
            1 => {
                info!("Paired {} with {} by {rule:?}", probe.name(), matched[0].name);
                return Some(matched[0].clone());
            },
            n => {
                debug!("{rule:?} rule matched {n} ports, narrowing");
                pool = matched;
            },
        }
    }

    match candidates {
        [only] => {
            info!("Using the only UART adapter: {}", only.name);
            Some(only.clone())
        },
        [] => None,
        many => {
            warn!(
                "{} UART adapters match {:04X}:{:04X} and none is linked to {}; select the port manually",
                many.len(),
                UART_VID_PID.0,
                UART_VID_PID.1,
                probe.name()
            );
            None
        },
    }
}

/// Source of probe and serial port snapshots.
pub trait DeviceSource {
    /// Enumerate supported probes in bus order.
    fn probes(&self) -> Result<Vec<ProbeDevice>>;

    /// Enumerate every serial port.
    fn serial_ports(&self) -> Result<Vec<SerialPortInfo>>;
}

/// Discovery, probe selection and pairing over a [`DeviceSource`].
pub struct DeviceRegistry<S> {
    source: S,
}

impl<S: DeviceSource> DeviceRegistry<S> {
    /// Wrap a device source.
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// The underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Enumerate supported probes. No probe is an empty list.
    pub fn discover_probes(&self) -> Result<Vec<ProbeDevice>> {
        self.source.probes()
    }

    /// Enumerate serial ports that carry the board's UART adapter signature.
    pub fn discover_uart_candidates(&self) -> Vec<SerialPortInfo> {
        let ports = match self.source.serial_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!("Failed to enumerate serial ports: {e}");
                return Vec::new();
            },
        };
        let candidates: Vec<SerialPortInfo> = ports
            .into_iter()
            .filter(SerialPortInfo::is_target_uart)
            .collect();
        if candidates.is_empty() {
            warn!(
                "No UART adapter {:04X}:{:04X} found; connect the board's control port",
                UART_VID_PID.0, UART_VID_PID.1
            );
        }
        candidates
    }

    /// Select a probe by its 1-based position in discovery order.
    pub fn select_probe(&self, index: usize) -> Result<ProbeDevice> {
        let probes = self.discover_probes()?;
        select_by_index(&probes, index)
    }

    /// Find the probe again after it re-enumerated: same identity first,
    /// same position second.
    pub fn reselect_probe(&self, previous: &ProbeDevice, index: usize) -> Result<ProbeDevice> {
        let probes = self.discover_probes()?;
        if previous.serial.is_some() {
            let key = previous.identity_key();
            if let Some(found) = probes.iter().find(|p| p.identity_key() == key) {
                return Ok(found.clone());
            }
        }
        select_by_index(&probes, index)
    }

    /// Pair `probe` with a UART candidate.
    pub fn pair_probe(&self, probe: &ProbeDevice) -> DevicePairing {
        let candidates = self.discover_uart_candidates();
        DevicePairing {
            probe: probe.clone(),
            port: pair(probe, &candidates),
        }
    }

    /// Resolve the UART port name for `probe`, failing with
    /// [`Error::PairingAmbiguous`] rather than guessing.
    pub fn resolve_port(&self, probe: &ProbeDevice) -> Result<SerialPortInfo> {
        let candidates = self.discover_uart_candidates();
        if candidates.is_empty() {
            return Err(Error::DeviceNotFound(format!(
                "no UART adapter {:04X}:{:04X} connected",
                UART_VID_PID.0, UART_VID_PID.1
            )));
        }
        pair(probe, &candidates).ok_or(Error::PairingAmbiguous(candidates.len()))
    }

    /// Look a port up by name again, e.g. after it vanished and came back.
    pub fn find_port(&self, name: &str) -> Option<SerialPortInfo> {
        let ports = self.source.serial_ports().ok()?;
        ports
            .iter()
            .find(|p| p.name == name)
            .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)))
            .cloned()
    }
}

fn select_by_index(probes: &[ProbeDevice], index: usize) -> Result<ProbeDevice> {
    if probes.is_empty() {
        return Err(Error::DeviceNotFound("no ST-Link probe connected".to_string()));
    }
    index
        .checked_sub(1)
        .and_then(|i| probes.get(i))
        .cloned()
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "probe index {index} out of range (1..={})",
                probes.len()
            ))
        })
}

/// Devices of the host this process runs on.
#[cfg(feature = "native")]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeDevices;

#[cfg(feature = "native")]
impl DeviceSource for NativeDevices {
    fn probes(&self) -> Result<Vec<ProbeDevice>> {
        usb::list_stlink_probes()
    }

    fn serial_ports(&self) -> Result<Vec<SerialPortInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X})",
                        port.port_name, usb.vid, usb.pid
                    );
                    SerialPortInfo {
                        hwid: format_hwid(
                            usb.vid,
                            usb.pid,
                            usb.serial_number.as_deref(),
                            &port.port_name,
                        ),
                        vid: Some(usb.vid),
                        pid: Some(usb.pid),
                        serial: usb.serial_number,
                        description: usb.product.or(usb.manufacturer),
                        name: port.port_name,
                    }
                },
                _ => SerialPortInfo {
                    hwid: "n/a".to_string(),
                    name: port.port_name,
                    ..SerialPortInfo::default()
                },
            })
            .collect())
    }
}

/// Format probes for display, numbered from 1.
pub fn format_probe_list(probes: &[ProbeDevice]) -> Vec<String> {
    probes
        .iter()
        .enumerate()
        .map(|(i, probe)| {
            let model = probe
                .model()
                .map(|m| format!(" [{}]", m.name()))
                .unwrap_or_default();
            format!("{}. {}{}", i + 1, probe.name(), model)
        })
        .collect()
}

/// Format serial ports for display.
pub fn format_port_list(ports: &[SerialPortInfo]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let ids = match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => format!(" [{vid:04X}:{pid:04X}]"),
                _ => String::new(),
            };
            let desc = port
                .description
                .as_ref()
                .map(|d| format!(" - {d}"))
                .unwrap_or_default();
            format!("{}{}{}", port.name, ids, desc)
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Device source with scripted snapshots.
    ///
    /// Each `probes()` call pops the next snapshot; the last one repeats.
    #[derive(Clone, Default)]
    pub(crate) struct StaticDevices {
        pub(crate) probe_snapshots: Arc<Mutex<Vec<Vec<ProbeDevice>>>>,
        pub(crate) ports: Vec<SerialPortInfo>,
    }

    impl StaticDevices {
        pub(crate) fn new(probes: Vec<ProbeDevice>, ports: Vec<SerialPortInfo>) -> Self {
            Self {
                probe_snapshots: Arc::new(Mutex::new(vec![probes])),
                ports,
            }
        }

        /// Serve these snapshots in order before the current one.
        pub(crate) fn then_probes(self, snapshots: Vec<Vec<ProbeDevice>>) -> Self {
            {
                let mut guard = self
                    .probe_snapshots
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let last = guard.pop().unwrap_or_default();
                guard.extend(snapshots);
                guard.push(last);
            }
            self
        }
    }

    impl DeviceSource for StaticDevices {
        fn probes(&self) -> Result<Vec<ProbeDevice>> {
            let mut guard = self
                .probe_snapshots
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if guard.len() > 1 {
                Ok(guard.remove(0))
            } else {
                Ok(guard.first().cloned().unwrap_or_default())
            }
        }

        fn serial_ports(&self) -> Result<Vec<SerialPortInfo>> {
            Ok(self.ports.clone())
        }
    }

    pub(crate) fn probe(serial: Option<&str>, bus: u8, address: u8) -> ProbeDevice {
        ProbeDevice {
            vid: STLINK_VID,
            pid: 0x374B,
            serial: serial.map(str::to_string),
            bus: Some(bus),
            address: Some(address),
        }
    }

    pub(crate) fn uart(name: &str, serial: Option<&str>, hwid_extra: &str) -> SerialPortInfo {
        SerialPortInfo {
            name: name.to_string(),
            hwid: format!(
                "{}{hwid_extra}",
                format_hwid(0x1A86, 0x7523, serial, name)
            ),
            vid: Some(0x1A86),
            pid: Some(0x7523),
            serial: serial.map(str::to_string),
            description: Some("USB Serial".to_string()),
        }
    }
}
