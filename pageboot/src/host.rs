//! Host-side serial port discovery.

#[cfg(feature = "native")]
use log::{debug, trace};

/// Common USB-UART bridges found on bootloader boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeKind {
    /// CH340/CH341.
    Ch340,
    /// Silicon Labs CP210x.
    Cp210x,
    /// FTDI FT232 and relatives.
    Ftdi,
    /// Prolific PL2303.
    Prolific,
    /// Anything else.
    Unknown,
}

const KNOWN_BRIDGES: &[(u16, &[u16], BridgeKind)] = &[
    (0x1A86, &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4], BridgeKind::Ch340),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], BridgeKind::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015], BridgeKind::Ftdi),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], BridgeKind::Prolific),
];

impl BridgeKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|(known_vid, pids, _)| *known_vid == vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the bridge was recognized.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for BridgeKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// A serial port found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified USB bridge.
    pub bridge: BridgeKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A port with no USB metadata.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bridge: BridgeKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// One-line description for listings.
    pub fn describe(&self) -> String {
        let bridge = if self.bridge.is_known() {
            format!(" [{}]", self.bridge.name())
        } else if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };
        let product = self
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();
        format!("{}{bridge}{product}", self.name)
    }
}

/// List the serial ports on this host.
///
/// Enumeration errors are logged and yield an empty list.
#[cfg(feature = "native")]
pub fn discover_ports() -> Vec<DetectedPort> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let mut port = DetectedPort::plain(info.port_name);
                if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                    port.bridge = BridgeKind::from_vid_pid(usb.vid, usb.pid);
                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, {:?})",
                        port.name, usb.vid, usb.pid, port.bridge
                    );
                    port.vid = Some(usb.vid);
                    port.pid = Some(usb.pid);
                    port.manufacturer = usb.manufacturer;
                    port.product = usb.product;
                    port.serial = usb.serial_number;
                }
                port
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Without native support there is nothing to enumerate.
#[cfg(not(feature = "native"))]
pub fn discover_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Order ports so recognized USB bridges come first, keeping relative order.
pub fn rank_ports(mut ports: Vec<DetectedPort>) -> Vec<DetectedPort> {
    ports.sort_by_key(|p| !p.bridge.is_known());
    ports
}
