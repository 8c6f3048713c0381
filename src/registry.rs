use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tracing::warn;

use crate::config::KnownBoard;

/// The board models the lab knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardModel {
    /// Arduino Uno, or a CH340 clone presenting as one.
    Uno,

    /// Arduino Mega.
    Mega,

    /// ESP32 family.
    Esp32,

    /// Anything the vendor:product table does not match.
    Unknown,
}

impl BoardModel {
    /// The models the upload tool can flash.
    pub fn supported() -> &'static [BoardModel] {
        &[Self::Uno, Self::Mega, Self::Esp32]
    }
}

impl Display for BoardModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BoardModel::Uno => "uno",
            BoardModel::Mega => "mega",
            BoardModel::Esp32 => "esp32",
            BoardModel::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// One attached device, as seen by the latest scan.
///
/// `index` is the device's position in that scan and is what every
/// other part of the system keys on. It is not a stable hardware
/// identity: attach or detach a device between scans and the indices
/// shift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Position in the scan this descriptor came from.
    pub index: usize,

    /// The classified board model.
    #[serde(rename = "model")]
    pub board_model: BoardModel,

    /// Path to the port, e.g. `/dev/ttyACM0` or `COM3`.
    #[serde(rename = "port")]
    pub port_path: String,

    /// The port's product description, if the OS knows one.
    pub description: Option<String>,

    /// USB manufacturer string.
    pub manufacturer: Option<String>,

    /// USB serial number.
    pub serial_number: Option<String>,

    /// USB vendor id, four lowercase hex digits.
    #[serde(rename = "vid")]
    pub vendor_id: Option<String>,

    /// USB product id, four lowercase hex digits.
    #[serde(rename = "pid")]
    pub product_id: Option<String>,
}

impl DeviceDescriptor {
    /// An example descriptor: an official Uno on the first ACM port.
    pub fn example() -> Self {
        Self {
            index: 0,
            board_model: BoardModel::Uno,
            port_path: "/dev/ttyACM0".into(),
            description: Some("Arduino Uno".into()),
            manufacturer: Some("Arduino (www.arduino.cc)".into()),
            serial_number: Some("95530343834351A0D0E1".into()),
            vendor_id: Some("2341".into()),
            product_id: Some("0043".into()),
        }
    }
}

/// Enumerates the currently attached devices.
///
/// Implementations re-scan on every call; nothing is cached, so two
/// consecutive calls may disagree if hardware was plugged or pulled
/// in between. Callers that need a descriptor and its index to match
/// must take both from the same `discover` call.
pub trait DeviceRegistry: Send + Sync {
    /// Scan now and classify every attached port.
    fn discover(&self) -> Vec<DeviceDescriptor>;

    /// Whether `index` refers to a device in a fresh scan.
    fn validate(&self, index: usize) -> bool {
        index < self.discover().len()
    }

    /// The descriptor at `index` in a fresh scan, if any.
    fn descriptor(&self, index: usize) -> Option<DeviceDescriptor> {
        self.discover().into_iter().nth(index)
    }
}

/// The exact vendor:product pairs we recognize out of the box.
const KNOWN_BOARDS: &[(&str, BoardModel)] = &[
    ("2341:0043", BoardModel::Uno),  // Official Arduino Uno
    ("2341:0010", BoardModel::Mega), // Official Arduino Mega
    ("2341:0243", BoardModel::Uno),  // Uno R3
    ("2341:0042", BoardModel::Mega), // Mega 2560 R3
    ("1a86:7523", BoardModel::Uno),  // CH340 - usually Uno/Mega
    ("1a86:55d4", BoardModel::Esp32), // CH9102 - newer ESP32 clones
    ("10c4:ea60", BoardModel::Esp32), // CP2102
    ("10c4:ea70", BoardModel::Esp32), // CP2105 dual UART
    ("0403:6001", BoardModel::Esp32), // FTDI - NodeMCU, etc.
    ("303a:1001", BoardModel::Esp32), // ESP32-S2 native USB
];

/// Discovery over the host's USB serial ports.
pub struct UsbRegistry {
    /// Config-provided pairs, consulted before the built-in table.
    extra: Vec<(String, BoardModel)>,
}

impl UsbRegistry {
    /// A registry recognizing the built-in table plus the given boards.
    pub fn new(known_boards: &[KnownBoard]) -> Self {
        Self {
            extra: known_boards
                .iter()
                .map(|board| (board.usb_id.clone(), board.model))
                .collect(),
        }
    }

    fn classify(&self, usb_id: &str) -> BoardModel {
        self.extra
            .iter()
            .find(|(id, _)| id == usb_id)
            .map(|(_, model)| *model)
            .or_else(|| {
                KNOWN_BOARDS
                    .iter()
                    .find(|(id, _)| *id == usb_id)
                    .map(|(_, model)| *model)
            })
            .unwrap_or(BoardModel::Unknown)
    }
}

impl DeviceRegistry for UsbRegistry {
    fn discover(&self) -> Vec<DeviceDescriptor> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!("Could not enumerate serial ports: {e}");
                return Vec::new();
            }
        };

        ports
            .into_iter()
            .enumerate()
            .map(|(index, port)| match port.port_type {
                SerialPortType::UsbPort(usb) => {
                    let vid = format!("{:04x}", usb.vid);
                    let pid = format!("{:04x}", usb.pid);
                    let board_model = self.classify(&format!("{vid}:{pid}"));

                    DeviceDescriptor {
                        index,
                        board_model,
                        port_path: port.port_name,
                        description: usb.product,
                        manufacturer: usb.manufacturer,
                        serial_number: usb.serial_number,
                        vendor_id: Some(vid),
                        product_id: Some(pid),
                    }
                }
                _ => DeviceDescriptor {
                    index,
                    board_model: BoardModel::Unknown,
                    port_path: port.port_name,
                    description: None,
                    manufacturer: None,
                    serial_number: None,
                    vendor_id: None,
                    product_id: None,
                },
            })
            .collect()
    }
}
