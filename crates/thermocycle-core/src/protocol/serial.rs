//! Serial port handling
//!
//! Opens and configures the controller's port, and finds candidate ports by
//! the USB bridge the controller boards ship with.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::time::Duration;

use tracing::{debug, info};

use super::ProtocolError;

/// USB-serial bridge in front of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bridge {
    /// Native USB on the controller MCU (Arduino Uno/Mega/Leonardo)
    Arduino,
    /// WCH CH340/CH341, used by most clone boards
    Ch340,
    /// FTDI FT232, older boards and Nano clones
    Ftdi,
    /// Silicon Labs CP210x
    Cp210x,
}

/// (vid, pid, bridge); a pid of `None` matches the whole vendor
const KNOWN_BRIDGES: &[(u16, Option<u16>, Bridge)] = &[
    (0x2341, None, Bridge::Arduino),
    (0x2a03, None, Bridge::Arduino),
    (0x1a86, Some(0x7523), Bridge::Ch340),
    (0x1a86, Some(0x5523), Bridge::Ch340),
    (0x0403, Some(0x6001), Bridge::Ftdi),
    (0x0403, Some(0x6015), Bridge::Ftdi),
    (0x10c4, Some(0xea60), Bridge::Cp210x),
];

impl Bridge {
    /// Match a USB vendor/product pair against the known controller bridges
    pub fn identify(vid: u16, pid: u16) -> Option<Bridge> {
        KNOWN_BRIDGES
            .iter()
            .find(|(v, p, _)| *v == vid && p.map_or(true, |p| p == pid))
            .map(|(_, _, bridge)| *bridge)
    }
}

/// A serial port that may have the controller behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,
    pub vid: u16,
    pub pid: u16,
    pub bridge: Bridge,
    /// Product string, if the device reports one
    pub product: Option<String>,
}

impl PortInfo {
    /// Keep USB ports whose bridge is a known controller bridge
    fn from_info(info: SerialPortInfo) -> Option<Self> {
        let SerialPortType::UsbPort(usb) = info.port_type else {
            return None;
        };
        let bridge = Bridge::identify(usb.vid, usb.pid)?;
        Some(Self {
            name: info.port_name,
            vid: usb.vid,
            pid: usb.pid,
            bridge,
            product: usb.product,
        })
    }
}

/// Order candidates: native boards first, then by bridge, then by path
fn rank(ports: &mut [PortInfo]) {
    ports.sort_by(|a, b| a.bridge.cmp(&b.bridge).then_with(|| a.name.cmp(&b.name)));
}

/// List ports that look like a rig controller, best candidate first
pub fn list_ports() -> Vec<PortInfo> {
    let available = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("list_ports: enumeration failed: {}", e);
            return Vec::new();
        }
    };
    let mut ports: Vec<PortInfo> = available.into_iter().filter_map(PortInfo::from_info).collect();
    rank(&mut ports);
    ports
}

/// Pick the best controller candidate from `ports`
pub fn select_controller(ports: &[PortInfo]) -> Result<&PortInfo, ProtocolError> {
    let port = ports
        .first()
        .ok_or_else(|| ProtocolError::Connection("no rig controller found on any serial port".into()))?;
    if ports.len() > 1 {
        info!(
            "{} controller candidates, using {} ({:?})",
            ports.len(),
            port.name,
            port.bridge
        );
    }
    Ok(port)
}

/// Open a serial port with a short read timeout for polling
pub fn open_port(name: &str, baud_rate: u32, read_slice: Duration) -> Result<Box<dyn SerialPort>, ProtocolError> {
    serialport::new(name, baud_rate)
        .timeout(read_slice)
        .open()
        .map_err(|e| ProtocolError::Serial(e.to_string()))
}

/// Configure a serial port for the controller: 8N1, no flow control
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    // Keep DTR asserted; toggling it resets Arduino-class controllers
    if let Err(e) = port.write_data_terminal_ready(true) {
        debug!("configure_port: failed to set DTR high: {} (continuing)", e);
    }

    Ok(())
}

/// Clear both serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(serialport::ClearBuffer::All)?;
    Ok(())
}
