//! Serial Protocol Communication
//!
//! Implements the rig controller's fixed-frame serial protocol: command
//! frames from the host, telemetry frames from the controller, and the
//! link they travel over.

pub mod codec;
pub mod commands;
mod error;
pub mod frame;
pub mod link;
pub mod serial;

pub use codec::{DecodeStatus, DecoderStats, FrameDecoder};
pub use commands::{Command, PayloadKind};
pub use error::ProtocolError;
pub use frame::{Checksum, CommandFrame, TelemetryFrame};
pub use link::{CloseHandle, Link, SerialLink};
pub use serial::{list_ports, select_controller, Bridge, PortInfo};

/// Default baud rate of the controller firmware
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for a telemetry response in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 200;

/// Byte written after open to synchronise with the controller
pub const SIGNATURE_BYTE: u8 = 0x63;

/// Size of a command frame: opcode + payload + checksum
pub const COMMAND_FRAME_LEN: usize = 6;

/// Size of a telemetry frame: 12 floats + config + state + error + checksum
pub const TELEMETRY_FRAME_LEN: usize = 52;
