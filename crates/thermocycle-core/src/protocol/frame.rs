//! Frame encoding/decoding
//!
//! Command frame (host -> controller, 6 bytes):
//! - 1 byte: opcode
//! - 4 bytes: payload (`f32` or `i32`, little-endian)
//! - 1 byte: checksum of the preceding 5 bytes
//!
//! Telemetry frame (controller -> host, 52 bytes):
//! - 12 x 4 bytes: measurement and parameter floats (little-endian)
//! - 1 byte: actuator configuration bits
//! - 1 byte: state code
//! - 1 byte: error code
//! - 1 byte: checksum of the preceding 51 bytes

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::{Command, PayloadKind, ProtocolError, COMMAND_FRAME_LEN, TELEMETRY_FRAME_LEN};
use crate::rig::{ActuatorConfig, Fault, Mode};

/// Number of float fields at the start of a telemetry frame
const TELEMETRY_FLOATS: usize = 12;

/// Checksum algorithm applied to both frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checksum {
    /// Sum of all bytes modulo 256
    #[default]
    Additive,
    /// Accumulated XOR of all bytes (legacy firmware)
    Xor,
}

impl Checksum {
    /// Compute the checksum byte of `data`
    pub fn compute(&self, data: &[u8]) -> u8 {
        match self {
            Checksum::Additive => data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)),
            Checksum::Xor => data.iter().fold(0u8, |acc, b| acc ^ b),
        }
    }

    /// Verify that the last byte of `frame` is the checksum of the rest
    pub fn verify(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        let (body, check) = match frame.split_last() {
            Some((check, body)) => (body, *check),
            None => return Err(ProtocolError::InvalidFrame("empty frame".to_string())),
        };
        let expected = self.compute(body);
        if expected != check {
            return Err(ProtocolError::Checksum {
                expected,
                actual: check,
            });
        }
        Ok(())
    }
}

/// A command frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandFrame {
    /// Command to execute
    pub command: Command,
    /// Raw payload bytes (little-endian)
    pub payload: [u8; 4],
}

impl CommandFrame {
    /// Zero-payload command
    pub fn bare(command: Command) -> Self {
        Self {
            command,
            payload: [0; 4],
        }
    }

    /// Command carrying a float value
    pub fn with_float(command: Command, value: f32) -> Self {
        let mut payload = [0u8; 4];
        LittleEndian::write_f32(&mut payload, value);
        Self { command, payload }
    }

    /// Payload read as a float
    pub fn float_value(&self) -> f32 {
        LittleEndian::read_f32(&self.payload)
    }

    /// Payload as `f64` according to the command's payload kind
    pub fn value(&self) -> Option<f64> {
        match self.command.payload_kind() {
            PayloadKind::None => None,
            PayloadKind::Float => Some(self.float_value() as f64),
        }
    }

    /// Encode the frame to raw bytes
    pub fn to_bytes(&self, checksum: Checksum) -> [u8; COMMAND_FRAME_LEN] {
        let mut bytes = [0u8; COMMAND_FRAME_LEN];
        bytes[0] = self.command.opcode();
        bytes[1..5].copy_from_slice(&self.payload);
        bytes[5] = checksum.compute(&bytes[..5]);
        bytes
    }

    /// Decode a frame from raw bytes
    pub fn from_bytes(data: &[u8], checksum: Checksum) -> Result<Self, ProtocolError> {
        if data.len() != COMMAND_FRAME_LEN {
            return Err(ProtocolError::InvalidFrame(format!(
                "command frame is {} bytes, expected {}",
                data.len(),
                COMMAND_FRAME_LEN
            )));
        }
        checksum.verify(data)?;

        let command = Command::from_opcode(data[0])
            .ok_or_else(|| ProtocolError::InvalidFrame(format!("unknown opcode {}", data[0])))?;
        let mut payload = [0u8; 4];
        payload.copy_from_slice(&data[1..5]);
        Ok(Self { command, payload })
    }
}

/// A decoded, validated telemetry frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TelemetryFrame {
    pub t_meas: f32,
    pub p_meas: f32,
    pub q_meas: f32,
    pub kp: f32,
    pub ki: f32,
    pub t_set: f32,
    pub p_set: f32,
    pub u_pres: f32,
    pub period: f32,
    pub duty_cycle: f32,
    pub cycle: f32,
    pub max_cycle: f32,
    pub config: ActuatorConfig,
    pub mode: Mode,
    pub error: Fault,
}

impl TelemetryFrame {
    fn floats(&self) -> [f32; TELEMETRY_FLOATS] {
        [
            self.t_meas,
            self.p_meas,
            self.q_meas,
            self.kp,
            self.ki,
            self.t_set,
            self.p_set,
            self.u_pres,
            self.period,
            self.duty_cycle,
            self.cycle,
            self.max_cycle,
        ]
    }

    /// Encode the frame to raw bytes
    pub fn to_bytes(&self, checksum: Checksum) -> [u8; TELEMETRY_FRAME_LEN] {
        let mut bytes = [0u8; TELEMETRY_FRAME_LEN];
        LittleEndian::write_f32_into(&self.floats(), &mut bytes[..TELEMETRY_FLOATS * 4]);
        bytes[48] = self.config.bits();
        bytes[49] = self.mode.code();
        bytes[50] = self.error.code();
        bytes[51] = checksum.compute(&bytes[..51]);
        bytes
    }

    /// Decode and validate a frame from raw bytes
    ///
    /// The checksum is checked before anything else; state and error codes
    /// must map to known values.
    pub fn from_bytes(data: &[u8], checksum: Checksum) -> Result<Self, ProtocolError> {
        if data.len() != TELEMETRY_FRAME_LEN {
            return Err(ProtocolError::InvalidFrame(format!(
                "telemetry frame is {} bytes, expected {}",
                data.len(),
                TELEMETRY_FRAME_LEN
            )));
        }
        checksum.verify(data)?;

        let mode = Mode::from_code(data[49])
            .ok_or_else(|| ProtocolError::InvalidFrame(format!("unknown state code {:#04x}", data[49])))?;
        let error = Fault::from_code(data[50])
            .ok_or_else(|| ProtocolError::InvalidFrame(format!("unknown error code {:#04x}", data[50])))?;

        let mut f = [0f32; TELEMETRY_FLOATS];
        LittleEndian::read_f32_into(&data[..TELEMETRY_FLOATS * 4], &mut f);

        Ok(Self {
            t_meas: f[0],
            p_meas: f[1],
            q_meas: f[2],
            kp: f[3],
            ki: f[4],
            t_set: f[5],
            p_set: f[6],
            u_pres: f[7],
            period: f[8],
            duty_cycle: f[9],
            cycle: f[10],
            max_cycle: f[11],
            config: ActuatorConfig::from_bits(data[48]),
            mode,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_checksum_is_byte_sum() {
        let frame = CommandFrame::with_float(Command::SetPIIntegralGain, 5.0);
        let bytes = frame.to_bytes(Checksum::Additive);

        // 5.0f32 = 0x40a00000
        assert_eq!(bytes[..5], [15, 0x00, 0x00, 0xa0, 0x40]);
        let sum = bytes[..5].iter().map(|b| *b as u32).sum::<u32>() % 256;
        assert_eq!(bytes[5] as u32, sum);
    }

    #[test]
    fn test_command_roundtrip_preserves_payload() {
        let frame = CommandFrame::with_float(Command::SetMaximumCycleNumber, 331_630.0);
        let bytes = frame.to_bytes(Checksum::Xor);
        assert_eq!(bytes[1..5], 331_630.0f32.to_le_bytes());
        let decoded = CommandFrame::from_bytes(&bytes, Checksum::Xor).expect("valid frame");
        assert_eq!(decoded.command, Command::SetMaximumCycleNumber);
        assert_eq!(decoded.float_value(), 331_630.0);
        assert_eq!(decoded.value(), Some(331_630.0));
    }

    #[test]
    fn test_bare_command_has_zero_payload() {
        let bytes = CommandFrame::bare(Command::StartCycle).to_bytes(Checksum::Additive);
        assert_eq!(bytes, [21, 0, 0, 0, 0, 21]);
        assert_eq!(CommandFrame::bare(Command::StartCycle).value(), None);
    }

    #[test]
    fn test_command_rejects_unknown_opcode() {
        let mut bytes = [30u8, 0, 0, 0, 0, 0];
        bytes[5] = Checksum::Additive.compute(&bytes[..5]);
        let err = CommandFrame::from_bytes(&bytes, Checksum::Additive).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame(_)));
    }

    #[test]
    fn test_command_rejects_bad_checksum() {
        let mut bytes = CommandFrame::bare(Command::Heartbeat).to_bytes(Checksum::Additive);
        bytes[5] ^= 0x01;
        let err = CommandFrame::from_bytes(&bytes, Checksum::Additive).unwrap_err();
        assert!(matches!(err, ProtocolError::Checksum { .. }));
    }

    #[test]
    fn test_xor_checksum() {
        assert_eq!(Checksum::Xor.compute(&[0x0f, 0xf0, 0x01]), 0xfe);
        assert_eq!(Checksum::Additive.compute(&[0xff, 0x02]), 0x01);
    }

    #[test]
    fn test_telemetry_layout() {
        let frame = TelemetryFrame {
            t_meas: 1.0,
            max_cycle: 2.0,
            config: ActuatorConfig::from_bits(0x05),
            mode: Mode::Running,
            error: Fault::NoError,
            ..Default::default()
        };
        let bytes = frame.to_bytes(Checksum::Additive);
        assert_eq!(bytes[..4], 1.0f32.to_le_bytes());
        assert_eq!(bytes[44..48], 2.0f32.to_le_bytes());
        assert_eq!(bytes[48], 0x05);
        assert_eq!(bytes[49], 0x04);
        assert_eq!(bytes[50], 0x00);

        let decoded = TelemetryFrame::from_bytes(&bytes, Checksum::Additive).expect("valid frame");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_telemetry_rejects_unknown_state() {
        let mut bytes = TelemetryFrame::default().to_bytes(Checksum::Additive);
        bytes[49] = 0x03;
        bytes[51] = Checksum::Additive.compute(&bytes[..51]);
        let err = TelemetryFrame::from_bytes(&bytes, Checksum::Additive).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame(_)));
    }

    #[test]
    fn test_telemetry_checksum_checked_first() {
        let mut bytes = TelemetryFrame::default().to_bytes(Checksum::Additive);
        bytes[50] = 0x7f;
        let err = TelemetryFrame::from_bytes(&bytes, Checksum::Additive).unwrap_err();
        assert!(matches!(err, ProtocolError::Checksum { .. }));
    }
}
