//! Protocol commands
//!
//! Defines the command table understood by the rig controller firmware.
//! The opcode of each command is its position in the firmware's table.

use serde::{Deserialize, Serialize};

/// How the four payload bytes of a command frame are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// No payload; four zero bytes are sent
    None,
    /// Little-endian IEEE-754 `f32`; the firmware converts counters on receipt
    Float,
}

/// Commands sent from the host to the rig controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Keep-alive; the controller answers with a telemetry frame
    Heartbeat,
    /// Disable the temperature controller (manual actuation)
    ManualTemperatureControl,
    /// Enable the temperature controller
    AutomaticTemperatureControl,
    /// Disable the pressure controller (manual actuation)
    ManualPressureControl,
    /// Enable the pressure controller
    AutomaticPressureControl,
    /// Pause or resume the running cycle
    TogglePauseCycle,
    /// Raise the alarm state immediately
    EmergencyStopCycle,
    /// Toggle the chiller output
    ToggleChillerActuation,
    /// Toggle the heating resistance output
    ToggleResistanceActuation,
    /// Temperature setpoint
    SetTemperature,
    /// Upper pressure of the square wave reference
    SetPressureHigh,
    /// Lower pressure of the square wave reference
    SetPressureLow,
    /// Override the current pressure setpoint
    SetPressure,
    /// Override the PI output with a manual value
    OverridePIControl,
    /// PI proportional gain
    SetPIProportionalGain,
    /// PI integral gain
    SetPIIntegralGain,
    /// Target number of cycles
    SetMaximumCycleNumber,
    /// Override the current cycle number
    SetCurrentCycleNumber,
    /// Square wave reference period (seconds)
    SetReferencePeriod,
    /// Square wave reference duty cycle (0..1)
    SetReferenceDutyCycle,
    /// Reboot the controller
    SystemReboot,
    /// Start the cycle (enters running)
    StartCycle,
    /// Persist the configuration in the controller EEPROM
    SaveStorageConfig,
    /// Restore the configuration from the controller EEPROM
    LoadStorageConfig,
    /// Restore the cycle counter from the controller EEPROM
    LoadStorageCycle,
}

impl Command {
    /// Every command, in opcode order
    pub const ALL: [Command; 25] = [
        Command::Heartbeat,
        Command::ManualTemperatureControl,
        Command::AutomaticTemperatureControl,
        Command::ManualPressureControl,
        Command::AutomaticPressureControl,
        Command::TogglePauseCycle,
        Command::EmergencyStopCycle,
        Command::ToggleChillerActuation,
        Command::ToggleResistanceActuation,
        Command::SetTemperature,
        Command::SetPressureHigh,
        Command::SetPressureLow,
        Command::SetPressure,
        Command::OverridePIControl,
        Command::SetPIProportionalGain,
        Command::SetPIIntegralGain,
        Command::SetMaximumCycleNumber,
        Command::SetCurrentCycleNumber,
        Command::SetReferencePeriod,
        Command::SetReferenceDutyCycle,
        Command::SystemReboot,
        Command::StartCycle,
        Command::SaveStorageConfig,
        Command::LoadStorageConfig,
        Command::LoadStorageCycle,
    ];

    /// Get the opcode byte
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Heartbeat => 0,
            Command::ManualTemperatureControl => 1,
            Command::AutomaticTemperatureControl => 2,
            Command::ManualPressureControl => 3,
            Command::AutomaticPressureControl => 4,
            Command::TogglePauseCycle => 5,
            Command::EmergencyStopCycle => 6,
            Command::ToggleChillerActuation => 7,
            Command::ToggleResistanceActuation => 8,
            Command::SetTemperature => 9,
            Command::SetPressureHigh => 10,
            Command::SetPressureLow => 11,
            Command::SetPressure => 12,
            Command::OverridePIControl => 13,
            Command::SetPIProportionalGain => 14,
            Command::SetPIIntegralGain => 15,
            Command::SetMaximumCycleNumber => 16,
            Command::SetCurrentCycleNumber => 17,
            Command::SetReferencePeriod => 18,
            Command::SetReferenceDutyCycle => 19,
            Command::SystemReboot => 20,
            Command::StartCycle => 21,
            Command::SaveStorageConfig => 22,
            Command::LoadStorageConfig => 23,
            Command::LoadStorageCycle => 24,
        }
    }

    /// Look up a command by opcode
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Self::ALL.get(opcode as usize).copied()
    }

    /// Payload interpretation for this command
    pub fn payload_kind(&self) -> PayloadKind {
        match self {
            Command::SetTemperature
            | Command::SetPressureHigh
            | Command::SetPressureLow
            | Command::SetPressure
            | Command::OverridePIControl
            | Command::SetPIProportionalGain
            | Command::SetPIIntegralGain
            | Command::SetReferencePeriod
            | Command::SetReferenceDutyCycle
            | Command::SetMaximumCycleNumber
            | Command::SetCurrentCycleNumber => PayloadKind::Float,
            Command::Heartbeat
            | Command::ManualTemperatureControl
            | Command::AutomaticTemperatureControl
            | Command::ManualPressureControl
            | Command::AutomaticPressureControl
            | Command::TogglePauseCycle
            | Command::EmergencyStopCycle
            | Command::ToggleChillerActuation
            | Command::ToggleResistanceActuation
            | Command::SystemReboot
            | Command::StartCycle
            | Command::SaveStorageConfig
            | Command::LoadStorageConfig
            | Command::LoadStorageCycle => PayloadKind::None,
        }
    }
}
