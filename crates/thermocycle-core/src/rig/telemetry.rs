//! Telemetry snapshot
//!
//! The last validated report from the controller. A snapshot is never
//! patched; each successful exchange replaces it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Fault, Mode};
use crate::protocol::TelemetryFrame;

/// Actuator configuration bits reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActuatorConfig(u8);

impl ActuatorConfig {
    pub const CHILLER: u8 = 0x01;
    pub const RESISTANCE: u8 = 0x02;
    pub const PRESSURE_ACTUATOR: u8 = 0x04;
    /// Not defined by the stock firmware; reported by controllers built with
    /// the automatic-control extension and by the simulator.
    pub const TEMPERATURE_AUTO: u8 = 0x08;
    /// Same extension as `TEMPERATURE_AUTO`.
    pub const PRESSURE_AUTO: u8 = 0x10;

    const KNOWN: u8 = 0x1f;

    /// Build from raw bits; unknown bits are dropped
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::KNOWN)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Return a copy with `flag` set or cleared
    pub fn with(self, flag: u8, on: bool) -> Self {
        if on {
            Self(self.0 | (flag & Self::KNOWN))
        } else {
            Self(self.0 & !flag)
        }
    }

    pub fn chiller(&self) -> bool {
        self.has(Self::CHILLER)
    }

    pub fn resistance(&self) -> bool {
        self.has(Self::RESISTANCE)
    }

    pub fn pressure_actuator(&self) -> bool {
        self.has(Self::PRESSURE_ACTUATOR)
    }

    pub fn temperature_mode(&self) -> ControlMode {
        ControlMode::from_flag(self.has(Self::TEMPERATURE_AUTO))
    }

    pub fn pressure_mode(&self) -> ControlMode {
        ControlMode::from_flag(self.has(Self::PRESSURE_AUTO))
    }
}

/// Whether a control loop is closed by the controller or driven by hand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    #[default]
    Manual,
    Automatic,
}

impl ControlMode {
    fn from_flag(auto: bool) -> Self {
        if auto {
            ControlMode::Automatic
        } else {
            ControlMode::Manual
        }
    }
}

/// Last telemetry received from the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Temperature (degrees Celsius)
    pub t_meas: f32,
    /// Actuator pressure (bar)
    pub p_actuator_meas: f32,
    /// Accumulator pressure (bar)
    pub p_accumulator_meas: f32,
    /// PI proportional gain
    pub kp: f32,
    /// PI integral gain
    pub ki: f32,
    /// Temperature setpoint
    pub t_set: f32,
    /// Pressure setpoint
    pub p_set: f32,
    /// Pressure controller output (0..255 units)
    pub u_pres: f32,
    /// Reference period (seconds)
    pub period: f32,
    /// Reference duty cycle (0..1)
    pub duty_cycle: f32,
    /// Current cycle index
    pub cycle: f32,
    /// Target cycle count
    pub max_cycle: f32,
    pub actuators: ActuatorConfig,
    /// Mode as reported by the controller (may differ from the session mode)
    pub reported_mode: Mode,
    /// Error as reported by the controller
    pub reported_error: Fault,
    /// Host time when the frame was validated
    pub captured_at: DateTime<Utc>,
}

impl TelemetrySnapshot {
    /// Capture a validated frame
    pub fn capture(frame: &TelemetryFrame) -> Self {
        Self {
            t_meas: frame.t_meas,
            p_actuator_meas: frame.p_meas,
            p_accumulator_meas: frame.q_meas,
            kp: frame.kp,
            ki: frame.ki,
            t_set: frame.t_set,
            p_set: frame.p_set,
            u_pres: frame.u_pres,
            period: frame.period,
            duty_cycle: frame.duty_cycle,
            cycle: frame.cycle,
            max_cycle: frame.max_cycle,
            actuators: frame.config,
            reported_mode: frame.mode,
            reported_error: frame.error,
            captured_at: Utc::now(),
        }
    }

    /// Fraction of cycles done, if a target is set
    pub fn cycle_progress(&self) -> Option<f32> {
        (self.max_cycle > 0.0).then(|| (self.cycle / self.max_cycle).clamp(0.0, 1.0))
    }
}
