//! Control parameters
//!
//! Values the operator asks the controller to use. They are requests: the
//! controller's own copy only shows up in telemetry after the next exchange.

use serde::{Deserialize, Serialize};

use super::ControlMode;
use crate::protocol::{Command, CommandFrame, PayloadKind, ProtocolError};

/// Largest cycle count a counter command may carry (every whole number up
/// to it is exact in `f32`)
pub const MAX_CYCLE_COUNT: f64 = 16_777_216.0;

/// A tunable value that maps to one setter command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    TemperatureSetpoint,
    PressureSetpoint,
    PressureHigh,
    PressureLow,
    ProportionalGain,
    IntegralGain,
    ManualOutput,
    Period,
    DutyCycle,
    Cycle,
    MaxCycle,
}

impl Parameter {
    /// Push order: setpoints and gains first, counters last
    pub const ALL: [Parameter; 11] = [
        Parameter::TemperatureSetpoint,
        Parameter::PressureHigh,
        Parameter::PressureLow,
        Parameter::PressureSetpoint,
        Parameter::ProportionalGain,
        Parameter::IntegralGain,
        Parameter::ManualOutput,
        Parameter::Period,
        Parameter::DutyCycle,
        Parameter::MaxCycle,
        Parameter::Cycle,
    ];

    pub fn command(&self) -> Command {
        match self {
            Parameter::TemperatureSetpoint => Command::SetTemperature,
            Parameter::PressureSetpoint => Command::SetPressure,
            Parameter::PressureHigh => Command::SetPressureHigh,
            Parameter::PressureLow => Command::SetPressureLow,
            Parameter::ProportionalGain => Command::SetPIProportionalGain,
            Parameter::IntegralGain => Command::SetPIIntegralGain,
            Parameter::ManualOutput => Command::OverridePIControl,
            Parameter::Period => Command::SetReferencePeriod,
            Parameter::DutyCycle => Command::SetReferenceDutyCycle,
            Parameter::Cycle => Command::SetCurrentCycleNumber,
            Parameter::MaxCycle => Command::SetMaximumCycleNumber,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Parameter::TemperatureSetpoint => "t_set",
            Parameter::PressureSetpoint => "p_set",
            Parameter::PressureHigh => "p_high",
            Parameter::PressureLow => "p_low",
            Parameter::ProportionalGain => "kp",
            Parameter::IntegralGain => "ki",
            Parameter::ManualOutput => "u_pres",
            Parameter::Period => "period",
            Parameter::DutyCycle => "duty_cycle",
            Parameter::Cycle => "cycle",
            Parameter::MaxCycle => "max_cycle",
        }
    }

    /// Cycle counters; whole numbers sent as `f32`
    pub fn is_counter(&self) -> bool {
        matches!(self, Parameter::Cycle | Parameter::MaxCycle)
    }

    /// Parameter set by `command`, if any
    pub fn from_command(command: Command) -> Option<Parameter> {
        Parameter::ALL.into_iter().find(|p| p.command() == command)
    }

    fn invalid(&self, value: f64, reason: &'static str) -> ProtocolError {
        ProtocolError::InvalidValue {
            field: self.name(),
            value,
            reason,
        }
    }

    /// Check `value` and build the command frame carrying it
    pub fn frame(&self, value: f64) -> Result<CommandFrame, ProtocolError> {
        if !value.is_finite() {
            return Err(self.invalid(value, "not a finite number"));
        }
        match self {
            Parameter::Period if value <= 0.0 => {
                return Err(self.invalid(value, "period must be positive"));
            }
            Parameter::DutyCycle if !(0.0..=1.0).contains(&value) => {
                return Err(self.invalid(value, "duty cycle must be within 0..=1"));
            }
            _ => {}
        }

        if self.is_counter() {
            if value.fract() != 0.0 {
                return Err(self.invalid(value, "counter must be a whole number"));
            }
            if !(0.0..=MAX_CYCLE_COUNT).contains(&value) {
                return Err(self.invalid(value, "counter out of range"));
            }
        }

        let command = self.command();
        match command.payload_kind() {
            PayloadKind::Float => {
                if value.abs() > f32::MAX as f64 {
                    return Err(self.invalid(value, "does not fit in f32"));
                }
                Ok(CommandFrame::with_float(command, value as f32))
            }
            PayloadKind::None => Ok(CommandFrame::bare(command)),
        }
    }
}

/// Requested parameter set
///
/// `None` means "leave the controller's value alone".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlParameters {
    pub temperature_mode: Option<ControlMode>,
    pub pressure_mode: Option<ControlMode>,
    pub t_set: Option<f64>,
    pub p_set: Option<f64>,
    pub p_high: Option<f64>,
    pub p_low: Option<f64>,
    pub kp: Option<f64>,
    pub ki: Option<f64>,
    pub u_pres: Option<f64>,
    pub period: Option<f64>,
    pub duty_cycle: Option<f64>,
    pub cycle: Option<f64>,
    pub max_cycle: Option<f64>,
}

impl ControlParameters {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, parameter: Parameter) -> &mut Option<f64> {
        match parameter {
            Parameter::TemperatureSetpoint => &mut self.t_set,
            Parameter::PressureSetpoint => &mut self.p_set,
            Parameter::PressureHigh => &mut self.p_high,
            Parameter::PressureLow => &mut self.p_low,
            Parameter::ProportionalGain => &mut self.kp,
            Parameter::IntegralGain => &mut self.ki,
            Parameter::ManualOutput => &mut self.u_pres,
            Parameter::Period => &mut self.period,
            Parameter::DutyCycle => &mut self.duty_cycle,
            Parameter::Cycle => &mut self.cycle,
            Parameter::MaxCycle => &mut self.max_cycle,
        }
    }

    pub fn get(&self, parameter: Parameter) -> Option<f64> {
        match parameter {
            Parameter::TemperatureSetpoint => self.t_set,
            Parameter::PressureSetpoint => self.p_set,
            Parameter::PressureHigh => self.p_high,
            Parameter::PressureLow => self.p_low,
            Parameter::ProportionalGain => self.kp,
            Parameter::IntegralGain => self.ki,
            Parameter::ManualOutput => self.u_pres,
            Parameter::Period => self.period,
            Parameter::DutyCycle => self.duty_cycle,
            Parameter::Cycle => self.cycle,
            Parameter::MaxCycle => self.max_cycle,
        }
    }

    pub fn set(&mut self, parameter: Parameter, value: f64) {
        *self.slot(parameter) = Some(value);
    }

    /// Builder-style setter
    pub fn with(mut self, parameter: Parameter, value: f64) -> Self {
        self.set(parameter, value);
        self
    }

    /// Copy the mode or value that `command` carries over from `source`
    pub fn adopt(&mut self, source: &ControlParameters, command: Command) {
        match command {
            Command::ManualTemperatureControl | Command::AutomaticTemperatureControl => {
                self.temperature_mode = source.temperature_mode;
            }
            Command::ManualPressureControl | Command::AutomaticPressureControl => {
                self.pressure_mode = source.pressure_mode;
            }
            _ => {
                if let Some(parameter) = Parameter::from_command(command) {
                    if let Some(value) = source.get(parameter) {
                        self.set(parameter, value);
                    }
                }
            }
        }
    }

    /// Command frames for every value that is set, in push order
    ///
    /// Validation runs over the whole set before anything is returned, so a
    /// bad value never yields a partial list.
    pub fn frames(&self) -> Result<Vec<CommandFrame>, ProtocolError> {
        let mut frames = Vec::new();

        let modes = [
            (
                self.temperature_mode,
                Command::ManualTemperatureControl,
                Command::AutomaticTemperatureControl,
            ),
            (
                self.pressure_mode,
                Command::ManualPressureControl,
                Command::AutomaticPressureControl,
            ),
        ];
        for (mode, manual, automatic) in modes {
            match mode {
                Some(ControlMode::Manual) => frames.push(CommandFrame::bare(manual)),
                Some(ControlMode::Automatic) => frames.push(CommandFrame::bare(automatic)),
                None => {}
            }
        }

        for parameter in Parameter::ALL {
            if let Some(value) = self.get(parameter) {
                frames.push(parameter.frame(value)?);
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adopt_copies_one_command() {
        let source = ControlParameters {
            pressure_mode: Some(ControlMode::Manual),
            ..Default::default()
        }
        .with(Parameter::TemperatureSetpoint, 70.0)
        .with(Parameter::PressureLow, 5.0);

        let mut target = ControlParameters::new();
        target.adopt(&source, Command::SetTemperature);
        assert_eq!(target.t_set, Some(70.0));
        assert_eq!(target.p_low, None);
        assert_eq!(target.pressure_mode, None);

        target.adopt(&source, Command::AutomaticPressureControl);
        assert_eq!(target.pressure_mode, Some(ControlMode::Manual));

        // Commands without a value leave everything alone
        target.adopt(&source, Command::StartCycle);
        let expected = ControlParameters {
            pressure_mode: Some(ControlMode::Manual),
            ..Default::default()
        }
        .with(Parameter::TemperatureSetpoint, 70.0);
        assert_eq!(target, expected);
    }

    #[test]
    fn test_rejects_non_finite() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = Parameter::IntegralGain.frame(value).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidValue { field: "ki", .. }));
        }
    }

    #[test]
    fn test_rejects_out_of_f32_range() {
        assert!(Parameter::TemperatureSetpoint.frame(1e300).is_err());
    }

    #[test]
    fn test_counter_validation() {
        assert!(Parameter::MaxCycle.frame(331_630.0).is_ok());
        assert!(Parameter::MaxCycle.frame(12.5).is_err());
        assert!(Parameter::Cycle.frame(-1.0).is_err());
        assert!(Parameter::Cycle.frame(MAX_CYCLE_COUNT + 1.0).is_err());

        let frame = Parameter::Cycle.frame(42.0).expect("valid counter");
        assert_eq!(frame.command, Command::SetCurrentCycleNumber);
        assert_eq!(frame.float_value(), 42.0);
        assert_eq!(frame.payload, 42.0f32.to_le_bytes());
    }

    #[test]
    fn test_reference_ranges() {
        assert!(Parameter::Period.frame(0.0).is_err());
        assert!(Parameter::Period.frame(1.0).is_ok());
        assert!(Parameter::DutyCycle.frame(1.5).is_err());
        assert!(Parameter::DutyCycle.frame(0.5).is_ok());
    }

    #[test]
    fn test_frames_follow_push_order() {
        let params = ControlParameters {
            pressure_mode: Some(ControlMode::Automatic),
            temperature_mode: Some(ControlMode::Automatic),
            ..Default::default()
        }
        .with(Parameter::Cycle, 0.0)
        .with(Parameter::IntegralGain, 1.0)
        .with(Parameter::PressureHigh, 31.5)
        .with(Parameter::TemperatureSetpoint, 70.0);

        let commands: Vec<Command> = params
            .frames()
            .expect("valid set")
            .iter()
            .map(|f| f.command)
            .collect();
        assert_eq!(
            commands,
            vec![
                Command::AutomaticTemperatureControl,
                Command::AutomaticPressureControl,
                Command::SetTemperature,
                Command::SetPressureHigh,
                Command::SetPIIntegralGain,
                Command::SetCurrentCycleNumber,
            ]
        );
    }

    #[test]
    fn test_frames_fail_as_a_whole() {
        let params = ControlParameters::new()
            .with(Parameter::TemperatureSetpoint, 70.0)
            .with(Parameter::DutyCycle, f64::NAN);
        assert!(params.frames().is_err());
    }

    #[test]
    fn test_deserialize_partial_set() {
        let params: ControlParameters =
            serde_json::from_str(r#"{ "ki": 5.0, "pressure_mode": "automatic" }"#).expect("json");
        assert_eq!(params.ki, Some(5.0));
        assert_eq!(params.pressure_mode, Some(ControlMode::Automatic));
        assert_eq!(params.kp, None);
    }
}
