//! Operating mode state machine
//!
//! The controller is authoritative: local requests (play, pause, ...) only
//! mark intent, and the mode moves when telemetry confirms it. The host
//! adds two rules of its own: transport failures force the alarm state, and
//! once in alarm only a reboot or cycle restore request lets telemetry pull
//! the mode back out.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating mode of the rig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Link not yet established
    #[default]
    SerialSetup,
    /// Idle, cycle not started or completed
    Waiting,
    /// Cycle in progress
    Running,
    /// Cycle paused by the operator
    Paused,
    /// Fault raised; cycle halted
    Alarm,
}

impl Mode {
    pub const ALL: [Mode; 5] = [
        Mode::SerialSetup,
        Mode::Waiting,
        Mode::Running,
        Mode::Paused,
        Mode::Alarm,
    ];

    /// State code as sent by the firmware
    pub fn code(&self) -> u8 {
        match self {
            Mode::Alarm => 0x01,
            Mode::Paused => 0x02,
            Mode::Running => 0x04,
            Mode::Waiting => 0x08,
            Mode::SerialSetup => 0x0a,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Mode::Alarm),
            0x02 => Some(Mode::Paused),
            0x04 => Some(Mode::Running),
            0x08 => Some(Mode::Waiting),
            0x0a => Some(Mode::SerialSetup),
            _ => None,
        }
    }

    /// Symbolic name
    pub fn name(&self) -> &'static str {
        match self {
            Mode::SerialSetup => "serial_setup",
            Mode::Waiting => "waiting",
            Mode::Running => "running",
            Mode::Paused => "paused",
            Mode::Alarm => "alarm",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Mode::Alarm => "Alarm state raised",
            Mode::Paused => "System is Paused",
            Mode::Running => "System is Running",
            Mode::Waiting => "System is Waiting",
            Mode::SerialSetup => "System is in Serial Setup",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error condition reported by the controller (or raised by the host for
/// transport failures)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    #[default]
    NoError,
    TempSensorFault,
    PresActSensorFault,
    PresAccSensorFault,
    SerialCheck,
    EmergencyButton,
    TempControlEmergency,
    PresControlEmergency,
    PresAccumulatorEmergency,
    CycleComplete,
    SerialStop,
}

impl Fault {
    pub const ALL: [Fault; 11] = [
        Fault::NoError,
        Fault::TempSensorFault,
        Fault::PresActSensorFault,
        Fault::PresAccSensorFault,
        Fault::SerialCheck,
        Fault::EmergencyButton,
        Fault::TempControlEmergency,
        Fault::PresControlEmergency,
        Fault::PresAccumulatorEmergency,
        Fault::CycleComplete,
        Fault::SerialStop,
    ];

    /// Error code as sent by the firmware
    pub fn code(&self) -> u8 {
        match self {
            Fault::NoError => 0,
            Fault::TempSensorFault => 1,
            Fault::PresActSensorFault => 2,
            Fault::PresAccSensorFault => 3,
            Fault::SerialCheck => 4,
            Fault::EmergencyButton => 5,
            Fault::TempControlEmergency => 6,
            Fault::PresControlEmergency => 7,
            Fault::PresAccumulatorEmergency => 8,
            Fault::CycleComplete => 9,
            Fault::SerialStop => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Symbolic name
    pub fn name(&self) -> &'static str {
        match self {
            Fault::NoError => "no_error",
            Fault::TempSensorFault => "temp_sensor_fault",
            Fault::PresActSensorFault => "pres_act_sensor_fault",
            Fault::PresAccSensorFault => "pres_acc_sensor_fault",
            Fault::SerialCheck => "serial_check",
            Fault::EmergencyButton => "emergency_button",
            Fault::TempControlEmergency => "temp_control_emergency",
            Fault::PresControlEmergency => "pres_control_emergency",
            Fault::PresAccumulatorEmergency => "pres_accumulator_emergency",
            Fault::CycleComplete => "cycle_complete",
            Fault::SerialStop => "serial_stop",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Fault::NoError => "No Error",
            Fault::TempSensorFault => "Temperature sensor fault reading",
            Fault::PresActSensorFault => "Pressure Actuator sensor fault reading",
            Fault::PresAccSensorFault => "Pressure Accumulator sensor fault reading",
            Fault::SerialCheck => "Serial Check Error, communication went wrong",
            Fault::EmergencyButton => "Emergency contact pressed",
            Fault::TempControlEmergency => {
                "Temperature controller error - System deviates from reference"
            }
            Fault::PresControlEmergency => {
                "Pressure controller error - System deviates from reference"
            }
            Fault::PresAccumulatorEmergency => {
                "Pressure Accumulator Error - Accumulator deviates from circuit"
            }
            Fault::CycleComplete => "All cycles have been completed",
            Fault::SerialStop => "Stop received via serial",
        }
    }

    /// Whether this fault puts the rig in alarm
    pub fn is_alarm(&self) -> bool {
        !matches!(self, Fault::NoError | Fault::CycleComplete)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operator request that was sent to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Play,
    TogglePause,
    EmergencyStop,
    Reboot,
    RestoreCycle,
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    /// A validated telemetry frame arrived
    Telemetry {
        mode: Mode,
        error: Fault,
        cycle: f32,
        max_cycle: f32,
    },
    /// Consecutive timeouts reached the configured threshold
    TimeoutLimit,
    /// The decoder could not resynchronise within its bound
    ResyncLimit,
    /// A command was sent on behalf of the operator
    Requested(Request),
}

/// Mode, error and pending recovery intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateMachine {
    mode: Mode,
    error: Fault,
    recovery_requested: bool,
    /// Set by the first validated telemetry frame
    linked: bool,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn error(&self) -> Fault {
        self.error
    }

    /// Whether a reboot/restore was requested while in alarm
    pub fn recovery_requested(&self) -> bool {
        self.recovery_requested
    }

    /// Whether any telemetry has been applied yet
    pub fn linked(&self) -> bool {
        self.linked
    }

    /// Compute the state that `event` leads to, without applying it
    pub fn next(&self, event: &Event) -> StateMachine {
        match *event {
            Event::TimeoutLimit | Event::ResyncLimit => StateMachine {
                mode: Mode::Alarm,
                error: Fault::SerialCheck,
                recovery_requested: self.mode == Mode::Alarm && self.recovery_requested,
                linked: self.linked,
            },
            Event::Requested(request) => self.on_request(request),
            Event::Telemetry {
                mode,
                error,
                cycle,
                max_cycle,
            } => self.on_telemetry(mode, error, cycle, max_cycle),
        }
    }

    /// Apply `event`; returns the previous mode when the mode changed
    pub fn apply(&mut self, event: &Event) -> Option<Mode> {
        let previous = self.mode;
        *self = self.next(event);
        (previous != self.mode).then_some(previous)
    }

    fn on_request(&self, request: Request) -> StateMachine {
        match (self.mode, request) {
            (Mode::Alarm, Request::Reboot | Request::RestoreCycle) => StateMachine {
                recovery_requested: true,
                ..*self
            },
            (
                Mode::SerialSetup | Mode::Waiting | Mode::Running | Mode::Paused | Mode::Alarm,
                Request::Play
                | Request::TogglePause
                | Request::EmergencyStop
                | Request::Reboot
                | Request::RestoreCycle,
            ) => *self,
        }
    }

    fn on_telemetry(&self, reported: Mode, error: Fault, cycle: f32, max_cycle: f32) -> StateMachine {
        // Serial check is tolerated while the controller is still in setup
        let setup_check = reported == Mode::SerialSetup && error == Fault::SerialCheck;
        if reported == Mode::Alarm || (error.is_alarm() && !setup_check) {
            return StateMachine {
                mode: Mode::Alarm,
                error,
                recovery_requested: self.mode == Mode::Alarm && self.recovery_requested,
                linked: true,
            };
        }

        if self.mode == Mode::Alarm && !self.recovery_requested {
            return *self;
        }
        if setup_check {
            return StateMachine {
                mode: Mode::SerialSetup,
                error,
                recovery_requested: false,
                linked: true,
            };
        }

        let cycles_done = max_cycle > 0.0 && cycle >= max_cycle;
        let completed = error == Fault::CycleComplete
            || (cycles_done && matches!(reported, Mode::Running | Mode::Waiting));

        let mode = match (self.mode, reported) {
            _ if completed => Mode::Waiting,
            // First exchange: the link is up even if the controller still says setup
            (Mode::SerialSetup, Mode::SerialSetup) if !self.linked => Mode::Waiting,
            // Controller rebooted and dropped back to setup
            (_, Mode::SerialSetup) => Mode::SerialSetup,
            (_, Mode::Waiting) => Mode::Waiting,
            (_, Mode::Running) => Mode::Running,
            (_, Mode::Paused) => Mode::Paused,
            (_, Mode::Alarm) => Mode::Alarm,
        };

        StateMachine {
            mode,
            error: if completed {
                Fault::CycleComplete
            } else {
                error
            },
            recovery_requested: false,
            linked: true,
        }
    }
}
