//! Rig control
//!
//! Host-side view of the thermal/pressure cycling rig: the operating mode
//! state machine, the telemetry snapshot, requested parameters and the
//! `Session` that ties them to a link.

mod params;
mod session;
mod state;
mod telemetry;

pub use params::{ControlParameters, Parameter, MAX_CYCLE_COUNT};
pub use session::{Diagnostics, Session, SessionConfig, UpdateOutcome};
pub use state::{Event, Fault, Mode, Request, StateMachine};
pub use telemetry::{ActuatorConfig, ControlMode, TelemetrySnapshot};
