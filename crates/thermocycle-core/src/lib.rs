//! # Thermocycle Core Library
//!
//! Host-side control of a thermal/pressure cycling rig over a serial link.

#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The controller's fixed-frame serial protocol (command and telemetry frames)
//! - A polling `Session` that tracks the rig's operating mode and last telemetry
//! - A simulated controller for demos and tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use thermocycle_core::rig::{Session, SessionConfig};
//!
//! let mut session = Session::open("/dev/ttyACM0", SessionConfig::default())?;
//! session.set_max_cycle(331630.0)?;
//! session.play()?;
//!
//! loop {
//!     session.update()?;
//!     println!("{} cycle {}", session.mode(), session.cycle());
//! }
//! ```

pub mod protocol;
pub mod rig;
pub mod sim;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{Checksum, ProtocolError};
    pub use crate::rig::{
        ControlMode, ControlParameters, Fault, Mode, Parameter, Session, SessionConfig,
        TelemetrySnapshot, UpdateOutcome,
    };
    pub use crate::sim::{SimLink, SimulatedRig};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
