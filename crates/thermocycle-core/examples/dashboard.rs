//! Console dashboard
//!
//! Configures the rig, starts the cycle and prints the telemetry every
//! 100 ms until the cycles are done or the rig raises an alarm.
//!
//! ```text
//! cargo run --example dashboard                  # simulated rig
//! cargo run --example dashboard -- /dev/ttyACM0  # real controller
//! cargo run --example dashboard -- --auto        # first detected controller
//! cargo run --example dashboard -- --list        # list controller ports
//! ```
//!
//! `RUST_LOG=thermocycle_core=debug` shows the frames on the wire.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use thermocycle_core::prelude::*;
use thermocycle_core::protocol::list_ports;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn open_session(port: Option<&str>) -> Result<Session> {
    match port {
        Some("--auto") => {
            Session::open_detected(SessionConfig::default()).context("opening the detected controller")
        }
        Some(path) => Session::open(path, SessionConfig::default())
            .with_context(|| format!("opening {}", path)),
        None => {
            let (link, rig) = SimLink::pair(SimulatedRig::new(Checksum::Additive));
            rig.lock()
                .map_err(|_| anyhow::anyhow!("simulator lock poisoned"))?
                .set_cycles_per_heartbeat(2);
            let config = SessionConfig {
                settle_delay_ms: 0,
                ..Default::default()
            };
            Session::with_link(Box::new(link), config).context("connecting to the simulated rig")
        }
    }
}

fn render(session: &Session) {
    println!(
        "{:<12} {:<14} T {:6.2}/{:6.2} C  P {:6.2}/{:6.2} bar  acc {:6.2} bar  u {:6.1}  cycle {:>8}/{:<8} {}{}{}",
        session.mode().name(),
        session.error().name(),
        session.t_meas(),
        session.t_set(),
        session.p_actuator_meas(),
        session.p_set(),
        session.p_accumulator_meas(),
        session.u_pres(),
        session.cycle(),
        session.max_cycle(),
        if session.chiller() { "C" } else { "-" },
        if session.resistance() { "R" } else { "-" },
        if session.actuator() { "A" } else { "-" },
    );
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "thermocycle_core=info".into()),
        )
        .init();

    let arg = std::env::args().nth(1);
    if arg.as_deref() == Some("--list") {
        for port in list_ports() {
            println!(
                "{} {:04x}:{:04x} {:?} {}",
                port.name,
                port.vid,
                port.pid,
                port.bridge,
                port.product.unwrap_or_default()
            );
        }
        return Ok(());
    }

    let mut session = open_session(arg.as_deref())?;
    println!("Connected to {}: {}", session.name(), session.mode_description());

    let params = ControlParameters {
        temperature_mode: Some(ControlMode::Automatic),
        pressure_mode: Some(ControlMode::Automatic),
        ..Default::default()
    }
    .with(Parameter::TemperatureSetpoint, 70.0)
    .with(Parameter::PressureHigh, 30.0)
    .with(Parameter::PressureLow, 5.0)
    .with(Parameter::ProportionalGain, 2.0)
    .with(Parameter::IntegralGain, 0.5)
    .with(Parameter::Period, 4.0)
    .with(Parameter::DutyCycle, 0.5)
    .with(Parameter::MaxCycle, 200.0)
    .with(Parameter::Cycle, 0.0);
    session.push_parameters(&params)?;
    session.play()?;

    loop {
        thread::sleep(POLL_INTERVAL);
        match session.update()? {
            UpdateOutcome::Applied => render(&session),
            outcome => println!("{:?}", outcome),
        }

        match session.mode() {
            Mode::Alarm => {
                println!("Alarm: {}", session.error_description());
                break;
            }
            Mode::Waiting if session.error() == Fault::CycleComplete => {
                println!("{}", session.error_description());
                break;
            }
            _ => {}
        }
    }

    let diagnostics = session.diagnostics();
    println!(
        "{} frames sent, {} received, {} resyncs, {} timeouts",
        diagnostics.frames_sent,
        diagnostics.frames_received,
        diagnostics.resyncs,
        diagnostics.timeouts
    );
    session.close();
    Ok(())
}
