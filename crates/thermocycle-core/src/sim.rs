//! Simulated rig controller
//!
//! An in-process controller that speaks the serial protocol, for demos and
//! tests without hardware. It waits for the signature byte, applies command
//! frames, and answers each heartbeat with a telemetry frame generated from
//! a simple thermal/pressure model with a little measurement noise.
//!
//! The controller state sits behind an `Arc<Mutex<..>>` so a test can keep a
//! handle and inject faults while a `Session` owns the [`SimLink`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::protocol::{
    Checksum, CloseHandle, Command, CommandFrame, Link, ProtocolError, TelemetryFrame,
    COMMAND_FRAME_LEN, SIGNATURE_BYTE,
};
use crate::rig::{ActuatorConfig, ControlMode, Fault, Mode};

/// Simulated seconds that pass on each heartbeat
const TICK_SECONDS: f32 = 0.1;

/// Ambient temperature the rig drifts back to
const AMBIENT_TEMPERATURE: f32 = 22.0;

/// Accumulator pressure when full
const SUPPLY_PRESSURE: f32 = 40.0;

/// Parameters the controller keeps (and can persist)
#[derive(Debug, Clone, Copy, PartialEq)]
struct RigParams {
    t_set: f32,
    p_set: f32,
    p_high: f32,
    p_low: f32,
    kp: f32,
    ki: f32,
    u_pres: f32,
    period: f32,
    duty_cycle: f32,
    cycle: f32,
    max_cycle: f32,
}

impl Default for RigParams {
    fn default() -> Self {
        Self {
            t_set: 70.0,
            p_set: 0.0,
            p_high: 30.0,
            p_low: 5.0,
            kp: 2.0,
            ki: 0.5,
            u_pres: 0.0,
            period: 10.0,
            duty_cycle: 0.5,
            cycle: 0.0,
            max_cycle: 0.0,
        }
    }
}

/// Controller model behind a [`SimLink`]
pub struct SimulatedRig {
    checksum: Checksum,
    mode: Mode,
    error: Fault,
    config: ActuatorConfig,
    params: RigParams,
    stored: RigParams,
    t_meas: f32,
    p_meas: f32,
    q_meas: f32,
    integral: f32,
    phase: f32,
    rng: StdRng,
    // fault injection
    silent: bool,
    corrupt_next: usize,
    chunk_size: usize,
    cycles_per_heartbeat: u32,
    report_completion: bool,
    prefix: Vec<u8>,
    // wire buffers
    input: Vec<u8>,
    output: VecDeque<u8>,
    received: Vec<CommandFrame>,
    rejected_bytes: usize,
    signatures: usize,
    heartbeats: usize,
}

impl SimulatedRig {
    /// Create a rig in serial setup using `checksum` for both directions
    pub fn new(checksum: Checksum) -> Self {
        Self::with_seed(checksum, 0x5eed)
    }

    /// Create a rig with a fixed noise seed
    pub fn with_seed(checksum: Checksum, seed: u64) -> Self {
        Self {
            checksum,
            mode: Mode::SerialSetup,
            error: Fault::NoError,
            config: ActuatorConfig::default(),
            params: RigParams::default(),
            stored: RigParams::default(),
            t_meas: AMBIENT_TEMPERATURE,
            p_meas: 0.0,
            q_meas: SUPPLY_PRESSURE,
            integral: 0.0,
            phase: 0.0,
            rng: StdRng::seed_from_u64(seed),
            silent: false,
            corrupt_next: 0,
            chunk_size: 0,
            cycles_per_heartbeat: 1,
            report_completion: true,
            prefix: Vec::new(),
            input: Vec::new(),
            output: VecDeque::new(),
            received: Vec::new(),
            rejected_bytes: 0,
            signatures: 0,
            heartbeats: 0,
        }
    }

    /// Wrap the rig for sharing between a link and a test
    pub fn shared(self) -> Arc<Mutex<SimulatedRig>> {
        Arc::new(Mutex::new(self))
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn error(&self) -> Fault {
        self.error
    }

    pub fn config(&self) -> ActuatorConfig {
        self.config
    }

    pub fn ki(&self) -> f32 {
        self.params.ki
    }

    pub fn cycle(&self) -> f32 {
        self.params.cycle
    }

    pub fn p_high(&self) -> f32 {
        self.params.p_high
    }

    pub fn p_low(&self) -> f32 {
        self.params.p_low
    }

    /// Every command frame accepted so far, in arrival order
    pub fn commands(&self) -> &[CommandFrame] {
        &self.received
    }

    /// Bytes dropped while hunting for a valid command frame
    pub fn rejected_bytes(&self) -> usize {
        self.rejected_bytes
    }

    /// Signature bytes seen while in serial setup
    pub fn signatures(&self) -> usize {
        self.signatures
    }

    pub fn heartbeats(&self) -> usize {
        self.heartbeats
    }

    /// Stop answering heartbeats
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Flip a byte in each of the next `count` telemetry frames
    pub fn corrupt_next(&mut self, count: usize) {
        self.corrupt_next = count;
    }

    /// Deliver at most `size` bytes per read (0 for no limit)
    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size;
    }

    /// Cycles counted per heartbeat while running
    pub fn set_cycles_per_heartbeat(&mut self, cycles: u32) {
        self.cycles_per_heartbeat = cycles;
    }

    /// Whether the rig itself reports cycle_complete when the target is hit
    ///
    /// With this off the rig keeps reporting running at the limit.
    pub fn set_report_completion(&mut self, report: bool) {
        self.report_completion = report;
    }

    /// Emit raw bytes ahead of the next heartbeat response
    ///
    /// The bytes go out even while the rig is silent.
    pub fn inject_bytes(&mut self, bytes: &[u8]) {
        self.prefix.extend_from_slice(bytes);
    }

    /// Raise a fault as the hardware would
    pub fn inject_fault(&mut self, fault: Fault) {
        self.error = fault;
        if fault.is_alarm() {
            self.mode = Mode::Alarm;
        }
    }

    /// Drop any queued output
    fn clear_output(&mut self) {
        self.output.clear();
    }

    fn take_output(&mut self) -> Vec<u8> {
        let n = if self.chunk_size == 0 {
            self.output.len()
        } else {
            self.chunk_size.min(self.output.len())
        };
        self.output.drain(..n).collect()
    }

    /// Feed bytes written by the host
    pub fn receive(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);

        loop {
            if self.mode == Mode::SerialSetup {
                match self.input.iter().position(|b| *b == SIGNATURE_BYTE) {
                    Some(pos) => {
                        self.rejected_bytes += pos;
                        self.input.drain(..=pos);
                        self.signatures += 1;
                        self.mode = Mode::Waiting;
                        self.error = Fault::NoError;
                        debug!("sim: signature received, waiting");
                        continue;
                    }
                    None => {
                        self.input.clear();
                        return;
                    }
                }
            }

            if self.input.len() < COMMAND_FRAME_LEN {
                return;
            }
            match CommandFrame::from_bytes(&self.input[..COMMAND_FRAME_LEN], self.checksum) {
                Ok(frame) => {
                    self.input.drain(..COMMAND_FRAME_LEN);
                    self.received.push(frame);
                    self.execute(frame);
                }
                Err(e) => {
                    trace!("sim: dropping byte ({})", e);
                    self.input.remove(0);
                    self.rejected_bytes += 1;
                }
            }
        }
    }

    fn execute(&mut self, frame: CommandFrame) {
        let value = frame.float_value();
        match frame.command {
            Command::Heartbeat => self.heartbeat(),
            Command::ManualTemperatureControl => {
                self.config = self.config.with(ActuatorConfig::TEMPERATURE_AUTO, false)
            }
            Command::AutomaticTemperatureControl => {
                self.config = self.config.with(ActuatorConfig::TEMPERATURE_AUTO, true)
            }
            Command::ManualPressureControl => {
                self.config = self.config.with(ActuatorConfig::PRESSURE_AUTO, false)
            }
            Command::AutomaticPressureControl => {
                self.config = self.config.with(ActuatorConfig::PRESSURE_AUTO, true)
            }
            Command::TogglePauseCycle => {
                self.mode = match self.mode {
                    Mode::Running => Mode::Paused,
                    Mode::Paused => Mode::Running,
                    other => other,
                }
            }
            Command::EmergencyStopCycle => {
                self.mode = Mode::Alarm;
                self.error = Fault::SerialStop;
                self.config = self.config.with(ActuatorConfig::PRESSURE_ACTUATOR, false);
            }
            Command::ToggleChillerActuation => {
                self.config = self.config.with(ActuatorConfig::CHILLER, !self.config.chiller())
            }
            Command::ToggleResistanceActuation => {
                self.config = self
                    .config
                    .with(ActuatorConfig::RESISTANCE, !self.config.resistance())
            }
            Command::SetTemperature => self.params.t_set = value,
            Command::SetPressureHigh => self.params.p_high = value,
            Command::SetPressureLow => self.params.p_low = value,
            Command::SetPressure => self.params.p_set = value,
            Command::OverridePIControl => self.params.u_pres = value,
            Command::SetPIProportionalGain => self.params.kp = value,
            Command::SetPIIntegralGain => self.params.ki = value,
            Command::SetMaximumCycleNumber => self.params.max_cycle = value,
            Command::SetCurrentCycleNumber => self.params.cycle = value,
            Command::SetReferencePeriod => self.params.period = value,
            Command::SetReferenceDutyCycle => self.params.duty_cycle = value,
            Command::SystemReboot => {
                debug!("sim: reboot");
                self.params = self.stored;
                self.config = ActuatorConfig::default();
                self.mode = Mode::SerialSetup;
                self.error = Fault::NoError;
                self.integral = 0.0;
                self.input.clear();
            }
            Command::StartCycle => {
                if self.mode == Mode::Waiting {
                    self.mode = Mode::Running;
                    self.error = Fault::NoError;
                    self.config = self.config.with(ActuatorConfig::PRESSURE_ACTUATOR, true);
                }
            }
            Command::SaveStorageConfig => self.stored = self.params,
            Command::LoadStorageConfig => {
                let cycle = self.params.cycle;
                self.params = self.stored;
                self.params.cycle = cycle;
            }
            Command::LoadStorageCycle => {
                self.params.cycle = self.stored.cycle;
                if self.mode == Mode::Alarm {
                    self.mode = Mode::Waiting;
                    self.error = Fault::NoError;
                }
            }
        }
    }

    fn heartbeat(&mut self) {
        self.heartbeats += 1;
        self.step();
        self.output.extend(self.prefix.drain(..));
        if self.silent {
            return;
        }

        let mut bytes = self.telemetry().to_bytes(self.checksum);
        if self.corrupt_next > 0 {
            self.corrupt_next -= 1;
            bytes[0] ^= 0xff;
        }
        self.output.extend(bytes);
    }

    fn step(&mut self) {
        let p = self.params;

        // Temperature: first-order approach to the target
        let target = if self.config.temperature_mode() == ControlMode::Automatic {
            p.t_set
        } else if self.config.resistance() {
            p.t_set + 10.0
        } else if self.config.chiller() {
            AMBIENT_TEMPERATURE - 10.0
        } else {
            AMBIENT_TEMPERATURE
        };
        self.t_meas += (target - self.t_meas) * 0.05 + self.noise(0.05);

        if self.mode == Mode::Running {
            self.phase += TICK_SECONDS;
            let period = if p.period > 0.0 { p.period } else { 1.0 };
            if self.phase >= period {
                self.phase -= period;
            }
            self.params.p_set = if self.phase < period * p.duty_cycle {
                p.p_high
            } else {
                p.p_low
            };

            self.params.cycle += self.cycles_per_heartbeat as f32;
            if p.max_cycle > 0.0 && self.params.cycle >= p.max_cycle {
                self.params.cycle = p.max_cycle;
                if self.report_completion {
                    self.mode = Mode::Waiting;
                    self.error = Fault::CycleComplete;
                    self.config = self.config.with(ActuatorConfig::PRESSURE_ACTUATOR, false);
                    debug!("sim: cycle complete at {}", self.params.cycle);
                }
            }
        }

        // Pressure: PI loop in automatic, raw output in manual
        let error = self.params.p_set - self.p_meas;
        if self.config.pressure_mode() == ControlMode::Automatic {
            self.integral = (self.integral + error * TICK_SECONDS).clamp(-100.0, 100.0);
            self.params.u_pres = (p.kp * error + p.ki * self.integral).clamp(0.0, 255.0);
        }
        let drive = if self.config.pressure_actuator() {
            self.params.u_pres / 255.0 * self.q_meas
        } else {
            0.0
        };
        self.p_meas += (drive - self.p_meas) * 0.2 + self.noise(0.02);
        self.q_meas = (self.q_meas + (SUPPLY_PRESSURE - self.q_meas) * 0.1 - drive * 0.01)
            .clamp(0.0, SUPPLY_PRESSURE);
    }

    fn noise(&mut self, amplitude: f32) -> f32 {
        self.rng.gen_range(-amplitude..=amplitude)
    }

    /// Telemetry frame describing the current controller state
    pub fn telemetry(&self) -> TelemetryFrame {
        let p = self.params;
        TelemetryFrame {
            t_meas: self.t_meas,
            p_meas: self.p_meas,
            q_meas: self.q_meas,
            kp: p.kp,
            ki: p.ki,
            t_set: p.t_set,
            p_set: p.p_set,
            u_pres: p.u_pres,
            period: p.period,
            duty_cycle: p.duty_cycle,
            cycle: p.cycle,
            max_cycle: p.max_cycle,
            config: self.config,
            mode: self.mode,
            error: self.error,
        }
    }
}

fn lock(rig: &Mutex<SimulatedRig>) -> MutexGuard<'_, SimulatedRig> {
    rig.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Link that talks to a [`SimulatedRig`]
pub struct SimLink {
    name: String,
    rig: Arc<Mutex<SimulatedRig>>,
    open: bool,
    poll_interval: Duration,
}

impl SimLink {
    pub fn new(rig: Arc<Mutex<SimulatedRig>>) -> Self {
        Self {
            name: "sim".to_string(),
            rig,
            open: true,
            poll_interval: Duration::from_millis(1),
        }
    }

    /// Link plus a handle to the rig behind it
    pub fn pair(rig: SimulatedRig) -> (Self, Arc<Mutex<SimulatedRig>>) {
        let shared = rig.shared();
        (Self::new(Arc::clone(&shared)), shared)
    }
}

impl Link for SimLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, timeout: Duration, cancel: &CloseHandle) -> Result<Vec<u8>, ProtocolError> {
        let start = Instant::now();
        loop {
            if cancel.is_closed() || !self.open {
                return Err(ProtocolError::Closed);
            }
            let bytes = lock(&self.rig).take_output();
            if !bytes.is_empty() {
                return Ok(bytes);
            }
            if start.elapsed() >= timeout {
                return Err(ProtocolError::Timeout);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if !self.open {
            return Err(ProtocolError::Closed);
        }
        lock(&self.rig).receive(data);
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), ProtocolError> {
        lock(&self.rig).clear_output();
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
