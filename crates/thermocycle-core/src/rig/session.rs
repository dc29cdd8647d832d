//! Session management
//!
//! A `Session` owns the link to one controller. It pushes commands
//! fire-and-forget and learns their effect only through telemetry, which the
//! caller pulls with [`Session::update`].

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::{
    ActuatorConfig, ControlMode, ControlParameters, Event, Fault, Mode, Parameter, Request,
    StateMachine, TelemetrySnapshot,
};
use crate::protocol::{
    Checksum, CloseHandle, Command, CommandFrame, DecodeStatus, FrameDecoder, Link, ProtocolError,
    list_ports, select_controller, SerialLink, TelemetryFrame, DEFAULT_BAUD_RATE,
    DEFAULT_TIMEOUT_MS, SIGNATURE_BYTE,
};

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// How long `update` waits for a telemetry frame
    pub read_timeout_ms: u64,
    /// Consecutive failed exchanges before the session raises serial_check
    pub timeout_threshold: u32,
    /// Single-byte resync steps allowed per exchange
    pub max_resync_attempts: usize,
    /// Frame checksum algorithm
    pub checksum: Checksum,
    /// Delay after the signature byte; the controller resets on port open
    pub settle_delay_ms: u64,
    /// Read polling slice
    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_TIMEOUT_MS,
            timeout_threshold: 10,
            max_resync_attempts: 64,
            checksum: Checksum::Additive,
            settle_delay_ms: 2000,
            poll_interval_ms: 2,
        }
    }
}

impl SessionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// What a call to [`Session::update`] achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A valid frame replaced the snapshot
    Applied,
    /// Nothing arrived before the read timeout
    TimedOut { consecutive: u32 },
    /// Bytes arrived but none formed a valid frame before the timeout
    Discarded { consecutive: u32 },
    /// Resync attempts ran out; the session is in alarm with serial_check
    SyncLost,
}

/// Link health counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub checksum_failures: u64,
    pub invalid_frames: u64,
    pub resyncs: u64,
    pub timeouts: u64,
    pub consecutive_timeouts: u32,
    /// Description of the last transport problem
    pub last_fault: Option<String>,
}

/// Live control/telemetry session bound to one controller
pub struct Session {
    link: Option<Box<dyn Link>>,
    name: String,
    config: SessionConfig,
    decoder: FrameDecoder,
    machine: StateMachine,
    snapshot: Option<TelemetrySnapshot>,
    requested: ControlParameters,
    close_handle: CloseHandle,
    awaiting_signature: bool,
    consecutive_timeouts: u32,
    frames_sent: u64,
    timeouts: u64,
    last_fault: Option<String>,
}

impl Session {
    /// Open the serial device at `path` and synchronise with the controller
    pub fn open(path: &str, config: SessionConfig) -> Result<Self, ProtocolError> {
        let link = SerialLink::open(path, config.baud_rate, config.poll_interval())?;
        Self::with_link(Box::new(link), config)
    }

    /// Find the controller among the attached USB serial ports and open it
    pub fn open_detected(config: SessionConfig) -> Result<Self, ProtocolError> {
        let ports = list_ports();
        let port = select_controller(&ports)?;
        info!("Detected {:?} controller at {}", port.bridge, port.name);
        Self::open(&port.name, config)
    }

    /// Build a session over an already opened link and run the handshake
    ///
    /// The handshake writes the signature byte, waits for the controller to
    /// settle and tries one telemetry exchange. A controller that stays
    /// silent leaves the session in serial_setup; a failing link is a
    /// [`ProtocolError::Connection`] and the link is released.
    pub fn with_link(link: Box<dyn Link>, config: SessionConfig) -> Result<Self, ProtocolError> {
        let mut session = Self {
            name: link.name().to_string(),
            link: Some(link),
            decoder: FrameDecoder::new(config.checksum, config.max_resync_attempts),
            config,
            machine: StateMachine::new(),
            snapshot: None,
            requested: ControlParameters::new(),
            close_handle: CloseHandle::new(),
            awaiting_signature: false,
            consecutive_timeouts: 0,
            frames_sent: 0,
            timeouts: 0,
            last_fault: None,
        };

        match session.handshake() {
            Ok(()) => Ok(session),
            Err(e) => {
                session.close();
                Err(match e {
                    ProtocolError::Connection(msg) => ProtocolError::Connection(msg),
                    other => ProtocolError::Connection(format!("handshake failed: {}", other)),
                })
            }
        }
    }

    fn handshake(&mut self) -> Result<(), ProtocolError> {
        let link = self.link_mut()?;
        link.clear_input()?;
        link.write(&[SIGNATURE_BYTE])?;
        debug!("handshake: signature {:#04x} sent to {}", SIGNATURE_BYTE, self.name);

        let settle = self.config.settle_delay();
        if !settle.is_zero() {
            debug!("handshake: waiting {}ms for the controller to settle", settle.as_millis());
            std::thread::sleep(settle);
        }

        match self.exchange()? {
            UpdateOutcome::Applied => info!("Connected to {} ({})", self.name, self.machine.mode()),
            outcome => {
                debug!("handshake: no telemetry yet ({:?}), staying in serial setup", outcome);
                self.machine = StateMachine::new();
                self.awaiting_signature = true;
            }
        }
        self.consecutive_timeouts = 0;
        Ok(())
    }

    fn link_mut(&mut self) -> Result<&mut Box<dyn Link>, ProtocolError> {
        match self.link.as_mut() {
            Some(link) if link.is_open() => Ok(link),
            _ => Err(ProtocolError::Closed),
        }
    }

    /// Fail with `Closed` if the session was closed here or via a handle
    fn ensure_open(&mut self) -> Result<(), ProtocolError> {
        if self.close_handle.is_closed() {
            self.release();
            return Err(ProtocolError::Closed);
        }
        self.link_mut().map(|_| ())
    }

    fn release(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
            info!("Session on {} closed", self.name);
        }
    }

    fn send(&mut self, frame: CommandFrame) -> Result<(), ProtocolError> {
        self.ensure_open()?;
        let bytes = frame.to_bytes(self.config.checksum);
        self.link_mut()?.write(&bytes)?;
        self.frames_sent += 1;
        debug!("Sent {:?} ({:02x?})", frame.command, bytes);
        Ok(())
    }

    fn command(&mut self, command: Command) -> Result<(), ProtocolError> {
        self.send(CommandFrame::bare(command))
    }

    fn request(&mut self, command: Command, request: Request) -> Result<(), ProtocolError> {
        self.command(command)?;
        self.machine.apply(&Event::Requested(request));
        Ok(())
    }

    /// Poll the controller once
    ///
    /// Transport trouble is reported through the outcome and the
    /// mode/error, never as `Err`; `Err` means the session is closed or the
    /// link failed outright.
    pub fn update(&mut self) -> Result<UpdateOutcome, ProtocolError> {
        self.ensure_open()?;
        self.exchange()
    }

    fn exchange(&mut self) -> Result<UpdateOutcome, ProtocolError> {
        self.decoder.reset();
        let resend = self.awaiting_signature;
        let link = self.link_mut()?;
        link.clear_input()?;
        if resend {
            link.write(&[SIGNATURE_BYTE])?;
            debug!("Resent signature to {}", self.name);
        }
        self.command(Command::Heartbeat)?;

        let timeout = self.config.read_timeout();
        let start = Instant::now();
        let mut received_any = false;

        loop {
            match self.decoder.next_frame() {
                DecodeStatus::Frame(frame) => return Ok(self.apply_frame(frame)),
                DecodeStatus::ResyncExhausted => return Ok(self.on_sync_lost()),
                DecodeStatus::NeedMore => {}
            }

            let remaining = match timeout.checked_sub(start.elapsed()) {
                Some(r) if !r.is_zero() => r,
                _ => return Ok(self.on_timeout(received_any)),
            };

            let link = self.link.as_mut().ok_or(ProtocolError::Closed)?;
            match link.read(remaining, &self.close_handle) {
                Ok(bytes) => {
                    received_any = true;
                    self.decoder.push(&bytes);
                }
                Err(ProtocolError::Timeout) => return Ok(self.on_timeout(received_any)),
                // A link that validates its own framing reports bad bytes here
                Err(e) if e.is_transient() => {
                    debug!("read from {} failed: {}", self.name, e);
                    return Ok(self.on_timeout(true));
                }
                Err(ProtocolError::Closed) => {
                    self.release();
                    return Err(ProtocolError::Closed);
                }
                Err(e) => {
                    self.last_fault = Some(e.to_string());
                    return Err(e);
                }
            }
        }
    }

    fn apply_frame(&mut self, frame: TelemetryFrame) -> UpdateOutcome {
        self.snapshot = Some(TelemetrySnapshot::capture(&frame));
        self.consecutive_timeouts = 0;

        let event = Event::Telemetry {
            mode: frame.mode,
            error: frame.error,
            cycle: frame.cycle,
            max_cycle: frame.max_cycle,
        };
        if let Some(previous) = self.machine.apply(&event) {
            info!(
                "Mode {} -> {} (error: {})",
                previous,
                self.machine.mode(),
                self.machine.error()
            );
        }

        // A controller back in setup waits for the signature again
        self.awaiting_signature = frame.mode == Mode::SerialSetup;
        UpdateOutcome::Applied
    }

    fn on_timeout(&mut self, received_any: bool) -> UpdateOutcome {
        self.consecutive_timeouts += 1;
        self.timeouts += 1;
        let consecutive = self.consecutive_timeouts;
        let reason = if received_any {
            "no valid telemetry frame"
        } else {
            "no response"
        };
        warn!("{} from {} ({} in a row)", reason, self.name, consecutive);
        self.last_fault = Some(reason.to_string());

        if consecutive >= self.config.timeout_threshold.max(1) {
            self.force_serial_check(Event::TimeoutLimit);
        }

        if received_any {
            UpdateOutcome::Discarded { consecutive }
        } else {
            UpdateOutcome::TimedOut { consecutive }
        }
    }

    fn on_sync_lost(&mut self) -> UpdateOutcome {
        self.last_fault = Some("telemetry resync limit reached".to_string());
        self.force_serial_check(Event::ResyncLimit);
        UpdateOutcome::SyncLost
    }

    fn force_serial_check(&mut self, event: Event) {
        let was_checked = self.machine.mode() == Mode::Alarm && self.machine.error() == Fault::SerialCheck;
        self.machine.apply(&event);
        if !was_checked {
            error!("Link to {} unreliable ({:?}), raising alarm", self.name, event);
        }
    }

    /// Close the session and release the link; further calls are no-ops
    pub fn close(&mut self) {
        self.close_handle.close();
        self.release();
    }

    /// Handle that closes this session from another thread
    pub fn close_handle(&self) -> CloseHandle {
        self.close_handle.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.close_handle.is_closed() || self.link.is_none()
    }

    // -- setters ---------------------------------------------------------

    /// Validate and send one parameter value
    pub fn set(&mut self, parameter: Parameter, value: f64) -> Result<(), ProtocolError> {
        self.ensure_open()?;
        let frame = parameter.frame(value)?;
        self.send(frame)?;
        self.requested.set(parameter, value);
        Ok(())
    }

    pub fn set_t_set(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.set(Parameter::TemperatureSetpoint, value)
    }

    pub fn set_p_set(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.set(Parameter::PressureSetpoint, value)
    }

    pub fn set_p_high(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.set(Parameter::PressureHigh, value)
    }

    pub fn set_p_low(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.set(Parameter::PressureLow, value)
    }

    pub fn set_kp(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.set(Parameter::ProportionalGain, value)
    }

    pub fn set_ki(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.set(Parameter::IntegralGain, value)
    }

    /// Manual pressure controller output (0..255 units)
    pub fn set_u_pres(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.set(Parameter::ManualOutput, value)
    }

    pub fn set_period(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.set(Parameter::Period, value)
    }

    pub fn set_duty_cycle(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.set(Parameter::DutyCycle, value)
    }

    pub fn set_cycle(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.set(Parameter::Cycle, value)
    }

    pub fn set_max_cycle(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.set(Parameter::MaxCycle, value)
    }

    /// Send every value present in `params`; returns the number of frames sent
    ///
    /// The whole set is validated before the first write.
    pub fn push_parameters(&mut self, params: &ControlParameters) -> Result<usize, ProtocolError> {
        self.ensure_open()?;
        let frames = params.frames()?;
        for frame in &frames {
            self.send(*frame)?;
            self.requested.adopt(params, frame.command);
        }
        Ok(frames.len())
    }

    // -- mode toggles ----------------------------------------------------

    pub fn auto_temperature(&mut self) -> Result<(), ProtocolError> {
        self.command(Command::AutomaticTemperatureControl)?;
        self.requested.temperature_mode = Some(ControlMode::Automatic);
        Ok(())
    }

    pub fn manual_temperature(&mut self) -> Result<(), ProtocolError> {
        self.command(Command::ManualTemperatureControl)?;
        self.requested.temperature_mode = Some(ControlMode::Manual);
        Ok(())
    }

    pub fn auto_pressure(&mut self) -> Result<(), ProtocolError> {
        self.command(Command::AutomaticPressureControl)?;
        self.requested.pressure_mode = Some(ControlMode::Automatic);
        Ok(())
    }

    pub fn manual_pressure(&mut self) -> Result<(), ProtocolError> {
        self.command(Command::ManualPressureControl)?;
        self.requested.pressure_mode = Some(ControlMode::Manual);
        Ok(())
    }

    pub fn toggle_chiller(&mut self) -> Result<(), ProtocolError> {
        self.command(Command::ToggleChillerActuation)
    }

    pub fn toggle_resistance(&mut self) -> Result<(), ProtocolError> {
        self.command(Command::ToggleResistanceActuation)
    }

    pub fn toggle_pause(&mut self) -> Result<(), ProtocolError> {
        self.request(Command::TogglePauseCycle, Request::TogglePause)
    }

    pub fn emergency_stop(&mut self) -> Result<(), ProtocolError> {
        self.request(Command::EmergencyStopCycle, Request::EmergencyStop)
    }

    /// Reboot the controller; the session re-synchronises on the next update
    pub fn reboot(&mut self) -> Result<(), ProtocolError> {
        self.request(Command::SystemReboot, Request::Reboot)?;
        self.awaiting_signature = true;
        Ok(())
    }

    /// Ask the controller to persist its parameters
    pub fn save_config(&mut self) -> Result<(), ProtocolError> {
        self.command(Command::SaveStorageConfig)
    }

    /// Ask the controller to restore its persisted parameters
    pub fn load_config(&mut self) -> Result<(), ProtocolError> {
        self.command(Command::LoadStorageConfig)
    }

    /// Restore the persisted cycle counter
    pub fn restore_cycle(&mut self) -> Result<(), ProtocolError> {
        self.request(Command::LoadStorageCycle, Request::RestoreCycle)
    }

    /// Start the cycle; the mode moves to running once telemetry confirms it
    pub fn play(&mut self) -> Result<(), ProtocolError> {
        self.request(Command::StartCycle, Request::Play)
    }

    // -- accessors -------------------------------------------------------

    /// Device path or link name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.machine.mode()
    }

    pub fn error(&self) -> Fault {
        self.machine.error()
    }

    pub fn mode_description(&self) -> &'static str {
        self.machine.mode().description()
    }

    pub fn error_description(&self) -> &'static str {
        self.machine.error().description()
    }

    /// Last validated telemetry, if any arrived yet
    pub fn snapshot(&self) -> Option<&TelemetrySnapshot> {
        self.snapshot.as_ref()
    }

    /// Values requested through this session (not necessarily applied)
    pub fn requested(&self) -> &ControlParameters {
        &self.requested
    }

    fn field(&self, get: impl Fn(&TelemetrySnapshot) -> f32) -> f32 {
        self.snapshot.as_ref().map(get).unwrap_or(0.0)
    }

    pub fn t_meas(&self) -> f32 {
        self.field(|s| s.t_meas)
    }

    pub fn p_actuator_meas(&self) -> f32 {
        self.field(|s| s.p_actuator_meas)
    }

    pub fn p_accumulator_meas(&self) -> f32 {
        self.field(|s| s.p_accumulator_meas)
    }

    pub fn kp(&self) -> f32 {
        self.field(|s| s.kp)
    }

    pub fn ki(&self) -> f32 {
        self.field(|s| s.ki)
    }

    pub fn t_set(&self) -> f32 {
        self.field(|s| s.t_set)
    }

    pub fn p_set(&self) -> f32 {
        self.field(|s| s.p_set)
    }

    pub fn u_pres(&self) -> f32 {
        self.field(|s| s.u_pres)
    }

    pub fn period(&self) -> f32 {
        self.field(|s| s.period)
    }

    pub fn duty_cycle(&self) -> f32 {
        self.field(|s| s.duty_cycle)
    }

    pub fn cycle(&self) -> f32 {
        self.field(|s| s.cycle)
    }

    pub fn max_cycle(&self) -> f32 {
        self.field(|s| s.max_cycle)
    }

    pub fn cycle_progress(&self) -> Option<f32> {
        self.snapshot.as_ref().and_then(|s| s.cycle_progress())
    }

    fn actuators(&self) -> ActuatorConfig {
        self.snapshot.as_ref().map(|s| s.actuators).unwrap_or_default()
    }

    pub fn chiller(&self) -> bool {
        self.actuators().chiller()
    }

    pub fn resistance(&self) -> bool {
        self.actuators().resistance()
    }

    /// Pressure actuator output
    pub fn actuator(&self) -> bool {
        self.actuators().pressure_actuator()
    }

    pub fn temperature_mode(&self) -> ControlMode {
        self.actuators().temperature_mode()
    }

    pub fn pressure_mode(&self) -> ControlMode {
        self.actuators().pressure_mode()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let stats = self.decoder.stats();
        Diagnostics {
            frames_sent: self.frames_sent,
            frames_received: stats.frames,
            checksum_failures: stats.checksum_failures,
            invalid_frames: stats.invalid_frames,
            resyncs: stats.resyncs,
            timeouts: self.timeouts,
            consecutive_timeouts: self.consecutive_timeouts,
            last_fault: self.last_fault.clone(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
