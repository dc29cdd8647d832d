use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thermocycle_core::protocol::{
    Checksum, CloseHandle, Command, CommandFrame, Link, ProtocolError, TelemetryFrame,
    SIGNATURE_BYTE,
};
use thermocycle_core::rig::{
    ControlMode, ControlParameters, Fault, Mode, Parameter, Session, SessionConfig, UpdateOutcome,
};

/// What the mock link has seen and will answer
#[derive(Default)]
struct MockState {
    written: Vec<u8>,
    responses: VecDeque<Vec<u8>>,
    fail_on_write: bool,
    /// Writes accepted before the link starts failing
    writes_left: Option<usize>,
    /// Reads answered with a checksum error before the queue is served
    corrupt_reads: usize,
    closed: bool,
}

/// Scripted link: each read pops one queued chunk, an empty queue times out
struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    fn new() -> (Self, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl Link for MockLink {
    fn name(&self) -> &str {
        "mock"
    }

    fn read(&mut self, _timeout: Duration, cancel: &CloseHandle) -> Result<Vec<u8>, ProtocolError> {
        if cancel.is_closed() {
            return Err(ProtocolError::Closed);
        }
        let mut state = self.state.lock().unwrap();
        if state.corrupt_reads > 0 {
            state.corrupt_reads -= 1;
            return Err(ProtocolError::Checksum {
                expected: 0x00,
                actual: 0xff,
            });
        }
        state.responses.pop_front().ok_or(ProtocolError::Timeout)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().unwrap();
        if state.writes_left == Some(0) {
            state.fail_on_write = true;
        }
        if state.fail_on_write {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged").into());
        }
        if let Some(left) = state.writes_left.as_mut() {
            *left -= 1;
        }
        state.written.extend_from_slice(data);
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }

    fn is_open(&self) -> bool {
        !self.state.lock().unwrap().closed
    }
}

fn config(checksum: Checksum) -> SessionConfig {
    SessionConfig {
        checksum,
        settle_delay_ms: 0,
        read_timeout_ms: 20,
        ..Default::default()
    }
}

fn telemetry(mode: Mode, error: Fault) -> TelemetryFrame {
    TelemetryFrame {
        t_meas: 69.5,
        ki: 1.0,
        max_cycle: 100.0,
        mode,
        error,
        ..Default::default()
    }
}

/// Session whose handshake received a waiting frame
fn waiting_session(checksum: Checksum) -> (Session, Arc<Mutex<MockState>>) {
    let (link, state) = MockLink::new();
    state
        .lock()
        .unwrap()
        .responses
        .push_back(telemetry(Mode::Waiting, Fault::NoError).to_bytes(checksum).to_vec());
    let session = Session::with_link(Box::new(link), config(checksum)).expect("handshake");
    state.lock().unwrap().written.clear();
    (session, state)
}

fn queue(state: &Arc<Mutex<MockState>>, bytes: &[u8]) {
    state.lock().unwrap().responses.push_back(bytes.to_vec());
}

#[test]
fn test_handshake_sends_signature_then_heartbeat() {
    let (link, state) = MockLink::new();
    let session = Session::with_link(Box::new(link), config(Checksum::Additive)).expect("open");

    assert_eq!(session.mode(), Mode::SerialSetup);
    let written = state.lock().unwrap().written.clone();
    assert_eq!(written, vec![SIGNATURE_BYTE, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn test_handshake_with_telemetry_reaches_waiting() {
    let (session, _state) = waiting_session(Checksum::Additive);
    assert_eq!(session.mode(), Mode::Waiting);
    assert_eq!(session.error(), Fault::NoError);
    assert_eq!(session.t_meas(), 69.5);
}

#[test]
fn test_handshake_write_failure_is_connection_error() {
    let (link, state) = MockLink::new();
    state.lock().unwrap().fail_on_write = true;
    let result = Session::with_link(Box::new(link), config(Checksum::Additive));
    assert!(matches!(result, Err(ProtocolError::Connection(_))));
    assert!(state.lock().unwrap().closed);
}

#[test]
fn test_setter_frame_on_the_wire() {
    let (mut session, state) = waiting_session(Checksum::Additive);
    session.set_ki(5.0).unwrap();

    let written = state.lock().unwrap().written.clone();
    let frame = CommandFrame::from_bytes(&written, Checksum::Additive).unwrap();
    assert_eq!(frame.command, Command::SetPIIntegralGain);
    assert_eq!(frame.float_value(), 5.0);
    assert_eq!(written[0], 15);
}

#[test]
fn test_cycle_counters_are_floats_on_the_wire() {
    for checksum in [Checksum::Additive, Checksum::Xor] {
        let (mut session, state) = waiting_session(checksum);
        session.set_max_cycle(331630.0).unwrap();
        session.set_cycle(12.0).unwrap();

        let written = state.lock().unwrap().written.clone();
        assert_eq!(written.len(), 12);
        let max = CommandFrame::from_bytes(&written[..6], checksum).unwrap();
        assert_eq!(max.command, Command::SetMaximumCycleNumber);
        assert_eq!(&written[1..5], &331630f32.to_le_bytes());
        assert_eq!(max.float_value(), 331630.0);
        let cycle = CommandFrame::from_bytes(&written[6..], checksum).unwrap();
        assert_eq!(cycle.command, Command::SetCurrentCycleNumber);
        assert_eq!(&written[7..11], &12f32.to_le_bytes());
    }
}

#[test]
fn test_invalid_value_writes_nothing() {
    let (mut session, state) = waiting_session(Checksum::Additive);

    let err = session.set_ki(f64::NAN).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidValue { field: "ki", .. }));
    let err = session.set_max_cycle(12.5).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidValue { field: "max_cycle", .. }));

    assert!(state.lock().unwrap().written.is_empty());
    assert_eq!(session.requested().ki, None);
}

#[test]
fn test_corrupted_frame_leaves_state_unchanged() {
    let (mut session, state) = waiting_session(Checksum::Additive);
    let before = session.snapshot().cloned();

    let mut bytes = telemetry(Mode::Running, Fault::NoError).to_bytes(Checksum::Additive);
    bytes[51] = bytes[51].wrapping_add(1);
    queue(&state, &bytes);

    let outcome = session.update().unwrap();
    assert_eq!(outcome, UpdateOutcome::Discarded { consecutive: 1 });
    assert_eq!(session.mode(), Mode::Waiting);
    assert_eq!(session.snapshot().cloned(), before);

    let diagnostics = session.diagnostics();
    assert_eq!(diagnostics.checksum_failures, 1);
    assert_eq!(diagnostics.resyncs, 1);
    assert_eq!(diagnostics.consecutive_timeouts, 1);
}

#[test]
fn test_frame_split_across_reads() {
    let (mut session, state) = waiting_session(Checksum::Additive);
    let bytes = telemetry(Mode::Running, Fault::NoError).to_bytes(Checksum::Additive);
    queue(&state, &bytes[..7]);
    queue(&state, &bytes[7..40]);
    queue(&state, &bytes[40..]);

    assert_eq!(session.update().unwrap(), UpdateOutcome::Applied);
    assert_eq!(session.mode(), Mode::Running);
}

#[test]
fn test_leading_garbage_is_resynced() {
    let (mut session, state) = waiting_session(Checksum::Additive);
    let mut bytes = vec![0xde, 0xad, 0xbe];
    bytes.extend_from_slice(&telemetry(Mode::Running, Fault::NoError).to_bytes(Checksum::Additive));
    queue(&state, &bytes);

    assert_eq!(session.update().unwrap(), UpdateOutcome::Applied);
    assert_eq!(session.mode(), Mode::Running);
    assert_eq!(session.diagnostics().resyncs, 3);
}

#[test]
fn test_resync_limit_raises_serial_check() {
    let (link, state) = MockLink::new();
    state.lock().unwrap().responses.push_back(
        telemetry(Mode::Waiting, Fault::NoError)
            .to_bytes(Checksum::Additive)
            .to_vec(),
    );
    let config = SessionConfig {
        max_resync_attempts: 4,
        ..config(Checksum::Additive)
    };
    let mut session = Session::with_link(Box::new(link), config).unwrap();

    queue(&state, &[0xff; 60]);
    assert_eq!(session.update().unwrap(), UpdateOutcome::SyncLost);
    assert_eq!(session.mode(), Mode::Alarm);
    assert_eq!(session.error(), Fault::SerialCheck);
}

#[test]
fn test_xor_checksum_interop() {
    let (mut session, state) = waiting_session(Checksum::Xor);
    assert_eq!(session.mode(), Mode::Waiting);

    session.set_ki(1.0).unwrap();
    let written = state.lock().unwrap().written.clone();
    assert!(CommandFrame::from_bytes(&written, Checksum::Xor).is_ok());
    assert!(CommandFrame::from_bytes(&written, Checksum::Additive).is_err());

    // An additive frame means nothing to a xor session
    queue(
        &state,
        &telemetry(Mode::Running, Fault::NoError).to_bytes(Checksum::Additive),
    );
    assert!(matches!(session.update().unwrap(), UpdateOutcome::Discarded { .. }));
    assert_eq!(session.mode(), Mode::Waiting);

    queue(&state, &telemetry(Mode::Running, Fault::NoError).to_bytes(Checksum::Xor));
    assert_eq!(session.update().unwrap(), UpdateOutcome::Applied);
    assert_eq!(session.mode(), Mode::Running);
}

#[test]
fn test_setup_report_resends_signature() {
    let (mut session, state) = waiting_session(Checksum::Additive);
    queue(
        &state,
        &telemetry(Mode::SerialSetup, Fault::NoError).to_bytes(Checksum::Additive),
    );

    assert_eq!(session.update().unwrap(), UpdateOutcome::Applied);
    assert_eq!(session.mode(), Mode::SerialSetup);
    state.lock().unwrap().written.clear();

    queue(
        &state,
        &telemetry(Mode::Waiting, Fault::NoError).to_bytes(Checksum::Additive),
    );
    session.update().unwrap();
    assert_eq!(session.mode(), Mode::Waiting);
    let written = state.lock().unwrap().written.clone();
    assert_eq!(written, vec![SIGNATURE_BYTE, 0, 0, 0, 0, 0, 0]);

    // Back in sync: no more signature bytes
    state.lock().unwrap().written.clear();
    session.update().unwrap();
    assert_eq!(state.lock().unwrap().written.len(), 6);
}

#[test]
fn test_setup_reports_after_waiting_stay_in_setup() {
    let (mut session, state) = waiting_session(Checksum::Additive);
    for _ in 0..3 {
        queue(
            &state,
            &telemetry(Mode::SerialSetup, Fault::NoError).to_bytes(Checksum::Additive),
        );
        assert_eq!(session.update().unwrap(), UpdateOutcome::Applied);
        assert_eq!(session.mode(), Mode::SerialSetup);
    }
}

#[test]
fn test_link_checksum_error_counts_as_discarded() {
    let (mut session, state) = waiting_session(Checksum::Additive);
    state.lock().unwrap().corrupt_reads = 1;

    assert_eq!(session.update().unwrap(), UpdateOutcome::Discarded { consecutive: 1 });
    assert_eq!(session.mode(), Mode::Waiting);

    queue(&state, &telemetry(Mode::Running, Fault::NoError).to_bytes(Checksum::Additive));
    assert_eq!(session.update().unwrap(), UpdateOutcome::Applied);
    assert_eq!(session.diagnostics().consecutive_timeouts, 0);
}

#[test]
fn test_push_failure_keeps_what_was_sent() {
    let (mut session, state) = waiting_session(Checksum::Additive);
    state.lock().unwrap().writes_left = Some(2);

    let params = ControlParameters {
        temperature_mode: Some(ControlMode::Automatic),
        ..Default::default()
    }
    .with(Parameter::TemperatureSetpoint, 70.0)
    .with(Parameter::PressureHigh, 30.0);

    assert!(matches!(session.push_parameters(&params), Err(ProtocolError::Io(_))));
    assert_eq!(state.lock().unwrap().written.len(), 12);
    let requested = session.requested();
    assert_eq!(requested.temperature_mode, Some(ControlMode::Automatic));
    assert_eq!(requested.t_set, Some(70.0));
    assert_eq!(requested.p_high, None);
}

#[test]
fn test_write_failure_surfaces_from_update() {
    let (mut session, state) = waiting_session(Checksum::Additive);
    state.lock().unwrap().fail_on_write = true;
    assert!(matches!(session.update(), Err(ProtocolError::Io(_))));
}

#[test]
fn test_close_releases_link_once() {
    let (mut session, state) = waiting_session(Checksum::Additive);
    session.close();
    session.close();
    assert!(state.lock().unwrap().closed);
    assert!(session.is_closed());
    assert!(matches!(session.update(), Err(ProtocolError::Closed)));
    assert!(matches!(session.set_t_set(70.0), Err(ProtocolError::Closed)));
    assert!(matches!(session.play(), Err(ProtocolError::Closed)));
    assert!(state.lock().unwrap().written.is_empty());
}
