//! Capture preparation state machine.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::{
    ActionState, CaptureState, DeviceAdapter, FrameType, PrepareEvent, PreparationConfig,
    PreparationStatus, Quantity, ReadTicket, Reading, RotatorStatus,
};

/// Drives the camera and rotator toward their targets before a capture.
///
/// Each call to [`prepare_light_frame_capture`](Self::prepare_light_frame_capture)
/// starts a new cycle tagged with a generation number. Temperature and
/// rotator converge independently; `PrepareComplete` is emitted once per
/// cycle, as soon as every enforced action is within tolerance.
pub struct PreparationStateMachine {
    config: PreparationConfig,
    adapter: Arc<dyn DeviceAdapter>,
    events_tx: mpsc::UnboundedSender<PrepareEvent>,
    capture: CaptureState,
    generation: u64,
    status: PreparationStatus,
    temperature: ActionState,
    rotator: ActionState,
    /// Temperature enforcement was asked for when the cycle started.
    temperature_requested: bool,
    /// A move was commanded for the current target.
    temperature_commanded: bool,
    rotator_commanded: bool,
    current_temperature: Option<f64>,
    current_rotator: Option<(f64, RotatorStatus)>,
}

impl PreparationStateMachine {
    /// Create a machine and the receiver for its events.
    pub fn new(
        config: PreparationConfig,
        adapter: Arc<dyn DeviceAdapter>,
    ) -> (Self, mpsc::UnboundedReceiver<PrepareEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let machine = Self {
            config,
            adapter,
            events_tx,
            capture: CaptureState::default(),
            generation: 0,
            status: PreparationStatus::Idle,
            temperature: ActionState::NotRequired,
            rotator: ActionState::NotRequired,
            temperature_requested: false,
            temperature_commanded: false,
            rotator_commanded: false,
            current_temperature: None,
            current_rotator: None,
        };
        (machine, events_rx)
    }

    pub fn config(&self) -> &PreparationConfig {
        &self.config
    }

    pub fn status(&self) -> PreparationStatus {
        self.status
    }

    /// Generation of the current (or last) cycle; 0 before the first one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn temperature_state(&self) -> ActionState {
        self.temperature
    }

    pub fn rotator_state(&self) -> ActionState {
        self.rotator
    }

    pub fn capture_state(&self) -> &CaptureState {
        &self.capture
    }

    pub fn current_temperature(&self) -> Option<f64> {
        self.current_temperature
    }

    pub fn current_rotator_angle(&self) -> Option<(f64, RotatorStatus)> {
        self.current_rotator
    }

    pub fn set_frame_type(&mut self, frame_type: FrameType) {
        self.capture.frame_type = frame_type;
    }

    /// Set the temperature target. An outstanding cycle re-settles against
    /// the new target before it can complete.
    pub fn set_target_temperature(&mut self, target: f64) {
        self.retarget_temperature(Some(target));
    }

    pub fn clear_target_temperature(&mut self) {
        self.retarget_temperature(None);
    }

    /// Set the rotator target. An outstanding cycle re-settles against
    /// the new target before it can complete.
    pub fn set_target_rotator_angle(&mut self, target: f64) {
        self.retarget_rotator(Some(target));
    }

    pub fn clear_target_rotator_angle(&mut self) {
        self.retarget_rotator(None);
    }

    fn retarget_temperature(&mut self, target: Option<f64>) {
        if self.capture.target_temperature == target {
            return;
        }
        self.capture.target_temperature = target;
        if self.status != PreparationStatus::Preparing {
            return;
        }

        debug!(generation = self.generation, ?target, "temperature target changed mid-cycle");
        self.capture.enforce_temperature = self.temperature_requested && target.is_some();
        self.temperature_commanded = false;
        if !self.capture.enforce_temperature {
            self.temperature = ActionState::NotRequired;
        } else if let Some(current) = self.current_temperature {
            self.settle_temperature(current);
        } else if self.temperature != ActionState::AwaitingValue {
            self.temperature = ActionState::AwaitingValue;
            self.request_read(Quantity::Temperature);
        }
        self.check_completion();
    }

    fn retarget_rotator(&mut self, target: Option<f64>) {
        if self.capture.target_rotator_angle == target {
            return;
        }
        self.capture.target_rotator_angle = target;
        if self.status != PreparationStatus::Preparing {
            return;
        }

        debug!(generation = self.generation, ?target, "rotator target changed mid-cycle");
        self.capture.enforce_rotator = target.is_some();
        self.rotator_commanded = false;
        if !self.capture.enforce_rotator {
            self.rotator = ActionState::NotRequired;
        } else if let Some((angle, status)) = self.current_rotator {
            self.settle_rotator(angle, status);
        } else if self.rotator != ActionState::AwaitingValue {
            self.rotator = ActionState::AwaitingValue;
            self.request_read(Quantity::RotatorAngle);
        }
        self.check_completion();
    }

    /// Start a light frame preparation cycle and return its generation.
    pub fn prepare_light_frame_capture(&mut self, enforce_temperature: bool, is_preview: bool) -> u64 {
        self.capture.frame_type = FrameType::Light;
        self.prepare_capture(enforce_temperature, is_preview)
    }

    /// Start a preparation cycle for the configured frame type.
    ///
    /// Supersedes any outstanding cycle. Temperature is enforced when
    /// requested and a target is set; the rotator whenever a target angle
    /// is set. With nothing enforced, completion is emitted before this
    /// returns.
    pub fn prepare_capture(&mut self, enforce_temperature: bool, is_preview: bool) -> u64 {
        if self.status == PreparationStatus::Preparing {
            debug!(generation = self.generation, "superseding outstanding preparation");
        }
        self.generation += 1;
        self.status = PreparationStatus::Preparing;
        self.capture.is_preview = is_preview;
        self.temperature_requested = enforce_temperature;
        self.capture.enforce_temperature =
            enforce_temperature && self.capture.target_temperature.is_some();
        self.capture.enforce_rotator = self.capture.target_rotator_angle.is_some();
        self.temperature = ActionState::NotRequired;
        self.rotator = ActionState::NotRequired;
        self.temperature_commanded = false;
        self.rotator_commanded = false;

        info!(
            generation = self.generation,
            frame_type = %self.capture.frame_type,
            is_preview,
            enforce_temperature = self.capture.enforce_temperature,
            enforce_rotator = self.capture.enforce_rotator,
            "preparing capture"
        );
        self.adapter
            .set_frame_type_and_batch_mode(self.capture.frame_type, is_preview);

        if self.capture.enforce_temperature {
            match self.current_temperature {
                Some(current) => self.settle_temperature(current),
                None => {
                    self.temperature = ActionState::AwaitingValue;
                    self.request_read(Quantity::Temperature);
                }
            }
        }
        if self.capture.enforce_rotator {
            match self.current_rotator {
                Some((angle, status)) => self.settle_rotator(angle, status),
                None => {
                    self.rotator = ActionState::AwaitingValue;
                    self.request_read(Quantity::RotatorAngle);
                }
            }
        }

        self.check_completion();
        self.generation
    }

    /// Device callback: the camera temperature changed.
    pub fn set_current_temperature(&mut self, value: f64) {
        self.current_temperature = Some(value);
        if self.status != PreparationStatus::Preparing
            || self.temperature == ActionState::NotRequired
        {
            return;
        }
        self.settle_temperature(value);
        self.check_completion();
    }

    /// Device callback: the rotator angle or its state changed.
    pub fn set_current_rotator_angle(&mut self, angle: f64, status: RotatorStatus) {
        self.current_rotator = Some((angle, status));
        if self.status != PreparationStatus::Preparing || self.rotator == ActionState::NotRequired
        {
            return;
        }
        self.settle_rotator(angle, status);
        self.check_completion();
    }

    /// Answer a `ReadCurrentState` request.
    ///
    /// Readings are accepted from any cycle unless a move for the same
    /// quantity was commanded in the current one; such a reading may
    /// predate the command and is dropped.
    pub fn answer_read(&mut self, ticket: ReadTicket, reading: Reading) {
        if reading.quantity() != ticket.quantity {
            warn!(expected = %ticket.quantity, got = %reading.quantity(), "reading does not match request");
            return;
        }
        let commanded = match ticket.quantity {
            Quantity::Temperature => self.temperature_commanded,
            Quantity::RotatorAngle => self.rotator_commanded,
        };
        if commanded {
            debug!(
                quantity = %ticket.quantity,
                ticket_generation = ticket.generation,
                generation = self.generation,
                "dropping reading taken before move command"
            );
            return;
        }
        if ticket.generation != self.generation {
            debug!(
                quantity = %ticket.quantity,
                ticket_generation = ticket.generation,
                generation = self.generation,
                "applying reading from earlier cycle"
            );
        }

        match reading {
            Reading::Temperature(value) => self.set_current_temperature(value),
            Reading::RotatorAngle { angle, status } => self.set_current_rotator_angle(angle, status),
        }
    }

    fn settle_temperature(&mut self, current: f64) {
        let Some(target) = self.capture.target_temperature else {
            self.temperature = ActionState::Converged;
            return;
        };

        if self.config.temperature_converged(current, target) {
            if self.temperature != ActionState::Converged {
                debug!(current, target, "temperature within tolerance");
            }
            self.temperature = ActionState::Converged;
        } else {
            if !self.temperature_commanded {
                info!(current, target, "requesting temperature");
                self.adapter.request_temperature(target);
                self.temperature_commanded = true;
            }
            self.temperature = ActionState::Moving;
        }
    }

    fn settle_rotator(&mut self, angle: f64, status: RotatorStatus) {
        let Some(target) = self.capture.target_rotator_angle else {
            self.rotator = ActionState::Converged;
            return;
        };

        if status == RotatorStatus::Alert {
            warn!(angle, target, "rotator reported alert");
            self.emit(PrepareEvent::DeviceFault {
                quantity: Quantity::RotatorAngle,
                generation: self.generation,
            });
        }

        if status == RotatorStatus::Ok && self.config.rotator_converged(angle, target) {
            if self.rotator != ActionState::Converged {
                debug!(angle, target, "rotator within tolerance");
            }
            self.rotator = ActionState::Converged;
        } else {
            if !self.rotator_commanded {
                info!(angle, target, "requesting rotator angle");
                self.adapter.request_rotator_angle(target);
                self.rotator_commanded = true;
            }
            self.rotator = ActionState::Moving;
        }
    }

    fn request_read(&self, quantity: Quantity) {
        debug!(%quantity, generation = self.generation, "current value unknown, requesting read");
        self.emit(PrepareEvent::ReadCurrentState {
            quantity,
            ticket: ReadTicket {
                generation: self.generation,
                quantity,
            },
        });
    }

    fn check_completion(&mut self) {
        if self.status == PreparationStatus::Preparing
            && self.temperature.is_done()
            && self.rotator.is_done()
        {
            self.status = PreparationStatus::Complete;
            info!(generation = self.generation, "capture preparation complete");
            self.emit(PrepareEvent::PrepareComplete {
                generation: self.generation,
            });
        }
    }

    fn emit(&self, event: PrepareEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("no receiver for preparation event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceCommand, SimulatedDevice};
    use test_case::test_case;

    const TEMPERATURE_TARGET: f64 = -10.0;
    const ROTATOR_TARGET: f64 = 90.0;

    fn machine() -> (
        PreparationStateMachine,
        mpsc::UnboundedReceiver<PrepareEvent>,
        Arc<SimulatedDevice>,
    ) {
        let device = Arc::new(SimulatedDevice::new(PreparationConfig::default(), 10.0, 0.0));
        let (machine, rx) = PreparationStateMachine::new(PreparationConfig::default(), device.clone());
        (machine, rx, device)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PrepareEvent>) -> Vec<PrepareEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn completions(events: &[PrepareEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, PrepareEvent::PrepareComplete { .. }))
            .count()
    }

    fn moves(device: &SimulatedDevice) -> Vec<DeviceCommand> {
        device
            .commands()
            .into_iter()
            .filter(|c| !matches!(c, DeviceCommand::FrameTypeAndBatchMode { .. }))
            .collect()
    }

    // === Unit Tests ===

    #[test_case(false ; "capture")]
    #[test_case(true ; "preview")]
    fn test_nothing_enforced_completes_synchronously(is_preview: bool) {
        let (mut machine, mut rx, device) = machine();

        let generation = machine.prepare_light_frame_capture(false, is_preview);

        assert_eq!(machine.status(), PreparationStatus::Complete);
        assert_eq!(drain(&mut rx), vec![PrepareEvent::PrepareComplete { generation }]);
        assert_eq!(
            device.commands(),
            vec![DeviceCommand::FrameTypeAndBatchMode {
                frame_type: FrameType::Light,
                is_preview,
            }]
        );
    }

    #[test]
    fn test_temperature_target_without_enforcement_is_ignored() {
        let (mut machine, mut rx, device) = machine();
        machine.set_target_temperature(TEMPERATURE_TARGET);
        machine.set_current_temperature(10.0);

        machine.prepare_light_frame_capture(false, false);

        assert_eq!(completions(&drain(&mut rx)), 1);
        assert!(moves(&device).is_empty());
    }

    #[test]
    fn test_enforced_without_target_is_trivially_satisfied() {
        let (mut machine, mut rx, _device) = machine();

        machine.prepare_light_frame_capture(true, false);

        assert_eq!(machine.temperature_state(), ActionState::NotRequired);
        assert_eq!(completions(&drain(&mut rx)), 1);
    }

    // Every combination of preview, rotator and temperature enforcement,
    // starting from known values away from the targets.
    #[test_case(false, false, false)]
    #[test_case(false, false, true)]
    #[test_case(false, true, false)]
    #[test_case(false, true, true)]
    #[test_case(true, false, false)]
    #[test_case(true, false, true)]
    #[test_case(true, true, false)]
    #[test_case(true, true, true)]
    fn test_preparation_combinations(is_preview: bool, rotate: bool, cool: bool) {
        let (mut machine, mut rx, device) = machine();
        machine.set_current_temperature(10.0);
        machine.set_current_rotator_angle(0.0, RotatorStatus::Ok);
        if rotate {
            machine.set_target_rotator_angle(ROTATOR_TARGET);
        }
        if cool {
            machine.set_target_temperature(TEMPERATURE_TARGET);
        }

        machine.prepare_light_frame_capture(cool, is_preview);

        let mut expected_moves = Vec::new();
        if cool {
            expected_moves.push(DeviceCommand::Temperature(TEMPERATURE_TARGET));
        }
        if rotate {
            expected_moves.push(DeviceCommand::RotatorAngle(ROTATOR_TARGET));
        }
        assert_eq!(moves(&device), expected_moves);

        if !rotate && !cool {
            assert_eq!(completions(&drain(&mut rx)), 1);
            return;
        }
        assert_eq!(completions(&drain(&mut rx)), 0);

        if cool {
            machine.set_current_temperature(-9.8);
        }
        if rotate {
            machine.set_current_rotator_angle(ROTATOR_TARGET, RotatorStatus::Ok);
        }
        assert_eq!(machine.status(), PreparationStatus::Complete);
        assert_eq!(completions(&drain(&mut rx)), 1);
    }

    #[test]
    fn test_lazy_init_within_tolerance_skips_command() {
        let (mut machine, mut rx, device) = machine();
        machine.set_target_temperature(TEMPERATURE_TARGET);

        let generation = machine.prepare_light_frame_capture(true, false);

        let events = drain(&mut rx);
        let ticket = ReadTicket {
            generation,
            quantity: Quantity::Temperature,
        };
        assert_eq!(
            events,
            vec![PrepareEvent::ReadCurrentState {
                quantity: Quantity::Temperature,
                ticket,
            }]
        );
        assert_eq!(machine.temperature_state(), ActionState::AwaitingValue);

        machine.answer_read(ticket, Reading::Temperature(TEMPERATURE_TARGET + 0.3));

        assert_eq!(drain(&mut rx), vec![PrepareEvent::PrepareComplete { generation }]);
        assert!(moves(&device).is_empty());
    }

    #[test]
    fn test_lazy_init_out_of_tolerance_commands_move() {
        let (mut machine, mut rx, device) = machine();
        machine.set_target_temperature(TEMPERATURE_TARGET);

        let generation = machine.prepare_light_frame_capture(true, false);
        drain(&mut rx);
        machine.answer_read(
            ReadTicket {
                generation,
                quantity: Quantity::Temperature,
            },
            Reading::Temperature(15.0),
        );

        assert_eq!(machine.temperature_state(), ActionState::Moving);
        assert_eq!(moves(&device), vec![DeviceCommand::Temperature(TEMPERATURE_TARGET)]);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_cooling_completes_only_within_tolerance() {
        let (mut machine, mut rx, device) = machine();
        machine.set_current_temperature(10.0);
        machine.set_target_temperature(TEMPERATURE_TARGET);

        machine.prepare_light_frame_capture(true, false);
        assert_eq!(moves(&device), vec![DeviceCommand::Temperature(TEMPERATURE_TARGET)]);

        for value in [8.0, 2.0, -4.0, -8.0, -8.9] {
            machine.set_current_temperature(value);
            assert_eq!(completions(&drain(&mut rx)), 0, "completed at {value}");
        }

        // Half the tolerance away is inside the band
        machine.set_current_temperature(TEMPERATURE_TARGET + 0.5);
        assert_eq!(completions(&drain(&mut rx)), 1);

        // Further updates after completion are ignored
        machine.set_current_temperature(TEMPERATURE_TARGET);
        machine.set_current_temperature(TEMPERATURE_TARGET + 5.0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(moves(&device).len(), 1);
    }

    #[test]
    fn test_known_value_within_tolerance_completes_immediately() {
        let (mut machine, mut rx, device) = machine();
        machine.set_current_temperature(TEMPERATURE_TARGET - 0.2);
        machine.set_target_temperature(TEMPERATURE_TARGET);

        let generation = machine.prepare_light_frame_capture(true, false);

        assert_eq!(drain(&mut rx), vec![PrepareEvent::PrepareComplete { generation }]);
        assert!(moves(&device).is_empty());
    }

    #[test]
    fn test_rotator_busy_never_converges() {
        let (mut machine, mut rx, _device) = machine();
        machine.set_current_rotator_angle(0.0, RotatorStatus::Ok);
        machine.set_target_rotator_angle(ROTATOR_TARGET);

        machine.prepare_light_frame_capture(false, false);
        machine.set_current_rotator_angle(ROTATOR_TARGET, RotatorStatus::Busy);
        assert_eq!(completions(&drain(&mut rx)), 0);
        assert_eq!(machine.rotator_state(), ActionState::Moving);

        machine.set_current_rotator_angle(ROTATOR_TARGET + 0.2, RotatorStatus::Ok);
        assert_eq!(completions(&drain(&mut rx)), 1);
    }

    #[test]
    fn test_rotator_tolerance_in_arcminutes() {
        let (mut machine, mut rx, _device) = machine();
        machine.set_current_rotator_angle(0.0, RotatorStatus::Ok);
        machine.set_target_rotator_angle(ROTATOR_TARGET);

        machine.prepare_light_frame_capture(false, false);
        // 36 arc-minutes away, outside the 30' band
        machine.set_current_rotator_angle(ROTATOR_TARGET - 0.6, RotatorStatus::Ok);
        assert_eq!(completions(&drain(&mut rx)), 0);
        // 24 arc-minutes away
        machine.set_current_rotator_angle(ROTATOR_TARGET - 0.4, RotatorStatus::Ok);
        assert_eq!(completions(&drain(&mut rx)), 1);
    }

    #[test]
    fn test_rotator_alert_reports_fault() {
        let (mut machine, mut rx, _device) = machine();
        machine.set_current_rotator_angle(0.0, RotatorStatus::Ok);
        machine.set_target_rotator_angle(ROTATOR_TARGET);

        let generation = machine.prepare_light_frame_capture(false, false);
        machine.set_current_rotator_angle(45.0, RotatorStatus::Alert);

        assert_eq!(
            drain(&mut rx),
            vec![PrepareEvent::DeviceFault {
                quantity: Quantity::RotatorAngle,
                generation,
            }]
        );
        assert_eq!(machine.status(), PreparationStatus::Preparing);
    }

    #[test]
    fn test_restart_supersedes_outstanding_cycle() {
        let (mut machine, mut rx, _device) = machine();
        machine.set_current_temperature(10.0);
        machine.set_target_temperature(TEMPERATURE_TARGET);

        let first = machine.prepare_light_frame_capture(true, false);
        let second = machine.prepare_light_frame_capture(false, true);

        assert_eq!(second, first + 1);
        assert_eq!(
            drain(&mut rx),
            vec![PrepareEvent::PrepareComplete { generation: second }]
        );
        assert!(machine.capture_state().is_preview);
        assert!(!machine.capture_state().enforce_temperature);
    }

    #[test]
    fn test_retarget_mid_cycle_blocks_completion() {
        let (mut machine, mut rx, device) = machine();
        machine.set_current_temperature(TEMPERATURE_TARGET);
        machine.set_current_rotator_angle(0.0, RotatorStatus::Ok);
        machine.set_target_temperature(TEMPERATURE_TARGET);
        machine.set_target_rotator_angle(ROTATOR_TARGET);

        machine.prepare_light_frame_capture(true, false);
        assert_eq!(machine.temperature_state(), ActionState::Converged);

        machine.set_target_temperature(-20.0);
        assert_eq!(machine.temperature_state(), ActionState::Moving);
        assert_eq!(
            moves(&device),
            vec![
                DeviceCommand::RotatorAngle(ROTATOR_TARGET),
                DeviceCommand::Temperature(-20.0),
            ]
        );

        machine.set_current_rotator_angle(ROTATOR_TARGET, RotatorStatus::Ok);
        assert_eq!(completions(&drain(&mut rx)), 0);
        assert_eq!(machine.status(), PreparationStatus::Preparing);

        machine.set_current_temperature(-19.5);
        assert_eq!(completions(&drain(&mut rx)), 1);
    }

    #[test]
    fn test_retarget_while_moving_commands_new_target() {
        let (mut machine, _rx, device) = machine();
        machine.set_current_temperature(10.0);
        machine.set_target_temperature(TEMPERATURE_TARGET);

        machine.prepare_light_frame_capture(true, false);
        machine.set_target_temperature(-15.0);
        machine.set_target_temperature(-15.0);

        assert_eq!(
            moves(&device),
            vec![
                DeviceCommand::Temperature(TEMPERATURE_TARGET),
                DeviceCommand::Temperature(-15.0),
            ]
        );
    }

    #[test]
    fn test_clearing_target_mid_cycle_completes() {
        let (mut machine, mut rx, _device) = machine();
        machine.set_current_rotator_angle(0.0, RotatorStatus::Ok);
        machine.set_target_rotator_angle(ROTATOR_TARGET);

        let generation = machine.prepare_light_frame_capture(false, false);
        assert!(drain(&mut rx).is_empty());

        machine.clear_target_rotator_angle();

        assert_eq!(machine.rotator_state(), ActionState::NotRequired);
        assert_eq!(drain(&mut rx), vec![PrepareEvent::PrepareComplete { generation }]);
    }

    #[test]
    fn test_new_target_mid_cycle_requests_unknown_value() {
        let (mut machine, mut rx, _device) = machine();
        machine.set_current_temperature(10.0);
        machine.set_target_temperature(TEMPERATURE_TARGET);

        let generation = machine.prepare_light_frame_capture(true, false);
        drain(&mut rx);
        machine.set_target_rotator_angle(ROTATOR_TARGET);

        assert_eq!(machine.rotator_state(), ActionState::AwaitingValue);
        assert_eq!(
            drain(&mut rx),
            vec![PrepareEvent::ReadCurrentState {
                quantity: Quantity::RotatorAngle,
                ticket: ReadTicket {
                    generation,
                    quantity: Quantity::RotatorAngle,
                },
            }]
        );
    }

    #[test]
    fn test_target_change_after_completion_waits_for_next_cycle() {
        let (mut machine, mut rx, device) = machine();
        machine.set_current_temperature(TEMPERATURE_TARGET);
        machine.set_target_temperature(TEMPERATURE_TARGET);
        machine.prepare_light_frame_capture(true, false);
        drain(&mut rx);

        machine.set_target_temperature(-20.0);

        assert_eq!(machine.status(), PreparationStatus::Complete);
        assert!(moves(&device).is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_stale_reading_dropped_after_command() {
        let (mut machine, mut rx, _device) = machine();
        machine.set_target_temperature(TEMPERATURE_TARGET);

        // First cycle asks for the temperature
        let first = machine.prepare_light_frame_capture(true, false);
        drain(&mut rx);

        // A callback arrives and the second cycle commands a move
        machine.set_current_temperature(12.0);
        let second = machine.prepare_light_frame_capture(true, false);
        assert_eq!(machine.temperature_state(), ActionState::Moving);

        // The first cycle's answer must not complete the second
        machine.answer_read(
            ReadTicket {
                generation: first,
                quantity: Quantity::Temperature,
            },
            Reading::Temperature(TEMPERATURE_TARGET),
        );
        assert_eq!(completions(&drain(&mut rx)), 0);
        assert_eq!(machine.generation(), second);
    }

    #[test]
    fn test_stale_reading_applied_without_command() {
        let (mut machine, mut rx, _device) = machine();
        machine.set_target_temperature(TEMPERATURE_TARGET);

        let first = machine.prepare_light_frame_capture(true, false);
        let second = machine.prepare_light_frame_capture(true, false);
        drain(&mut rx);

        machine.answer_read(
            ReadTicket {
                generation: first,
                quantity: Quantity::Temperature,
            },
            Reading::Temperature(TEMPERATURE_TARGET),
        );
        assert_eq!(
            drain(&mut rx),
            vec![PrepareEvent::PrepareComplete { generation: second }]
        );
    }

    #[test]
    fn test_mismatched_reading_ignored() {
        let (mut machine, mut rx, _device) = machine();
        machine.set_target_temperature(TEMPERATURE_TARGET);
        let generation = machine.prepare_light_frame_capture(true, false);
        drain(&mut rx);

        machine.answer_read(
            ReadTicket {
                generation,
                quantity: Quantity::Temperature,
            },
            Reading::RotatorAngle {
                angle: 0.0,
                status: RotatorStatus::Ok,
            },
        );
        assert_eq!(machine.temperature_state(), ActionState::AwaitingValue);
        assert_eq!(machine.current_rotator_angle(), None);
    }

    #[test]
    fn test_updates_before_cycle_are_remembered() {
        let (mut machine, _rx, _device) = machine();
        machine.set_current_temperature(-3.0);
        machine.set_current_rotator_angle(12.0, RotatorStatus::Busy);

        assert_eq!(machine.status(), PreparationStatus::Idle);
        assert_eq!(machine.current_temperature(), Some(-3.0));
        assert_eq!(
            machine.current_rotator_angle(),
            Some((12.0, RotatorStatus::Busy))
        );
    }
}
