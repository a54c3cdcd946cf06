//! Async host for the preparation state machine.
//!
//! The driver owns a [`PreparationStateMachine`] inside a tokio task. It
//! answers read requests from a [`Device`], forwards device callbacks, and
//! resolves each `prepare` call when its cycle completes, faults, or is
//! superseded by a newer one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::{
    CaptureError, Device, DeviceAdapter, DeviceUpdate, PrepareEvent, PreparationConfig,
    PreparationStateMachine, ReadTicket, Reading, RotatorStatus,
};

/// Capacity of the observer broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

type Completion = oneshot::Sender<Result<u64, CaptureError>>;

enum DriverCommand {
    Prepare {
        enforce_temperature: bool,
        is_preview: bool,
        done: Completion,
    },
    SetTargetTemperature(Option<f64>),
    SetTargetRotatorAngle(Option<f64>),
    Temperature(f64),
    RotatorAngle { angle: f64, status: RotatorStatus },
}

enum Step {
    Command(Option<DriverCommand>),
    Read(ReadTicket, Result<Reading, CaptureError>),
}

/// Spawns preparation drivers.
pub struct PreparationDriver;

impl PreparationDriver {
    /// Start a driver task. Must be called from within a tokio runtime.
    ///
    /// The task stops once every [`PreparationHandle`] has been dropped.
    pub fn spawn(
        config: PreparationConfig,
        adapter: Arc<dyn DeviceAdapter>,
        device: Arc<dyn Device>,
    ) -> PreparationHandle {
        let (machine, machine_events) = PreparationStateMachine::new(config, adapter);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (reads_tx, reads_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let task = DriverTask {
            machine,
            machine_events,
            commands_rx,
            reads_tx,
            reads_rx,
            device,
            events_tx: events_tx.clone(),
            waiters: Vec::new(),
        };
        tokio::spawn(task.run());

        PreparationHandle {
            commands_tx,
            events_tx,
        }
    }
}

struct DriverTask {
    machine: PreparationStateMachine,
    machine_events: mpsc::UnboundedReceiver<PrepareEvent>,
    commands_rx: mpsc::UnboundedReceiver<DriverCommand>,
    reads_tx: mpsc::UnboundedSender<(ReadTicket, Result<Reading, CaptureError>)>,
    reads_rx: mpsc::UnboundedReceiver<(ReadTicket, Result<Reading, CaptureError>)>,
    device: Arc<dyn Device>,
    events_tx: broadcast::Sender<PrepareEvent>,
    /// Pending `prepare` calls keyed by generation.
    waiters: Vec<(u64, Completion)>,
}

impl DriverTask {
    async fn run(mut self) {
        debug!("preparation driver started");

        loop {
            let step = tokio::select! {
                command = self.commands_rx.recv() => Step::Command(command),
                Some((ticket, result)) = self.reads_rx.recv() => Step::Read(ticket, result),
            };

            match step {
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Command(None) => break,
                Step::Read(ticket, result) => self.handle_read(ticket, result),
            }
            self.drain_machine_events();
        }

        for (generation, done) in self.waiters.drain(..) {
            if done.send(Err(CaptureError::ChannelClosed)).is_err() {
                trace!(generation, "preparation waiter already gone");
            }
        }
        debug!("preparation driver stopped");
    }

    fn handle_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Prepare {
                enforce_temperature,
                is_preview,
                done,
            } => {
                let generation = self
                    .machine
                    .prepare_light_frame_capture(enforce_temperature, is_preview);
                self.supersede_before(generation);
                self.waiters.push((generation, done));
            }
            DriverCommand::SetTargetTemperature(Some(target)) => {
                self.machine.set_target_temperature(target)
            }
            DriverCommand::SetTargetTemperature(None) => self.machine.clear_target_temperature(),
            DriverCommand::SetTargetRotatorAngle(Some(target)) => {
                self.machine.set_target_rotator_angle(target)
            }
            DriverCommand::SetTargetRotatorAngle(None) => {
                self.machine.clear_target_rotator_angle()
            }
            DriverCommand::Temperature(value) => self.machine.set_current_temperature(value),
            DriverCommand::RotatorAngle { angle, status } => {
                self.machine.set_current_rotator_angle(angle, status)
            }
        }
    }

    fn handle_read(&mut self, ticket: ReadTicket, result: Result<Reading, CaptureError>) {
        match result {
            Ok(reading) => self.machine.answer_read(ticket, reading),
            Err(e) => {
                warn!(quantity = %ticket.quantity, generation = ticket.generation, error = %e, "device read failed");
                if ticket.generation == self.machine.generation() {
                    self.resolve(ticket.generation, Err(e));
                }
            }
        }
    }

    fn drain_machine_events(&mut self) {
        while let Ok(event) = self.machine_events.try_recv() {
            match event {
                PrepareEvent::ReadCurrentState { quantity, ticket } => {
                    let device = Arc::clone(&self.device);
                    let reads_tx = self.reads_tx.clone();
                    tokio::spawn(async move {
                        let result = device.read(quantity).await;
                        if reads_tx.send((ticket, result)).is_err() {
                            trace!(%quantity, "driver gone before read completed");
                        }
                    });
                }
                PrepareEvent::PrepareComplete { generation } => {
                    self.resolve(generation, Ok(generation));
                }
                PrepareEvent::DeviceFault {
                    quantity,
                    generation,
                } => {
                    self.resolve(generation, Err(CaptureError::DeviceFault(quantity)));
                }
            }
            self.broadcast(event);
        }
    }

    fn supersede_before(&mut self, generation: u64) {
        let (stale, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|(g, _)| *g < generation);
        self.waiters = pending;
        for (old, done) in stale {
            info!(superseded = old, by = generation, "preparation superseded");
            if done.send(Err(CaptureError::Superseded(old))).is_err() {
                trace!(generation = old, "preparation waiter already gone");
            }
        }
    }

    fn resolve(&mut self, generation: u64, result: Result<u64, CaptureError>) {
        let (matched, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|(g, _)| *g == generation);
        self.waiters = pending;
        for (_, done) in matched {
            if done.send(result.clone()).is_err() {
                trace!(generation, "preparation waiter already gone");
            }
        }
    }

    fn broadcast(&self, event: PrepareEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("no subscribers for preparation event");
        }
    }
}

/// Cloneable handle to a running [`PreparationDriver`].
#[derive(Clone)]
pub struct PreparationHandle {
    commands_tx: mpsc::UnboundedSender<DriverCommand>,
    events_tx: broadcast::Sender<PrepareEvent>,
}

impl PreparationHandle {
    /// Prepare a light frame capture and wait for it to complete.
    ///
    /// Returns the generation of the completed cycle. Fails with
    /// [`CaptureError::Superseded`] if another `prepare` call starts a newer
    /// cycle first, or [`CaptureError::DeviceFault`] if the device alerts.
    pub async fn prepare(
        &self,
        enforce_temperature: bool,
        is_preview: bool,
    ) -> Result<u64, CaptureError> {
        let (done, completion) = oneshot::channel();
        self.send(DriverCommand::Prepare {
            enforce_temperature,
            is_preview,
            done,
        })?;
        completion.await.map_err(|_| CaptureError::ChannelClosed)?
    }

    /// Like [`prepare`](Self::prepare), giving up after `timeout`.
    pub async fn prepare_with_timeout(
        &self,
        enforce_temperature: bool,
        is_preview: bool,
        timeout: Duration,
    ) -> Result<u64, CaptureError> {
        tokio::time::timeout(timeout, self.prepare(enforce_temperature, is_preview))
            .await
            .map_err(|_| CaptureError::Timeout(timeout))?
    }

    pub fn set_target_temperature(&self, target: Option<f64>) -> Result<(), CaptureError> {
        self.send(DriverCommand::SetTargetTemperature(target))
    }

    pub fn set_target_rotator_angle(&self, target: Option<f64>) -> Result<(), CaptureError> {
        self.send(DriverCommand::SetTargetRotatorAngle(target))
    }

    /// Forward a camera temperature notification.
    pub fn temperature_update(&self, value: f64) -> Result<(), CaptureError> {
        self.send(DriverCommand::Temperature(value))
    }

    /// Forward a rotator angle notification.
    pub fn rotator_update(&self, angle: f64, status: RotatorStatus) -> Result<(), CaptureError> {
        self.send(DriverCommand::RotatorAngle { angle, status })
    }

    pub fn device_update(&self, update: DeviceUpdate) -> Result<(), CaptureError> {
        match update {
            DeviceUpdate::Temperature(value) => self.temperature_update(value),
            DeviceUpdate::RotatorAngle { angle, status } => self.rotator_update(angle, status),
        }
    }

    /// Subscribe to machine events.
    pub fn subscribe(&self) -> broadcast::Receiver<PrepareEvent> {
        self.events_tx.subscribe()
    }

    fn send(&self, command: DriverCommand) -> Result<(), CaptureError> {
        self.commands_tx
            .send(command)
            .map_err(|_| CaptureError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceCommand, Quantity, SimulatedDevice};

    fn spawn(device: &Arc<SimulatedDevice>) -> PreparationHandle {
        PreparationDriver::spawn(
            PreparationConfig::default(),
            device.clone(),
            device.clone(),
        )
    }

    /// Step the simulation and forward its updates until the handle goes away.
    fn run_device(device: Arc<SimulatedDevice>, handle: PreparationHandle) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                for update in device.step() {
                    if handle.device_update(update).is_err() {
                        return;
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn test_nothing_enforced_resolves_immediately() {
        let device = Arc::new(SimulatedDevice::new(PreparationConfig::default(), 10.0, 0.0));
        let handle = spawn(&device);

        let generation = handle.prepare(false, true).await.unwrap();

        assert_eq!(generation, 1);
        assert_eq!(
            device.commands(),
            vec![DeviceCommand::FrameTypeAndBatchMode {
                frame_type: crate::FrameType::Light,
                is_preview: true,
            }]
        );
    }

    #[tokio::test]
    async fn test_reads_unknown_temperature_from_device() {
        let device = Arc::new(SimulatedDevice::new(PreparationConfig::default(), -9.6, 0.0));
        let handle = spawn(&device);
        handle.set_target_temperature(Some(-10.0)).unwrap();

        handle
            .prepare_with_timeout(true, false, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(
            !device
                .commands()
                .iter()
                .any(|c| matches!(c, DeviceCommand::Temperature(_)))
        );
    }

    #[tokio::test]
    async fn test_failed_read_fails_current_cycle() {
        let device = Arc::new(SimulatedDevice::new(PreparationConfig::default(), -9.6, 0.0));
        device.set_offline(true);
        let handle = spawn(&device);
        handle.set_target_temperature(Some(-10.0)).unwrap();

        let result = handle
            .prepare_with_timeout(true, false, Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(CaptureError::Device(_))));

        // Back online, the next cycle reads again and completes
        device.set_offline(false);
        let generation = handle
            .prepare_with_timeout(true, false, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cools_and_rotates_to_targets() {
        let device = Arc::new(
            SimulatedDevice::new(PreparationConfig::default(), 10.0, 350.0).with_rates(2.0, 4.0),
        );
        let handle = spawn(&device);
        handle.set_target_temperature(Some(-10.0)).unwrap();
        handle.set_target_rotator_angle(Some(30.0)).unwrap();
        run_device(device.clone(), handle.clone());

        handle
            .prepare_with_timeout(true, false, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(device.temperature() <= -9.0);
        let (angle, status) = device.rotator_angle();
        assert!((angle - 30.0).abs() <= 0.5);
        assert_eq!(status, RotatorStatus::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_device_never_moves() {
        let device = Arc::new(SimulatedDevice::new(PreparationConfig::default(), 10.0, 0.0));
        let handle = spawn(&device);
        handle.set_target_temperature(Some(-10.0)).unwrap();

        let result = handle
            .prepare_with_timeout(true, false, Duration::from_secs(5))
            .await;

        assert_eq!(result, Err(CaptureError::Timeout(Duration::from_secs(5))));
    }

    #[tokio::test]
    async fn test_newer_cycle_supersedes_pending_prepare() {
        let device = Arc::new(SimulatedDevice::new(PreparationConfig::default(), 10.0, 0.0));
        let handle = spawn(&device);
        let mut events = handle.subscribe();
        handle.set_target_temperature(Some(-10.0)).unwrap();

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.prepare(true, false).await }
        });
        // The first cycle has started once it asks for the temperature
        let event = events.recv().await.unwrap();
        assert!(matches!(event, PrepareEvent::ReadCurrentState { .. }));

        let second = handle.prepare(false, false).await;

        assert_eq!(first.await.unwrap(), Err(CaptureError::Superseded(1)));
        assert_eq!(second, Ok(2));
    }

    #[tokio::test]
    async fn test_rotator_alert_fails_prepare() {
        let device = Arc::new(SimulatedDevice::new(PreparationConfig::default(), 10.0, 0.0));
        device.set_rotator_status(RotatorStatus::Alert);
        let handle = spawn(&device);
        handle.set_target_rotator_angle(Some(45.0)).unwrap();

        let result = handle.prepare(false, false).await;

        assert_eq!(
            result,
            Err(CaptureError::DeviceFault(Quantity::RotatorAngle))
        );
    }

    #[tokio::test]
    async fn test_observers_see_completion() {
        let device = Arc::new(SimulatedDevice::new(PreparationConfig::default(), 10.0, 0.0));
        let handle = spawn(&device);
        let mut events = handle.subscribe();

        handle.prepare(false, false).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            PrepareEvent::PrepareComplete { generation: 1 }
        );
    }
}
