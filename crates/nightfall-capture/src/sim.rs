//! In-process camera and rotator simulation.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::config::angular_distance;
use crate::{
    CaptureError, Device, DeviceAdapter, FrameType, PreparationConfig, Quantity, Reading,
    RotatorStatus,
};

/// A command received by the simulated device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    FrameTypeAndBatchMode { frame_type: FrameType, is_preview: bool },
    Temperature(f64),
    RotatorAngle(f64),
}

/// A change notification produced by [`SimulatedDevice::step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceUpdate {
    Temperature(f64),
    RotatorAngle { angle: f64, status: RotatorStatus },
}

#[derive(Debug)]
struct SimState {
    temperature: f64,
    angle: f64,
    rotator_status: RotatorStatus,
    target_temperature: Option<f64>,
    target_angle: Option<f64>,
    /// Last values pushed out as updates.
    reported_temperature: f64,
    reported_angle: f64,
    reported_status: RotatorStatus,
    commands: Vec<DeviceCommand>,
    /// Reads fail while set.
    offline: bool,
}

/// Camera cooler and rotator that move a fixed amount per [`step`](Self::step).
///
/// Commands only set targets. Values change when the owner steps the
/// simulation, and changes at or below the configured thresholds are
/// not reported.
#[derive(Debug)]
pub struct SimulatedDevice {
    config: PreparationConfig,
    cooling_per_step: f64,
    degrees_per_step: f64,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    pub fn new(config: PreparationConfig, temperature: f64, angle: f64) -> Self {
        Self {
            config,
            cooling_per_step: 1.0,
            degrees_per_step: 5.0,
            state: Mutex::new(SimState {
                temperature,
                angle,
                rotator_status: RotatorStatus::Ok,
                target_temperature: None,
                target_angle: None,
                reported_temperature: temperature,
                reported_angle: angle,
                reported_status: RotatorStatus::Ok,
                commands: Vec::new(),
                offline: false,
            }),
        }
    }

    /// Set how far the cooler and rotator move per step.
    pub fn with_rates(mut self, cooling_per_step: f64, degrees_per_step: f64) -> Self {
        self.cooling_per_step = cooling_per_step;
        self.degrees_per_step = degrees_per_step;
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make reads fail until the device is brought back online.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Every command received so far, oldest first.
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.state().commands.clone()
    }

    pub fn temperature(&self) -> f64 {
        self.state().temperature
    }

    pub fn rotator_angle(&self) -> (f64, RotatorStatus) {
        let state = self.state();
        (state.angle, state.rotator_status)
    }

    /// Force the rotator into a state, e.g. to inject an alert.
    pub fn set_rotator_status(&self, status: RotatorStatus) -> Option<DeviceUpdate> {
        let mut state = self.state();
        state.rotator_status = status;
        Self::rotator_update(&mut state, self.config.rotator_change_threshold, false)
    }

    /// Advance the simulation by one step and return the notifications it produced.
    pub fn step(&self) -> Vec<DeviceUpdate> {
        let mut state = self.state();
        let mut updates = Vec::new();

        if let Some(target) = state.target_temperature {
            let delta = target - state.temperature;
            let arrived = delta.abs() <= self.cooling_per_step;
            state.temperature = if arrived {
                target
            } else {
                state.temperature + self.cooling_per_step.copysign(delta)
            };
            if arrived {
                state.target_temperature = None;
            }
            let change = (state.temperature - state.reported_temperature).abs();
            if change > self.config.temperature_change_threshold || (arrived && change > 0.0) {
                state.reported_temperature = state.temperature;
                updates.push(DeviceUpdate::Temperature(state.temperature));
            } else {
                trace!(temperature = state.temperature, "temperature change below threshold");
            }
        }

        let rotator_target = state
            .target_angle
            .filter(|_| state.rotator_status != RotatorStatus::Alert);
        if let Some(target) = rotator_target {
            let distance = angular_distance(state.angle, target);
            let arrived = distance <= self.degrees_per_step;
            state.angle = if arrived {
                target
            } else {
                let forward = (target - state.angle).rem_euclid(360.0) <= 180.0;
                let step = if forward {
                    self.degrees_per_step
                } else {
                    -self.degrees_per_step
                };
                (state.angle + step).rem_euclid(360.0)
            };
            if arrived {
                state.target_angle = None;
                state.rotator_status = RotatorStatus::Ok;
            }
            if let Some(update) =
                Self::rotator_update(&mut state, self.config.rotator_change_threshold, arrived)
            {
                updates.push(update);
            }
        }

        updates
    }

    fn rotator_update(
        state: &mut SimState,
        threshold: f64,
        arrived: bool,
    ) -> Option<DeviceUpdate> {
        let change = angular_distance(state.angle, state.reported_angle);
        let status_changed = state.rotator_status != state.reported_status;
        if change > threshold || status_changed || (arrived && change > 0.0) {
            state.reported_angle = state.angle;
            state.reported_status = state.rotator_status;
            Some(DeviceUpdate::RotatorAngle {
                angle: state.angle,
                status: state.rotator_status,
            })
        } else {
            trace!(angle = state.angle, "rotator change below threshold");
            None
        }
    }
}

impl DeviceAdapter for SimulatedDevice {
    fn set_frame_type_and_batch_mode(&self, frame_type: FrameType, is_preview: bool) {
        debug!(%frame_type, is_preview, "simulated frame mode");
        self.state().commands.push(DeviceCommand::FrameTypeAndBatchMode {
            frame_type,
            is_preview,
        });
    }

    fn request_temperature(&self, target: f64) {
        debug!(target, "simulated cooler target");
        let mut state = self.state();
        state.target_temperature = Some(target);
        state.commands.push(DeviceCommand::Temperature(target));
    }

    fn request_rotator_angle(&self, target: f64) {
        debug!(target, "simulated rotator target");
        let mut state = self.state();
        state.target_angle = Some(target);
        if state.rotator_status == RotatorStatus::Ok {
            state.rotator_status = RotatorStatus::Busy;
        }
        state.commands.push(DeviceCommand::RotatorAngle(target));
    }
}

#[async_trait]
impl Device for SimulatedDevice {
    async fn read(&self, quantity: Quantity) -> Result<Reading, CaptureError> {
        let (temperature, angle, status, offline) = {
            let state = self.state();
            (state.temperature, state.angle, state.rotator_status, state.offline)
        };
        if offline {
            return Err(CaptureError::Device(format!(
                "cannot read {quantity}: device offline"
            )));
        }
        Ok(match quantity {
            Quantity::Temperature => Reading::Temperature(temperature),
            Quantity::RotatorAngle => Reading::RotatorAngle { angle, status },
        })
    }
}
