//! Capture preparation state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// CCD frame type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    #[default]
    Light,
    Bias,
    Dark,
    Flat,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FrameType::Light => "light",
            FrameType::Bias => "bias",
            FrameType::Dark => "dark",
            FrameType::Flat => "flat",
        };
        f.write_str(s)
    }
}

/// A device quantity the preparation converges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Temperature,
    RotatorAngle,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Temperature => f.write_str("temperature"),
            Quantity::RotatorAngle => f.write_str("rotator angle"),
        }
    }
}

/// Rotator property state reported with each angle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotatorStatus {
    /// At rest.
    #[default]
    Ok,
    /// Still moving.
    Busy,
    /// Device fault.
    Alert,
}

/// A current value read from the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Temperature(f64),
    RotatorAngle { angle: f64, status: RotatorStatus },
}

impl Reading {
    pub fn quantity(&self) -> Quantity {
        match self {
            Reading::Temperature(_) => Quantity::Temperature,
            Reading::RotatorAngle { .. } => Quantity::RotatorAngle,
        }
    }
}

/// Progress of one preparation action within a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    /// Not enforced in this cycle.
    #[default]
    NotRequired,
    /// Current value unknown, read requested.
    AwaitingValue,
    /// Move commanded, waiting for the device to arrive.
    Moving,
    /// Within tolerance.
    Converged,
}

impl ActionState {
    /// Satisfied for the purpose of completing the cycle.
    pub fn is_done(self) -> bool {
        matches!(self, ActionState::NotRequired | ActionState::Converged)
    }
}

/// Overall status of the preparation machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreparationStatus {
    #[default]
    Idle,
    Preparing,
    Complete,
}

/// Capture targets and the enforcement flags of the current cycle.
///
/// Targets persist across cycles; enforcement is decided anew by every
/// preparation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureState {
    pub target_temperature: Option<f64>,
    pub target_rotator_angle: Option<f64>,
    pub frame_type: FrameType,
    pub is_preview: bool,
    pub enforce_temperature: bool,
    pub enforce_rotator: bool,
}

/// Tag of an outstanding read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadTicket {
    pub generation: u64,
    pub quantity: Quantity,
}

/// Events emitted by the preparation machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareEvent {
    /// The host must read the current value and answer with the ticket.
    ReadCurrentState { quantity: Quantity, ticket: ReadTicket },
    /// Every enforced target has converged.
    PrepareComplete { generation: u64 },
    /// The device reported an alert while preparing.
    DeviceFault { quantity: Quantity, generation: u64 },
}
