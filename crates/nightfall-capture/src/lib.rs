//! Capture preparation for Nightfall.
//!
//! Before each light frame the camera and rotator have to reach their
//! targets. This crate provides:
//! - [`PreparationStateMachine`]: drives a [`DeviceAdapter`] toward the
//!   enforced targets and signals completion once per cycle
//! - [`PreparationDriver`]: a single-dispatcher task owning the machine,
//!   answering value requests from an async [`Device`]
//! - [`SimulatedDevice`]: an in-process camera and rotator

mod adapter;
mod config;
mod driver;
mod error;
mod machine;
mod sim;
mod state;

pub use adapter::{Device, DeviceAdapter};
pub use config::PreparationConfig;
pub use driver::{PreparationDriver, PreparationHandle};
pub use error::CaptureError;
pub use machine::PreparationStateMachine;
pub use sim::{DeviceCommand, DeviceUpdate, SimulatedDevice};
pub use state::{
    ActionState, CaptureState, FrameType, PrepareEvent, PreparationStatus, Quantity, ReadTicket,
    Reading, RotatorStatus,
};
