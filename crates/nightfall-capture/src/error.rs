//! Error types for capture preparation.

use std::time::Duration;

use thiserror::Error;

use crate::Quantity;

/// Errors that can occur while preparing a capture.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaptureError {
    /// The preparation driver has shut down.
    #[error("preparation driver channel closed")]
    ChannelClosed,

    /// Preparation did not complete in time.
    #[error("preparation timed out after {0:?}")]
    Timeout(Duration),

    /// The device reported an alert state.
    #[error("device fault on {0}")]
    DeviceFault(Quantity),

    /// A newer preparation cycle replaced this one.
    #[error("preparation cycle {0} superseded")]
    Superseded(u64),

    /// Device communication failed.
    #[error("device error: {0}")]
    Device(String),

    /// Invalid preparation configuration.
    #[error("invalid preparation configuration: {0}")]
    InvalidConfig(String),
}
