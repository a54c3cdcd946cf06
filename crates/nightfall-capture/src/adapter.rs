//! Device boundaries.

use async_trait::async_trait;

use crate::{CaptureError, FrameType, Quantity, Reading};

/// Commands the preparation machine sends to the camera and rotator.
///
/// Calls must not block; progress comes back through the machine's
/// device callbacks.
pub trait DeviceAdapter: Send + Sync {
    fn set_frame_type_and_batch_mode(&self, frame_type: FrameType, is_preview: bool);

    fn request_temperature(&self, target: f64);

    fn request_rotator_angle(&self, target: f64);
}

/// Asynchronous read access to current device values.
#[async_trait]
pub trait Device: Send + Sync {
    async fn read(&self, quantity: Quantity) -> Result<Reading, CaptureError>;
}
