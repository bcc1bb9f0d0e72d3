//! rollcall-hw: webcam capture and luma frame handling.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CaptureFormat, DeviceInfo, PixelFormat};
pub use frame::Frame;
