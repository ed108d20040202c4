//! facetranscript-hw: Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access and the [`FrameSource`] seam the
//! capture loop reads grayscale frames through.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError, FrameSource};
