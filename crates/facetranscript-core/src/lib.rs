//! facetranscript-core: Face detection and single-face capture.
//!
//! Detects frontal faces with a Haar cascade loaded from OpenCV's XML
//! format, then crops and JPEG-encodes the first face a frame source yields.

pub mod capture;
pub mod cascade;
pub mod detector;
mod integral;
pub mod still;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod types;

pub use capture::{encode_jpeg, CaptureError, CaptureFace, CaptureOutcome, CaptureSettings, CapturedFace};
pub use cascade::{CascadeError, HaarCascade};
pub use detector::{DetectorParams, FaceDetector};
pub use still::StillImage;
pub use types::FaceRegion;
