//! Single-face capture: pull frames until the detector finds a face, crop
//! it, and encode the crop as JPEG.

use crate::detector::FaceDetector;
use crate::types::FaceRegion;
use facetranscript_hw::{CameraError, Frame, FrameError, FrameSource};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ExtendedColorType, GrayImage, ImageError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_ATTEMPTS: u32 = 50;
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_JPEG_QUALITY: u8 = 95;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] ImageError),
    #[error("failed to save face image to {path}: {source}")]
    Save {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("user name {0:?} cannot be used as a file name")]
    InvalidUserName(String),
}

/// How a capture run behaves.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    /// Also write each captured face to `image_location/<user>.jpg`.
    pub save_image: bool,
    pub image_location: PathBuf,
    /// Frames to try before giving up.
    pub max_attempts: u32,
    /// Pause between frames that produced no face.
    pub frame_interval: Duration,
    pub jpeg_quality: u8,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            save_image: false,
            image_location: PathBuf::from("dataset"),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// A face found and encoded by [`CaptureFace::capture_image`].
#[derive(Debug, Clone)]
pub struct CapturedFace {
    pub region: FaceRegion,
    /// JPEG-encoded grayscale crop of `region`.
    pub jpeg: Vec<u8>,
    /// Where the crop was written, when saving is enabled.
    pub saved_to: Option<PathBuf>,
    /// Frames read, including the one the face came from.
    pub attempts: u32,
}

/// Result of one capture run. Running out of attempts and being cancelled
/// are outcomes, not errors.
#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    Captured(CapturedFace),
    NoFace { attempts: u32 },
    Cancelled { attempts: u32 },
}

impl CaptureOutcome {
    pub fn is_captured(&self) -> bool {
        matches!(self, Self::Captured(_))
    }

    pub fn captured(&self) -> Option<&CapturedFace> {
        match self {
            Self::Captured(face) => Some(face),
            _ => None,
        }
    }

    pub fn into_captured(self) -> Option<CapturedFace> {
        match self {
            Self::Captured(face) => Some(face),
            _ => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Captured(face) => face.attempts,
            Self::NoFace { attempts } | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// Captures one face per call from any [`FrameSource`].
pub struct CaptureFace {
    detector: FaceDetector,
    settings: CaptureSettings,
}

impl CaptureFace {
    pub fn new(detector: FaceDetector, settings: CaptureSettings) -> Self {
        Self { detector, settings }
    }

    pub fn detector(&self) -> &FaceDetector {
        &self.detector
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// File a capture for `user_name` is saved to when saving is enabled.
    pub fn image_path_for(&self, user_name: &str) -> PathBuf {
        self.settings.image_location.join(format!("{user_name}.jpg"))
    }

    /// Read frames until a face is found, the attempt budget runs out, or
    /// `cancel` is set.
    ///
    /// Only the first detected region of the first successful frame is used.
    pub fn capture_image<S: FrameSource + ?Sized>(
        &self,
        source: &mut S,
        user_name: &str,
        cancel: &AtomicBool,
    ) -> Result<CaptureOutcome, CaptureError> {
        if self.settings.save_image {
            validate_file_stem(user_name)?;
        }

        tracing::info!(
            user = user_name,
            max_attempts = self.settings.max_attempts,
            "starting face capture, look at the camera"
        );

        for attempt in 1..=self.settings.max_attempts {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!(user = user_name, attempts = attempt - 1, "capture cancelled");
                return Ok(CaptureOutcome::Cancelled {
                    attempts: attempt - 1,
                });
            }

            let frame = source.next_frame()?;
            if frame.is_dark {
                tracing::debug!(seq = frame.sequence, attempt, "skipping dark frame");
            } else if let Some(face) = self.try_frame(frame, user_name, attempt)? {
                return Ok(CaptureOutcome::Captured(face));
            }

            if attempt < self.settings.max_attempts && !self.settings.frame_interval.is_zero() {
                std::thread::sleep(self.settings.frame_interval);
            }
        }

        tracing::warn!(
            user = user_name,
            attempts = self.settings.max_attempts,
            "no face detected within attempt budget"
        );
        Ok(CaptureOutcome::NoFace {
            attempts: self.settings.max_attempts,
        })
    }

    fn try_frame(
        &self,
        frame: Frame,
        user_name: &str,
        attempt: u32,
    ) -> Result<Option<CapturedFace>, CaptureError> {
        let (width, height, sequence) = (frame.width, frame.height, frame.sequence);
        let actual = frame.data.len();
        let gray = GrayImage::from_raw(width, height, frame.data).ok_or(FrameError::InvalidLength {
            expected: width as usize * height as usize,
            actual,
        })?;

        let faces = self.detector.detect(&gray);
        tracing::debug!(seq = sequence, attempt, faces = faces.len(), "frame scanned");

        let Some(&region) = faces.first() else {
            return Ok(None);
        };

        let crop =
            imageops::crop_imm(&gray, region.x, region.y, region.width, region.height).to_image();
        let jpeg = encode_jpeg(&crop, self.settings.jpeg_quality)?;

        let saved_to = if self.settings.save_image {
            let path = self.image_path_for(user_name);
            save_bytes(&path, &jpeg)?;
            Some(path)
        } else {
            None
        };

        tracing::info!(
            user = user_name,
            attempt,
            x = region.x,
            y = region.y,
            width = region.width,
            height = region.height,
            bytes = jpeg.len(),
            "face captured"
        );

        Ok(Some(CapturedFace {
            region,
            jpeg,
            saved_to,
            attempts: attempt,
        }))
    }
}

/// Encode a grayscale image as JPEG.
pub fn encode_jpeg(gray: &GrayImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        gray.as_raw(),
        gray.width(),
        gray.height(),
        ExtendedColorType::L8,
    )?;
    Ok(buf)
}

fn save_bytes(path: &Path, bytes: &[u8]) -> Result<(), CaptureError> {
    let save_err = |source| CaptureError::Save {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(save_err)?;
    }
    std::fs::write(path, bytes).map_err(save_err)?;
    tracing::info!(path = %path.display(), "saved face image");
    Ok(())
}

fn validate_file_stem(user_name: &str) -> Result<(), CaptureError> {
    let bad = user_name.is_empty()
        || user_name == "."
        || user_name == ".."
        || user_name.contains(['/', '\\', '\0']);
    if bad {
        return Err(CaptureError::InvalidUserName(user_name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::tests::synthetic_detector;
    use crate::testing::synthetic_face;
    use crate::still::StillImage;
    use image::Luma;

    fn fast_settings() -> CaptureSettings {
        CaptureSettings {
            max_attempts: 5,
            frame_interval: Duration::ZERO,
            ..CaptureSettings::default()
        }
    }

    /// Source that serves `blank` frames `n` times before switching to a face.
    struct FaceAfter {
        remaining_blank: u32,
        reads: u32,
    }

    impl FrameSource for FaceAfter {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            self.reads += 1;
            let img = if self.remaining_blank > 0 {
                self.remaining_blank -= 1;
                GrayImage::from_pixel(160, 160, Luma([128]))
            } else {
                synthetic_face()
            };
            Ok(Frame::from_gray(img.into_raw(), 160, 160, self.reads).unwrap())
        }
    }

    struct Broken;

    impl FrameSource for Broken {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            Err(CameraError::CaptureFailed("unplugged".into()))
        }
    }

    #[test]
    fn test_captures_synthetic_face_as_jpeg() {
        let capture = CaptureFace::new(synthetic_detector(), fast_settings());
        let mut source = StillImage::new(synthetic_face());

        let outcome = capture
            .capture_image(&mut source, "alice", &AtomicBool::new(false))
            .unwrap();
        let face = outcome.into_captured().expect("face expected");

        assert!(!face.jpeg.is_empty());
        assert_eq!(face.attempts, 1);
        assert!(face.saved_to.is_none());

        let decoded = image::load_from_memory_with_format(&face.jpeg, image::ImageFormat::Jpeg)
            .expect("valid JPEG");
        assert_eq!((decoded.width(), decoded.height()), (face.region.width, face.region.height));
    }

    #[test]
    fn test_no_face_terminates_after_budget() {
        let capture = CaptureFace::new(synthetic_detector(), fast_settings());
        let mut source = StillImage::new(GrayImage::from_pixel(160, 160, Luma([128])));

        let outcome = capture
            .capture_image(&mut source, "nobody", &AtomicBool::new(false))
            .unwrap();
        assert!(matches!(outcome, CaptureOutcome::NoFace { attempts: 5 }));
        assert_eq!(source.frames_served(), 5);
    }

    #[test]
    fn test_face_found_on_later_attempt() {
        let capture = CaptureFace::new(synthetic_detector(), fast_settings());
        let mut source = FaceAfter {
            remaining_blank: 3,
            reads: 0,
        };

        let outcome = capture
            .capture_image(&mut source, "bob", &AtomicBool::new(false))
            .unwrap();
        assert_eq!(outcome.attempts(), 4);
        assert!(outcome.is_captured());
    }

    #[test]
    fn test_dark_frames_are_skipped() {
        let capture = CaptureFace::new(synthetic_detector(), fast_settings());
        let mut source = StillImage::new(GrayImage::from_pixel(160, 160, Luma([0])));
        let outcome = capture
            .capture_image(&mut source, "dark", &AtomicBool::new(false))
            .unwrap();
        assert!(matches!(outcome, CaptureOutcome::NoFace { attempts: 5 }));
    }

    #[test]
    fn test_cancel_stops_before_reading() {
        let capture = CaptureFace::new(synthetic_detector(), fast_settings());
        let mut source = StillImage::new(synthetic_face());

        let outcome = capture
            .capture_image(&mut source, "carol", &AtomicBool::new(true))
            .unwrap();
        assert!(matches!(outcome, CaptureOutcome::Cancelled { attempts: 0 }));
        assert_eq!(source.frames_served(), 0);
    }

    #[test]
    fn test_camera_error_propagates() {
        let capture = CaptureFace::new(synthetic_detector(), fast_settings());
        let err = capture
            .capture_image(&mut Broken, "dave", &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, CaptureError::Camera(_)));
    }

    #[test]
    fn test_saves_image_under_user_name() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("dataset");
        let settings = CaptureSettings {
            save_image: true,
            image_location: location.clone(),
            ..fast_settings()
        };
        let capture = CaptureFace::new(synthetic_detector(), settings);
        let mut source = StillImage::new(synthetic_face());

        let face = capture
            .capture_image(&mut source, "erin", &AtomicBool::new(false))
            .unwrap()
            .into_captured()
            .unwrap();

        let expected = location.join("erin.jpg");
        assert_eq!(face.saved_to.as_deref(), Some(expected.as_path()));
        assert_eq!(std::fs::read(&expected).unwrap(), face.jpeg);
    }

    #[test]
    fn test_rejects_path_like_user_name_when_saving() {
        let settings = CaptureSettings {
            save_image: true,
            ..fast_settings()
        };
        let capture = CaptureFace::new(synthetic_detector(), settings);
        let mut source = StillImage::new(synthetic_face());

        let err = capture
            .capture_image(&mut source, "../escape", &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidUserName(_)));
    }

    #[test]
    fn test_image_path_for() {
        let capture = CaptureFace::new(synthetic_detector(), CaptureSettings::default());
        assert_eq!(capture.image_path_for("TestUser"), PathBuf::from("dataset/TestUser.jpg"));
    }

    #[test]
    fn test_encode_jpeg_decodes() {
        let gray = GrayImage::from_fn(32, 16, |x, _| Luma([(x * 8) as u8]));
        let bytes = encode_jpeg(&gray, 90).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
    }
}
