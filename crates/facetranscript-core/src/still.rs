//! Frame source that serves one still image over and over.

use facetranscript_hw::{CameraError, Frame, FrameSource};
use image::{GrayImage, ImageError};
use std::path::Path;

/// Repeats a single grayscale image as if it were a camera feed.
pub struct StillImage {
    image: GrayImage,
    served: u32,
}

impl StillImage {
    pub fn new(image: GrayImage) -> Self {
        Self { image, served: 0 }
    }

    /// Decode an image file (any format `image` understands) to grayscale.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let image = image::open(path.as_ref())?.into_luma8();
        tracing::debug!(
            path = %path.as_ref().display(),
            width = image.width(),
            height = image.height(),
            "loaded still image"
        );
        Ok(Self::new(image))
    }

    /// Decode an in-memory encoded image to grayscale.
    pub fn from_encoded(bytes: &[u8]) -> Result<Self, ImageError> {
        Ok(Self::new(image::load_from_memory(bytes)?.into_luma8()))
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    /// Number of frames handed out so far.
    pub fn frames_served(&self) -> u32 {
        self.served
    }
}

impl FrameSource for StillImage {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.served += 1;
        Frame::from_gray(
            self.image.as_raw().clone(),
            self.image.width(),
            self.image.height(),
            self.served,
        )
        .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_serves_same_image_with_increasing_sequence() {
        let mut still = StillImage::new(GrayImage::from_pixel(3, 2, Luma([77])));
        let a = still.next_frame().unwrap();
        let b = still.next_frame().unwrap();
        assert_eq!(a.data, vec![77u8; 6]);
        assert_eq!(a.data, b.data);
        assert_eq!((a.sequence, b.sequence), (1, 2));
        assert_eq!(still.frames_served(), 2);
    }

    #[test]
    fn test_open_converts_to_grayscale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb.png");
        image::RgbImage::from_pixel(4, 4, image::Rgb([255, 255, 255]))
            .save(&path)
            .unwrap();

        let still = StillImage::open(&path).unwrap();
        assert_eq!(still.image().dimensions(), (4, 4));
        assert!(still.image().pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn test_from_encoded_rejects_garbage() {
        assert!(StillImage::from_encoded(b"not an image").is_err());
    }
}
