use serde::{Deserialize, Serialize};

/// Axis-aligned face rectangle in pixel coordinates of the source frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clip a signed rectangle to a `width × height` frame.
    ///
    /// Returns `None` when nothing of it remains inside the frame.
    pub fn clipped(x: i32, y: i32, w: i32, h: i32, width: u32, height: u32) -> Option<Self> {
        let x0 = x.max(0) as i64;
        let y0 = y.max(0) as i64;
        let x1 = (x as i64 + w as i64).min(width as i64);
        let y1 = (y as i64 + h as i64).min(height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self::new(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clipped_inside() {
        assert_eq!(
            FaceRegion::clipped(10, 20, 30, 40, 100, 100),
            Some(FaceRegion::new(10, 20, 30, 40))
        );
    }

    #[test]
    fn test_clipped_overhang() {
        assert_eq!(
            FaceRegion::clipped(-5, 90, 20, 20, 100, 100),
            Some(FaceRegion::new(0, 90, 15, 10))
        );
    }

    #[test]
    fn test_clipped_outside() {
        assert_eq!(FaceRegion::clipped(120, 0, 10, 10, 100, 100), None);
        assert_eq!(FaceRegion::clipped(0, 0, 0, 10, 100, 100), None);
    }

    #[test]
    fn test_area() {
        assert_eq!(FaceRegion::new(0, 0, 640, 480).area(), 307_200);
    }
}
