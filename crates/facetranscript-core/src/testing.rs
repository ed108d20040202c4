//! Synthetic fixtures for tests: a one-feature cascade and a matching "face".
//!
//! Built for this crate's tests and, with the `test-support` feature, for
//! downstream crates.

use image::{GrayImage, Luma};

/// Single-stage 24×24 cascade that fires on windows whose lower half is
/// brighter than their upper half.
pub const DARK_OVER_BRIGHT: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>24</height>
  <width>24</width>
  <stageParams><maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams><maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 2.0000000298023224e-01</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 24 12 -1.</_>
        <_>
          0 12 24 12 1.</_></rects></_></features></cascade>
</opencv_storage>
"#;

/// Smallest face side [`DARK_OVER_BRIGHT`] can find: its window size.
pub const SYNTHETIC_MIN_FACE: u32 = 24;

/// 160×160 mid-grey frame with an 80×80 "face": dark upper half, bright
/// lower half, at (40, 40).
pub fn synthetic_face() -> GrayImage {
    GrayImage::from_fn(160, 160, |x, y| {
        let inside = (40..120).contains(&x) && (40..120).contains(&y);
        Luma([match (inside, y < 80) {
            (false, _) => 128,
            (true, true) => 20,
            (true, false) => 235,
        }])
    })
}
