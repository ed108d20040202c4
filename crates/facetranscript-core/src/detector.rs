//! Multi-scale Haar cascade face detector.
//!
//! Scans an image pyramid with the cascade's training window, maps hits back
//! to frame coordinates and merges neighbouring hits into face regions the
//! way OpenCV's `detectMultiScale` + `groupRectangles` do.

use crate::cascade::{CascadeError, HaarCascade};
use crate::integral::IntegralImage;
use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::path::Path;

// --- Named constants (no magic numbers) ---
const DEFAULT_SCALE_FACTOR: f64 = 1.3;
const DEFAULT_MIN_NEIGHBORS: u32 = 5;
const DEFAULT_MIN_SIZE: u32 = 30;
/// Relative edge tolerance for two hits to count as the same face.
const GROUP_EPS: f64 = 0.2;
/// Above this pyramid factor every window position is scanned.
const DENSE_SCAN_FACTOR: f64 = 2.0;

/// Tunables for [`FaceDetector::detect`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorParams {
    /// Pyramid step; must be greater than 1.
    pub scale_factor: f64,
    /// A merged region needs more than this many raw hits. 0 disables merging.
    pub min_neighbors: u32,
    /// Smallest face `(width, height)` reported.
    pub min_size: (u32, u32),
    /// Largest face `(width, height)` reported; `None` means the frame size.
    pub max_size: Option<(u32, u32)>,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: (DEFAULT_MIN_SIZE, DEFAULT_MIN_SIZE),
            max_size: None,
        }
    }
}

/// Signed rectangle used while hits are mapped and grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
}

/// Haar cascade based face detector.
pub struct FaceDetector {
    cascade: HaarCascade,
    params: DetectorParams,
}

impl FaceDetector {
    pub fn new(cascade: HaarCascade, params: DetectorParams) -> Result<Self, CascadeError> {
        if !(params.scale_factor > 1.0) {
            return Err(CascadeError::InvalidValue {
                element: "scale_factor",
                value: params.scale_factor.to_string(),
            });
        }
        Ok(Self { cascade, params })
    }

    /// Load a cascade file and build a detector around it.
    pub fn load(cascade_path: impl AsRef<Path>, params: DetectorParams) -> Result<Self, CascadeError> {
        Self::new(HaarCascade::load(cascade_path)?, params)
    }

    pub fn cascade(&self) -> &HaarCascade {
        &self.cascade
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Detect faces in a grayscale image.
    ///
    /// Regions come back in scan order of their first raw hit: smallest
    /// pyramid level first, then top-to-bottom, left-to-right.
    pub fn detect(&self, image: &GrayImage) -> Vec<FaceRegion> {
        let (img_w, img_h) = image.dimensions();
        let (win_w, win_h) = self.cascade.window_size();
        let (max_w, max_h) = self.params.max_size.unwrap_or((img_w, img_h));
        let (min_w, min_h) = self.params.min_size;

        let mut hits = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;
            let face_w = (win_w as f64 * factor).round() as u32;
            let face_h = (win_h as f64 * factor).round() as u32;

            if scaled_w < win_w || scaled_h < win_h || face_w > max_w || face_h > max_h {
                break;
            }

            if face_w >= min_w && face_h >= min_h {
                let before = hits.len();
                self.scan_level(image, factor, (scaled_w, scaled_h), (face_w, face_h), &mut hits);
                tracing::trace!(factor, hits = hits.len() - before, "scanned pyramid level");
            }

            factor *= self.params.scale_factor;
        }

        let grouped = group_rectangles(&hits, self.params.min_neighbors, GROUP_EPS);
        tracing::debug!(raw = hits.len(), faces = grouped.len(), "detection finished");

        grouped
            .into_iter()
            .filter_map(|r| FaceRegion::clipped(r.x, r.y, r.width, r.height, img_w, img_h))
            .collect()
    }

    fn scan_level(
        &self,
        image: &GrayImage,
        factor: f64,
        (scaled_w, scaled_h): (u32, u32),
        (face_w, face_h): (u32, u32),
        hits: &mut Vec<Rect>,
    ) {
        let (win_w, win_h) = self.cascade.window_size();
        let integral = if factor == 1.0 {
            IntegralImage::new(image)
        } else {
            IntegralImage::new(&imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle))
        };

        let step = if factor > DENSE_SCAN_FACTOR { 1 } else { 2 };
        for y in (0..=integral.height() - win_h).step_by(step) {
            for x in (0..=integral.width() - win_w).step_by(step) {
                if self.cascade.classify(&integral, x, y) {
                    hits.push(Rect {
                        x: (x as f64 * factor).round() as i32,
                        y: (y as f64 * factor).round() as i32,
                        width: face_w as i32,
                        height: face_h as i32,
                    });
                }
            }
        }
    }
}

/// Whether two hits describe the same object: every edge within `eps` of the
/// mean of the smaller dimensions.
fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && ((a.x + a.width - b.x - b.width).abs() as f64) <= delta
        && ((a.y + a.height - b.y - b.height).abs() as f64) <= delta
}

/// Cluster raw hits and keep the well-supported ones.
///
/// Clusters are the transitive closure of [`similar`]. Each cluster becomes
/// its average rectangle; clusters with `min_neighbors` hits or fewer are
/// dropped, as are clusters nested inside a more strongly supported one.
fn group_rectangles(rects: &[Rect], min_neighbors: u32, eps: f64) -> Vec<Rect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let labels = partition(rects, eps);
    let cluster_count = labels.iter().copied().max().map_or(0, |m| m + 1);

    let mut sums = vec![(0i64, 0i64, 0i64, 0i64); cluster_count];
    let mut counts = vec![0u32; cluster_count];
    for (rect, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s.0 += rect.x as i64;
        s.1 += rect.y as i64;
        s.2 += rect.width as i64;
        s.3 += rect.height as i64;
        counts[label] += 1;
    }

    let averaged: Vec<Rect> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let n = n as f64;
            Rect {
                x: (s.0 as f64 / n).round() as i32,
                y: (s.1 as f64 / n).round() as i32,
                width: (s.2 as f64 / n).round() as i32,
                height: (s.3 as f64 / n).round() as i32,
            }
        })
        .collect();

    let mut kept = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= min_neighbors {
            continue;
        }

        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i32;
            let dy = (r2.height as f64 * eps).round() as i32;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width <= r2.x + r2.width + dx
                && r1.y + r1.height <= r2.y + r2.height + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !nested {
            kept.push(*r1);
        }
    }

    kept
}

/// Label equivalence classes of [`similar`] with a union-find.
///
/// Labels are dense and ordered by the first member of each class.
fn partition(rects: &[Rect], eps: f64) -> Vec<usize> {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    let mut label_of_root = vec![usize::MAX; rects.len()];
    let mut next = 0;
    (0..rects.len())
        .map(|i| {
            let root = find(&mut parent, i);
            if label_of_root[root] == usize::MAX {
                label_of_root[root] = next;
                next += 1;
            }
            label_of_root[root]
        })
        .collect()
}
