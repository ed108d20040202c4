//! Haar cascade classifier loaded from OpenCV's XML cascade format.
//!
//! Supports the `opencv-cascade-classifier` layout (BOOST stages over HAAR
//! features) that `haarcascade_frontalface_default.xml` ships in. Window
//! evaluation reproduces OpenCV's Haar evaluator: variance-normalised
//! feature responses, tree-shaped weak classifiers, and early stage exit.

use crate::integral::IntegralImage;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Minimum standard deviation (relative to the normalisation area) a window
/// needs before it is evaluated at all.
const MIN_NORM_RATIO: f64 = 0.1;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("failed to read cascade {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cascade XML is malformed: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("cascade is missing <{0}>")]
    MissingElement(&'static str),
    #[error("invalid value in <{element}>: {value:?}")]
    InvalidValue { element: &'static str, value: String },
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("weak classifier references {0}")]
    BadReference(String),
}

/// One rectangle of a Haar feature, in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

/// Split node of a weak classifier tree. Children `<= 0` are leaf indices
/// (negated); positive children index further nodes of the same tree.
#[derive(Debug, Clone, Copy)]
struct TreeNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<TreeNode>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    classifiers: Vec<WeakClassifier>,
}

/// A loaded, validated Haar cascade.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let cascade = Self::from_xml_str(&xml)?;
        tracing::info!(
            path = %path.display(),
            window = ?cascade.window_size(),
            stages = cascade.stage_count(),
            features = cascade.feature_count(),
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    /// Parse a cascade from XML text.
    pub fn from_xml_str(xml: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(xml)?;
        let cascade = doc
            .root_element()
            .children()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or(CascadeError::MissingElement("cascade"))?;

        let stage_type = text_of(cascade, "stageType")?;
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
        }
        let feature_type = text_of(cascade, "featureType")?;
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }

        let window_width: u32 = parse_value("width", text_of(cascade, "width")?)?;
        let window_height: u32 = parse_value("height", text_of(cascade, "height")?)?;
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::InvalidValue {
                element: "width",
                value: format!("{window_width}x{window_height}"),
            });
        }

        let features = items(child(cascade, "features")?)
            .map(|f| parse_feature(f, window_width, window_height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = items(child(cascade, "stages")?)
            .map(|s| parse_stage(s, features.len()))
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(CascadeError::MissingElement("stages/_"));
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Training window size `(width, height)`.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    /// Run every stage on the window whose top-left corner is `(x, y)`.
    ///
    /// The window must fit inside `integral`.
    pub(crate) fn classify(&self, integral: &IntegralImage, x: u32, y: u32) -> bool {
        let Some(inv_norm) = self.inverse_norm(integral, x, y) else {
            return false;
        };

        self.stages.iter().all(|stage| {
            let sum: f64 = stage
                .classifiers
                .iter()
                .map(|wc| self.eval_tree(wc, integral, x, y, inv_norm))
                .sum();
            sum >= stage.threshold
        })
    }

    /// Reciprocal of the window's scaled standard deviation, or `None` when
    /// the window is too flat to evaluate.
    fn inverse_norm(&self, integral: &IntegralImage, x: u32, y: u32) -> Option<f64> {
        let (w, h) = (self.window_width - 2, self.window_height - 2);
        let area = (w * h) as f64;
        let sum = integral.rect_sum(x + 1, y + 1, w, h) as f64;
        let sqsum = integral.rect_sqsum(x + 1, y + 1, w, h) as f64;

        let nf = area * sqsum - sum * sum;
        if nf <= 0.0 {
            return None;
        }
        let inv = 1.0 / nf.sqrt();
        (area * inv < MIN_NORM_RATIO).then_some(inv)
    }

    fn eval_tree(
        &self,
        wc: &WeakClassifier,
        integral: &IntegralImage,
        x: u32,
        y: u32,
        inv_norm: f64,
    ) -> f64 {
        let mut idx = 0i32;
        loop {
            let node = &wc.nodes[idx as usize];
            let value = self.feature_value(node.feature, integral, x, y) * inv_norm;
            idx = if value < node.threshold {
                node.left
            } else {
                node.right
            };
            if idx <= 0 {
                return wc.leaves[(-idx) as usize];
            }
        }
    }

    fn feature_value(&self, feature: usize, integral: &IntegralImage, x: u32, y: u32) -> f64 {
        self.features[feature]
            .rects
            .iter()
            .map(|r| r.weight * integral.rect_sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

/// Children named `_`, OpenCV's anonymous sequence element.
fn items<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> {
    node.children().filter(|n| n.has_tag_name("_"))
}

fn child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &'static str,
) -> Result<roxmltree::Node<'a, 'input>, CascadeError> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .ok_or(CascadeError::MissingElement(name))
}

fn text_of<'a>(node: roxmltree::Node<'a, '_>, name: &'static str) -> Result<&'a str, CascadeError> {
    Ok(child(node, name)?.text().unwrap_or("").trim())
}

fn parse_value<T: FromStr>(element: &'static str, raw: &str) -> Result<T, CascadeError> {
    raw.parse().map_err(|_| CascadeError::InvalidValue {
        element,
        value: raw.to_string(),
    })
}

fn parse_list<T: FromStr>(element: &'static str, raw: &str) -> Result<Vec<T>, CascadeError> {
    raw.split_whitespace().map(|tok| parse_value(element, tok)).collect()
}

fn parse_feature(
    node: roxmltree::Node<'_, '_>,
    window_width: u32,
    window_height: u32,
) -> Result<HaarFeature, CascadeError> {
    if let Ok(tilted) = text_of(node, "tilted") {
        if tilted != "0" {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }

    let rects = items(child(node, "rects")?)
        .map(|r| {
            let raw = r.text().unwrap_or("").trim();
            let parts: Vec<f64> = parse_list("rects", raw)?;
            let [x, y, w, h, weight] = parts[..] else {
                return Err(CascadeError::InvalidValue {
                    element: "rects",
                    value: raw.to_string(),
                });
            };
            let bad = || CascadeError::InvalidValue {
                element: "rects",
                value: raw.to_string(),
            };
            let rect = WeightedRect {
                x: whole_number(x, window_width).ok_or_else(bad)?,
                y: whole_number(y, window_height).ok_or_else(bad)?,
                width: whole_number(w, window_width).ok_or_else(bad)?,
                height: whole_number(h, window_height).ok_or_else(bad)?,
                weight,
            };
            let in_window = rect.x as u64 + rect.width as u64 <= window_width as u64
                && rect.y as u64 + rect.height as u64 <= window_height as u64;
            if !in_window || !weight.is_finite() {
                return Err(bad());
            }
            Ok(rect)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if rects.is_empty() {
        return Err(CascadeError::MissingElement("rects/_"));
    }
    Ok(HaarFeature { rects })
}

fn parse_stage(node: roxmltree::Node<'_, '_>, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold = parse_value("stageThreshold", text_of(node, "stageThreshold")?)?;

    let classifiers = items(child(node, "weakClassifiers")?)
        .map(|wc| parse_weak_classifier(wc, feature_count))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Stage {
        threshold,
        classifiers,
    })
}

fn parse_weak_classifier(
    node: roxmltree::Node<'_, '_>,
    feature_count: usize,
) -> Result<WeakClassifier, CascadeError> {
    let raw_nodes: Vec<f64> = parse_list("internalNodes", text_of(node, "internalNodes")?)?;
    let leaves: Vec<f64> = parse_list("leafValues", text_of(node, "leafValues")?)?;

    if raw_nodes.is_empty() || raw_nodes.len() % 4 != 0 {
        return Err(CascadeError::InvalidValue {
            element: "internalNodes",
            value: format!("{} values", raw_nodes.len()),
        });
    }

    let nodes = raw_nodes
        .chunks_exact(4)
        .map(|n| {
            let bad = |what: &str, v: f64| CascadeError::BadReference(format!("{what} {v}"));
            Ok(TreeNode {
                left: tree_child(n[0]).ok_or_else(|| bad("tree child", n[0]))?,
                right: tree_child(n[1]).ok_or_else(|| bad("tree child", n[1]))?,
                feature: whole_number(n[2], u32::MAX)
                    .ok_or_else(|| bad("feature", n[2]))? as usize,
                threshold: n[3],
            })
        })
        .collect::<Result<Vec<_>, CascadeError>>()?;

    for (i, node) in nodes.iter().enumerate() {
        if node.feature >= feature_count {
            return Err(CascadeError::BadReference(format!(
                "feature {} of {feature_count}",
                node.feature
            )));
        }
        for child in [node.left, node.right] {
            // Trees are stored parent-first; a child at or before its parent
            // would make evaluation cycle.
            let ok = if child > 0 {
                (child as usize) > i && (child as usize) < nodes.len()
            } else {
                ((-child) as usize) < leaves.len()
            };
            if !ok {
                return Err(CascadeError::BadReference(format!("tree child {child}")));
            }
        }
    }

    Ok(WeakClassifier { nodes, leaves })
}

/// `v` as an integer in `0..=max`, or `None` if it is not one.
fn whole_number(v: f64, max: u32) -> Option<u32> {
    (v.is_finite() && v.fract() == 0.0 && (0.0..=max as f64).contains(&v)).then_some(v as u32)
}

/// A tree child reference: a node index, or a negated leaf index.
fn tree_child(v: f64) -> Option<i32> {
    let range = -(i32::MAX as f64)..=i32::MAX as f64;
    (v.is_finite() && v.fract() == 0.0 && range.contains(&v)).then_some(v as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DARK_OVER_BRIGHT;
    use image::{GrayImage, Luma};

    /// 24×24 window, dark top half and bright bottom half.
    fn split_window(top: u8, bottom: u8) -> GrayImage {
        GrayImage::from_fn(24, 24, |_, y| Luma([if y < 12 { top } else { bottom }]))
    }

    #[test]
    fn test_parse_synthetic_cascade() {
        let cascade = HaarCascade::from_xml_str(DARK_OVER_BRIGHT).unwrap();
        assert_eq!(cascade.window_size(), (24, 24));
        assert_eq!(cascade.stage_count(), 1);
        assert_eq!(cascade.feature_count(), 1);
        assert_eq!(cascade.features[0].rects[1].weight, 1.0);
    }

    #[test]
    fn test_classify_matching_window() {
        let cascade = HaarCascade::from_xml_str(DARK_OVER_BRIGHT).unwrap();
        let integral = IntegralImage::new(&split_window(0, 255));
        assert!(cascade.classify(&integral, 0, 0));
    }

    #[test]
    fn test_classify_inverted_window() {
        let cascade = HaarCascade::from_xml_str(DARK_OVER_BRIGHT).unwrap();
        let integral = IntegralImage::new(&split_window(255, 0));
        assert!(!cascade.classify(&integral, 0, 0));
    }

    #[test]
    fn test_flat_window_is_rejected() {
        let cascade = HaarCascade::from_xml_str(DARK_OVER_BRIGHT).unwrap();
        let integral = IntegralImage::new(&GrayImage::from_pixel(24, 24, Luma([128])));
        assert!(cascade.inverse_norm(&integral, 0, 0).is_none());
        assert!(!cascade.classify(&integral, 0, 0));
    }

    #[test]
    fn test_tree_classifier_walks_internal_nodes() {
        // Root splits on feature 0; its right child is node 1 which splits on
        // feature 1 (left half darker than right half).
        let xml = DARK_OVER_BRIGHT
            .replace(
                "0 -1 0 2.0000000298023224e-01",
                "0 1 0 2.0000000298023224e-01 -1 -2 1 2.0000000298023224e-01",
            )
            .replace("-1. 1.</leafValues>", "-1. -1. 1.</leafValues>")
            .replace(
                "0 12 24 12 1.</_></rects></_>",
                "0 12 24 12 1.</_></rects></_>\n    <_><rects><_>0 0 12 24 -1.</_><_>12 0 12 24 1.</_></rects></_>",
            );
        let cascade = HaarCascade::from_xml_str(&xml).unwrap();
        assert_eq!(cascade.feature_count(), 2);

        // Passes node 0 but fails node 1 (no left/right contrast).
        let integral = IntegralImage::new(&split_window(0, 255));
        assert!(!cascade.classify(&integral, 0, 0));

        // Dark top-left quadrant region: bottom brighter and right brighter.
        let img = GrayImage::from_fn(24, 24, |x, y| Luma([if x < 12 && y < 12 { 0 } else { 255 }]));
        assert!(cascade.classify(&IntegralImage::new(&img), 0, 0));
    }

    #[test]
    fn test_reject_unsupported_feature_type() {
        let xml = DARK_OVER_BRIGHT.replace("<featureType>HAAR", "<featureType>LBP");
        let err = HaarCascade::from_xml_str(&xml).unwrap_err();
        assert!(matches!(err, CascadeError::Unsupported(_)), "{err}");
    }

    #[test]
    fn test_reject_tilted_feature() {
        let xml = DARK_OVER_BRIGHT.replace("<rects>", "<tilted>1</tilted><rects>");
        let err = HaarCascade::from_xml_str(&xml).unwrap_err();
        assert!(matches!(err, CascadeError::Unsupported(_)), "{err}");
    }

    #[test]
    fn test_reject_unknown_feature_reference() {
        let xml = DARK_OVER_BRIGHT.replace("0 -1 0 2.0", "0 -1 7 2.0");
        let err = HaarCascade::from_xml_str(&xml).unwrap_err();
        assert!(matches!(err, CascadeError::BadReference(_)), "{err}");
    }

    #[test]
    fn test_reject_rect_outside_window() {
        let xml = DARK_OVER_BRIGHT.replace("0 12 24 12 1.", "0 13 24 12 1.");
        let err = HaarCascade::from_xml_str(&xml).unwrap_err();
        assert!(matches!(err, CascadeError::InvalidValue { element: "rects", .. }), "{err}");
    }

    #[test]
    fn test_reject_rect_overflowing_u32() {
        // x + width would wrap around u32.
        let xml = DARK_OVER_BRIGHT.replace("0 12 24 12 1.", "1 12 4294967295 12 1.");
        let err = HaarCascade::from_xml_str(&xml).unwrap_err();
        assert!(matches!(err, CascadeError::InvalidValue { element: "rects", .. }), "{err}");
    }

    #[test]
    fn test_reject_non_integral_or_non_finite_rect() {
        for rect in ["0 12 24 11.5 1.", "0 12 nan 12 1.", "0 12 24 12 inf", "-0.5 12 24 12 1."] {
            let xml = DARK_OVER_BRIGHT.replace("0 12 24 12 1.", rect);
            assert!(HaarCascade::from_xml_str(&xml).is_err(), "{rect} accepted");
        }
    }

    #[test]
    fn test_reject_child_outside_i32() {
        let xml = DARK_OVER_BRIGHT.replace("0 -1 0 2.0000000298023224e-01", "-3000000000 -1 0 2.0");
        let err = HaarCascade::from_xml_str(&xml).unwrap_err();
        assert!(matches!(err, CascadeError::BadReference(_)), "{err}");
    }

    #[test]
    fn test_reject_negative_or_fractional_feature_index() {
        for node in ["0 -1 -1 0.2", "0 -1 0.5 0.2"] {
            let xml = DARK_OVER_BRIGHT.replace("0 -1 0 2.0000000298023224e-01", node);
            let err = HaarCascade::from_xml_str(&xml).unwrap_err();
            assert!(matches!(err, CascadeError::BadReference(_)), "{node}: {err}");
        }
    }

    #[test]
    fn test_reject_cyclic_tree() {
        // Node 1 names itself as its left child.
        let xml = DARK_OVER_BRIGHT.replace("0 -1 0 2.0000000298023224e-01", "1 -1 0 0.2 1 -1 0 0.2");
        let err = HaarCascade::from_xml_str(&xml).unwrap_err();
        assert!(matches!(err, CascadeError::BadReference(_)), "{err}");
    }

    #[test]
    fn test_reject_malformed_xml() {
        let err = HaarCascade::from_xml_str("<opencv_storage><cascade>").unwrap_err();
        assert!(matches!(err, CascadeError::Xml(_)), "{err}");
    }

    #[test]
    fn test_reject_missing_stages() {
        let err = HaarCascade::from_xml_str(
            "<opencv_storage><cascade><stageType>BOOST</stageType><featureType>HAAR</featureType>\
             <height>24</height><width>24</width><features/></cascade></opencv_storage>",
        )
        .unwrap_err();
        assert!(matches!(err, CascadeError::MissingElement("stages")), "{err}");
    }

    #[test]
    fn test_load_missing_file() {
        let err = HaarCascade::load("/nonexistent/haarcascade.xml").unwrap_err();
        assert!(matches!(err, CascadeError::NotFound(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cascade.xml");
        std::fs::write(&path, DARK_OVER_BRIGHT).unwrap();
        let cascade = HaarCascade::load(&path).unwrap();
        assert_eq!(cascade.stage_count(), 1);
    }
}
