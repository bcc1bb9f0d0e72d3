use serde::{Deserialize, Serialize};

/// Distance below which a probe is accepted as a known identity.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.6;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face descriptor vector (512-dimensional, L2-normalised for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model version that produced this descriptor (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Euclidean distance between two descriptors, `None` when they are
    /// not comparable (different or zero length).
    pub fn distance(&self, other: &Descriptor) -> Option<f32> {
        if self.values.is_empty() || self.values.len() != other.values.len() {
            return None;
        }
        let sum: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }
}

/// Reference descriptors for one known identity.
///
/// `descriptors` may be empty when no face was found in the reference
/// image. Such a set never produces a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledDescriptors {
    pub label: String,
    pub descriptors: Vec<Descriptor>,
}

impl LabeledDescriptors {
    pub fn new(label: impl Into<String>, descriptors: Vec<Descriptor>) -> Self {
        Self {
            label: label.into(),
            descriptors,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Mean distance from `probe` to every reference descriptor, or `None`
    /// for an empty set or a probe that is not comparable with every
    /// reference.
    pub fn mean_distance(&self, probe: &Descriptor) -> Option<f32> {
        if self.descriptors.is_empty() {
            return None;
        }
        let total = self
            .descriptors
            .iter()
            .map(|d| d.distance(probe))
            .sum::<Option<f32>>()?;
        Some(total / self.descriptors.len() as f32)
    }
}

/// One face found in a live frame.
#[derive(Debug, Clone)]
pub struct FaceDescription {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
}

/// Result of matching a probe descriptor against the reference sets.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched label, `None` for an unknown face.
    pub label: Option<String>,
    /// Distance to the closest non-empty reference set (`f32::INFINITY` when
    /// there was nothing to compare against).
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            label: None,
            distance,
        }
    }

    pub fn is_match(&self) -> bool {
        self.label.is_some()
    }
}

/// Strategy for comparing a probe descriptor against labeled reference sets.
pub trait Matcher {
    fn best_match(&self, probe: &Descriptor, references: &[LabeledDescriptors]) -> MatchResult;
}

/// Nearest-label matcher over mean Euclidean distance.
///
/// A label matches only when its distance is strictly below `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DISTANCE_THRESHOLD,
        }
    }
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Matcher for EuclideanMatcher {
    fn best_match(&self, probe: &Descriptor, references: &[LabeledDescriptors]) -> MatchResult {
        let best = references
            .iter()
            .filter_map(|set| set.mean_distance(probe).map(|d| (set, d)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((set, distance)) if distance < self.threshold => MatchResult {
                label: Some(set.label.clone()),
                distance,
            },
            Some((_, distance)) => MatchResult::unknown(distance),
            None => MatchResult::unknown(f32::INFINITY),
        }
    }
}
