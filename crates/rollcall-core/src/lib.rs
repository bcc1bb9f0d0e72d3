//! rollcall-core: face capability, reference labels and matching.
//!
//! Detection uses SCRFD and descriptors come from ArcFace, both via ONNX
//! Runtime. Orchestration code only sees the [`FaceBackend`] trait.

pub mod alignment;
pub mod backend;
pub mod detector;
pub mod labels;
pub mod recognizer;
pub mod roster;
pub mod types;

pub use backend::{BackendError, FaceBackend};
pub use detector::FaceDetector;
pub use labels::{build_labels, LabelSet, ReferenceCache};
pub use recognizer::FaceRecognizer;
pub use roster::{ReferenceEntry, Roster, RosterError};
pub use types::{
    BoundingBox, Descriptor, EuclideanMatcher, FaceDescription, LabeledDescriptors, MatchResult,
    Matcher, DEFAULT_DISTANCE_THRESHOLD,
};

/// Default directory for the ONNX model bundles.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/rollcall/models")
}
