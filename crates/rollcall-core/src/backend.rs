//! The face capability seam.
//!
//! Everything that needs pixels and models (live detection, reference
//! image description) goes through [`FaceBackend`]. The daemon implements it
//! on top of its engine thread; tests use in-memory fakes.

use crate::types::{Descriptor, FaceDescription};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("face backend unavailable: {0}")]
    Unavailable(String),
    #[error("cannot load image {path}: {reason}")]
    Image { path: PathBuf, reason: String },
    #[error("face inference failed: {0}")]
    Inference(String),
}

#[async_trait]
pub trait FaceBackend: Send + Sync {
    /// Detect every face in the current camera frame, with landmarks and
    /// descriptors. A frame with no faces (or no camera) is `Ok(vec![])`.
    async fn detect_all(&self) -> Result<Vec<FaceDescription>, BackendError>;

    /// Describe the most confident face in a still image, `Ok(None)` when
    /// the image contains no face.
    async fn detect_single(&self, image: &Path) -> Result<Option<Descriptor>, BackendError>;
}
