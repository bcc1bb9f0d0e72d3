//! Reference label building and caching.

use crate::backend::FaceBackend;
use crate::roster::Roster;
use crate::types::LabeledDescriptors;
use std::sync::Arc;

/// Output of one pass over the roster.
#[derive(Debug, Clone)]
pub struct LabelSet {
    /// One entry per roster employee, in roster order.
    pub labels: Arc<Vec<LabeledDescriptors>>,
    /// False when at least one image could not be read or processed.
    pub complete: bool,
}

impl LabelSet {
    /// Number of labels that can actually match.
    pub fn matchable(&self) -> usize {
        self.labels.iter().filter(|l| !l.is_empty()).count()
    }
}

/// Describe each roster image with a single-face detection.
///
/// An image without a detectable face yields an empty descriptor list for
/// that name; the label is still returned so callers can report it.
pub async fn build_labels(roster: &Roster, backend: &dyn FaceBackend) -> LabelSet {
    let mut labels = Vec::with_capacity(roster.len());
    let mut complete = true;

    for entry in &roster.employees {
        let descriptors = match backend.detect_single(&entry.image).await {
            Ok(Some(descriptor)) => vec![descriptor],
            Ok(None) => {
                tracing::warn!(
                    name = %entry.name,
                    image = %entry.image.display(),
                    "no face found in reference image; label will never match"
                );
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(
                    name = %entry.name,
                    image = %entry.image.display(),
                    error = %e,
                    "reference image failed; label will never match"
                );
                complete = false;
                Vec::new()
            }
        };
        labels.push(LabeledDescriptors::new(entry.name.clone(), descriptors));
    }

    let set = LabelSet {
        labels: Arc::new(labels),
        complete,
    };
    tracing::info!(
        employees = roster.len(),
        matchable = set.matchable(),
        complete,
        "reference labels built"
    );
    set
}

/// Reference labels cached by roster content key.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    entry: Option<(String, LabelSet)>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return cached labels for an unchanged roster, otherwise rebuild.
    ///
    /// Incomplete builds are returned but not stored.
    pub async fn get_or_build(&mut self, roster: &Roster, backend: &dyn FaceBackend) -> LabelSet {
        let key = roster.content_key();
        if let Some((cached_key, set)) = &self.entry {
            if *cached_key == key {
                tracing::debug!(key = %key, "reference labels cache hit");
                return set.clone();
            }
        }

        let set = build_labels(roster, backend).await;
        self.entry = if set.complete {
            Some((key, set.clone()))
        } else {
            None
        };
        set
    }

    /// Labels from the last stored build, if any.
    pub fn current(&self) -> Option<&LabelSet> {
        self.entry.as_ref().map(|(_, set)| set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::roster::ReferenceEntry;
    use crate::types::{Descriptor, FaceDescription};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Still {
        Face(Vec<f32>),
        NoFace,
        Broken,
    }

    #[derive(Default)]
    struct StillBackend {
        images: HashMap<PathBuf, Still>,
        calls: AtomicUsize,
    }

    impl StillBackend {
        fn with(mut self, path: &str, still: Still) -> Self {
            self.images.insert(PathBuf::from(path), still);
            self
        }
    }

    #[async_trait]
    impl FaceBackend for StillBackend {
        async fn detect_all(&self) -> Result<Vec<FaceDescription>, BackendError> {
            Ok(Vec::new())
        }

        async fn detect_single(&self, image: &Path) -> Result<Option<Descriptor>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.images.get(image).cloned() {
                Some(Still::Face(v)) => Ok(Some(Descriptor::new(v))),
                Some(Still::NoFace) => Ok(None),
                Some(Still::Broken) | None => Err(BackendError::Image {
                    path: image.to_path_buf(),
                    reason: "unreadable".into(),
                }),
            }
        }
    }

    fn roster(entries: &[(&str, &str)]) -> Roster {
        Roster {
            employees: entries
                .iter()
                .map(|(n, p)| ReferenceEntry::new(*n, *p))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_two_detectable_faces_give_two_nonempty_sets() {
        let backend = StillBackend::default()
            .with("a.jpg", Still::Face(vec![1.0, 0.0]))
            .with("b.jpg", Still::Face(vec![0.0, 1.0]));
        let set = build_labels(&roster(&[("A", "a.jpg"), ("B", "b.jpg")]), &backend).await;

        assert!(set.complete);
        assert_eq!(set.labels.len(), 2);
        assert_eq!(set.labels[0].label, "A");
        assert_eq!(set.labels[1].label, "B");
        assert!(set.labels.iter().all(|l| l.descriptors.len() == 1));
    }

    #[tokio::test]
    async fn test_faceless_reference_keeps_empty_label() {
        let backend = StillBackend::default()
            .with("a.jpg", Still::NoFace)
            .with("b.jpg", Still::Face(vec![0.0, 1.0]));
        let set = build_labels(&roster(&[("A", "a.jpg"), ("B", "b.jpg")]), &backend).await;

        assert!(set.complete);
        assert_eq!(set.labels[0].label, "A");
        assert!(set.labels[0].is_empty());
        assert_eq!(set.matchable(), 1);
    }

    #[tokio::test]
    async fn test_cache_reuses_unchanged_roster() {
        let backend = StillBackend::default().with("a.jpg", Still::Face(vec![1.0]));
        let r = roster(&[("A", "a.jpg")]);
        let mut cache = ReferenceCache::new();

        let first = cache.get_or_build(&r, &backend).await;
        let second = cache.get_or_build(&r.clone(), &backend).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first.labels, &second.labels));
    }

    #[tokio::test]
    async fn test_cache_rebuilds_when_roster_changes() {
        let backend = StillBackend::default()
            .with("a.jpg", Still::Face(vec![1.0]))
            .with("b.jpg", Still::Face(vec![2.0]));
        let mut cache = ReferenceCache::new();

        cache.get_or_build(&roster(&[("A", "a.jpg")]), &backend).await;
        let set = cache
            .get_or_build(&roster(&[("A", "a.jpg"), ("B", "b.jpg")]), &backend)
            .await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(set.labels.len(), 2);
    }

    #[tokio::test]
    async fn test_incomplete_build_is_not_cached() {
        let backend = StillBackend::default().with("a.jpg", Still::Broken);
        let r = roster(&[("A", "a.jpg")]);
        let mut cache = ReferenceCache::new();

        let set = cache.get_or_build(&r, &backend).await;
        assert!(!set.complete);
        assert!(cache.current().is_none());

        cache.get_or_build(&r, &backend).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }
}
