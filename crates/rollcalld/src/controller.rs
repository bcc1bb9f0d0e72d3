//! Session orchestration: start/stop, the detection loop and the timeout guard.

use crate::config::{Config, MIN_FRAME_INTERVAL_MS};
use crate::render::StatusView;
use crate::session::{Event, FrameOutcome, Outcome, Session, SessionId, StartRejection};
use rollcall_core::{
    BackendError, EuclideanMatcher, FaceBackend, FaceDescription, LabelSet, LabeledDescriptors,
    Matcher, ReferenceCache, Roster, RosterError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum StartError {
    #[error("{0}")]
    Rejected(StartRejection),
    #[error("roster: {0}")]
    Roster(#[from] RosterError),
}

struct State {
    session: Session,
    backend: Option<Arc<dyn FaceBackend>>,
    camera: Option<String>,
    /// Token of the running session; cancelled when it ends.
    token: Option<CancellationToken>,
    labels: Option<LabelSet>,
}

struct Inner {
    config: Config,
    matcher: EuclideanMatcher,
    state: Mutex<State>,
    cache: Mutex<ReferenceCache>,
}

/// Shared handle to the recognition controller.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(config: Config) -> Self {
        let session = Session::new(config.match_policy, config.timeout);
        Self {
            inner: Arc::new(Inner {
                matcher: EuclideanMatcher::new(config.distance_threshold),
                config,
                state: Mutex::new(State {
                    session,
                    backend: None,
                    camera: None,
                    token: None,
                    labels: None,
                }),
                cache: Mutex::new(ReferenceCache::new()),
            }),
        }
    }

    /// Models are loaded; recognition may start from now on.
    pub async fn models_ready(&self, backend: Arc<dyn FaceBackend>, camera: Option<String>) {
        let mut state = self.inner.state.lock().await;
        state.backend = Some(backend);
        state.camera = camera;
        state.session.apply(Event::ModelsLoaded);
    }

    pub async fn models_failed(&self, reason: String) {
        tracing::error!(reason = %reason, "model loading failed; recognition disabled");
        self.inner
            .state
            .lock()
            .await
            .session
            .apply(Event::ModelsFailed(reason));
    }

    pub async fn status(&self) -> StatusView {
        StatusView::render(&self.inner.state.lock().await.session)
    }

    pub async fn camera(&self) -> Option<String> {
        self.inner.state.lock().await.camera.clone()
    }

    /// Label sets used by the most recent session.
    pub async fn labels(&self) -> Option<Arc<Vec<LabeledDescriptors>>> {
        let state = self.inner.state.lock().await;
        state.labels.as_ref().map(|set| set.labels.clone())
    }

    /// Start a recognition session. Rejected while one is running.
    pub async fn start(&self) -> Result<StatusView, StartError> {
        let config = &self.inner.config;
        let roster = Roster::resolve(config.roster_path.as_deref(), &config.reference_dir)?;

        let mut state = self.inner.state.lock().await;
        let Some(backend) = state.backend.clone() else {
            return Err(StartError::Rejected(StartRejection::ModelsNotLoaded));
        };
        let session = match state.session.apply(Event::Start) {
            Outcome::Started(id) => id,
            Outcome::Rejected(why) => return Err(StartError::Rejected(why)),
            Outcome::Changed | Outcome::Ignored => {
                return Err(StartError::Rejected(StartRejection::AlreadyRunning))
            }
        };

        let token = CancellationToken::new();
        if let Some(previous) = state.token.replace(token.clone()) {
            previous.cancel();
        }
        let view = StatusView::render(&state.session);
        drop(state);

        tracing::info!(session, employees = roster.len(), "recognition started");
        let this = self.clone();
        tokio::spawn(async move { this.run_session(session, token, backend, roster).await });
        Ok(view)
    }

    /// Stop the running session. Returns false when nothing was running.
    pub async fn stop(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.session.apply(Event::Stop) != Outcome::Changed {
            return false;
        }
        if let Some(token) = state.token.take() {
            token.cancel();
        }
        true
    }

    /// Apply an event for `session`; returns whether it is still running.
    /// Cancels the session token once it is not.
    async fn dispatch(&self, session: SessionId, token: &CancellationToken, event: Event) -> bool {
        let mut state = self.inner.state.lock().await;
        state.session.apply(event);
        let running = state.session.is_running(session);
        if !running {
            token.cancel();
        }
        running
    }

    async fn run_session(
        self,
        session: SessionId,
        token: CancellationToken,
        backend: Arc<dyn FaceBackend>,
        roster: Roster,
    ) {
        let deadline = time::sleep(self.inner.config.timeout);
        tokio::pin!(deadline);

        let labels = tokio::select! {
            _ = token.cancelled() => return,
            _ = &mut deadline => {
                self.dispatch(session, &token, Event::Timeout { session }).await;
                return;
            }
            set = self.reference_labels(&roster, backend.as_ref()) => set,
        };
        self.inner.state.lock().await.labels = Some(labels.clone());

        let period = self
            .inner
            .config
            .frame_interval
            .max(Duration::from_millis(MIN_FRAME_INTERVAL_MS));
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut armed = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = &mut deadline, if armed => {
                    armed = false;
                    if !self.dispatch(session, &token, Event::Timeout { session }).await {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let detected = tokio::select! {
                        _ = token.cancelled() => break,
                        faces = backend.detect_all() => faces,
                    };
                    let outcome = self.classify(detected, &labels.labels);
                    let event = Event::Frame { session, outcome };
                    if !self.dispatch(session, &token, event).await {
                        break;
                    }
                }
            }
        }
        tracing::debug!(session, "detection loop finished");
    }

    async fn reference_labels(&self, roster: &Roster, backend: &dyn FaceBackend) -> LabelSet {
        self.inner.cache.lock().await.get_or_build(roster, backend).await
    }

    fn classify(
        &self,
        detected: Result<Vec<FaceDescription>, BackendError>,
        labels: &[LabeledDescriptors],
    ) -> FrameOutcome {
        match detected {
            Ok(faces) => classify_frame(&faces, labels, &self.inner.matcher),
            Err(e) => {
                tracing::warn!(error = %e, "frame detection failed");
                FrameOutcome::NoFaces
            }
        }
    }
}

/// Reduce one frame's faces to a single outcome: the closest match wins.
pub fn classify_frame(
    faces: &[FaceDescription],
    labels: &[LabeledDescriptors],
    matcher: &impl Matcher,
) -> FrameOutcome {
    if faces.is_empty() {
        return FrameOutcome::NoFaces;
    }
    faces
        .iter()
        .map(|face| matcher.best_match(&face.descriptor, labels))
        .filter(|m| m.is_match())
        .min_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .and_then(|m| m.label)
        .map_or(FrameOutcome::Unmatched, FrameOutcome::Matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchPolicy;
    use crate::session::Phase;
    use async_trait::async_trait;
    use rollcall_core::{BoundingBox, Descriptor};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ABHAY: [f32; 3] = [1.0, 0.0, 0.0];
    const ADITI: [f32; 3] = [0.0, 1.0, 0.0];
    const STRANGER: [f32; 3] = [0.0, 0.0, 1.0];

    fn face(values: &[f32]) -> FaceDescription {
        FaceDescription {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                confidence: 0.9,
                landmarks: None,
            },
            descriptor: Descriptor::new(values.to_vec()),
        }
    }

    /// Serves fixed reference descriptors and the same live frame forever.
    struct FakeBackend {
        references: Vec<(PathBuf, Option<Vec<f32>>)>,
        frame: Vec<Vec<f32>>,
        frames_served: AtomicUsize,
    }

    impl FakeBackend {
        fn new(abhay: Option<[f32; 3]>, aditi: Option<[f32; 3]>, frame: &[[f32; 3]]) -> Arc<Self> {
            Arc::new(Self {
                references: vec![
                    (PathBuf::from("refs/AbhayKadam.jpg"), abhay.map(|d| d.to_vec())),
                    (PathBuf::from("refs/AditiKotechaa.jpg"), aditi.map(|d| d.to_vec())),
                ],
                frame: frame.iter().map(|v| v.to_vec()).collect(),
                frames_served: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FaceBackend for FakeBackend {
        async fn detect_all(&self) -> Result<Vec<FaceDescription>, BackendError> {
            self.frames_served.fetch_add(1, Ordering::SeqCst);
            Ok(self.frame.iter().map(|v| face(v)).collect())
        }

        async fn detect_single(&self, image: &Path) -> Result<Option<Descriptor>, BackendError> {
            self.references
                .iter()
                .find(|(p, _)| p == image)
                .map(|(_, d)| d.clone().map(Descriptor::new))
                .ok_or_else(|| BackendError::Image {
                    path: image.to_path_buf(),
                    reason: "not found".into(),
                })
        }
    }

    fn config(policy: MatchPolicy) -> Config {
        let mut cfg = Config::from_lookup(|_| None);
        cfg.reference_dir = PathBuf::from("refs");
        cfg.match_policy = policy;
        cfg
    }

    async fn ready(policy: MatchPolicy, backend: Arc<FakeBackend>) -> Controller {
        let controller = Controller::new(config(policy));
        controller.models_ready(backend, None).await;
        controller
    }

    #[test]
    fn test_classify_empty_frame() {
        let labels = vec![LabeledDescriptors::new("A", vec![Descriptor::new(ABHAY.to_vec())])];
        let out = classify_frame(&[], &labels, &EuclideanMatcher::default());
        assert_eq!(out, FrameOutcome::NoFaces);
    }

    #[test]
    fn test_classify_closest_face_wins() {
        let labels = vec![
            LabeledDescriptors::new("A", vec![Descriptor::new(ABHAY.to_vec())]),
            LabeledDescriptors::new("B", vec![Descriptor::new(ADITI.to_vec())]),
        ];
        let faces = vec![face(&[0.8, 0.2, 0.0]), face(&[0.0, 0.95, 0.05]), face(&STRANGER)];
        let out = classify_frame(&faces, &labels, &EuclideanMatcher::default());
        assert_eq!(out, FrameOutcome::Matched("B".into()));
    }

    #[test]
    fn test_classify_stranger_is_unmatched() {
        let labels = vec![LabeledDescriptors::new("A", vec![Descriptor::new(ABHAY.to_vec())])];
        let out = classify_frame(&[face(&STRANGER)], &labels, &EuclideanMatcher::default());
        assert_eq!(out, FrameOutcome::Unmatched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejected_before_models_load() {
        let controller = Controller::new(config(MatchPolicy::Stop));
        assert!(matches!(
            controller.start().await,
            Err(StartError::Rejected(StartRejection::ModelsNotLoaded))
        ));
        controller.models_failed("det_10g.onnx missing".into()).await;
        assert!(controller.start().await.is_err());
        assert!(!controller.status().await.models_loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_face_is_reported() {
        let backend = FakeBackend::new(Some(ABHAY), Some(ADITI), &[[0.05, 0.98, 0.0]]);
        let controller = ready(MatchPolicy::Stop, backend).await;

        let view = controller.start().await.unwrap();
        assert!(view.recognition_active);
        assert_eq!(view.status_line, crate::render::SEARCHING);

        time::sleep(Duration::from_millis(100)).await;
        let view = controller.status().await;
        assert_eq!(view.detected_label.as_deref(), Some("Aditi Kotecha detected!"));
        assert!(!view.recognition_active);

        // Stop policy: the timer died with the session.
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(controller.status().await.alert_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_alerts_once_and_deactivates() {
        let backend = FakeBackend::new(Some(ABHAY), Some(ADITI), &[STRANGER]);
        let controller = ready(MatchPolicy::Stop, backend.clone()).await;
        controller.start().await.unwrap();

        time::sleep(Duration::from_secs(39)).await;
        let view = controller.status().await;
        assert!(view.recognition_active);
        assert_eq!(view.status_line, crate::render::SEARCHING);

        time::sleep(Duration::from_secs(2)).await;
        let view = controller.status().await;
        assert!(!view.recognition_active);
        assert_eq!(view.alert_count, 1);
        assert_eq!(
            view.last_alert.as_deref(),
            Some("Failed to detect the employee within 40 seconds.")
        );

        // The loop is gone: no more frames are requested.
        let served = backend.frames_served.load(Ordering::SeqCst);
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.frames_served.load(Ordering::SeqCst), served);
        assert_eq!(controller.status().await.alert_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_frame_interval_still_times_out() {
        let backend = FakeBackend::new(Some(ABHAY), Some(ADITI), &[STRANGER]);
        let mut cfg = config(MatchPolicy::Stop);
        cfg.frame_interval = Duration::ZERO;
        let controller = Controller::new(cfg);
        controller.models_ready(backend.clone(), None).await;
        controller.start().await.unwrap();

        time::sleep(Duration::from_secs(1)).await;
        assert!(backend.frames_served.load(Ordering::SeqCst) > 0);

        time::sleep(Duration::from_secs(40)).await;
        let view = controller.status().await;
        assert!(!view.recognition_active);
        assert_eq!(view.alert_count, 1);
        assert!(controller.start().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_faceless_reference_never_matches() {
        // Abhay's photo has no face; the live face is Abhay.
        let backend = FakeBackend::new(None, Some(ADITI), &[ABHAY]);
        let controller = ready(MatchPolicy::Stop, backend).await;
        controller.start().await.unwrap();

        time::sleep(Duration::from_secs(1)).await;
        let labels = controller.labels().await.unwrap();
        assert_eq!(labels[0].label, "Abhay Kadam");
        assert!(labels[0].is_empty());
        let view = controller.status().await;
        assert_eq!(view.detected_label, None);
        assert_eq!(view.status_line, crate::render::SEARCHING);

        time::sleep(Duration::from_secs(40)).await;
        assert_eq!(controller.status().await.alert_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_while_running_is_noop() {
        let backend = FakeBackend::new(Some(ABHAY), Some(ADITI), &[]);
        let controller = ready(MatchPolicy::Stop, backend).await;
        let first = controller.start().await.unwrap();
        assert!(matches!(
            controller.start().await,
            Err(StartError::Rejected(StartRejection::AlreadyRunning))
        ));
        assert_eq!(controller.status().await.session, first.session);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_restart_gets_fresh_timer() {
        let backend = FakeBackend::new(Some(ABHAY), Some(ADITI), &[STRANGER]);
        let controller = ready(MatchPolicy::Stop, backend).await;

        controller.start().await.unwrap();
        time::sleep(Duration::from_secs(30)).await;
        assert!(controller.stop().await);
        assert!(!controller.stop().await);

        controller.start().await.unwrap();
        // The first session's deadline passes without effect.
        time::sleep(Duration::from_secs(20)).await;
        let view = controller.status().await;
        assert!(view.recognition_active);
        assert_eq!(view.alert_count, 0);

        time::sleep(Duration::from_secs(21)).await;
        assert_eq!(controller.status().await.alert_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_policy_keeps_running_after_match() {
        let backend = FakeBackend::new(Some(ABHAY), Some(ADITI), &[ABHAY]);
        let controller = ready(MatchPolicy::Continuous, backend).await;
        controller.start().await.unwrap();

        time::sleep(Duration::from_secs(45)).await;
        let view = controller.status().await;
        assert!(view.recognition_active);
        assert_eq!(view.detected_label.as_deref(), Some("Abhay Kadam detected!"));
        assert_eq!(view.alert_count, 0);

        assert!(controller.stop().await);
        assert!(matches!(
            controller.inner.state.lock().await.session.phase(),
            Phase::Stopped { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reference_labels_are_cached_between_sessions() {
        struct Counting {
            inner: Arc<FakeBackend>,
            singles: AtomicUsize,
        }

        #[async_trait]
        impl FaceBackend for Counting {
            async fn detect_all(&self) -> Result<Vec<FaceDescription>, BackendError> {
                self.inner.detect_all().await
            }
            async fn detect_single(&self, image: &Path) -> Result<Option<Descriptor>, BackendError> {
                self.singles.fetch_add(1, Ordering::SeqCst);
                self.inner.detect_single(image).await
            }
        }

        let backend = Arc::new(Counting {
            inner: FakeBackend::new(Some(ABHAY), Some(ADITI), &[ABHAY]),
            singles: AtomicUsize::new(0),
        });
        let controller = Controller::new(config(MatchPolicy::Stop));
        controller.models_ready(backend.clone(), None).await;

        for _ in 0..3 {
            controller.start().await.unwrap();
            time::sleep(Duration::from_millis(100)).await;
            assert!(!controller.status().await.recognition_active);
        }
        assert_eq!(backend.singles.load(Ordering::SeqCst), 2);
    }
}
