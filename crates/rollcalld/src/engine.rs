use crate::config::Config;
use async_trait::async_trait;
use rollcall_core::{
    BackendError, Descriptor, FaceBackend, FaceDescription, FaceDetector, FaceRecognizer,
};
use rollcall_hw::{Camera, CaptureFormat, Frame};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] rollcall_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] rollcall_core::recognizer::RecognizerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Both ONNX sessions, loaded and ready to move onto the engine thread.
pub struct Models {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

/// Load the model bundles in order. The first failure aborts the load.
pub fn load_models(config: &Config) -> Result<Models, EngineError> {
    let detector_path = config.detector_model_path();
    let detector = FaceDetector::load(&detector_path)?;
    tracing::info!(
        bundle = "detector",
        path = %detector_path.display(),
        "model bundle loaded (detection + five-point landmarks)"
    );

    let recognizer_path = config.recognizer_model_path();
    let recognizer = FaceRecognizer::load(&recognizer_path)?;
    tracing::info!(
        bundle = "recognizer",
        path = %recognizer_path.display(),
        "model bundle loaded (descriptors)"
    );

    Ok(Models {
        detector,
        recognizer,
    })
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    DetectFrame {
        reply: oneshot::Sender<Result<Vec<FaceDescription>, BackendError>>,
    },
    DescribeImage {
        path: PathBuf,
        reply: oneshot::Sender<Result<Option<Descriptor>, BackendError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    camera: Option<String>,
}

impl EngineHandle {
    /// Device path of the open camera, `None` when acquisition failed.
    pub fn camera(&self) -> Option<&str> {
        self.camera.as_deref()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, BackendError>>) -> EngineRequest,
    ) -> Result<T, BackendError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| closed())?;
        reply_rx.await.map_err(|_| closed())?
    }
}

fn closed() -> BackendError {
    BackendError::Unavailable("engine thread exited".into())
}

#[async_trait]
impl FaceBackend for EngineHandle {
    async fn detect_all(&self) -> Result<Vec<FaceDescription>, BackendError> {
        self.request(|reply| EngineRequest::DetectFrame { reply })
            .await
    }

    async fn detect_single(&self, image: &Path) -> Result<Option<Descriptor>, BackendError> {
        let path = image.to_path_buf();
        self.request(|reply| EngineRequest::DescribeImage { path, reply })
            .await
    }
}

/// Acquire the camera and start the engine thread.
///
/// A camera that cannot be opened is not fatal: the engine runs without it
/// and every live detection reports no faces.
pub fn spawn_engine(config: &Config, models: Models) -> Result<EngineHandle, EngineError> {
    let camera = acquire_camera(config);
    let camera_path = camera.as_ref().map(|c| c.device_path.clone());
    let dark_attempts = config.dark_frame_attempts;
    let Models {
        mut detector,
        mut recognizer,
    } = models;

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::DetectFrame { reply } => {
                        let result = detect_frame(
                            camera.as_ref(),
                            &mut detector,
                            &mut recognizer,
                            dark_attempts,
                        );
                        let _ = reply.send(result);
                    }
                    EngineRequest::DescribeImage { path, reply } => {
                        let result = describe_image(&path, &mut detector, &mut recognizer);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        camera: camera_path,
    })
}

fn acquire_camera(config: &Config) -> Option<Camera> {
    let format = CaptureFormat {
        width: config.capture_width,
        height: config.capture_height,
    };
    match Camera::open(&config.camera_device, format) {
        Ok(camera) => {
            if let Err(e) = camera.warm_up(config.warmup_frames) {
                tracing::warn!(error = %e, "camera warm-up failed");
            }
            Some(camera)
        }
        Err(e) => {
            tracing::warn!(
                device = %config.camera_device,
                error = %e,
                "camera unavailable; live preview will stay blank"
            );
            None
        }
    }
}

fn inference<E: std::fmt::Display>(e: E) -> BackendError {
    BackendError::Inference(e.to_string())
}

/// Grab the next usable frame and describe every face in it.
fn detect_frame(
    camera: Option<&Camera>,
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
    dark_attempts: usize,
) -> Result<Vec<FaceDescription>, BackendError> {
    let Some(camera) = camera else {
        return Ok(Vec::new());
    };
    let frame = camera
        .next_usable_frame(dark_attempts)
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;
    let Some(frame) = frame else {
        tracing::trace!("only dark frames; nothing to detect");
        return Ok(Vec::new());
    };

    describe_faces(&frame, detector, recognizer, usize::MAX)
}

/// Describe the most confident face of a still image.
fn describe_image(
    path: &Path,
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
) -> Result<Option<Descriptor>, BackendError> {
    let img = image::open(path).map_err(|e| BackendError::Image {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let frame = Frame::from_image(&img);
    let faces = describe_faces(&frame, detector, recognizer, 1)?;
    Ok(faces.into_iter().next().map(|f| f.descriptor))
}

fn describe_faces(
    frame: &Frame,
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
    limit: usize,
) -> Result<Vec<FaceDescription>, BackendError> {
    let boxes = detector
        .detect(&frame.data, frame.width, frame.height)
        .map_err(inference)?;

    let mut faces = Vec::with_capacity(boxes.len().min(limit));
    for bbox in boxes.into_iter().take(limit) {
        let descriptor = recognizer
            .describe(&frame.data, frame.width, frame.height, &bbox)
            .map_err(inference)?;
        faces.push(FaceDescription { bbox, descriptor });
    }
    tracing::trace!(faces = faces.len(), seq = frame.sequence, "frame described");
    Ok(faces)
}
