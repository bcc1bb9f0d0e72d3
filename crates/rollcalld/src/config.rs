use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// `tokio::time::interval` rejects a zero period.
pub const MIN_FRAME_INTERVAL_MS: u64 = 1;

/// What happens to a session once an employee has been recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    /// The first match ends the session and disarms the timeout.
    Stop,
    /// Keep tracking frames until stopped; the first match disarms the timeout.
    Continuous,
}

impl MatchPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stop" => Some(Self::Stop),
            "continuous" => Some(Self::Continuous),
            _ => None,
        }
    }
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing the ONNX model bundles.
    pub model_dir: PathBuf,
    /// Optional roster TOML; the built-in roster is used when unset.
    pub roster_path: Option<PathBuf>,
    /// Base directory for relative reference image paths.
    pub reference_dir: PathBuf,
    /// Maximum (exclusive) descriptor distance for a match.
    pub distance_threshold: f32,
    /// How long a session may search before the timeout alert.
    pub timeout: Duration,
    /// Delay between detection iterations.
    pub frame_interval: Duration,
    /// Frames discarded after the camera opens.
    pub warmup_frames: usize,
    /// Dark frames skipped per detection before giving up on that tick.
    pub dark_frame_attempts: usize,
    pub match_policy: MatchPolicy,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = get("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(rollcall_core::default_model_dir);
        let reference_dir = get("ROLLCALL_REFERENCE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("labeled_images"));

        let match_policy = match get("ROLLCALL_MATCH_POLICY") {
            Some(raw) => MatchPolicy::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "unknown ROLLCALL_MATCH_POLICY; using stop");
                MatchPolicy::Stop
            }),
            None => MatchPolicy::Stop,
        };

        Self {
            camera_device: get("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|| "/dev/video0".to_string()),
            capture_width: parse_var(&get, "ROLLCALL_CAPTURE_WIDTH").unwrap_or(640),
            capture_height: parse_var(&get, "ROLLCALL_CAPTURE_HEIGHT").unwrap_or(480),
            model_dir,
            roster_path: get("ROLLCALL_ROSTER").map(PathBuf::from),
            reference_dir,
            distance_threshold: parse_var(&get, "ROLLCALL_DISTANCE_THRESHOLD")
                .unwrap_or(rollcall_core::DEFAULT_DISTANCE_THRESHOLD),
            timeout: Duration::from_secs(parse_var(&get, "ROLLCALL_TIMEOUT_SECS").unwrap_or(40)),
            frame_interval: Duration::from_millis(
                parse_var::<u64>(&get, "ROLLCALL_FRAME_INTERVAL_MS")
                    .unwrap_or(16)
                    .max(MIN_FRAME_INTERVAL_MS),
            ),
            warmup_frames: parse_var(&get, "ROLLCALL_WARMUP_FRAMES").unwrap_or(4),
            dark_frame_attempts: parse_var(&get, "ROLLCALL_DARK_FRAME_ATTEMPTS").unwrap_or(3),
            match_policy,
            bus: match get("ROLLCALL_BUS").as_deref() {
                Some("system") => BusKind::System,
                _ => BusKind::Session,
            },
        }
    }

    /// Path to the SCRFD detector bundle (also provides the landmarks).
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognizer bundle.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|v| v.trim().parse().ok())
}
