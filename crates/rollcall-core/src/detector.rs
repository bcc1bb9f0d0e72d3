//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the `det_10g` SCRFD export on a letterboxed grayscale frame and
//! decodes its three stride heads (scores, box distances, keypoints) into
//! [`BoundingBox`]es in frame coordinates, followed by greedy NMS.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    BadFrame { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Placement of the source frame inside the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((INPUT_SIZE as f32 - new_w) / 2.0).floor(),
            pad_y: ((INPUT_SIZE as f32 - new_h) / 2.0).floor(),
        }
    }

    /// Model-input coordinates back to frame coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output slot of each head, per stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadSlots {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [HeadSlots; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected 9 output heads, model has {}",
                names.len()
            )));
        }
        let heads = map_heads(&names);

        tracing::info!(
            path = %model_path.display(),
            outputs = ?names,
            ?heads,
            "loaded SCRFD detector"
        );

        Ok(Self { session, heads })
    }

    /// Detect all faces in a grayscale frame, highest confidence first.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let expected = (width * height) as usize;
        if frame.len() < expected || expected == 0 {
            return Err(DetectorError::BadFrame {
                expected,
                actual: frame.len(),
            });
        }

        let letterbox = Letterbox::fit(width, height);
        let input = letterbox_tensor(frame, width, height, &letterbox);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slots, &stride) in self.heads.iter().zip(STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what}/{stride}: {e}")))
            };
            let scores = extract(slots.score, "score")?;
            let boxes = extract(slots.bbox, "bbox")?;
            let kps = extract(slots.kps, "kps")?;
            decode_head(scores, boxes, kps, stride, &letterbox, &mut candidates);
        }

        Ok(suppress(candidates, NMS_IOU))
    }
}

/// Find the score/bbox/kps outputs for each stride by name, falling back
/// to the stock export order (all scores, then all boxes, then all keypoints).
fn map_heads(names: &[String]) -> [HeadSlots; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<HeadSlots>> = STRIDES
        .iter()
        .map(|&s| {
            Some(HeadSlots {
                score: position("score", s)?,
                bbox: position("bbox", s)?,
                kps: position("kps", s)?,
            })
        })
        .collect();

    match named {
        Some(slots) => [slots[0], slots[1], slots[2]],
        None => std::array::from_fn(|i| HeadSlots {
            score: i,
            bbox: i + 3,
            kps: i + 6,
        }),
    }
}

/// Resize into the letterbox and normalise into a 1×3×640×640 tensor.
fn letterbox_tensor(frame: &[u8], width: u32, height: u32, lb: &Letterbox) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    let new_w = ((width as f32 * lb.scale).round() as u32).max(1);
    let new_h = ((height as f32 * lb.scale).round() as u32).max(1);
    let resized = GrayImage::from_raw(width, height, frame[..(width * height) as usize].to_vec())
        .map(|img| imageops::resize(&img, new_w, new_h, FilterType::Triangle));
    let Some(resized) = resized else {
        return tensor;
    };

    let (ox, oy) = (lb.pad_x as u32, lb.pad_y as u32);
    for (x, y, px) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + ox) as usize, (y + oy) as usize);
        if tx >= size || ty >= size {
            continue;
        }
        let v = (px.0[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = v;
        }
    }
    tensor
}

/// Decode one stride head. Anchors are laid out row-major, two per cell.
fn decode_head(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    lb: &Letterbox,
    out: &mut Vec<BoundingBox>,
) {
    let cells_x = INPUT_SIZE as usize / stride;
    let step = stride as f32;

    for (idx, &score) in scores.iter().enumerate() {
        if score <= SCORE_THRESHOLD {
            continue;
        }
        let Some(dist) = boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let cell = idx / ANCHORS_PER_CELL;
        let ax = (cell % cells_x) as f32 * step;
        let ay = (cell / cells_x) as f32 * step;

        let (x1, y1) = lb.unmap(ax - dist[0] * step, ay - dist[1] * step);
        let (x2, y2) = lb.unmap(ax + dist[2] * step, ay + dist[3] * step);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| lb.unmap(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step))
        });

        out.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
}

/// Greedy non-maximum suppression. Output is sorted by confidence.
fn suppress(mut candidates: Vec<BoundingBox>, iou_limit: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<BoundingBox> = Vec::new();
    for cand in candidates {
        if kept.iter().all(|k| iou(k, &cand) <= iou_limit) {
            kept.push(cand);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
