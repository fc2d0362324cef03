//! Palm detection: SSD anchors, box decoding and non-maximum suppression.

use std::{cmp::Ordering, f32::consts::FRAC_PI_2, path::Path};

use anyhow::{Context, Result, anyhow};
use ort::{
    session::{Session, builder::GraphOptimizationLevel},
    value::Tensor,
};

use super::common::{LetterboxInfo, PALM_INPUT_SIZE, letterbox};
use crate::types::Frame;

/// Keypoints per palm: wrist, four finger bases and two thumb joints.
pub const PALM_LANDMARKS: usize = 7;

/// Feature map strides of the detector head. Layers that share a stride
/// share a grid.
const ANCHOR_STRIDES: [u32; 4] = [8, 16, 16, 16];
const ANCHORS_PER_LAYER: usize = 2;

#[derive(Clone, Debug, PartialEq)]
pub struct PalmRegion {
    /// `[x1, y1, x2, y2]` in source pixels.
    pub bbox: [f32; 4],
    pub landmarks: [(f32, f32); PALM_LANDMARKS],
    pub score: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PalmConfig {
    pub score_threshold: f32,
    pub nms_threshold: f32,
    /// Most regions kept after suppression.
    pub top_k: usize,
}

impl Default for PalmConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            nms_threshold: 0.3,
            top_k: 32,
        }
    }
}

/// Anchor centers in `[0, 1]` input coordinates, in head output order.
pub fn anchors(input_size: u32) -> Vec<[f32; 2]> {
    let mut out = Vec::new();
    let mut layer = 0;
    while layer < ANCHOR_STRIDES.len() {
        let stride = ANCHOR_STRIDES[layer];
        let mut repeats = 0;
        while layer < ANCHOR_STRIDES.len() && ANCHOR_STRIDES[layer] == stride {
            repeats += ANCHORS_PER_LAYER;
            layer += 1;
        }
        let cells = input_size.div_ceil(stride);
        for y in 0..cells {
            for x in 0..cells {
                let center = [
                    (x as f32 + 0.5) / cells as f32,
                    (y as f32 + 0.5) / cells as f32,
                ];
                out.extend(std::iter::repeat_n(center, repeats));
            }
        }
    }
    out
}

pub struct PalmDetector {
    session: Session,
    anchors: Vec<[f32; 2]>,
    cfg: PalmConfig,
}

impl PalmDetector {
    pub fn new(model_path: &Path, cfg: PalmConfig) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(model_path)
            .with_context(|| {
                format!("failed to load palm detector from {}", model_path.display())
            })?;
        log::info!("palm detector ready: {}", model_path.display());
        Ok(Self {
            session,
            anchors: anchors(PALM_INPUT_SIZE),
            cfg,
        })
    }

    /// Palm regions in source pixels, best score first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<PalmRegion>> {
        let (input, letterbox) = letterbox(frame, PALM_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run palm detector session")?;
        if outputs.len() < 2 {
            return Err(anyhow!(
                "palm detector returned {} outputs, expected at least 2",
                outputs.len()
            ));
        }

        let boxes = outputs[0].try_extract_array::<f32>()?;
        let scores = outputs[1].try_extract_array::<f32>()?;
        let boxes = RawOutput {
            values: boxes
                .as_slice()
                .ok_or_else(|| anyhow!("palm boxes not contiguous"))?,
            shape: boxes.shape(),
        };
        let scores = RawOutput {
            values: scores
                .as_slice()
                .ok_or_else(|| anyhow!("palm scores not contiguous"))?,
            shape: scores.shape(),
        };
        decode_palm_outputs(boxes, scores, &self.anchors, &letterbox, &self.cfg)
    }
}

/// A flat model output and its shape.
#[derive(Clone, Copy, Debug)]
pub struct RawOutput<'a> {
    pub values: &'a [f32],
    pub shape: &'a [usize],
}

impl RawOutput<'_> {
    /// `(anchors, features)` from the trailing two axes.
    fn dims(&self, what: &str) -> Result<(usize, usize)> {
        match self.shape {
            [.., anchors, features] if self.shape.len() >= 3 => Ok((*anchors, *features)),
            _ => Err(anyhow!(
                "unexpected palm {what} shape {:?}, need [batch, anchors, features]",
                self.shape
            )),
        }
    }

    fn at(&self, index: usize) -> Result<f32> {
        self.values
            .get(index)
            .copied()
            .ok_or_else(|| anyhow!("palm output index {index} out of range"))
    }
}

/// Turn raw detector outputs into suppressed palm regions in source pixels.
pub fn decode_palm_outputs(
    boxes: RawOutput<'_>,
    scores: RawOutput<'_>,
    anchors: &[[f32; 2]],
    letterbox: &LetterboxInfo,
    cfg: &PalmConfig,
) -> Result<Vec<PalmRegion>> {
    let (anchor_dim, feature_dim) = boxes.dims("box")?;
    let (score_anchor_dim, score_dim) = scores.dims("score")?;
    if feature_dim < 4 + PALM_LANDMARKS * 2 {
        return Err(anyhow!("palm box feature dimension too small: {feature_dim}"));
    }
    if anchor_dim != score_anchor_dim {
        return Err(anyhow!(
            "anchor dimension mismatch between boxes ({anchor_dim}) and scores ({score_anchor_dim})"
        ));
    }

    let input = PALM_INPUT_SIZE as f32;
    let scale = letterbox.orig_w.max(letterbox.orig_h) as f32;
    let pad_x = letterbox.pad_x / letterbox.scale;
    let pad_y = letterbox.pad_y / letterbox.scale;
    let to_source = |u: f32, v: f32| (u * scale - pad_x, v * scale - pad_y);

    let mut candidates = Vec::new();
    for (idx, anchor) in anchors.iter().enumerate().take(anchor_dim) {
        let score = sigmoid(scores.at(idx * score_dim)?);
        if score < cfg.score_threshold {
            continue;
        }

        let base = idx * feature_dim;
        let cx = boxes.at(base)? / input + anchor[0];
        let cy = boxes.at(base + 1)? / input + anchor[1];
        let hw = boxes.at(base + 2)? / input / 2.0;
        let hh = boxes.at(base + 3)? / input / 2.0;

        let (x1, y1) = to_source(cx - hw, cy - hh);
        let (x2, y2) = to_source(cx + hw, cy + hh);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        let mut landmarks = [(0.0, 0.0); PALM_LANDMARKS];
        for (l, point) in landmarks.iter_mut().enumerate() {
            let lx = boxes.at(base + 4 + l * 2)? / input + anchor[0];
            let ly = boxes.at(base + 5 + l * 2)? / input + anchor[1];
            *point = to_source(lx, ly);
        }

        candidates.push(PalmRegion {
            bbox: clamp_box([x1, y1, x2, y2], letterbox.orig_w, letterbox.orig_h),
            landmarks,
            score,
        });
    }

    Ok(nms(candidates, cfg.nms_threshold, cfg.top_k))
}

/// Center, side and rotation of the handpose crop around a palm.
pub fn crop_from_palm(region: &PalmRegion) -> ((f32, f32), f32, f32) {
    let n = PALM_LANDMARKS as f32;
    let (sum_x, sum_y) = region
        .landmarks
        .iter()
        .fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
    let center = (sum_x / n, sum_y / n);

    let (min_x, max_x, min_y, max_y) = region.landmarks.iter().fold(
        (f32::MAX, f32::MIN, f32::MAX, f32::MIN),
        |acc, &(x, y)| (acc.0.min(x), acc.1.max(x), acc.2.min(y), acc.3.max(y)),
    );
    let span = (max_x - min_x).max(max_y - min_y);
    let base_w = (region.bbox[2] - region.bbox[0]).abs();
    let base_h = (region.bbox[3] - region.bbox[1]).abs();
    // The palm box excludes the fingers.
    let side = base_w.max(base_h).max(span).max(80.0) * 2.4;

    (center, side, estimate_orientation(region))
}

/// Angle of the principal axis of the palm keypoints, turned so the palm
/// faces up in the crop.
pub fn estimate_orientation(region: &PalmRegion) -> f32 {
    let n = PALM_LANDMARKS as f32;
    let (sx, sy) = region
        .landmarks
        .iter()
        .fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
    let mean = (sx / n, sy / n);

    let (mut xx, mut xy, mut yy) = (0.0f32, 0.0f32, 0.0f32);
    for &(x, y) in &region.landmarks {
        let dx = x - mean.0;
        let dy = y - mean.1;
        xx += dx * dx;
        xy += dx * dy;
        yy += dy * dy;
    }
    xx /= n;
    xy /= n;
    yy /= n;

    let half_trace = (xx + yy) * 0.5;
    let det = xx * yy - xy * xy;
    let lambda = (half_trace + (half_trace * half_trace - det).max(0.0).sqrt()).max(1e-6);
    let (vx, vy) = if xy.abs() > 1e-6 {
        (lambda - yy, xy)
    } else if xx >= yy {
        (1.0, 0.0)
    } else {
        (0.0, 1.0)
    };
    vy.atan2(vx) - FRAC_PI_2
}

fn nms(mut candidates: Vec<PalmRegion>, threshold: f32, top_k: usize) -> Vec<PalmRegion> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    let mut keep: Vec<PalmRegion> = Vec::new();
    for candidate in candidates {
        if keep.len() >= top_k {
            break;
        }
        if keep.iter().all(|k| iou(&candidate.bbox, &k.bbox) < threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    if inter <= 0.0 {
        return 0.0;
    }
    let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn clamp_box(b: [f32; 4], w: u32, h: u32) -> [f32; 4] {
    let max_w = w.saturating_sub(1) as f32;
    let max_h = h.saturating_sub(1) as f32;
    [
        b[0].clamp(0.0, max_w),
        b[1].clamp(0.0, max_h),
        b[2].clamp(0.0, max_w),
        b[3].clamp(0.0, max_h),
    ]
}
