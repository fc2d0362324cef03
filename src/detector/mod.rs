//! Hand-landmark estimation on RGB frames.
//!
//! Two ONNX stages: a palm detector finds every hand, then the handpose
//! estimator runs on a rotated crop around each palm.

mod common;
mod palm;

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::{
    session::{Session, SessionOutputs, builder::GraphOptimizationLevel},
    value::Tensor,
};

use crate::types::{Frame, HandLandmarks};

pub use common::{
    CropTransform, INPUT_SIZE, LetterboxInfo, PALM_INPUT_SIZE, decode_landmarks, letterbox,
    prepare_rotated_crop, to_image_space,
};
pub use palm::{
    PALM_LANDMARKS, PalmConfig, PalmDetector, PalmRegion, RawOutput, anchors, crop_from_palm,
    decode_palm_outputs, estimate_orientation,
};

/// Produces zero or more hands per frame. An empty result is not an error.
pub trait LandmarkDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<HandLandmarks>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectorOptions {
    pub palm: PalmConfig,
    /// Hands scoring below this are dropped.
    pub min_confidence: f32,
    pub mirror: bool,
}

/// Palm detector followed by the handpose estimator, one hand per palm.
pub struct HandposeDetector {
    handpose: Session,
    palm: PalmDetector,
    min_confidence: f32,
    mirror: bool,
}

impl HandposeDetector {
    pub fn new(handpose_path: &Path, palm_path: &Path, options: DetectorOptions) -> Result<Self> {
        let handpose = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(handpose_path)
            .with_context(|| {
                format!("failed to load ORT session from {}", handpose_path.display())
            })?;
        log::info!("handpose model ready: {}", handpose_path.display());
        let palm = PalmDetector::new(palm_path, options.palm)?;
        Ok(Self {
            handpose,
            palm,
            min_confidence: options.min_confidence,
            mirror: options.mirror,
        })
    }

    fn estimate(&mut self, frame: &Frame, region: &PalmRegion) -> Result<Option<HandLandmarks>> {
        let (center, side, angle) = crop_from_palm(region);
        let (input, transform) = prepare_rotated_crop(frame, center, side, angle, INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .handpose
            .run(ort::inputs![tensor])
            .context("failed to run ORT session")?;
        if outputs.len() < 1 {
            return Err(anyhow!("model returned no outputs"));
        }

        let confidence = (first_scalar(&outputs, 1) * region.score).clamp(0.0, 1.0);
        if confidence < self.min_confidence {
            return Ok(None);
        }
        let handedness = first_scalar(&outputs, 2);

        let coords = outputs[0].try_extract_array::<f32>()?;
        let flat: Vec<f32> = coords.iter().copied().collect();
        let points = decode_landmarks(&flat)?;

        Ok(Some(HandLandmarks {
            points: to_image_space(&points, &transform, self.mirror),
            confidence,
            handedness,
        }))
    }
}

fn first_scalar(outputs: &SessionOutputs<'_>, index: usize) -> f32 {
    if index >= outputs.len() {
        return 0.0;
    }
    outputs[index]
        .try_extract_array::<f32>()
        .ok()
        .and_then(|arr| arr.iter().next().copied())
        .unwrap_or(0.0)
}

impl LandmarkDetector for HandposeDetector {
    /// One entry per palm region that passes the confidence threshold,
    /// strongest palm first.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<HandLandmarks>> {
        let regions = self.palm.detect(frame)?;
        let mut hands = Vec::with_capacity(regions.len());
        for region in &regions {
            if let Some(hand) = self.estimate(frame, region)? {
                hands.push(hand);
            }
        }
        log::trace!("{} palms, {} hands", regions.len(), hands.len());
        Ok(hands)
    }
}
