//! Runtime settings, optionally read from a JSON file.
//!
//! Every field has a default so a partial file only overrides what it
//! names. Command-line flags are applied on top in `main`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    detector::{DetectorOptions, PalmConfig},
    model_download::ModelKind,
    store,
};

pub const DEFAULT_LABELS: [&str; 9] = [
    "volume_up",
    "volume_down",
    "mute",
    "camera_toggle",
    "exit_room",
    "cursor",
    "grab",
    "resize",
    "draw_mode",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub model_dir: PathBuf,
    pub labels: Vec<String>,
    pub capture: CaptureSettings,
    pub detector: DetectorSettings,
    pub knn: KnnSettings,
    pub mlp: MlpSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            model_dir: PathBuf::from("models"),
            labels: DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
            capture: CaptureSettings::default(),
            detector: DetectorSettings::default(),
            knn: KnnSettings::default(),
            mlp: MlpSettings::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub quota: usize,
    pub max_hands: usize,
    pub camera_index: u32,
    pub min_confidence: f32,
    pub mirror: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            quota: 1000,
            max_hands: 1,
            camera_index: 0,
            min_confidence: 0.5,
            mirror: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub model_path: PathBuf,
    pub model_url: String,
    pub palm_model_path: PathBuf,
    pub palm_model_url: String,
    pub palm_score_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        let palm = PalmConfig::default();
        Self {
            model_path: ModelKind::HandposeEstimator.default_path(),
            model_url: ModelKind::HandposeEstimator.default_url().to_string(),
            palm_model_path: ModelKind::PalmDetector.default_path(),
            palm_model_url: ModelKind::PalmDetector.default_url().to_string(),
            palm_score_threshold: palm.score_threshold,
            nms_threshold: palm.nms_threshold,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnnSettings {
    pub k: usize,
    pub max_per_label: Option<usize>,
    pub seed: u64,
    pub test_fraction: f64,
    pub normalize: bool,
    pub output_file: String,
}

impl Default for KnnSettings {
    fn default() -> Self {
        Self {
            k: crate::knn::DEFAULT_K,
            max_per_label: Some(2000),
            seed: 42,
            test_fraction: 0.2,
            normalize: true,
            output_file: "knn_model.json".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpSettings {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub seed: u64,
    pub test_fraction: f64,
    pub export_dir: String,
}

impl Default for MlpSettings {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            learning_rate: 0.001,
            seed: 42,
            test_fraction: 0.2,
            export_dir: "gesture_model_export".to_string(),
        }
    }
}

impl Settings {
    pub fn load_json(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let settings: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        if let Some(bad) = settings.labels.iter().find(|l| !store::is_valid_label(l)) {
            anyhow::bail!(
                "config {}: label {bad:?} must be non-empty and free of '.', '/' and '\\'",
                path.display()
            );
        }
        Ok(settings)
    }

    /// Defaults when `path` is `None`.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load_json(path),
            None => Ok(Self::default()),
        }
    }

    /// Detector options for a capture run. One palm region is kept per
    /// hand the session may record.
    pub fn detector_options(&self) -> DetectorOptions {
        DetectorOptions {
            palm: PalmConfig {
                score_threshold: self.detector.palm_score_threshold,
                nms_threshold: self.detector.nms_threshold,
                top_k: self.capture.max_hands.max(1),
            },
            min_confidence: self.capture.min_confidence,
            mirror: self.capture.mirror,
        }
    }

    pub fn knn_output_path(&self) -> PathBuf {
        self.model_dir.join(&self.knn.output_file)
    }

    pub fn mlp_export_dir(&self) -> PathBuf {
        self.model_dir.join(&self.mlp.export_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "data_dir": "captures", "capture": { "quota": 50 }, "knn": { "max_per_label": null } }"#,
        )
        .expect("write");

        let settings = Settings::load_json(&path).expect("load");
        assert_eq!(settings.data_dir, PathBuf::from("captures"));
        assert_eq!(settings.capture.quota, 50);
        assert_eq!(settings.capture.max_hands, 1);
        assert!(settings.capture.mirror);
        assert_eq!(settings.knn.max_per_label, None);
        assert_eq!(settings.knn.k, 5);
        assert_eq!(settings.labels.len(), 9);
        assert_eq!(settings.mlp_export_dir(), PathBuf::from("models/gesture_model_export"));
    }

    #[test]
    fn dotted_labels_are_rejected_at_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "labels": ["thumbs.up", "thumbs.down"] }"#).expect("write");
        let err = Settings::load_json(&path).unwrap_err();
        assert!(format!("{err}").contains("thumbs.up"));
    }

    #[test]
    fn max_hands_caps_palm_regions() {
        let mut settings = Settings::default();
        settings.capture.max_hands = 2;
        settings.capture.mirror = false;
        let options = settings.detector_options();
        assert_eq!(options.palm.top_k, 2);
        assert!(!options.mirror);
        assert_eq!(options.palm.score_threshold, 0.5);
        assert!(settings.detector.palm_model_path.ends_with("palm_detection_mediapipe_2023feb.onnx"));
    }

    #[test]
    fn malformed_file_names_the_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").expect("write");
        let err = Settings::load_json(&path).unwrap_err();
        assert!(format!("{err}").contains("broken.json"));
    }
}
