//! Small dense feed-forward network for landmark classification.

mod bundle;
mod layers;
mod optim;
mod train;

use std::{cmp::Ordering, path::PathBuf};

use ndarray::{Array2, ArrayView2};
use ndarray_npy::{ReadNpyError, WriteNpyError};

pub use bundle::{
    Bundle, BundleMetrics, LayerSpec, MANIFEST_FILE, Manifest, load_bundle, read_manifest,
    save_bundle,
};
pub use layers::{Activation, BatchNorm, Dense, Dropout, Layer, ParamGrad};
pub use optim::Adam;
pub use train::{EpochMetrics, FitConfig, cross_entropy, evaluate, fit};

#[derive(thiserror::Error, Debug)]
pub enum MlpError {
    #[error("no training rows")]
    Empty,
    #[error("expected {expected} input features, got {got}")]
    InputWidth { expected: usize, got: usize },
    #[error("feature matrix has {rows} rows but {labels} labels")]
    Misaligned { rows: usize, labels: usize },
    #[error("label {label} out of range for {classes} output classes")]
    LabelOutOfRange { label: usize, classes: usize },
    #[error("failed to access {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read weights {}", .path.display())]
    ReadWeights {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },
    #[error("failed to write weights {}", .path.display())]
    WriteWeights {
        path: PathBuf,
        #[source]
        source: WriteNpyError,
    },
    #[error("invalid model bundle: {0}")]
    InvalidBundle(String),
}

#[derive(Clone, Debug)]
pub struct Network {
    input_dim: usize,
    layers: Vec<Layer>,
}

impl Network {
    pub fn new(input_dim: usize, layers: Vec<Layer>) -> Self {
        Self { input_dim, layers }
    }

    /// `input -> 256 -> 128 -> 64 -> classes` with batch normalization and
    /// dropout between the hidden layers.
    pub fn gesture_classifier(input_dim: usize, classes: usize, rng: &mut fastrand::Rng) -> Self {
        let layers = vec![
            Layer::Dense(Dense::glorot(input_dim, 256, Activation::Relu, rng)),
            Layer::BatchNorm(BatchNorm::new(256)),
            Layer::Dropout(Dropout::new(0.4)),
            Layer::Dense(Dense::glorot(256, 128, Activation::Relu, rng)),
            Layer::BatchNorm(BatchNorm::new(128)),
            Layer::Dropout(Dropout::new(0.3)),
            Layer::Dense(Dense::glorot(128, 64, Activation::Relu, rng)),
            Layer::Dropout(Dropout::new(0.2)),
            Layer::Dense(Dense::glorot(64, classes, Activation::Softmax, rng)),
        ];
        Self::new(input_dim, layers)
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.layers
            .iter()
            .fold(self.input_dim, |width, layer| layer.output_dim(width))
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(Layer::parameter_count).sum()
    }

    /// Class probabilities in inference mode.
    pub fn predict_proba(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut out = x.to_owned();
        for layer in &self.layers {
            out = layer.infer(out.view());
        }
        out
    }

    /// Most probable class per row.
    pub fn predict(&self, x: ArrayView2<'_, f32>) -> Vec<usize> {
        argmax_rows(&self.predict_proba(x))
    }

    pub(crate) fn forward_train(&mut self, x: Array2<f32>, rng: &mut fastrand::Rng) -> Array2<f32> {
        self.layers
            .iter_mut()
            .fold(x, |out, layer| layer.forward(out, rng))
    }

    /// `grad` is the loss gradient with respect to the output logits.
    pub(crate) fn backward(&mut self, grad: Array2<f32>) {
        self.layers
            .iter_mut()
            .rev()
            .fold(grad, |g, layer| layer.backward(g));
    }

    pub(crate) fn parameters(&mut self) -> Vec<ParamGrad<'_>> {
        self.layers.iter_mut().flat_map(Layer::params).collect()
    }

    /// One line per layer, in the spirit of a model summary.
    pub fn summary(&self) -> Vec<String> {
        let mut width = self.input_dim;
        self.layers
            .iter()
            .map(|layer| {
                let out = layer.output_dim(width);
                let line = format!(
                    "{:<20} ({width:>3} -> {out:>3})  params {}",
                    layer.kind(),
                    layer.parameter_count()
                );
                width = out;
                line
            })
            .collect()
    }
}

pub(crate) fn argmax_rows(probs: &Array2<f32>) -> Vec<usize> {
    probs
        .outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
                .map(|(idx, _)| idx)
                .unwrap_or(0)
        })
        .collect()
}
