//! On-disk model bundle: `manifest.json` plus one `.npy` file per tensor.

use std::{
    fs,
    path::{Path, PathBuf},
};

use ndarray::{Array1, Array2};
use ndarray_npy::{ReadNpyExt, WritableElement, read_npy, write_npy};
use serde::{Deserialize, Serialize};

use super::{Activation, BatchNorm, Dense, Dropout, Layer, MlpError, Network};

pub const MANIFEST_FILE: &str = "manifest.json";
const FORMAT: &str = "gesture-forge-mlp";
const VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Dense {
        units: usize,
        activation: Activation,
        kernel: String,
        bias: String,
    },
    BatchNormalization {
        momentum: f32,
        epsilon: f32,
        gamma: String,
        beta: String,
        moving_mean: String,
        moving_variance: String,
    },
    Dropout {
        rate: f32,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleMetrics {
    pub test_loss: f32,
    pub test_accuracy: f32,
    pub train_rows: usize,
    pub test_rows: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format: String,
    pub version: u32,
    pub input_dim: usize,
    pub labels: Vec<String>,
    pub layers: Vec<LayerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BundleMetrics>,
}

#[derive(Clone, Debug)]
pub struct Bundle {
    pub network: Network,
    pub labels: Vec<String>,
    pub metrics: Option<BundleMetrics>,
}

fn tensor_name(index: usize, kind: &str, tensor: &str) -> String {
    format!("layer{index:02}_{kind}_{tensor}.npy")
}

fn write_tensor<A, D>(dir: &Path, name: &str, array: &ndarray::Array<A, D>) -> Result<(), MlpError>
where
    A: WritableElement,
    D: ndarray::Dimension,
{
    let path = dir.join(name);
    write_npy(&path, array).map_err(|source| MlpError::WriteWeights { path, source })
}

fn read_tensor<T: ReadNpyExt>(dir: &Path, name: &str) -> Result<T, MlpError> {
    if name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(MlpError::InvalidBundle(format!(
            "tensor name {name:?} escapes the bundle directory"
        )));
    }
    let path = dir.join(name);
    read_npy(&path).map_err(|source| MlpError::ReadWeights { path, source })
}

/// Write `network` and its label list into `dir`, replacing any bundle
/// already there.
pub fn save_bundle(
    dir: impl AsRef<Path>,
    network: &Network,
    labels: &[String],
    metrics: Option<BundleMetrics>,
) -> Result<PathBuf, MlpError> {
    let dir = dir.as_ref();
    if labels.len() != network.output_dim() {
        return Err(MlpError::InvalidBundle(format!(
            "{} labels for {} output classes",
            labels.len(),
            network.output_dim()
        )));
    }
    fs::create_dir_all(dir).map_err(|source| MlpError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut specs = Vec::with_capacity(network.layers().len());
    for (index, layer) in network.layers().iter().enumerate() {
        let spec = match layer {
            Layer::Dense(dense) => {
                let kernel = tensor_name(index, "dense", "kernel");
                let bias = tensor_name(index, "dense", "bias");
                write_tensor(dir, &kernel, &dense.kernel)?;
                write_tensor(dir, &bias, &dense.bias)?;
                LayerSpec::Dense {
                    units: dense.units(),
                    activation: dense.activation,
                    kernel,
                    bias,
                }
            }
            Layer::BatchNorm(bn) => {
                let names = ["gamma", "beta", "moving_mean", "moving_variance"]
                    .map(|t| tensor_name(index, "batch_normalization", t));
                write_tensor(dir, &names[0], &bn.gamma)?;
                write_tensor(dir, &names[1], &bn.beta)?;
                write_tensor(dir, &names[2], &bn.moving_mean)?;
                write_tensor(dir, &names[3], &bn.moving_variance)?;
                let [gamma, beta, moving_mean, moving_variance] = names;
                LayerSpec::BatchNormalization {
                    momentum: bn.momentum,
                    epsilon: bn.epsilon,
                    gamma,
                    beta,
                    moving_mean,
                    moving_variance,
                }
            }
            Layer::Dropout(dropout) => LayerSpec::Dropout { rate: dropout.rate },
        };
        specs.push(spec);
    }

    let manifest = Manifest {
        format: FORMAT.to_string(),
        version: VERSION,
        input_dim: network.input_dim(),
        labels: labels.to_vec(),
        layers: specs,
        metrics,
    };
    let manifest_path = dir.join(MANIFEST_FILE);
    let json = serde_json::to_string_pretty(&manifest)?;
    fs::write(&manifest_path, json).map_err(|source| MlpError::Io {
        path: manifest_path,
        source,
    })?;

    log::info!("exported {} layers to {}", manifest.layers.len(), dir.display());
    Ok(dir.to_path_buf())
}

pub fn read_manifest(dir: impl AsRef<Path>) -> Result<Manifest, MlpError> {
    let path = dir.as_ref().join(MANIFEST_FILE);
    let raw = fs::read_to_string(&path).map_err(|source| MlpError::Io { path, source })?;
    let manifest: Manifest = serde_json::from_str(&raw)?;
    if manifest.format != FORMAT || manifest.version != VERSION {
        return Err(MlpError::InvalidBundle(format!(
            "unsupported bundle {} v{}",
            manifest.format, manifest.version
        )));
    }
    Ok(manifest)
}

/// Rebuild a network from a bundle written by [`save_bundle`].
pub fn load_bundle(dir: impl AsRef<Path>) -> Result<Bundle, MlpError> {
    let dir = dir.as_ref();
    let manifest = read_manifest(dir)?;

    let mut width = manifest.input_dim;
    let mut layers = Vec::with_capacity(manifest.layers.len());
    for (index, spec) in manifest.layers.iter().enumerate() {
        let layer = match spec {
            LayerSpec::Dense {
                units,
                activation,
                kernel,
                bias,
            } => {
                let kernel: Array2<f32> = read_tensor(dir, kernel)?;
                let bias: Array1<f32> = read_tensor(dir, bias)?;
                if kernel.dim() != (width, *units) || bias.len() != *units {
                    return Err(MlpError::InvalidBundle(format!(
                        "layer {index}: kernel {:?} and bias {} do not fit {width} -> {units}",
                        kernel.dim(),
                        bias.len()
                    )));
                }
                Layer::Dense(Dense::from_parts(kernel, bias, *activation))
            }
            LayerSpec::BatchNormalization {
                momentum,
                epsilon,
                gamma,
                beta,
                moving_mean,
                moving_variance,
            } => {
                let gamma: Array1<f32> = read_tensor(dir, gamma)?;
                let beta: Array1<f32> = read_tensor(dir, beta)?;
                let mean: Array1<f32> = read_tensor(dir, moving_mean)?;
                let variance: Array1<f32> = read_tensor(dir, moving_variance)?;
                if [&gamma, &beta, &mean, &variance].iter().any(|t| t.len() != width) {
                    return Err(MlpError::InvalidBundle(format!(
                        "layer {index}: batch normalization tensors do not match width {width}"
                    )));
                }
                Layer::BatchNorm(BatchNorm::from_parts(
                    gamma, beta, mean, variance, *momentum, *epsilon,
                ))
            }
            LayerSpec::Dropout { rate } => Layer::Dropout(Dropout::new(*rate)),
        };
        width = layer.output_dim(width);
        layers.push(layer);
    }

    if width != manifest.labels.len() {
        return Err(MlpError::InvalidBundle(format!(
            "network has {width} outputs but {} labels",
            manifest.labels.len()
        )));
    }

    Ok(Bundle {
        network: Network::new(manifest.input_dim, layers),
        labels: manifest.labels,
        metrics: manifest.metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlp::{FitConfig, fit};

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("g{i}")).collect()
    }

    #[test]
    fn reload_reproduces_predictions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("gesture_model_export");

        let mut rng = fastrand::Rng::with_seed(11);
        let mut net = Network::gesture_classifier(63, 3, &mut rng);
        let x = Array2::from_shape_fn((24, 63), |(r, c)| ((r % 3) as f32 - 1.0) * (c as f32 * 0.01));
        let y: Vec<usize> = (0..24).map(|r| r % 3).collect();
        let config = FitConfig {
            epochs: 2,
            ..FitConfig::default()
        };
        fit(&mut net, x.view(), &y, None, &config, |_| {}).expect("fit");

        let metrics = BundleMetrics {
            test_loss: 0.5,
            test_accuracy: 0.75,
            train_rows: 24,
            test_rows: 0,
        };
        save_bundle(&out, &net, &labels(3), Some(metrics.clone())).expect("save");
        assert!(out.join(MANIFEST_FILE).is_file());
        assert!(out.join("layer00_dense_kernel.npy").is_file());
        assert!(out.join("layer01_batch_normalization_moving_variance.npy").is_file());

        let bundle = load_bundle(&out).expect("load");
        assert_eq!(bundle.labels, labels(3));
        assert_eq!(bundle.metrics, Some(metrics));
        assert_eq!(bundle.network.layers().len(), 9);

        let before = net.predict_proba(x.view());
        let after = bundle.network.predict_proba(x.view());
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn label_count_must_match_outputs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut rng = fastrand::Rng::with_seed(1);
        let net = Network::gesture_classifier(63, 3, &mut rng);
        let err = save_bundle(dir.path(), &net, &labels(2), None).unwrap_err();
        assert!(matches!(err, MlpError::InvalidBundle(_)));
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut rng = fastrand::Rng::with_seed(1);
        let net = Network::gesture_classifier(63, 3, &mut rng);
        save_bundle(dir.path(), &net, &labels(3), None).expect("save");

        let mut manifest = read_manifest(dir.path()).expect("manifest");
        manifest.input_dim = 10;
        fs::write(
            dir.path().join(MANIFEST_FILE),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            load_bundle(dir.path()),
            Err(MlpError::InvalidBundle(_))
        ));
    }
}
