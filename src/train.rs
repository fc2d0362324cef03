//! Command-level workflows: assemble the dataset, fit, evaluate, export.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, Axis};

use crate::{
    config::{KnnSettings, MlpSettings},
    dataset::{self, AssembleOptions, TrainingMatrix},
    knn::{KnnClassifier, KnnExport},
    mlp::{self, BundleMetrics, FitConfig, Network},
    normalize,
};

#[derive(Clone, Debug)]
pub struct KnnReport {
    pub rows: usize,
    pub test_rows: usize,
    /// `None` when every class was too small to hold rows out.
    pub test_accuracy: Option<f64>,
    pub output: PathBuf,
}

#[derive(Clone, Debug)]
pub struct MlpReport {
    pub train_rows: usize,
    pub test_rows: usize,
    pub test_loss: Option<f32>,
    pub test_accuracy: Option<f32>,
    pub export_dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArtifactSummary {
    pub label: String,
    pub path: PathBuf,
    pub shape: Vec<usize>,
}

/// Discover and assemble every artifact under `data_dir`.
pub fn load_training_matrix(data_dir: &Path, options: &AssembleOptions) -> Result<TrainingMatrix> {
    let artifacts = dataset::discover_artifacts(data_dir)
        .with_context(|| format!("failed to scan {}", data_dir.display()))?;
    let matrix = dataset::assemble(&artifacts, options)
        .with_context(|| format!("failed to assemble dataset from {}", data_dir.display()))?;
    if matrix.is_empty() {
        bail!("no samples found under {}", data_dir.display());
    }

    for (label, count) in matrix.labels.iter().zip(matrix.class_counts()) {
        log::info!("  {label}: {count} samples");
    }
    log::info!(
        "assembled {} samples over {} labels",
        matrix.len(),
        matrix.num_classes()
    );
    Ok(matrix)
}

/// Fit k-NN on a stratified split, report hold-out accuracy and export the
/// full assembled matrix to `output`.
pub fn train_knn(data_dir: &Path, settings: &KnnSettings, output: &Path) -> Result<KnnReport> {
    let options = AssembleOptions {
        normalize: settings.normalize,
        max_per_label: settings.max_per_label,
        seed: settings.seed,
    };
    let matrix = load_training_matrix(data_dir, &options)?;

    let (train_idx, test_idx) =
        dataset::stratified_split(&matrix.y, settings.test_fraction, settings.seed);
    let (train_x, train_y) = matrix.subset(&train_idx);
    let (test_x, test_y) = matrix.subset(&test_idx);

    let classifier = KnnClassifier::fit(settings.k, train_x, train_y, matrix.labels.clone())
        .context("failed to fit k-NN")?;
    let test_accuracy = if test_y.is_empty() {
        log::warn!("no rows held out; skipping accuracy");
        None
    } else {
        let acc = classifier.accuracy(test_x.view(), &test_y);
        log::info!(
            "k-NN (k={}) hold-out accuracy: {:.2}% on {} rows",
            settings.k,
            acc * 100.0,
            test_y.len()
        );
        Some(acc)
    };

    KnnExport::from_matrix(settings.k, &matrix)
        .write_json(output)
        .with_context(|| format!("failed to export k-NN model to {}", output.display()))?;
    log::info!("k-NN model written to {}", output.display());

    Ok(KnnReport {
        rows: matrix.len(),
        test_rows: test_y.len(),
        test_accuracy,
        output: output.to_path_buf(),
    })
}

fn epoch_bar(epochs: usize) -> ProgressBar {
    let pb = ProgressBar::new(epochs as u64);
    if let Ok(style) =
        ProgressStyle::with_template("epoch {pos}/{len} [{wide_bar:.green/white}] {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

/// Train the dense classifier and export it as a bundle in `export_dir`.
pub fn train_mlp(data_dir: &Path, settings: &MlpSettings, export_dir: &Path) -> Result<MlpReport> {
    let options = AssembleOptions {
        seed: settings.seed,
        ..AssembleOptions::default()
    };
    let matrix = load_training_matrix(data_dir, &options)?;

    let (train_idx, test_idx) =
        dataset::stratified_split(&matrix.y, settings.test_fraction, settings.seed);
    let (train_x, train_y) = matrix.subset(&train_idx);
    let (test_x, test_y) = matrix.subset(&test_idx);

    let mut rng = fastrand::Rng::with_seed(settings.seed);
    let mut network =
        Network::gesture_classifier(train_x.ncols(), matrix.num_classes(), &mut rng);
    for line in network.summary() {
        log::info!("  {line}");
    }
    log::info!("{} trainable parameters", network.parameter_count());

    let config = FitConfig {
        epochs: settings.epochs,
        batch_size: settings.batch_size,
        learning_rate: settings.learning_rate,
        seed: settings.seed,
    };
    let validation = (!test_y.is_empty()).then(|| (test_x.view(), test_y.as_slice()));
    let bar = epoch_bar(settings.epochs);
    mlp::fit(
        &mut network,
        train_x.view(),
        &train_y,
        validation,
        &config,
        |m| {
            bar.set_message(match (m.val_loss, m.val_accuracy) {
                (Some(vl), Some(va)) => format!(
                    "loss {:.4} acc {:.3} val_loss {vl:.4} val_acc {va:.3}",
                    m.loss, m.accuracy
                ),
                _ => format!("loss {:.4} acc {:.3}", m.loss, m.accuracy),
            });
            bar.inc(1);
        },
    )
    .context("training failed")?;
    bar.finish();

    let (test_loss, test_accuracy) = if test_y.is_empty() {
        (None, None)
    } else {
        let (loss, acc) = mlp::evaluate(&network, test_x.view(), &test_y);
        log::info!("test accuracy: {:.2}% (loss {loss:.4})", acc * 100.0);
        (Some(loss), Some(acc))
    };

    let metrics = test_loss.zip(test_accuracy).map(|(loss, acc)| BundleMetrics {
        test_loss: loss,
        test_accuracy: acc,
        train_rows: train_y.len(),
        test_rows: test_y.len(),
    });
    mlp::save_bundle(export_dir, &network, &matrix.labels, metrics)
        .with_context(|| format!("failed to export model to {}", export_dir.display()))?;

    Ok(MlpReport {
        train_rows: train_y.len(),
        test_rows: test_y.len(),
        test_loss,
        test_accuracy,
        export_dir: export_dir.to_path_buf(),
    })
}

/// Shapes of the stored artifacts, without assembling them.
pub fn inspect(data_dir: &Path) -> Result<Vec<ArtifactSummary>> {
    let artifacts = dataset::discover_artifacts(data_dir)
        .with_context(|| format!("failed to scan {}", data_dir.display()))?;
    artifacts
        .into_iter()
        .map(|artifact| -> Result<ArtifactSummary> {
            let samples = artifact.load()?;
            Ok(ArtifactSummary {
                shape: samples.shape().to_vec(),
                label: artifact.label,
                path: artifact.path,
            })
        })
        .collect()
}

/// Classify every row of a raw sample file with an exported k-NN model.
pub fn predict_knn(model: &Path, samples: &Path, normalize_rows: bool) -> Result<Vec<String>> {
    let classifier = KnnExport::load_json(model)
        .and_then(KnnExport::into_classifier)
        .with_context(|| format!("failed to load k-NN model {}", model.display()))?;
    let raw = dataset::load_samples(samples)?;
    let rows: Array2<f32> = if normalize_rows {
        normalize::normalize(&raw)
    } else {
        normalize::flatten(&raw)
    }
    .with_context(|| format!("bad sample shape in {}", samples.display()))?;

    Ok(rows
        .axis_iter(Axis(0))
        .map(|row| {
            let label = classifier.predict(row);
            classifier
                .label_name(label)
                .unwrap_or("<unknown>")
                .to_string()
        })
        .collect())
}
