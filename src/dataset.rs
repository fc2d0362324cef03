//! Training-matrix assembly from per-label sample artifacts.

use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
};

use ndarray::{Array2, ArrayD, Axis, concatenate};
use ndarray_npy::{ReadNpyError, ReadNpyExt};

use crate::{
    normalize::{self, ShapeError},
    types::FEATURE_LEN,
};

pub const SAMPLE_EXTENSION: &str = "npy";

#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode sample array {}", .path.display())]
    Npy {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },
    #[error("sample set '{label}' has a bad shape")]
    Shape {
        label: String,
        #[source]
        source: ShapeError,
    },
    #[error("no sample artifacts to assemble")]
    NoArtifacts,
}

/// One `<label>.npy` file on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleArtifact {
    pub label: String,
    pub path: PathBuf,
}

impl SampleArtifact {
    pub fn new(label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
        }
    }

    pub fn load(&self) -> Result<ArrayD<f32>, DatasetError> {
        load_samples(&self.path)
    }
}

#[derive(Clone, Debug)]
pub struct AssembleOptions {
    pub normalize: bool,
    /// Cap on samples kept per label; larger sets are subsampled.
    pub max_per_label: Option<usize>,
    pub seed: u64,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            normalize: true,
            max_per_label: None,
            seed: 42,
        }
    }
}

/// Concatenated features `x`, integer labels `y` and the label-name table.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingMatrix {
    pub x: Array2<f32>,
    pub y: Vec<usize>,
    pub labels: Vec<String>,
}

impl TrainingMatrix {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    /// Rows selected by `indices`, in the given order.
    pub fn subset(&self, indices: &[usize]) -> (Array2<f32>, Vec<usize>) {
        let x = self.x.select(Axis(0), indices);
        let y = indices.iter().map(|&i| self.y[i]).collect();
        (x, y)
    }

    /// Number of rows per label index.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.labels.len()];
        for &label in &self.y {
            counts[label] += 1;
        }
        counts
    }
}

/// List the `.npy` artifacts in `dir`, sorted by file name.
pub fn discover_artifacts(dir: &Path) -> Result<Vec<SampleArtifact>, DatasetError> {
    let entries = fs::read_dir(dir).map_err(|source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DatasetError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(SAMPLE_EXTENSION) {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            log::warn!("skipping non UTF-8 artifact name {}", path.display());
            continue;
        };
        let label = file_name.split('.').next().unwrap_or(file_name).to_string();
        artifacts.push((file_name.to_string(), SampleArtifact { label, path }));
    }

    artifacts.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(artifacts.into_iter().map(|(_, artifact)| artifact).collect())
}

/// Read a sample array stored as `f32` or `f64`.
pub fn load_samples(path: &Path) -> Result<ArrayD<f32>, DatasetError> {
    let bytes = fs::read(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match ArrayD::<f32>::read_npy(Cursor::new(&bytes)) {
        Ok(array) => Ok(array),
        Err(ReadNpyError::WrongDescriptor(_)) => ArrayD::<f64>::read_npy(Cursor::new(&bytes))
            .map(|array| array.mapv(|v| v as f32))
            .map_err(|source| DatasetError::Npy {
                path: path.to_path_buf(),
                source,
            }),
        Err(source) => Err(DatasetError::Npy {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Load, normalize and concatenate the given artifacts.
///
/// Label integers follow the order of `artifacts`; pass the output of
/// [`discover_artifacts`] for the canonical lexicographic mapping.
pub fn assemble(
    artifacts: &[SampleArtifact],
    options: &AssembleOptions,
) -> Result<TrainingMatrix, DatasetError> {
    let mut sets = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let samples = artifact.load()?;
        log::debug!(
            "loaded {} {:?} from {}",
            artifact.label,
            samples.shape(),
            artifact.path.display()
        );
        sets.push((artifact.label.clone(), samples));
    }
    assemble_sets(sets, options)
}

/// Assemble already-loaded sample sets.
pub fn assemble_sets(
    sets: Vec<(String, ArrayD<f32>)>,
    options: &AssembleOptions,
) -> Result<TrainingMatrix, DatasetError> {
    if sets.is_empty() {
        return Err(DatasetError::NoArtifacts);
    }

    let mut rng = fastrand::Rng::with_seed(options.seed);
    let mut blocks = Vec::with_capacity(sets.len());
    let mut y = Vec::new();
    let mut labels = Vec::with_capacity(sets.len());

    for (idx, (label, samples)) in sets.into_iter().enumerate() {
        let prepared = if options.normalize {
            normalize::normalize(&samples)
        } else {
            normalize::flatten(&samples)
        }
        .map_err(|source| DatasetError::Shape {
            label: label.clone(),
            source,
        })?;

        let prepared = match options.max_per_label {
            Some(cap) if prepared.nrows() > cap => {
                log::info!(
                    "subsampling {label} from {} to {cap} samples",
                    prepared.nrows()
                );
                let keep = sample_without_replacement(&mut rng, prepared.nrows(), cap);
                prepared.select(Axis(0), &keep)
            }
            _ => prepared,
        };

        y.extend(std::iter::repeat_n(idx, prepared.nrows()));
        blocks.push(prepared);
        labels.push(label);
    }

    let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
    let x = concatenate(Axis(0), &views).unwrap_or_else(|_| Array2::zeros((0, FEATURE_LEN)));
    debug_assert_eq!(x.nrows(), y.len());

    Ok(TrainingMatrix { x, y, labels })
}

fn sample_without_replacement(rng: &mut fastrand::Rng, len: usize, count: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    rng.shuffle(&mut indices);
    indices.truncate(count);
    indices.sort_unstable();
    indices
}

/// Split row indices into train and test sets, class by class.
///
/// Each class holds out `round(n * test_fraction)` rows (never all of
/// them). Both returned lists are sorted.
pub fn stratified_split(y: &[usize], test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let classes = y.iter().copied().max().map_or(0, |m| m + 1);
    let mut per_class: Vec<Vec<usize>> = vec![Vec::new(); classes];
    for (row, &label) in y.iter().enumerate() {
        per_class[label].push(row);
    }

    let mut rng = fastrand::Rng::with_seed(seed);
    let mut train = Vec::with_capacity(y.len());
    let mut test = Vec::new();
    for mut rows in per_class {
        rng.shuffle(&mut rows);
        let n_test = ((rows.len() as f64 * test_fraction).round() as usize)
            .min(rows.len().saturating_sub(1));
        test.extend_from_slice(&rows[..n_test]);
        train.extend_from_slice(&rows[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, IxDyn};
    use ndarray_npy::write_npy;

    fn raw_set(rows: usize, seed: f32) -> ArrayD<f32> {
        Array2::from_shape_fn((rows, FEATURE_LEN), |(r, c)| {
            seed + r as f32 * 0.01 + c as f32 * 0.001 + ((r * c) as f32).cos() * 0.05
        })
        .into_dyn()
    }

    #[test]
    fn rows_and_labels_stay_aligned() {
        let sets = vec![
            ("a".to_string(), raw_set(3, 0.1)),
            ("b".to_string(), raw_set(7, 0.2)),
            ("c".to_string(), raw_set(0, 0.3)),
        ];
        let matrix = assemble_sets(sets, &AssembleOptions::default()).expect("assemble");
        assert_eq!(matrix.x.nrows(), matrix.y.len());
        assert_eq!(matrix.x.ncols(), FEATURE_LEN);
        assert!(matrix.y.iter().all(|&l| l < matrix.labels.len()));
        assert_eq!(matrix.class_counts(), vec![3, 7, 0]);
    }

    #[test]
    fn cap_subsamples_large_sets() {
        let sets = vec![
            ("big".to_string(), raw_set(50, 0.1)),
            ("small".to_string(), raw_set(4, 0.2)),
        ];
        let options = AssembleOptions {
            max_per_label: Some(10),
            ..AssembleOptions::default()
        };
        let matrix = assemble_sets(sets.clone(), &options).expect("assemble");
        assert_eq!(matrix.class_counts(), vec![10, 4]);

        // Sampled without replacement: no source row is kept twice.
        let mut kept: Vec<Vec<u32>> = matrix
            .x
            .outer_iter()
            .zip(matrix.y.iter())
            .filter(|(_, label)| **label == 0)
            .map(|(row, _)| row.iter().map(|v| v.to_bits()).collect())
            .collect();
        kept.sort();
        kept.dedup();
        assert_eq!(kept.len(), 10);

        let again = assemble_sets(sets, &options).expect("assemble");
        assert_eq!(matrix, again);
    }

    #[test]
    fn structured_sets_are_flattened() {
        let structured = Array3::<f32>::from_elem((2, 21, 3), 0.5).into_dyn();
        let matrix =
            assemble_sets(vec![("fist".to_string(), structured)], &AssembleOptions::default())
                .expect("assemble");
        assert_eq!(matrix.x.dim(), (2, FEATURE_LEN));
    }

    #[test]
    fn bad_shape_aborts_assembly() {
        let bad = ArrayD::<f32>::zeros(IxDyn(&[5, 64]));
        let err = assemble_sets(
            vec![("ok".to_string(), raw_set(2, 0.0)), ("bad".to_string(), bad)],
            &AssembleOptions::default(),
        )
        .unwrap_err();
        match err {
            DatasetError::Shape { label, source } => {
                assert_eq!(label, "bad");
                assert_eq!(source.shape, vec![5, 64]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(
            assemble_sets(Vec::new(), &AssembleOptions::default()),
            Err(DatasetError::NoArtifacts)
        ));
    }

    #[test]
    fn raw_mode_keeps_values() {
        let set = raw_set(2, 0.7);
        let options = AssembleOptions {
            normalize: false,
            ..AssembleOptions::default()
        };
        let matrix = assemble_sets(vec![("x".to_string(), set.clone())], &options).unwrap();
        assert_eq!(matrix.x.into_dyn(), set);
    }

    #[test]
    fn discovery_is_sorted_and_skips_other_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["volume_up", "mute", "grab"] {
            write_npy(dir.path().join(format!("{name}.npy")), &Array2::<f32>::zeros((1, 63)))
                .expect("write");
        }
        fs::write(dir.path().join("notes.txt"), "ignore me").expect("write");
        fs::create_dir(dir.path().join("nested.npy")).expect("mkdir");

        let labels: Vec<String> = discover_artifacts(dir.path())
            .expect("discover")
            .into_iter()
            .map(|a| a.label)
            .collect();
        assert_eq!(labels, vec!["grab", "mute", "volume_up"]);
    }

    #[test]
    fn double_precision_artifacts_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cursor.npy");
        write_npy(&path, &Array2::<f64>::from_elem((3, 63), 0.25)).expect("write");
        let loaded = load_samples(&path).expect("load");
        assert_eq!(loaded.shape(), &[3, 63]);
        assert_eq!(loaded[[2, 62]], 0.25f32);
    }

    #[test]
    fn split_is_stratified_and_deterministic() {
        let mut y = vec![0; 50];
        y.extend(vec![1; 20]);
        y.extend(vec![2; 1]);
        let (train, test) = stratified_split(&y, 0.2, 42);
        assert_eq!(train.len() + test.len(), y.len());
        assert!(train.iter().all(|i| !test.contains(i)));

        let count = |rows: &[usize], label: usize| rows.iter().filter(|&&r| y[r] == label).count();
        assert_eq!(count(&test, 0), 10);
        assert_eq!(count(&test, 1), 4);
        assert_eq!(count(&test, 2), 0);

        assert_eq!(stratified_split(&y, 0.2, 42), (train, test));
    }
}
