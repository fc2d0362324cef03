//! On-disk sample artifacts, one `<label>.npy` per gesture.

use std::{
    fs,
    path::{Path, PathBuf},
};

use ndarray::{Array2, Axis, concatenate};
use ndarray_npy::{WriteNpyError, write_npy};

use crate::{
    dataset::{self, DatasetError, SAMPLE_EXTENSION, SampleArtifact},
    normalize::{self, ShapeError},
    types::FEATURE_LEN,
};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("failed to prepare sample directory {}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Read(#[from] DatasetError),
    #[error("existing artifact {} has a bad shape", .path.display())]
    Shape {
        path: PathBuf,
        #[source]
        source: ShapeError,
    },
    #[error("label {0:?} cannot name an artifact file")]
    BadLabel(String),
    #[error("new samples for '{label}' have {cols} columns, expected {}", FEATURE_LEN)]
    Width { label: String, cols: usize },
    #[error("failed to write {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: WriteNpyError,
    },
    #[error("failed to move {} into place at {}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Labels become file stems and discovery cuts the name at the first dot,
/// so a label must be non-empty and free of dots and path separators.
pub fn is_valid_label(label: &str) -> bool {
    !label.trim().is_empty() && !label.contains(['.', '/', '\\'])
}

#[derive(Clone, Debug)]
pub struct SampleStore {
    dir: PathBuf,
}

impl SampleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.{SAMPLE_EXTENSION}"))
    }

    pub fn artifacts(&self) -> Result<Vec<SampleArtifact>, DatasetError> {
        dataset::discover_artifacts(&self.dir)
    }

    /// Append `samples` to the artifact for `label`, creating it if needed.
    ///
    /// Returns the number of rows stored after the merge.
    pub fn append(&self, label: &str, samples: &Array2<f32>) -> Result<usize, StoreError> {
        if !is_valid_label(label) {
            return Err(StoreError::BadLabel(label.to_string()));
        }
        if samples.ncols() != FEATURE_LEN {
            return Err(StoreError::Width {
                label: label.to_string(),
                cols: samples.ncols(),
            });
        }

        fs::create_dir_all(&self.dir).map_err(|source| StoreError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.path_for(label);
        let merged = if path.exists() {
            let existing = dataset::load_samples(&path)?;
            let existing = normalize::flatten(&existing).map_err(|source| StoreError::Shape {
                path: path.clone(),
                source,
            })?;
            concatenate(Axis(0), &[existing.view(), samples.view()]).map_err(|_| {
                StoreError::Width {
                    label: label.to_string(),
                    cols: samples.ncols(),
                }
            })?
        } else {
            samples.clone()
        };

        let tmp_path = path.with_extension("npy.partial");
        write_npy(&tmp_path, &merged).map_err(|source| StoreError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &path).map_err(|source| StoreError::Rename {
            from: tmp_path.clone(),
            to: path.clone(),
            source,
        })?;

        log::debug!("saved {label}: {:?} -> {}", merged.dim(), path.display());
        Ok(merged.nrows())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_creates_then_merges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SampleStore::new(dir.path().join("data"));

        let first = Array2::<f32>::from_elem((3, FEATURE_LEN), 1.0);
        assert_eq!(store.append("mute", &first).expect("append"), 3);

        let second = Array2::<f32>::from_elem((2, FEATURE_LEN), 2.0);
        assert_eq!(store.append("mute", &second).expect("append"), 5);

        let stored = dataset::load_samples(&store.path_for("mute")).expect("load");
        assert_eq!(stored.shape(), &[5, FEATURE_LEN]);
        assert_eq!(stored[[0, 0]], 1.0);
        assert_eq!(stored[[4, 0]], 2.0);

        let labels: Vec<_> = store.artifacts().unwrap().into_iter().map(|a| a.label).collect();
        assert_eq!(labels, vec!["mute"]);
    }

    #[test]
    fn append_rejects_wrong_width() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SampleStore::new(dir.path());
        let err = store
            .append("grab", &Array2::<f32>::zeros((1, 42)))
            .unwrap_err();
        assert!(matches!(err, StoreError::Width { cols: 42, .. }));
        assert!(!store.path_for("grab").exists());
    }

    #[test]
    fn labels_that_cannot_round_trip_are_refused() {
        assert!(is_valid_label("thumbs_up"));
        for bad in ["thumbs.up", "a/b", "a\\b", "", "  "] {
            assert!(!is_valid_label(bad), "{bad:?}");
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let store = SampleStore::new(dir.path());
        let rows = Array2::<f32>::zeros((1, FEATURE_LEN));
        let err = store.append("thumbs.up", &rows).unwrap_err();
        assert!(matches!(err, StoreError::BadLabel(ref l) if l == "thumbs.up"));
        assert!(store.artifacts().expect("scan").is_empty());
    }

    #[test]
    fn append_widens_existing_f64_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SampleStore::new(dir.path());
        let legacy = Array2::<f64>::from_elem((2, FEATURE_LEN), 0.25);
        write_npy(store.path_for("grab"), &legacy).expect("seed");

        let fresh = Array2::<f32>::from_elem((1, FEATURE_LEN), 0.5);
        assert_eq!(store.append("grab", &fresh).expect("append"), 3);

        let bytes = fs::read(store.path_for("grab")).expect("read");
        let stored = <Array2<f32> as ndarray_npy::ReadNpyExt>::read_npy(bytes.as_slice())
            .expect("stored as f32");
        assert_eq!(stored.dim(), (3, FEATURE_LEN));
        assert_eq!(stored[[1, 5]], 0.25);
        assert_eq!(stored[[2, 5]], 0.5);
    }
}
