//! k-nearest-neighbor classifier over a k-d tree, and its JSON export.
//!
//! The export carries the whole training matrix because inference needs
//! every sample, not fitted parameters.

use std::{
    cmp::Ordering,
    fmt, fs,
    path::{Path, PathBuf},
};

use kiddo::{KdTree, SquaredEuclidean};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::{dataset::TrainingMatrix, types::FEATURE_LEN};

pub const DEFAULT_K: usize = 5;

#[derive(thiserror::Error, Debug)]
pub enum KnnError {
    #[error("k must be at least 1")]
    ZeroK,
    #[error("training set is empty")]
    Empty,
    #[error("feature matrix has {rows} rows but {labels} labels")]
    Misaligned { rows: usize, labels: usize },
    #[error("label index {index} out of range for {count} label names")]
    UnknownLabel { index: usize, count: usize },
    #[error("sample {row} has {len} features, expected {expected}")]
    Width {
        row: usize,
        len: usize,
        expected: usize,
    },
    #[error("failed to access {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub struct KnnClassifier {
    k: usize,
    tree: KdTree<f32, FEATURE_LEN>,
    /// Column permutation applied to rows before they enter the tree.
    axes: [usize; FEATURE_LEN],
    y: Vec<usize>,
    labels: Vec<String>,
}

impl fmt::Debug for KnnClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnnClassifier")
            .field("k", &self.k)
            .field("rows", &self.y.len())
            .field("labels", &self.labels)
            .finish()
    }
}

/// Columns ordered by decreasing spread.
///
/// The tree splits on axis `depth % FEATURE_LEN`, so only the first few
/// axes are ever split on. Normalized rows have a constant wrist, and a
/// leaf full of equal values on its split axis cannot be divided. Squared
/// distances do not depend on column order.
fn axes_by_spread(x: &Array2<f32>) -> [usize; FEATURE_LEN] {
    let variance = x.var_axis(Axis(0), 0.0);
    let mut axes: [usize; FEATURE_LEN] = std::array::from_fn(|i| i);
    axes.sort_by(|&a, &b| {
        variance[b]
            .partial_cmp(&variance[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    axes
}

fn permute<'a>(
    row: impl IntoIterator<Item = &'a f32>,
    axes: &[usize; FEATURE_LEN],
) -> [f32; FEATURE_LEN] {
    let mut source = [0.0; FEATURE_LEN];
    for (slot, &v) in source.iter_mut().zip(row) {
        *slot = v;
    }
    axes.map(|axis| source[axis])
}

impl KnnClassifier {
    pub fn fit(
        k: usize,
        x: Array2<f32>,
        y: Vec<usize>,
        labels: Vec<String>,
    ) -> Result<Self, KnnError> {
        if k == 0 {
            return Err(KnnError::ZeroK);
        }
        if x.nrows() == 0 {
            return Err(KnnError::Empty);
        }
        if x.nrows() != y.len() {
            return Err(KnnError::Misaligned {
                rows: x.nrows(),
                labels: y.len(),
            });
        }
        if x.ncols() != FEATURE_LEN {
            return Err(KnnError::Width {
                row: 0,
                len: x.ncols(),
                expected: FEATURE_LEN,
            });
        }
        if let Some(&index) = y.iter().find(|&&l| l >= labels.len()) {
            return Err(KnnError::UnknownLabel {
                index,
                count: labels.len(),
            });
        }

        let axes = axes_by_spread(&x);
        let coords: Vec<[f32; FEATURE_LEN]> =
            x.outer_iter().map(|row| permute(row.iter(), &axes)).collect();
        let tree: KdTree<f32, FEATURE_LEN> = (&coords).into();
        log::debug!("k-NN tree built over {} rows", coords.len());

        Ok(Self {
            k,
            tree,
            axes,
            y,
            labels,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label_name(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// Majority vote among the `k` nearest rows by Euclidean distance.
    ///
    /// Ties between labels go to the smallest label index.
    pub fn predict(&self, query: ArrayView1<'_, f32>) -> usize {
        let query = permute(query.iter(), &self.axes);
        let neighbours = self
            .tree
            .nearest_n::<SquaredEuclidean>(&query, self.k.min(self.y.len()));

        let mut votes = vec![0usize; self.labels.len()];
        for nn in neighbours {
            votes[self.y[nn.item as usize]] += 1;
        }

        let mut best = 0;
        for (label, &count) in votes.iter().enumerate() {
            if count > votes[best] {
                best = label;
            }
        }
        best
    }

    pub fn predict_batch(&self, queries: ArrayView2<'_, f32>) -> Vec<usize> {
        queries.outer_iter().map(|q| self.predict(q)).collect()
    }

    /// Fraction of rows whose predicted label matches `y`.
    pub fn accuracy(&self, x: ArrayView2<'_, f32>, y: &[usize]) -> f64 {
        if y.is_empty() {
            return 0.0;
        }
        let hits = self
            .predict_batch(x)
            .iter()
            .zip(y.iter())
            .filter(|(p, t)| p == t)
            .count();
        hits as f64 / y.len() as f64
    }
}

/// Portable k-NN model: `{k, labels, X, y}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnnExport {
    pub k: usize,
    pub labels: Vec<String>,
    #[serde(rename = "X")]
    pub x: Vec<Vec<f32>>,
    pub y: Vec<usize>,
}

impl KnnExport {
    pub fn from_matrix(k: usize, matrix: &TrainingMatrix) -> Self {
        Self {
            k,
            labels: matrix.labels.clone(),
            x: matrix.x.outer_iter().map(|row| row.to_vec()).collect(),
            y: matrix.y.clone(),
        }
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, KnnError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| KnnError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), KnnError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| KnnError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string(self)?;
        fs::write(path, json).map_err(|source| KnnError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn into_classifier(self) -> Result<KnnClassifier, KnnError> {
        let rows = self.x.len();
        let mut flat = Vec::with_capacity(rows * FEATURE_LEN);
        for (row, values) in self.x.iter().enumerate() {
            if values.len() != FEATURE_LEN {
                return Err(KnnError::Width {
                    row,
                    len: values.len(),
                    expected: FEATURE_LEN,
                });
            }
            flat.extend_from_slice(values);
        }
        let x = Array2::from_shape_vec((rows, FEATURE_LEN), flat).map_err(|_| KnnError::Empty)?;
        KnnClassifier::fit(self.k, x, self.y, self.labels)
    }
}
