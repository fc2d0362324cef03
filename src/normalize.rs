//! Wrist-centred, scale-invariant landmark normalization.
//!
//! Every sample is translated so the wrist (landmark 0) sits at the origin
//! and then divided by the length of the wrist -> middle-MCP bone
//! (landmark 9). The bone length is floored at [`SPAN_EPSILON`] so a
//! collapsed hand never blows up the division.

use ndarray::{Array2, ArrayBase, ArrayViewMut1, Data, Dimension};

use crate::types::{FEATURE_LEN, MIDDLE_MCP, NUM_LANDMARKS, WRIST};

pub const SPAN_EPSILON: f64 = 1e-5;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unexpected landmark array shape {shape:?}, expected (N, 63) or (N, 21, 3)")]
pub struct ShapeError {
    pub shape: Vec<usize>,
}

/// Number of samples in a `(N, 63)` or `(N, 21, 3)` array.
pub fn sample_count(shape: &[usize]) -> Result<usize, ShapeError> {
    match shape {
        [rows, FEATURE_LEN] => Ok(*rows),
        [rows, NUM_LANDMARKS, 3] => Ok(*rows),
        _ => Err(ShapeError {
            shape: shape.to_vec(),
        }),
    }
}

/// Normalize a batch of landmark samples.
///
/// Accepts flattened `(N, 63)` or structured `(N, 21, 3)` input of any
/// element type that widens to `f64`, and always returns `(N, 63)` `f32`.
pub fn normalize<S, D>(samples: &ArrayBase<S, D>) -> Result<Array2<f32>, ShapeError>
where
    S: Data,
    S::Elem: Copy + Into<f64>,
    D: Dimension,
{
    let rows = sample_count(samples.shape())?;
    let flat: Vec<f64> = samples.iter().map(|&v| v.into()).collect();
    let mut out = Array2::<f32>::zeros((rows, FEATURE_LEN));
    for (src, dst) in flat.chunks_exact(FEATURE_LEN).zip(out.outer_iter_mut()) {
        normalize_row(src, dst);
    }
    Ok(out)
}

/// Validate the shape and flatten to `(N, 63)` `f32` without transforming
/// the values.
pub fn flatten<S, D>(samples: &ArrayBase<S, D>) -> Result<Array2<f32>, ShapeError>
where
    S: Data,
    S::Elem: Copy + Into<f64>,
    D: Dimension,
{
    let rows = sample_count(samples.shape())?;
    let flat: Vec<f32> = samples.iter().map(|&v| v.into() as f32).collect();
    Array2::from_shape_vec((rows, FEATURE_LEN), flat).map_err(|_| ShapeError {
        shape: samples.shape().to_vec(),
    })
}

/// Normalize a single raw feature vector.
pub fn normalize_vector(raw: &[f32; FEATURE_LEN]) -> [f32; FEATURE_LEN] {
    let src: Vec<f64> = raw.iter().map(|&v| v as f64).collect();
    let mut out = [0.0f32; FEATURE_LEN];
    normalize_row(&src, ArrayViewMut1::from(&mut out[..]));
    out
}

fn normalize_row(src: &[f64], mut dst: ArrayViewMut1<'_, f32>) {
    let origin = [src[WRIST * 3], src[WRIST * 3 + 1], src[WRIST * 3 + 2]];
    let mcp = &src[MIDDLE_MCP * 3..MIDDLE_MCP * 3 + 3];
    let span = mcp
        .iter()
        .zip(origin.iter())
        .map(|(p, o)| (p - o) * (p - o))
        .sum::<f64>()
        .sqrt();
    let divisor = span.max(SPAN_EPSILON);

    for (i, (d, s)) in dst.iter_mut().zip(src.iter()).enumerate() {
        *d = ((s - origin[i % 3]) / divisor) as f32;
    }
}
