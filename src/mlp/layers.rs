use ndarray::{Array1, Array2, ArrayView2, ArrayViewD, ArrayViewMutD, Axis, Zip};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    Softmax,
}

impl Activation {
    fn apply(self, z: &mut Array2<f32>) {
        match self {
            Activation::Linear => {}
            Activation::Relu => z.mapv_inplace(|v| v.max(0.0)),
            Activation::Softmax => {
                for mut row in z.outer_iter_mut() {
                    let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                    row.mapv_inplace(|v| (v - max).exp());
                    let sum = row.sum();
                    row.mapv_inplace(|v| v / sum);
                }
            }
        }
    }
}

/// A trainable tensor together with its most recent gradient.
pub struct ParamGrad<'a> {
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: ArrayViewD<'a, f32>,
}

/// Fully connected layer, `y = act(x . kernel + bias)`.
#[derive(Clone, Debug)]
pub struct Dense {
    pub(crate) kernel: Array2<f32>,
    pub(crate) bias: Array1<f32>,
    pub(crate) activation: Activation,
    grad_kernel: Array2<f32>,
    grad_bias: Array1<f32>,
    input: Array2<f32>,
    output: Array2<f32>,
}

impl Dense {
    /// Glorot-uniform kernel, zero bias.
    pub fn glorot(
        inputs: usize,
        units: usize,
        activation: Activation,
        rng: &mut fastrand::Rng,
    ) -> Self {
        let limit = (6.0 / (inputs + units) as f32).sqrt();
        let kernel = Array2::from_shape_fn((inputs, units), |_| (rng.f32() * 2.0 - 1.0) * limit);
        Self::from_parts(kernel, Array1::zeros(units), activation)
    }

    pub fn from_parts(kernel: Array2<f32>, bias: Array1<f32>, activation: Activation) -> Self {
        let (inputs, units) = kernel.dim();
        Self {
            grad_kernel: Array2::zeros((inputs, units)),
            grad_bias: Array1::zeros(units),
            input: Array2::zeros((0, inputs)),
            output: Array2::zeros((0, units)),
            kernel,
            bias,
            activation,
        }
    }

    pub fn inputs(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn units(&self) -> usize {
        self.kernel.ncols()
    }

    pub fn infer(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut z = x.dot(&self.kernel) + &self.bias;
        self.activation.apply(&mut z);
        z
    }

    pub fn forward(&mut self, x: Array2<f32>) -> Array2<f32> {
        let out = self.infer(x.view());
        self.input = x;
        self.output = out.clone();
        out
    }

    /// Back-propagate `grad`. For a softmax layer `grad` is taken to be
    /// the gradient with respect to the logits.
    pub fn backward(&mut self, mut grad: Array2<f32>) -> Array2<f32> {
        if self.activation == Activation::Relu {
            Zip::from(&mut grad).and(&self.output).for_each(|g, &o| {
                if o <= 0.0 {
                    *g = 0.0;
                }
            });
        }
        self.grad_kernel = self.input.t().dot(&grad);
        self.grad_bias = grad.sum_axis(Axis(0));
        grad.dot(&self.kernel.t())
    }

    fn params(&mut self) -> Vec<ParamGrad<'_>> {
        vec![
            ParamGrad {
                value: self.kernel.view_mut().into_dyn(),
                grad: self.grad_kernel.view().into_dyn(),
            },
            ParamGrad {
                value: self.bias.view_mut().into_dyn(),
                grad: self.grad_bias.view().into_dyn(),
            },
        ]
    }
}

/// Per-feature batch normalization with moving statistics for inference.
#[derive(Clone, Debug)]
pub struct BatchNorm {
    pub(crate) gamma: Array1<f32>,
    pub(crate) beta: Array1<f32>,
    pub(crate) moving_mean: Array1<f32>,
    pub(crate) moving_variance: Array1<f32>,
    pub(crate) momentum: f32,
    pub(crate) epsilon: f32,
    grad_gamma: Array1<f32>,
    grad_beta: Array1<f32>,
    normalized: Array2<f32>,
    inv_std: Array1<f32>,
}

impl BatchNorm {
    pub const DEFAULT_MOMENTUM: f32 = 0.99;
    pub const DEFAULT_EPSILON: f32 = 1e-3;

    pub fn new(features: usize) -> Self {
        Self::from_parts(
            Array1::ones(features),
            Array1::zeros(features),
            Array1::zeros(features),
            Array1::ones(features),
            Self::DEFAULT_MOMENTUM,
            Self::DEFAULT_EPSILON,
        )
    }

    pub fn from_parts(
        gamma: Array1<f32>,
        beta: Array1<f32>,
        moving_mean: Array1<f32>,
        moving_variance: Array1<f32>,
        momentum: f32,
        epsilon: f32,
    ) -> Self {
        let features = gamma.len();
        Self {
            gamma,
            beta,
            moving_mean,
            moving_variance,
            momentum,
            epsilon,
            grad_gamma: Array1::zeros(features),
            grad_beta: Array1::zeros(features),
            normalized: Array2::zeros((0, features)),
            inv_std: Array1::ones(features),
        }
    }

    pub fn features(&self) -> usize {
        self.gamma.len()
    }

    pub fn infer(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let inv_std = self.moving_variance.mapv(|v| 1.0 / (v + self.epsilon).sqrt());
        (&x - &self.moving_mean) * &inv_std * &self.gamma + &self.beta
    }

    pub fn forward(&mut self, x: Array2<f32>) -> Array2<f32> {
        let features = x.ncols();
        let mean = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(features));
        let centered = &x - &mean;
        let variance = centered
            .mapv(|v| v * v)
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(features));

        let m = self.momentum;
        Zip::from(&mut self.moving_mean)
            .and(&mean)
            .for_each(|mv, &b| *mv = *mv * m + b * (1.0 - m));
        Zip::from(&mut self.moving_variance)
            .and(&variance)
            .for_each(|mv, &b| *mv = *mv * m + b * (1.0 - m));

        self.inv_std = variance.mapv(|v| 1.0 / (v + self.epsilon).sqrt());
        self.normalized = centered * &self.inv_std;
        &self.normalized * &self.gamma + &self.beta
    }

    pub fn backward(&mut self, grad: Array2<f32>) -> Array2<f32> {
        let n = grad.nrows() as f32;
        self.grad_beta = grad.sum_axis(Axis(0));
        self.grad_gamma = (&grad * &self.normalized).sum_axis(Axis(0));

        let dxhat = grad * &self.gamma;
        let sum_dxhat = dxhat.sum_axis(Axis(0));
        let sum_dxhat_xhat = (&dxhat * &self.normalized).sum_axis(Axis(0));
        (dxhat * n - &sum_dxhat - &self.normalized * &sum_dxhat_xhat) * &self.inv_std / n
    }

    fn params(&mut self) -> Vec<ParamGrad<'_>> {
        vec![
            ParamGrad {
                value: self.gamma.view_mut().into_dyn(),
                grad: self.grad_gamma.view().into_dyn(),
            },
            ParamGrad {
                value: self.beta.view_mut().into_dyn(),
                grad: self.grad_beta.view().into_dyn(),
            },
        ]
    }
}

/// Inverted dropout: active only while training.
#[derive(Clone, Debug)]
pub struct Dropout {
    pub(crate) rate: f32,
    mask: Array2<f32>,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self {
            rate: rate.clamp(0.0, 0.99),
            mask: Array2::zeros((0, 0)),
        }
    }

    pub fn forward(&mut self, x: Array2<f32>, rng: &mut fastrand::Rng) -> Array2<f32> {
        let keep = 1.0 - self.rate;
        self.mask = Array2::from_shape_fn(x.dim(), |_| {
            if rng.f32() < keep { 1.0 / keep } else { 0.0 }
        });
        x * &self.mask
    }

    pub fn backward(&mut self, grad: Array2<f32>) -> Array2<f32> {
        grad * &self.mask
    }
}

#[derive(Clone, Debug)]
pub enum Layer {
    Dense(Dense),
    BatchNorm(BatchNorm),
    Dropout(Dropout),
}

impl Layer {
    pub fn infer(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        match self {
            Layer::Dense(l) => l.infer(x),
            Layer::BatchNorm(l) => l.infer(x),
            Layer::Dropout(_) => x.to_owned(),
        }
    }

    pub fn forward(&mut self, x: Array2<f32>, rng: &mut fastrand::Rng) -> Array2<f32> {
        match self {
            Layer::Dense(l) => l.forward(x),
            Layer::BatchNorm(l) => l.forward(x),
            Layer::Dropout(l) => l.forward(x, rng),
        }
    }

    pub fn backward(&mut self, grad: Array2<f32>) -> Array2<f32> {
        match self {
            Layer::Dense(l) => l.backward(grad),
            Layer::BatchNorm(l) => l.backward(grad),
            Layer::Dropout(l) => l.backward(grad),
        }
    }

    pub fn params(&mut self) -> Vec<ParamGrad<'_>> {
        match self {
            Layer::Dense(l) => l.params(),
            Layer::BatchNorm(l) => l.params(),
            Layer::Dropout(_) => Vec::new(),
        }
    }

    /// Output width given an input width.
    pub fn output_dim(&self, input: usize) -> usize {
        match self {
            Layer::Dense(l) => l.units(),
            Layer::BatchNorm(_) | Layer::Dropout(_) => input,
        }
    }

    pub fn parameter_count(&self) -> usize {
        match self {
            Layer::Dense(l) => l.kernel.len() + l.bias.len(),
            Layer::BatchNorm(l) => l.features() * 4,
            Layer::Dropout(_) => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Dense(_) => "dense",
            Layer::BatchNorm(_) => "batch_normalization",
            Layer::Dropout(_) => "dropout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn softmax_rows_sum_to_one() {
        let dense = Dense::from_parts(
            array![[1.0, -1.0, 0.5], [2.0, 0.0, -3.0]],
            array![0.1, 0.2, 0.3],
            Activation::Softmax,
        );
        let out = dense.infer(array![[1.0, 2.0], [-4.0, 0.5]].view());
        for row in out.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
            assert!(row.iter().all(|&p| p > 0.0));
        }
    }

    #[test]
    fn dense_gradients_match_finite_differences() {
        let mut dense = Dense::from_parts(
            array![[0.3, -0.2], [0.1, 0.4], [-0.5, 0.2]],
            array![0.05, -0.1],
            Activation::Linear,
        );
        let x = array![[1.0, 2.0, -1.0], [0.5, -0.5, 0.25]];
        // loss = sum(output), so dL/dout is all ones.
        dense.forward(x.clone());
        let dx = dense.backward(Array2::ones((2, 2)));

        let loss = |d: &Dense, x: &Array2<f32>| d.infer(x.view()).sum();
        let h = 1e-2;
        let mut bumped = dense.clone();
        bumped.kernel[[1, 0]] += h;
        let numeric = (loss(&bumped, &x) - loss(&dense, &x)) / h;
        assert_abs_diff_eq!(dense.grad_kernel[[1, 0]], numeric, epsilon = 1e-3);

        let mut x_bumped = x.clone();
        x_bumped[[0, 2]] += h;
        let numeric = (loss(&dense, &x_bumped) - loss(&dense, &x)) / h;
        assert_abs_diff_eq!(dx[[0, 2]], numeric, epsilon = 1e-3);
        assert_abs_diff_eq!(dense.grad_bias[0], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn relu_blocks_gradient_of_inactive_units() {
        let mut dense = Dense::from_parts(array![[1.0, -1.0]], array![0.0, 0.0], Activation::Relu);
        let out = dense.forward(array![[2.0]]);
        assert_eq!(out, array![[2.0, 0.0]]);
        dense.backward(array![[1.0, 1.0]]);
        assert_eq!(dense.grad_kernel, array![[2.0, 0.0]]);
    }

    #[test]
    fn batch_norm_whitens_training_batches() {
        let mut bn = BatchNorm::new(2);
        let out = bn.forward(array![[1.0, 10.0], [3.0, 20.0], [5.0, 30.0]]);
        let mean = out.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(mean[0], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(mean[1], 0.0, epsilon = 1e-5);
        assert!(bn.moving_mean[1] > 0.0);

        // Gradients of sum(output) vanish because the output is centred.
        let dx = bn.backward(Array2::ones((3, 2)));
        assert!(dx.iter().all(|v| v.abs() < 1e-4));
    }

    #[test]
    fn dropout_is_identity_at_inference() {
        let layer = Layer::Dropout(Dropout::new(0.5));
        let x = array![[1.0, 2.0, 3.0]];
        assert_eq!(layer.infer(x.view()), x);
    }

    #[test]
    fn dropout_scales_kept_units() {
        let mut dropout = Dropout::new(0.5);
        let mut rng = fastrand::Rng::with_seed(7);
        let out = dropout.forward(Array2::ones((4, 50)), &mut rng);
        assert!(out.iter().all(|&v| v == 0.0 || v == 2.0));
        assert!(out.iter().any(|&v| v == 0.0));
        assert!(out.iter().any(|&v| v == 2.0));
    }
}
