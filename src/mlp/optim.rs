use ndarray::{ArrayD, Zip};

use super::layers::ParamGrad;

/// Adam with bias-corrected step size.
#[derive(Clone, Debug)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    step: i32,
    moments: Vec<(ArrayD<f32>, ArrayD<f32>)>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            step: 0,
            moments: Vec::new(),
        }
    }

    pub fn steps(&self) -> i32 {
        self.step
    }

    /// Apply one update. `params` must list the same tensors in the same
    /// order on every call.
    pub fn step(&mut self, params: Vec<ParamGrad<'_>>) {
        if self.moments.len() != params.len() {
            self.moments = params
                .iter()
                .map(|p| {
                    (
                        ArrayD::zeros(p.value.raw_dim()),
                        ArrayD::zeros(p.value.raw_dim()),
                    )
                })
                .collect();
        }

        self.step += 1;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        let lr_t = self.learning_rate * (1.0 - b2.powi(self.step)).sqrt()
            / (1.0 - b1.powi(self.step));

        for (param, (m, v)) in params.into_iter().zip(self.moments.iter_mut()) {
            Zip::from(param.value)
                .and(param.grad)
                .and(m)
                .and(v)
                .for_each(|w, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *w -= lr_t * *m / (v.sqrt() + eps);
                });
        }
    }
}
