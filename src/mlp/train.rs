use ndarray::{Array2, ArrayView2, Axis};

use super::{Adam, MlpError, Network, argmax_rows};

const PROB_FLOOR: f32 = 1e-7;

#[derive(Clone, Debug)]
pub struct FitConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub seed: u64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            learning_rate: 0.001,
            seed: 42,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
}

/// Mean categorical cross-entropy of `probs` against integer labels.
pub fn cross_entropy(probs: &Array2<f32>, y: &[usize]) -> f32 {
    if y.is_empty() {
        return 0.0;
    }
    let total: f32 = probs
        .outer_iter()
        .zip(y.iter())
        .map(|(row, &label)| -row[label].clamp(PROB_FLOOR, 1.0).ln())
        .sum();
    total / y.len() as f32
}

fn accuracy(probs: &Array2<f32>, y: &[usize]) -> f32 {
    if y.is_empty() {
        return 0.0;
    }
    let hits = argmax_rows(probs)
        .iter()
        .zip(y.iter())
        .filter(|(p, t)| p == t)
        .count();
    hits as f32 / y.len() as f32
}

/// Loss and accuracy in inference mode.
pub fn evaluate(net: &Network, x: ArrayView2<'_, f32>, y: &[usize]) -> (f32, f32) {
    let probs = net.predict_proba(x);
    (cross_entropy(&probs, y), accuracy(&probs, y))
}

fn validate(net: &Network, x: ArrayView2<'_, f32>, y: &[usize]) -> Result<(), MlpError> {
    if x.ncols() != net.input_dim() {
        return Err(MlpError::InputWidth {
            expected: net.input_dim(),
            got: x.ncols(),
        });
    }
    if x.nrows() != y.len() {
        return Err(MlpError::Misaligned {
            rows: x.nrows(),
            labels: y.len(),
        });
    }
    let classes = net.output_dim();
    if let Some(&label) = y.iter().find(|&&l| l >= classes) {
        return Err(MlpError::LabelOutOfRange { label, classes });
    }
    Ok(())
}

/// Train `net` with Adam on categorical cross-entropy.
///
/// `on_epoch` is called after every epoch with the running metrics.
pub fn fit<F>(
    net: &mut Network,
    x: ArrayView2<'_, f32>,
    y: &[usize],
    validation: Option<(ArrayView2<'_, f32>, &[usize])>,
    config: &FitConfig,
    mut on_epoch: F,
) -> Result<Vec<EpochMetrics>, MlpError>
where
    F: FnMut(&EpochMetrics),
{
    if y.is_empty() {
        return Err(MlpError::Empty);
    }
    validate(net, x, y)?;
    if let Some((vx, vy)) = validation {
        validate(net, vx, vy)?;
    }

    let mut rng = fastrand::Rng::with_seed(config.seed);
    let mut optimizer = Adam::new(config.learning_rate);
    let mut order: Vec<usize> = (0..y.len()).collect();
    let batch_size = config.batch_size.max(1);
    let mut history = Vec::with_capacity(config.epochs);

    for epoch in 1..=config.epochs {
        rng.shuffle(&mut order);
        let mut loss_sum = 0.0f32;
        let mut hits = 0usize;

        for batch in order.chunks(batch_size) {
            let xb = x.select(Axis(0), batch);
            let yb: Vec<usize> = batch.iter().map(|&i| y[i]).collect();

            let probs = net.forward_train(xb, &mut rng);
            loss_sum += cross_entropy(&probs, &yb) * yb.len() as f32;
            hits += argmax_rows(&probs)
                .iter()
                .zip(yb.iter())
                .filter(|(p, t)| p == t)
                .count();

            // Softmax + cross-entropy: dL/dlogits = (p - onehot) / batch.
            let mut grad = probs;
            for (mut row, &label) in grad.outer_iter_mut().zip(yb.iter()) {
                row[label] -= 1.0;
            }
            grad /= yb.len() as f32;

            net.backward(grad);
            optimizer.step(net.parameters());
        }

        let (val_loss, val_accuracy) = match validation {
            Some((vx, vy)) if !vy.is_empty() => {
                let (l, a) = evaluate(net, vx, vy);
                (Some(l), Some(a))
            }
            _ => (None, None),
        };

        let metrics = EpochMetrics {
            epoch,
            loss: loss_sum / y.len() as f32,
            accuracy: hits as f32 / y.len() as f32,
            val_loss,
            val_accuracy,
        };
        log::debug!(
            "epoch {epoch}/{}: loss {:.4} acc {:.3} val_loss {:?} val_acc {:?}",
            config.epochs,
            metrics.loss,
            metrics.accuracy,
            metrics.val_loss,
            metrics.val_accuracy
        );
        on_epoch(&metrics);
        history.push(metrics);
    }

    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Three well separated clusters in 63 dimensions.
    fn clusters(per_class: usize, seed: u64) -> (Array2<f32>, Vec<usize>) {
        let mut rng = fastrand::Rng::with_seed(seed);
        let rows = per_class * 3;
        let mut y = Vec::with_capacity(rows);
        let x = Array2::from_shape_fn((rows, 63), |(r, c)| {
            let class = r % 3;
            let centre = if c % 3 == class { 2.0 } else { -1.0 };
            centre + (rng.f32() - 0.5) * 0.6
        });
        for r in 0..rows {
            y.push(r % 3);
        }
        (x, y)
    }

    #[test]
    fn cross_entropy_of_confident_prediction_is_small() {
        let probs = array![[0.98, 0.01, 0.01], [0.1, 0.8, 0.1]];
        let loss = cross_entropy(&probs, &[0, 1]);
        assert_abs_diff_eq!(loss, -(0.98f32.ln() + 0.8f32.ln()) / 2.0, epsilon = 1e-6);
        assert!(cross_entropy(&array![[0.0, 1.0]], &[0]).is_finite());
    }

    #[test]
    fn learns_separable_clusters() {
        let (x, y) = clusters(40, 3);
        let (vx, vy) = clusters(10, 4);
        let mut rng = fastrand::Rng::with_seed(5);
        let mut net = Network::gesture_classifier(63, 3, &mut rng);

        let config = FitConfig {
            epochs: 20,
            learning_rate: 0.01,
            ..FitConfig::default()
        };
        let mut seen = 0;
        let history = fit(
            &mut net,
            x.view(),
            &y,
            Some((vx.view(), &vy)),
            &config,
            |_| seen += 1,
        )
        .expect("fit");

        assert_eq!(seen, 20);
        assert_eq!(history.len(), 20);
        assert!(history[19].loss < history[0].loss);
        let (_, acc) = evaluate(&net, vx.view(), &vy);
        assert!(acc > 0.9, "validation accuracy {acc}");
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let mut rng = fastrand::Rng::with_seed(5);
        let mut net = Network::gesture_classifier(63, 2, &mut rng);
        let x = Array2::zeros((2, 63));
        let err = fit(&mut net, x.view(), &[0, 2], None, &FitConfig::default(), |_| {})
            .unwrap_err();
        assert!(matches!(err, MlpError::LabelOutOfRange { label: 2, classes: 2 }));

        let narrow = Array2::zeros((2, 10));
        let err = fit(&mut net, narrow.view(), &[0, 1], None, &FitConfig::default(), |_| {})
            .unwrap_err();
        assert!(matches!(err, MlpError::InputWidth { expected: 63, got: 10 }));
    }
}
