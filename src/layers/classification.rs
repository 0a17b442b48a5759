//! Classification layer: logits, cross-entropy loss and prediction.

use ndarray::ArrayView2;

use super::{BarsMut, Layer, Params};
use crate::linalg::{argvecmax, vecmax};

impl Layer {
    fn logits(&self, p: Params<'_>, state: &[f64]) -> Vec<f64> {
        let dim_in = self.dim_in();
        let mut update = vec![0.0; self.dim_out()];
        for io in 0..self.dim_out() {
            let mut sum = p.bias[io];
            for ii in 0..dim_in {
                sum += p.weights[io * dim_in + ii] * state[ii];
            }
            update[io] = sum;
        }
        update
    }

    /// `u = W state + b`, shifted by `max(u)` for a stable softmax, written
    /// into the first `dim_out` channels; remaining channels are zeroed.
    pub(super) fn class_forward(&self, p: Params<'_>, state: &mut [f64]) {
        debug_assert!(self.dim_in() >= self.dim_out());
        let mut update = self.logits(p, state);
        normalize(&mut update);
        state[..self.dim_out()].copy_from_slice(&update);
        for s in state[self.dim_out()..self.dim_in()].iter_mut() {
            *s = 0.0;
        }
    }

    pub(super) fn class_backward(
        &self,
        p: Params<'_>,
        bars: Option<BarsMut<'_>>,
        state: &[f64],
        state_bar: &mut [f64],
    ) {
        let dim_in = self.dim_in();
        let dim_out = self.dim_out();

        // The unnormalised logits are enough here: the shift does not change
        // the argmax that normalize_diff needs.
        let update = self.logits(p, state);

        for sb in state_bar[dim_out..dim_in].iter_mut() {
            *sb = 0.0;
        }
        let mut update_bar = vec![0.0; dim_out];
        for io in 0..dim_out {
            update_bar[io] = state_bar[io];
            state_bar[io] = 0.0;
        }

        normalize_diff(&update, &mut update_bar);

        match bars {
            Some(bars) => {
                for io in 0..dim_out {
                    bars.bias[io] += update_bar[io];
                    for ii in 0..dim_in {
                        bars.weights[io * dim_in + ii] += state[ii] * update_bar[io];
                        state_bar[ii] += p.weights[io * dim_in + ii] * update_bar[io];
                    }
                }
            }
            None => {
                for io in 0..dim_out {
                    for ii in 0..dim_in {
                        state_bar[ii] += p.weights[io * dim_in + ii] * update_bar[io];
                    }
                }
            }
        }
    }

    /// Cross-entropy loss of one example's (already shifted) logits.
    pub fn eval_loss(&self, logits: &[f64], label: &[f64]) -> f64 {
        let dim_out = self.dim_out();
        let mut label_pr = 0.0;
        let mut exp_sum = 0.0;
        for io in 0..dim_out {
            label_pr += label[io] * logits[io];
            exp_sum += logits[io].exp();
        }
        -label_pr + exp_sum.ln()
    }

    /// Derivative of [`Layer::eval_loss`] with respect to the logits,
    /// written (not accumulated) into the first `dim_out` slots of
    /// `logits_bar`.
    pub fn eval_loss_diff(&self, logits: &[f64], logits_bar: &mut [f64], label: &[f64], loss_bar: f64) {
        let dim_out = self.dim_out();
        let mut exp_sum = 0.0;
        for io in 0..dim_out {
            exp_sum += logits[io].exp();
        }
        let exp_sum_bar = loss_bar / exp_sum;
        for io in 0..dim_out {
            logits_bar[io] = logits[io].exp() * exp_sum_bar - label[io] * loss_bar;
        }
    }

    /// Softmax prediction; true when the argmax class carries the label.
    pub fn prediction(&self, logits: &[f64], label: &[f64]) -> bool {
        let dim_out = self.dim_out();
        let mut exp_sum = 0.0;
        for io in 0..dim_out {
            exp_sum += logits[io].exp();
        }
        let mut class_id = 0;
        let mut max = -1.0;
        for io in 0..dim_out {
            let probability = logits[io].exp() / exp_sum;
            if probability > max {
                max = probability;
                class_id = io;
            }
        }
        label[class_id] > 0.99
    }

    /// Forward the final states through the classification step and return
    /// `(mean loss, accuracy in percent)`.
    pub fn eval_classification(
        &self,
        p: Params<'_>,
        states: ArrayView2<'_, f64>,
        labels: ArrayView2<'_, f64>,
    ) -> (f64, f64) {
        let nexamples = states.nrows();
        let mut loss = 0.0;
        let mut success = 0usize;
        let mut aux = vec![0.0; states.ncols()];
        for (row, label) in states.rows().into_iter().zip(labels.rows()) {
            for (a, s) in aux.iter_mut().zip(row.iter()) {
                *a = *s;
            }
            self.class_forward(p, &mut aux);
            let label = label.as_slice().expect("contiguous label row");
            loss += self.eval_loss(&aux, label);
            if self.prediction(&aux, label) {
                success += 1;
            }
        }
        (loss / nexamples as f64, 100.0 * success as f64 / nexamples as f64)
    }
}

/// Shift the data by its maximum.
fn normalize(data: &mut [f64]) {
    let max = vecmax(data);
    for d in data.iter_mut() {
        *d -= max;
    }
}

fn normalize_diff(data: &[f64], data_bar: &mut [f64]) {
    let mut max_b = 0.0;
    for db in data_bar.iter() {
        max_b -= db;
    }
    data_bar[argvecmax(data)] += max_b;
}

#[cfg(test)]
mod tests {
    use super::super::{Layer, Params};
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn forward_shifts_by_maximum_then_zero_pads() {
        let layer = Layer::classification(3, 3, 2, 0.0);
        let w = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let b = [0.0, 0.0];
        let mut state = [2.0, 5.0, 7.0];
        layer.apply_forward(Params { weights: &w, bias: &b }, None, &mut state).unwrap();
        // logits (2, 5) shifted by 5, remaining channel zeroed
        assert_eq!(state, [-3.0, 0.0, 0.0]);
    }

    #[test]
    fn loss_matches_cross_entropy_formula() {
        let layer = Layer::classification(3, 2, 2, 0.0);
        let logits = [0.3, -0.7];
        let label = [1.0, 0.0];
        let expected = -0.3 + (0.3f64.exp() + (-0.7f64).exp()).ln();
        assert_relative_eq!(layer.eval_loss(&logits, &label), expected, epsilon = 1e-14);
    }

    #[test]
    fn loss_diff_matches_finite_difference() {
        let layer = Layer::classification(3, 2, 2, 0.0);
        let logits = [0.3, -0.7];
        let label = [0.0, 1.0];
        let mut bar = [0.0, 0.0];
        layer.eval_loss_diff(&logits, &mut bar, &label, 1.0);
        let eps = 1e-7;
        for io in 0..2 {
            let mut lp = logits;
            lp[io] += eps;
            let fd = (layer.eval_loss(&lp, &label) - layer.eval_loss(&logits, &label)) / eps;
            assert_relative_eq!(bar[io], fd, max_relative = 1e-5);
        }
    }

    #[test]
    fn prediction_counts_argmax_hits() {
        let layer = Layer::classification(3, 2, 2, 0.0);
        assert!(layer.prediction(&[2.0, -1.0], &[1.0, 0.0]));
        assert!(!layer.prediction(&[2.0, -1.0], &[0.0, 1.0]));
    }

    #[test]
    fn eval_classification_reduces_over_examples() {
        let layer = Layer::classification(3, 2, 2, 0.0);
        let w = [1.0, 0.0, 0.0, 1.0];
        let b = [0.0, 0.0];
        let states = array![[3.0, 0.0], [0.0, 3.0]];
        let labels = array![[1.0, 0.0], [1.0, 0.0]];
        let (loss, acc) = layer.eval_classification(
            Params { weights: &w, bias: &b },
            states.view(),
            labels.view(),
        );
        assert_relative_eq!(acc, 50.0, epsilon = 1e-12);
        assert!(loss > 0.0);
    }
}
