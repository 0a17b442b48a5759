//! Dense residual step and its reverse-mode update.

use ndarray::ArrayView2;

use super::{BarsMut, Layer, Params};

impl Layer {
    fn affine(&self, p: Params<'_>, input: &[f64]) -> Vec<f64> {
        let w = ArrayView2::from_shape((self.dim_out(), self.dim_in()), p.weights)
            .expect("weight slice matches layer dimensions");
        let mut update = vec![0.0; self.dim_out()];
        for (io, row) in w.rows().into_iter().enumerate() {
            let mut sum = 0.0;
            for (wi, xi) in row.iter().zip(input) {
                sum += wi * xi;
            }
            update[io] = sum + p.bias[0];
        }
        update
    }

    /// `state += dt * sigma(W state + b)`
    pub(super) fn dense_forward(&self, p: Params<'_>, state: &mut [f64]) {
        let update = self.affine(p, state);
        for io in 0..self.dim_out() {
            state[io] += self.dt() * self.activation().apply(update[io]);
        }
    }

    pub(super) fn dense_backward(
        &self,
        p: Params<'_>,
        bars: Option<BarsMut<'_>>,
        state: &[f64],
        state_bar: &mut [f64],
    ) {
        let dim_in = self.dim_in();

        // Recompute the affine transformation; the adjoint of the step needs
        // the pre-activation values.
        let update = self.affine(p, state);
        let mut update_bar = vec![0.0; self.dim_out()];
        for io in 0..self.dim_out() {
            update_bar[io] = self.dt() * self.activation().diff(update[io]) * state_bar[io];
        }

        match bars {
            Some(bars) => {
                for io in 0..self.dim_out() {
                    bars.bias[0] += update_bar[io];
                    for ii in 0..dim_in {
                        bars.weights[io * dim_in + ii] += state[ii] * update_bar[io];
                        state_bar[ii] += p.weights[io * dim_in + ii] * update_bar[io];
                    }
                }
            }
            None => {
                for io in 0..self.dim_out() {
                    for ii in 0..dim_in {
                        state_bar[ii] += p.weights[io * dim_in + ii] * update_bar[io];
                    }
                }
            }
        }
    }

    /// `state = sigma(W example + b)`; the opening step replaces the state.
    pub(super) fn open_dense_forward(&self, p: Params<'_>, example: &[f64], state: &mut [f64]) {
        let update = self.affine(p, example);
        for io in 0..self.dim_out() {
            state[io] = self.activation().apply(update[io]);
        }
    }

    pub(super) fn open_dense_backward(
        &self,
        p: Params<'_>,
        bars: Option<BarsMut<'_>>,
        example: &[f64],
        state_bar: &mut [f64],
    ) {
        let dim_in = self.dim_in();

        let update = self.affine(p, example);
        let mut update_bar = vec![0.0; self.dim_out()];
        for io in 0..self.dim_out() {
            update_bar[io] = self.activation().diff(update[io]) * state_bar[io];
            state_bar[io] = 0.0;
        }

        if let Some(bars) = bars {
            for io in 0..self.dim_out() {
                bars.bias[0] += update_bar[io];
                for ii in 0..dim_in {
                    bars.weights[io * dim_in + ii] += example[ii] * update_bar[io];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{BarsMut, Layer, Params};
    use crate::activation::Activation;
    use approx::assert_relative_eq;

    fn params<'a>(w: &'a [f64], b: &'a [f64]) -> Params<'a> {
        Params { weights: w, bias: b }
    }

    #[test]
    fn residual_form_holds() {
        let layer = Layer::dense(1, 3, 3, 0.1, Activation::Tanh, 0.0);
        let w: Vec<f64> = (0..9).map(|i| 0.1 * i as f64 - 0.4).collect();
        let b = [0.2];
        let before = [0.5, -1.0, 0.25];
        let mut state = before;
        layer.apply_forward(params(&w, &b), None, &mut state).unwrap();

        for io in 0..3 {
            let mut pre = b[0];
            for ii in 0..3 {
                pre += w[io * 3 + ii] * before[ii];
            }
            let expected = before[io] + 0.1 * pre.tanh();
            assert_relative_eq!(state[io], expected, epsilon = 1e-14);
        }
    }

    #[test]
    fn zero_dt_is_identity() {
        let layer = Layer::dense(1, 4, 4, 0.0, Activation::ReLu, 0.0);
        let w = vec![0.3; 16];
        let b = [0.7];
        let before = [1.0, -2.0, 0.5, 0.0];
        let mut state = before;
        layer.apply_forward(params(&w, &b), None, &mut state).unwrap();
        assert_eq!(state, before);
    }

    #[test]
    fn backward_matches_finite_difference() {
        let layer = Layer::dense(1, 2, 2, 0.05, Activation::Tanh, 0.0);
        let w = [0.4, -0.3, 0.2, 0.1];
        let b = [0.05];
        let state0 = [0.8, -0.6];
        let seed = [1.0, -2.0];

        // analytic: state_bar on exit, weight gradient accumulated
        let mut wbar = [0.0; 4];
        let mut bbar = [0.0];
        let mut state_bar = seed;
        layer
            .apply_backward(
                params(&w, &b),
                Some(BarsMut { weights: &mut wbar, bias: &mut bbar }),
                None,
                &state0,
                &mut state_bar,
            )
            .unwrap();

        let eps = 1e-6;
        let run = |w: &[f64], b: &[f64], s0: &[f64]| -> f64 {
            let mut s = [s0[0], s0[1]];
            layer.apply_forward(params(w, b), None, &mut s).unwrap();
            seed[0] * s[0] + seed[1] * s[1]
        };
        for i in 0..4 {
            let mut wp = w;
            wp[i] += eps;
            let mut wm = w;
            wm[i] -= eps;
            let fd = (run(&wp, &b, &state0) - run(&wm, &b, &state0)) / (2.0 * eps);
            assert_relative_eq!(wbar[i], fd, max_relative = 1e-6, epsilon = 1e-10);
        }
        for i in 0..2 {
            let mut sp = state0;
            sp[i] += eps;
            let mut sm = state0;
            sm[i] -= eps;
            let fd = (run(&w, &b, &sp) - run(&w, &b, &sm)) / (2.0 * eps);
            assert_relative_eq!(state_bar[i], fd, max_relative = 1e-6, epsilon = 1e-10);
        }
    }

    #[test]
    fn coarse_backward_leaves_bars_untouched() {
        let layer = Layer::dense(1, 2, 2, 0.05, Activation::Tanh, 0.0);
        let w = [0.4, -0.3, 0.2, 0.1];
        let b = [0.05];
        let mut state_bar = [1.0, 1.0];
        layer
            .apply_backward(params(&w, &b), None, None, &[0.8, -0.6], &mut state_bar)
            .unwrap();
        // only the state adjoint moves; nothing to assert about bars since
        // none were passed, but the propagation must still have happened
        assert!(state_bar[0] != 1.0 || state_bar[1] != 1.0);
    }
}
