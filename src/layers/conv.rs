//! Depthwise convolutional residual step.
//!
//! Each of the `nconv` image channels carries its own `csize x csize`
//! kernel; pixels outside the image are treated as zero.

use super::{BarsMut, Layer, Params};

impl Layer {
    /// Correlation of `data` with channel `i`'s kernel at pixel `(j, k)`.
    /// With `adjoint` set, the kernel is flipped, which applies the
    /// transpose of the correlation operator.
    #[allow(clippy::too_many_arguments)]
    fn apply_conv(
        weights: &[f64],
        data: &[f64],
        csize: usize,
        i: usize,
        j: usize,
        k: usize,
        side: usize,
        adjoint: bool,
    ) -> f64 {
        let fcsize = (csize / 2) as isize;
        let idx = i * side * side + j * side + k;
        let mut val = 0.0;
        for s in -fcsize..=fcsize {
            for t in -fcsize..=fcsize {
                let jj = j as isize + s;
                let kk = k as isize + t;
                if jj < 0 || jj >= side as isize || kk < 0 || kk >= side as isize {
                    continue;
                }
                let offset = s * side as isize + t;
                let (ws, wt) = if adjoint { (fcsize - s, fcsize - t) } else { (s + fcsize, t + fcsize) };
                let wght_idx = i * csize * csize + (ws as usize) * csize + wt as usize;
                val += data[(idx as isize + offset) as usize] * weights[wght_idx];
            }
        }
        val
    }

    pub(super) fn conv_forward(&self, p: Params<'_>, csize: usize, nconv: usize, state: &mut [f64]) {
        let img_size = self.dim_in() / nconv;
        let side = (img_size as f64).sqrt().round() as usize;
        debug_assert_eq!(side * side, img_size, "convolution needs square images");

        let mut update = vec![0.0; self.dim_out()];
        for i in 0..nconv {
            for j in 0..side {
                for k in 0..side {
                    update[i * img_size + j * side + k] =
                        Self::apply_conv(p.weights, state, csize, i, j, k, side, false) + p.bias[0];
                }
            }
        }
        for io in 0..self.dim_out() {
            state[io] += self.dt() * self.activation().apply(update[io]);
        }
    }

    pub(super) fn conv_backward(
        &self,
        p: Params<'_>,
        bars: Option<BarsMut<'_>>,
        csize: usize,
        nconv: usize,
        state: &[f64],
        state_bar: &mut [f64],
    ) {
        let img_size = self.dim_in() / nconv;
        let side = (img_size as f64).sqrt().round() as usize;
        let fcsize = (csize / 2) as isize;

        // Recompute the forward pre-activation so sigma' sees the values the
        // forward step actually produced.
        let mut update = vec![0.0; self.dim_out()];
        let mut update_bar = vec![0.0; self.dim_out()];
        for i in 0..nconv {
            for j in 0..side {
                for k in 0..side {
                    let m = i * img_size + j * side + k;
                    update[m] =
                        Self::apply_conv(p.weights, state, csize, i, j, k, side, false) + p.bias[0];
                    update_bar[m] = self.dt() * self.activation().diff(update[m]) * state_bar[m];
                }
            }
        }

        // Kernel and bias derivative: the correlation transposed onto the
        // primal state, one accumulation per kernel tap.
        if let Some(bars) = bars {
            for ub in &update_bar {
                bars.bias[0] += ub;
            }
            for i in 0..nconv {
                for s in -fcsize..=fcsize {
                    for t in -fcsize..=fcsize {
                        let wght_idx = i * csize * csize
                            + (s + fcsize) as usize * csize
                            + (t + fcsize) as usize;
                        let mut sum = 0.0;
                        for j in 0..side {
                            for k in 0..side {
                                let jj = j as isize + s;
                                let kk = k as isize + t;
                                if jj < 0 || jj >= side as isize || kk < 0 || kk >= side as isize {
                                    continue;
                                }
                                let m = i * img_size + j * side + k;
                                let n = i * img_size + jj as usize * side + kk as usize;
                                sum += state[n] * update_bar[m];
                            }
                        }
                        bars.weights[wght_idx] += sum;
                    }
                }
            }
        }

        // State adjoint: residual identity plus the flipped-kernel
        // correlation of update_bar.
        for i in 0..nconv {
            for j in 0..side {
                for k in 0..side {
                    let m = i * img_size + j * side + k;
                    state_bar[m] +=
                        Self::apply_conv(p.weights, &update_bar, csize, i, j, k, side, true);
                }
            }
        }
    }
}
