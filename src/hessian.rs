//! Quasi-Newton Hessian approximations for the outer optimisation loop.
//!
//! All variants produce a direction with the same sign convention as the
//! gradient; the caller subtracts `stepsize * direction`.

use std::rc::Rc;

use tracing::warn;

use crate::comm::Communicator;
use crate::errors::PintResult;
use crate::linalg::{matvec, vecdot};

pub trait HessianApprox {
    /// Feed the `(s, y)` pair of the last accepted step. Called at the
    /// start of every iteration; implementations ignore `iter == 0`.
    fn update_memory(
        &mut self,
        iter: usize,
        x_new: &[f64],
        x_old: &[f64],
        g_new: &[f64],
        g_old: &[f64],
    ) -> PintResult<()>;

    /// Fill `descent` with the search direction for the current gradient.
    fn compute_descent_dir(
        &mut self,
        iter: usize,
        gradient: &[f64],
        descent: &mut [f64],
    ) -> PintResult<()>;
}

/// Steepest descent.
pub struct Identity;

impl HessianApprox for Identity {
    fn update_memory(
        &mut self,
        _iter: usize,
        _x_new: &[f64],
        _x_old: &[f64],
        _g_new: &[f64],
        _g_old: &[f64],
    ) -> PintResult<()> {
        Ok(())
    }

    fn compute_descent_dir(
        &mut self,
        _iter: usize,
        gradient: &[f64],
        descent: &mut [f64],
    ) -> PintResult<()> {
        descent.copy_from_slice(gradient);
        Ok(())
    }
}

/// Dense BFGS (Nocedal & Wright, chapter 6.1). Single-worker only: the
/// explicit Hessian is not distributed.
pub struct Bfgs {
    dim: usize,
    hessian: Vec<f64>,
    s: Vec<f64>,
    y: Vec<f64>,
}

impl Bfgs {
    pub fn new(dim: usize) -> Bfgs {
        let mut bfgs =
            Bfgs { dim, hessian: vec![0.0; dim * dim], s: vec![0.0; dim], y: vec![0.0; dim] };
        bfgs.set_identity();
        bfgs
    }

    fn set_identity(&mut self) {
        self.hessian.fill(0.0);
        for i in 0..self.dim {
            self.hessian[i * self.dim + i] = 1.0;
        }
    }
}

impl HessianApprox for Bfgs {
    fn update_memory(
        &mut self,
        _iter: usize,
        x_new: &[f64],
        x_old: &[f64],
        g_new: &[f64],
        g_old: &[f64],
    ) -> PintResult<()> {
        for i in 0..self.dim {
            self.y[i] = g_new[i] - g_old[i];
            self.s[i] = x_new[i] - x_old[i];
        }
        Ok(())
    }

    fn compute_descent_dir(
        &mut self,
        iter: usize,
        gradient: &[f64],
        descent: &mut [f64],
    ) -> PintResult<()> {
        let dim = self.dim;

        if iter == 0 {
            self.set_identity();
            matvec(dim, &self.hessian, gradient, descent);
            return Ok(());
        }

        let yts = vecdot(&self.y, &self.s);
        if yts < 1e-12 {
            warn!(yts, "curvature condition not satisfied, resetting Hessian");
            self.set_identity();
        } else {
            let yty = vecdot(&self.y, &self.y);
            if iter == 1 {
                let h0 = yts / yty;
                for i in 0..dim {
                    self.hessian[i * dim + i] = h0;
                }
            }

            // H <- H + rho * (b * s s' - (A + A'))  with A = H y s',
            // b = 1 + rho * y' H y, rho = 1 / y's
            let mut hy = vec![0.0; dim];
            matvec(dim, &self.hessian, &self.y, &mut hy);
            let rho = 1.0 / yts;
            let b = 1.0 + rho * vecdot(&self.y, &hy);
            for i in 0..dim {
                for j in 0..dim {
                    let ssj = self.s[i] * self.s[j];
                    let a_ij = hy[i] * self.s[j];
                    let a_ji = hy[j] * self.s[i];
                    self.hessian[i * dim + j] += rho * (b * ssj - a_ij - a_ji);
                }
            }
        }

        matvec(dim, &self.hessian, gradient, descent);
        Ok(())
    }
}

/// Limited-memory BFGS with a two-loop recursion. Dot products go through
/// the communicator, so the design may be sharded across workers.
pub struct Lbfgs {
    dim: usize,
    stages: usize,
    s: Vec<Vec<f64>>,
    y: Vec<Vec<f64>>,
    rho: Vec<f64>,
    h0: f64,
    comm: Rc<dyn Communicator>,
}

impl Lbfgs {
    pub fn new(dim: usize, stages: usize, comm: Rc<dyn Communicator>) -> Lbfgs {
        Lbfgs {
            dim,
            stages,
            s: vec![vec![0.0; dim]; stages],
            y: vec![vec![0.0; dim]; stages],
            rho: vec![0.0; stages],
            h0: 1.0,
            comm,
        }
    }

    fn dot_par(&self, x: &[f64], y: &[f64]) -> PintResult<f64> {
        self.comm.allreduce_sum(vecdot(x, y))
    }
}

impl HessianApprox for Lbfgs {
    fn update_memory(
        &mut self,
        iter: usize,
        x_new: &[f64],
        x_old: &[f64],
        g_new: &[f64],
        g_old: &[f64],
    ) -> PintResult<()> {
        if iter == 0 {
            return Ok(());
        }
        let imem = (iter - 1) % self.stages;
        for i in 0..self.dim {
            self.y[imem][i] = g_new[i] - g_old[i];
            self.s[imem][i] = x_new[i] - x_old[i];
        }

        let mut yts = self.dot_par(&self.y[imem], &self.s[imem])?;
        let mut yty = self.dot_par(&self.y[imem], &self.y[imem])?;
        if yts == 0.0 {
            warn!("resetting y's to 1");
            yts = 1.0;
        }
        if yty == 0.0 {
            warn!("resetting y'y to 1");
            yty = 1.0;
        }
        self.rho[imem] = 1.0 / yts;
        self.h0 = yts / yty;
        Ok(())
    }

    fn compute_descent_dir(
        &mut self,
        iter: usize,
        gradient: &[f64],
        descent: &mut [f64],
    ) -> PintResult<()> {
        descent.copy_from_slice(gradient);

        let imax = iter as i64 - 1;
        let imin = if iter < self.stages { 0 } else { (iter - self.stages) as i64 };

        let mut alpha = vec![0.0; self.stages];
        for i in (imin..=imax).rev() {
            let imem = (i as usize) % self.stages;
            alpha[imem] = self.rho[imem] * self.dot_par(&self.s[imem], descent)?;
            for idir in 0..self.dim {
                descent[idir] -= alpha[imem] * self.y[imem][idir];
            }
        }

        for d in descent.iter_mut() {
            *d *= self.h0;
        }

        for i in imin..=imax {
            let imem = (i as usize) % self.stages;
            let beta = self.rho[imem] * self.dot_par(&self.y[imem], descent)?;
            for idir in 0..self.dim {
                descent[idir] += self.s[imem][idir] * (alpha[imem] - beta);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleComm;
    use approx::assert_relative_eq;

    #[test]
    fn identity_returns_the_gradient() {
        let mut h = Identity;
        let g = [0.5, -2.0, 1.0];
        let mut d = [0.0; 3];
        h.compute_descent_dir(4, &g, &mut d).unwrap();
        assert_eq!(d, g);
    }

    #[test]
    fn lbfgs_first_iteration_is_steepest_descent() {
        let mut h = Lbfgs::new(3, 5, Rc::new(SingleComm));
        let g = [1.0, 2.0, -0.5];
        let mut d = [0.0; 3];
        h.update_memory(0, &[0.0; 3], &[0.0; 3], &[0.0; 3], &[0.0; 3]).unwrap();
        h.compute_descent_dir(0, &g, &mut d).unwrap();
        assert_eq!(d, g);
    }

    #[test]
    fn bfgs_curvature_failure_falls_back_to_gradient() {
        let mut h = Bfgs::new(2);
        // y's = 0 here
        h.update_memory(1, &[1.0, 0.0], &[0.0, 0.0], &[0.0, 1.0], &[0.0, 1.0]).unwrap();
        let g = [0.3, -0.4];
        let mut d = [0.0; 2];
        h.compute_descent_dir(1, &g, &mut d).unwrap();
        assert_eq!(d, g);
    }

    #[test]
    fn bfgs_directions_descend_a_quadratic() {
        // f(x) = 1/2 x'Ax with A = diag(2, 8); gradient g = Ax
        let a = [2.0, 8.0];
        let f = |x: &[f64]| 0.5 * (a[0] * x[0] * x[0] + a[1] * x[1] * x[1]);
        let grad = |x: &[f64]| [a[0] * x[0], a[1] * x[1]];
        let mut h = Bfgs::new(2);
        let mut x = [1.0, 1.0];
        let mut g = grad(&x);
        let mut x_old = x;
        let mut g_old = g;
        let f0 = f(&x);
        for iter in 0..10 {
            h.update_memory(iter, &x, &x_old, &g, &g_old).unwrap();
            let mut d = [0.0; 2];
            h.compute_descent_dir(iter, &g, &mut d).unwrap();
            // the returned direction follows the gradient's sign convention
            assert!(g[0] * d[0] + g[1] * d[1] > 0.0, "not a descent direction at {iter}");
            x_old = x;
            g_old = g;
            let step = 0.1;
            x = [x[0] - step * d[0], x[1] - step * d[1]];
            g = grad(&x);
        }
        assert!(f(&x) < 0.5 * f0, "objective did not drop: {} -> {}", f0, f(&x));
    }

    #[test]
    fn lbfgs_two_loop_matches_matrix_form() {
        // independent reference: the recursive product form
        // H_k = (I - rho s y')H_{k-1}(I - rho y s') + rho s s'
        let dim = 3;
        let stages = 3;
        let a = [3.0, 1.0, 0.5];
        let grad = |x: &[f64]| -> Vec<f64> { (0..dim).map(|i| a[i] * x[i]).collect() };

        let mut lbfgs = Lbfgs::new(dim, stages, Rc::new(SingleComm));
        let mut pairs: Vec<(Vec<f64>, Vec<f64>)> = Vec::new();

        let mut x = vec![1.0, -2.0, 0.5];
        let mut g = grad(&x);
        let mut x_old = x.clone();
        let mut g_old = g.clone();
        for iter in 0..4 {
            lbfgs.update_memory(iter, &x, &x_old, &g, &g_old).unwrap();
            if iter > 0 {
                let s: Vec<f64> = (0..dim).map(|i| x[i] - x_old[i]).collect();
                let y: Vec<f64> = (0..dim).map(|i| g[i] - g_old[i]).collect();
                pairs.push((s, y));
            }
            let mut d = vec![0.0; dim];
            lbfgs.compute_descent_dir(iter, &g, &mut d).unwrap();

            // reference direction from the explicit matrix product
            if iter > 0 {
                let window = &pairs[pairs.len().saturating_sub(stages)..];
                let (s_last, y_last) = window.last().unwrap();
                let h0 = vecdot(y_last, s_last) / vecdot(y_last, y_last);
                let mut h = vec![vec![0.0; dim]; dim];
                for (i, row) in h.iter_mut().enumerate() {
                    row[i] = h0;
                }
                for (s, y) in window {
                    let rho = 1.0 / vecdot(y, s);
                    // H <- (I - rho s y') H (I - rho y s') + rho s s'
                    let mut left = vec![vec![0.0; dim]; dim];
                    for i in 0..dim {
                        for j in 0..dim {
                            let mut v = 0.0;
                            for k in 0..dim {
                                let ik = if i == k { 1.0 } else { 0.0 } - rho * s[i] * y[k];
                                v += ik * h[k][j];
                            }
                            left[i][j] = v;
                        }
                    }
                    let mut new_h = vec![vec![0.0; dim]; dim];
                    for i in 0..dim {
                        for j in 0..dim {
                            let mut v = 0.0;
                            for k in 0..dim {
                                let kj = if k == j { 1.0 } else { 0.0 } - rho * y[k] * s[j];
                                v += left[i][k] * kj;
                            }
                            new_h[i][j] = v + rho * s[i] * s[j];
                        }
                    }
                    h = new_h;
                }
                for i in 0..dim {
                    let reference: f64 = (0..dim).map(|j| h[i][j] * g[j]).sum();
                    assert_relative_eq!(d[i], reference, epsilon = 1e-10, max_relative = 1e-10);
                }
            }

            x_old = x.clone();
            g_old = g.clone();
            for i in 0..dim {
                x[i] -= 0.2 * d[i];
            }
            g = grad(&x);
        }
    }
}
