//! Multigrid-reduction-in-time driver.
//!
//! The time grid is partitioned contiguously over the workers; coarser
//! levels keep every `cfactor`-th point. Each iteration runs an FAS V-cycle:
//! FCF-relaxation, restriction of C-point residuals, a recursive coarse
//! solve, and C-point correction. The coarsest level is solved by
//! sequential (pipelined) time stepping, which is also the whole solve when
//! only one level exists.
//!
//! All vectors of the finest level are stored, so a companion core (the
//! adjoint sweep) can read the trajectory by point index.

use std::rc::Rc;

use tracing::debug;

use super::grid::{block_distribution, owner_of};
use super::status::{AccessStatus, StepStatus};
use super::TimeIntegrator;
use crate::comm::{Communicator, Tag};
use crate::errors::{PintError, PintResult};

/// Driver knobs, mapped one-to-one from the `braid_*` configuration keys.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub max_levels: usize,
    pub min_coarse: usize,
    pub cfactor: usize,
    pub cfactor0: usize,
    pub max_iter: usize,
    pub abs_tol: f64,
    pub print_level: i32,
    pub access_level: i32,
    pub skip: bool,
    pub fmg: bool,
    pub nrelax: usize,
    pub nrelax0: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            max_levels: 10,
            min_coarse: 10,
            cfactor: 4,
            cfactor0: 4,
            max_iter: 3,
            abs_tol: 1e-10,
            print_level: 1,
            access_level: 0,
            skip: false,
            fmg: false,
            nrelax: 1,
            nrelax0: 1,
        }
    }
}

struct Level<V> {
    /// Stride between this level's points in finest-level indices.
    span: usize,
    /// Coarsening factor towards the next level.
    cfactor: usize,
    /// Global number of points on this level.
    npoints: usize,
    /// Owned inclusive range in level-local indices; `None` when empty.
    range: Option<(usize, usize)>,
    vectors: Vec<Option<V>>,
    /// FAS right-hand side; empty on the finest level.
    rhs: Vec<Option<V>>,
    /// Pre-correction copies of the injected C-point values.
    prev: Vec<Option<V>>,
}

impl<V> Level<V> {
    fn local(&self, point: usize) -> Option<usize> {
        let (lo, hi) = self.range?;
        if (lo..=hi).contains(&point) {
            Some(point - lo)
        } else {
            None
        }
    }
}

pub struct Core<T: TimeIntegrator> {
    integrator: T,
    comm: Rc<dyn Communicator>,
    cfg: CoreConfig,
    /// Number of intervals on the finest grid (points `0..=ntime`).
    ntime: usize,
    dt: f64,
    /// Reverse the rank-to-range mapping (adjoint core).
    reverted: bool,
    levels: Vec<Level<T::Vector>>,
    warm: bool,
    rnorm: f64,
}

impl<T: TimeIntegrator> Core<T> {
    pub fn new(
        integrator: T,
        comm: Rc<dyn Communicator>,
        cfg: CoreConfig,
        ntime: usize,
        dt: f64,
        reverted: bool,
    ) -> Core<T> {
        let mut core = Core {
            integrator,
            comm,
            cfg,
            ntime,
            dt,
            reverted,
            levels: Vec::new(),
            warm: false,
            rnorm: 0.0,
        };
        core.build_levels();
        core
    }

    fn build_levels(&mut self) {
        let mut span = 1;
        let mut npoints = self.ntime + 1;
        loop {
            let level_index = self.levels.len();
            let cfactor = if level_index == 0 { self.cfg.cfactor0 } else { self.cfg.cfactor };
            let range = self.level_range(span);
            let count = range.map(|(lo, hi)| hi - lo + 1).unwrap_or(0);
            self.levels.push(Level {
                span,
                cfactor,
                npoints,
                range,
                vectors: (0..count).map(|_| None).collect(),
                rhs: (0..count).map(|_| None).collect(),
                prev: (0..count).map(|_| None).collect(),
            });

            if self.levels.len() >= self.cfg.max_levels {
                break;
            }
            let next_npoints = (npoints - 1) / cfactor + 1;
            if next_npoints >= npoints || next_npoints < self.cfg.min_coarse {
                break;
            }
            span *= cfactor;
            npoints = next_npoints;
        }
    }

    /// Owned range of this rank on the level whose points sit at fine
    /// indices that are multiples of `span`.
    fn level_range(&self, span: usize) -> Option<(usize, usize)> {
        let (lo, hi) = self.rank_fine_range(self.comm.rank());
        if lo > hi {
            return None;
        }
        let llo = (lo + span - 1) / span;
        let lhi = hi / span;
        if llo <= lhi {
            Some((llo, lhi))
        } else {
            None
        }
    }

    /// Finest-level inclusive range of `rank`, honouring reverted order.
    fn rank_fine_range(&self, rank: usize) -> (usize, usize) {
        let npoints = self.ntime + 1;
        let (lo, hi) = block_distribution(npoints, self.comm.size(), rank);
        if lo > hi {
            return (lo, hi);
        }
        if self.reverted {
            (npoints - 1 - hi, npoints - 1 - lo)
        } else {
            (lo, hi)
        }
    }

    /// Rank owning a point of level `l`.
    fn owner(&self, level: usize, point: usize) -> usize {
        let fine = point * self.levels[level].span;
        let npoints = self.ntime + 1;
        if self.reverted {
            owner_of(npoints, self.comm.size(), npoints - 1 - fine)
        } else {
            owner_of(npoints, self.comm.size(), fine)
        }
    }

    fn time_of(&self, level: usize, point: usize) -> f64 {
        (point * self.levels[level].span) as f64 * self.dt
    }

    pub fn warm_restart(&self) -> bool {
        self.warm
    }

    pub fn rnorm(&self) -> f64 {
        self.rnorm
    }

    pub fn npoints(&self) -> usize {
        self.ntime + 1
    }

    /// Owned range on the finest level.
    pub fn range(&self) -> Option<(usize, usize)> {
        self.levels[0].range
    }

    pub fn integrator(&self) -> &T {
        &self.integrator
    }

    pub fn integrator_mut(&mut self) -> &mut T {
        &mut self.integrator
    }

    /// Stored finest-level vector at `point`, if owned here and computed.
    pub fn vector(&self, point: usize) -> Option<&T::Vector> {
        let local = self.levels[0].local(point)?;
        self.levels[0].vectors[local].as_ref()
    }

    pub fn vector_mut(&mut self, point: usize) -> Option<&mut T::Vector> {
        let local = self.levels[0].local(point)?;
        self.levels[0].vectors[local].as_mut()
    }

    /// Overwrite the stored vector at a finest-level point.
    pub fn set_vector(&mut self, point: usize, v: T::Vector) -> PintResult<()> {
        let local = self.levels[0].local(point).ok_or_else(|| PintError::Comm(format!(
            "point {point} is not stored on rank {}",
            self.comm.rank()
        )))?;
        self.levels[0].vectors[local] = Some(v);
        Ok(())
    }

    /// Run the solver until its residual tolerance or iteration cap.
    /// Returns the final space-time residual norm.
    pub fn drive(&mut self) -> PintResult<f64> {
        if !self.warm {
            self.init_finest_level()?;
        }

        if self.levels.len() == 1 {
            // single-level MGRIT degenerates to sequential time stepping
            self.sequential_solve(0)?;
            self.rnorm = 0.0;
        } else {
            for iter in 0..self.cfg.max_iter {
                if self.cfg.fmg {
                    self.fmg_cycle(0)?;
                } else {
                    let skip_down = self.cfg.skip && !self.warm && iter == 0;
                    self.vcycle(0, skip_down)?;
                }
                self.rnorm = self.residual_norm(0)?;
                if self.cfg.print_level > 0 {
                    debug!(iter, rnorm = self.rnorm, "mgrit iteration");
                }
                if self.rnorm < self.cfg.abs_tol {
                    break;
                }
            }
        }

        self.warm = true;
        if self.cfg.access_level > 0 {
            self.run_access();
        }
        Ok(self.rnorm)
    }

    fn init_finest_level(&mut self) -> PintResult<()> {
        if let Some((lo, hi)) = self.levels[0].range {
            for point in lo..=hi {
                let t = self.time_of(0, point);
                let v = self.integrator.init(t)?;
                let local = point - lo;
                self.levels[0].vectors[local] = Some(v);
            }
        }
        Ok(())
    }

    fn vcycle(&mut self, level: usize, skip_relax: bool) -> PintResult<()> {
        if level + 1 == self.levels.len() {
            return self.sequential_solve(level);
        }
        if !skip_relax {
            self.fcf_relax(level)?;
        }
        self.restrict(level)?;
        self.vcycle(level + 1, false)?;
        self.correct(level)?;
        Ok(())
    }

    /// Full-multigrid F-cycle: descend to the coarsest level first, solve
    /// there, and finish each level on the way back up with a V-cycle.
    fn fmg_cycle(&mut self, level: usize) -> PintResult<()> {
        if level + 1 == self.levels.len() {
            return self.sequential_solve(level);
        }
        self.restrict(level)?;
        self.fmg_cycle(level + 1)?;
        self.correct(level)?;
        self.vcycle(level, false)
    }

    fn nrelax_of(&self, level: usize) -> usize {
        if level == 0 {
            self.cfg.nrelax0
        } else {
            self.cfg.nrelax
        }
    }

    fn fcf_relax(&mut self, level: usize) -> PintResult<()> {
        self.relax_sweep(level, false)?;
        for _ in 0..self.nrelax_of(level) {
            self.relax_sweep(level, true)?;
            self.relax_sweep(level, false)?;
        }
        Ok(())
    }

    /// Step `prev` across one interval of `level`, adding the FAS rhs.
    fn step_point(&mut self, level: usize, point: usize, prev: T::Vector) -> PintResult<T::Vector> {
        let mut v = prev;
        let status = StepStatus {
            t_start: self.time_of(level, point - 1),
            t_stop: self.time_of(level, point),
            level,
        };
        self.integrator.step(&mut v, &status)?;
        if let Some(local) = self.levels[level].local(point) {
            if let Some(g) = self.levels[level].rhs[local].take() {
                self.integrator.sum(1.0, &g, 1.0, &mut v);
                self.levels[level].rhs[local] = Some(g);
            }
        }
        Ok(v)
    }

    /// Receive the left-boundary vector of this rank's range, if any.
    fn recv_left_ghost(&mut self, level: usize) -> PintResult<Option<T::Vector>> {
        let Some((lo, _)) = self.levels[level].range else {
            return Ok(None);
        };
        if lo == 0 {
            return Ok(None);
        }
        let src = self.owner(level, lo - 1);
        let buf = self.comm.recv(src, Tag::Halo)?;
        Ok(Some(self.integrator.buf_unpack(&buf)?))
    }

    /// Send the right-boundary vector onwards, if a neighbour needs it.
    fn send_right_boundary(&mut self, level: usize) -> PintResult<()> {
        let Some((_, hi)) = self.levels[level].range else {
            return Ok(());
        };
        if hi + 1 >= self.levels[level].npoints {
            return Ok(());
        }
        let dest = self.owner(level, hi + 1);
        let local = self.levels[level].local(hi).expect("own boundary point");
        let v = self.levels[level].vectors[local].as_ref().ok_or_else(|| {
            PintError::Comm(format!("boundary vector {hi} missing on level {level}"))
        })?;
        let mut buf = Vec::with_capacity(self.integrator.buf_size() / std::mem::size_of::<f64>());
        self.integrator.buf_pack(v, &mut buf)?;
        self.comm.send(dest, Tag::Halo, &buf)
    }

    /// One relaxation sweep over the owned range, updating either the
    /// C-points or the F-points, pipelined left to right across workers.
    fn relax_sweep(&mut self, level: usize, c_points: bool) -> PintResult<()> {
        let ghost = self.recv_left_ghost(level)?;
        if let Some((lo, hi)) = self.levels[level].range {
            let m = self.levels[level].cfactor;
            for point in lo.max(1)..=hi {
                let is_c = point % m == 0;
                if is_c != c_points {
                    continue;
                }
                let prev = if point == lo {
                    ghost.as_ref().ok_or_else(|| {
                        PintError::Comm(format!("missing left ghost at point {point}"))
                    })?
                } else {
                    let local = self.levels[level].local(point - 1).expect("interior point");
                    self.levels[level].vectors[local].as_ref().ok_or_else(|| {
                        PintError::Comm(format!("vector {} not initialised", point - 1))
                    })?
                };
                let prev = self.integrator.clone_vector(prev);
                let v = self.step_point(level, point, prev)?;
                let local = self.levels[level].local(point).expect("owned point");
                self.levels[level].vectors[local] = Some(v);
            }
        }
        self.send_right_boundary(level)
    }

    /// Sequential time stepping over the whole owned range; exact solve of
    /// this level's (FAS-corrected) evolution.
    fn sequential_solve(&mut self, level: usize) -> PintResult<()> {
        let ghost = self.recv_left_ghost(level)?;
        if let Some((lo, hi)) = self.levels[level].range {
            for point in lo.max(1)..=hi {
                let prev = if point == lo {
                    self.integrator.clone_vector(ghost.as_ref().ok_or_else(|| {
                        PintError::Comm(format!("missing left ghost at point {point}"))
                    })?)
                } else {
                    let local = self.levels[level].local(point - 1).expect("interior point");
                    self.integrator.clone_vector(
                        self.levels[level].vectors[local].as_ref().ok_or_else(|| {
                            PintError::Comm(format!("vector {} not initialised", point - 1))
                        })?,
                    )
                };
                let v = self.step_point(level, point, prev)?;
                let local = self.levels[level].local(point).expect("owned point");
                self.levels[level].vectors[local] = Some(v);
            }
        }
        self.send_right_boundary(level)
    }

    /// Inject C-points into the next level and build its FAS right-hand
    /// side from the fine residual.
    fn restrict(&mut self, level: usize) -> PintResult<()> {
        let m = self.levels[level].cfactor;

        // residual at owned C-points, against post-relaxation neighbours
        let ghost = self.recv_left_ghost(level)?;
        let mut residuals: Vec<Option<T::Vector>> = Vec::new();
        if let Some((lo, hi)) = self.levels[level].range {
            for point in lo..=hi {
                if point % m != 0 {
                    continue;
                }
                let coarse_local = self.levels[level + 1].local(point / m);
                if point == 0 {
                    residuals.push(None);
                } else {
                    let prev = if point == lo {
                        self.integrator.clone_vector(ghost.as_ref().ok_or_else(|| {
                            PintError::Comm(format!("missing left ghost at point {point}"))
                        })?)
                    } else {
                        let local = self.levels[level].local(point - 1).expect("interior point");
                        self.integrator.clone_vector(
                            self.levels[level].vectors[local]
                                .as_ref()
                                .expect("relaxed vector"),
                        )
                    };
                    // r = Phi(u_{point-1}) + g - u_point
                    let mut r = self.step_point(level, point, prev)?;
                    let local = self.levels[level].local(point).expect("owned point");
                    let u = self.levels[level].vectors[local].as_ref().expect("owned vector");
                    self.integrator.sum(-1.0, u, 1.0, &mut r);
                    residuals.push(Some(r));
                }
                // inject the C-point value
                let local = self.levels[level].local(point).expect("owned point");
                let u = self.levels[level].vectors[local].as_ref().expect("owned vector");
                let injected = self.integrator.clone_vector(u);
                let copy = self.integrator.clone_vector(&injected);
                let coarse_local = coarse_local.expect("coarse range covers owned C-points");
                self.levels[level + 1].vectors[coarse_local] = Some(injected);
                self.levels[level + 1].prev[coarse_local] = Some(copy);
            }
        }
        self.send_right_boundary(level)?;

        // tau correction: g_J = r_J + v_J - Phi_coarse(v_{J-1})
        let coarse = level + 1;
        let ghost = self.recv_left_ghost(coarse)?;
        if let Some((clo, chi)) = self.levels[coarse].range {
            let mut res_iter = residuals.into_iter();
            for point in clo..=chi {
                let r = res_iter.next().flatten();
                if point == 0 {
                    continue;
                }
                let r = r.ok_or_else(|| {
                    PintError::Comm(format!("missing residual for coarse point {point}"))
                })?;
                let prev = if point == clo {
                    self.integrator.clone_vector(ghost.as_ref().ok_or_else(|| {
                        PintError::Comm(format!("missing coarse ghost at point {point}"))
                    })?)
                } else {
                    let local = self.levels[coarse].local(point - 1).expect("interior point");
                    self.integrator.clone_vector(
                        self.levels[coarse].vectors[local].as_ref().expect("injected vector"),
                    )
                };
                let mut phi = prev;
                let status = StepStatus {
                    t_start: self.time_of(coarse, point - 1),
                    t_stop: self.time_of(coarse, point),
                    level: coarse,
                };
                self.integrator.step(&mut phi, &status)?;

                let local = self.levels[coarse].local(point).expect("owned point");
                let v = self.levels[coarse].vectors[local].as_ref().expect("injected vector");
                let mut g = r;
                self.integrator.sum(1.0, v, 1.0, &mut g);
                self.integrator.sum(-1.0, &phi, 1.0, &mut g);
                self.levels[coarse].rhs[local] = Some(g);
            }
        }
        self.send_right_boundary(coarse)
    }

    /// Apply the coarse-grid correction to the C-points, then refresh the
    /// F-points with one more F-relaxation.
    fn correct(&mut self, level: usize) -> PintResult<()> {
        let m = self.levels[level].cfactor;
        if let Some((lo, hi)) = self.levels[level].range {
            for point in lo..=hi {
                if point % m != 0 || point == 0 {
                    continue;
                }
                let coarse_local =
                    self.levels[level + 1].local(point / m).expect("coarse range matches");
                let v = self.levels[level + 1].vectors[coarse_local]
                    .take()
                    .expect("coarse solution");
                let prev = self.levels[level + 1].prev[coarse_local]
                    .take()
                    .expect("pre-correction copy");
                let local = self.levels[level].local(point).expect("owned point");
                let u = self.levels[level].vectors[local].as_mut().expect("owned vector");
                self.integrator.sum(1.0, &v, 1.0, u);
                self.integrator.sum(-1.0, &prev, 1.0, u);
                self.integrator.free(v);
                self.integrator.free(prev);
            }
        }
        self.relax_sweep(level, false)
    }

    /// Space-time residual norm at the C-points of `level`.
    fn residual_norm(&mut self, level: usize) -> PintResult<f64> {
        let m = self.levels[level].cfactor;
        let ghost = self.recv_left_ghost(level)?;
        let mut normsq = 0.0;
        if let Some((lo, hi)) = self.levels[level].range {
            for point in lo..=hi {
                if point % m != 0 || point == 0 {
                    continue;
                }
                let prev = if point == lo {
                    self.integrator.clone_vector(ghost.as_ref().ok_or_else(|| {
                        PintError::Comm(format!("missing left ghost at point {point}"))
                    })?)
                } else {
                    let local = self.levels[level].local(point - 1).expect("interior point");
                    self.integrator.clone_vector(
                        self.levels[level].vectors[local].as_ref().expect("owned vector"),
                    )
                };
                let mut r = self.step_point(level, point, prev)?;
                let local = self.levels[level].local(point).expect("owned point");
                let u = self.levels[level].vectors[local].as_ref().expect("owned vector");
                self.integrator.sum(-1.0, u, 1.0, &mut r);
                let n = self.integrator.spatial_norm(&r);
                normsq += n * n;
            }
        }
        self.send_right_boundary(level)?;
        let total = self.comm.allreduce_sum(normsq)?;
        Ok(total.sqrt())
    }

    fn run_access(&mut self) {
        if let Some((lo, hi)) = self.levels[0].range {
            for point in lo..=hi {
                let t = self.time_of(0, point);
                let local = point - lo;
                if let Some(u) = self.levels[0].vectors[local].as_ref() {
                    self.integrator.access(
                        u,
                        &AccessStatus { t, level: 0, done: point == self.ntime },
                    );
                }
            }
        }
    }
}
