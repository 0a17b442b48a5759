//! Outer optimisation loop.
//!
//! Each iteration: primal sweep, objective assembly, adjoint sweep,
//! gradient gather, quasi-Newton direction on the coordinator, design
//! scatter with ghost refresh, and an Armijo backtracking line search.

use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::comm::{Communicator, SingleComm};
use crate::config::{Config, HessianKind};
use crate::dataset::{write_vector, DataSet};
use crate::errors::PintResult;
use crate::hessian::{Bfgs, HessianApprox, Identity, Lbfgs};
use crate::linalg::{vec_normsq, vecdot};
use crate::network::Network;
use crate::objective::{eval_classification_at_end, eval_objective, Objective};
use crate::pint::{block_distribution, AdjointNet, App, Core, CoreConfig, PrimalNet};

const MASTER: usize = 0;
const LS_PARAM: f64 = 1e-4;

/// Scalars of a finished run.
#[derive(Debug, Clone, Copy)]
pub struct Summary {
    pub iterations: usize,
    pub objective: f64,
    pub loss: f64,
    pub gnorm: f64,
    pub train_accuracy: f64,
    pub val_accuracy: f64,
}

pub struct Trainer {
    config: Config,
    comm: Rc<dyn Communicator>,
    network: Rc<RefCell<Network>>,
    app_train: Rc<App>,
    app_val: Rc<App>,
    core_train: Rc<RefCell<Core<PrimalNet>>>,
    core_val: Rc<RefCell<Core<PrimalNet>>>,
    core_adj: Core<AdjointNet>,
    hessian: Option<Box<dyn HessianApprox>>,
    ndesign_global: usize,
    counts: Vec<usize>,
    // coordinator copies of the global optimisation vectors
    design: Vec<f64>,
    design0: Vec<f64>,
    gradient: Vec<f64>,
    gradient0: Vec<f64>,
    descentdir: Vec<f64>,
    optimfile: Option<File>,
}

impl Trainer {
    pub fn new(
        config: Config,
        comm: Rc<dyn Communicator>,
        train: DataSet,
        validation: DataSet,
    ) -> PintResult<Trainer> {
        let rank = comm.rank();
        let size = comm.size();
        let npoints = config.nlayers;
        let ntime = npoints - 1;
        let (ilower, iupper) = block_distribution(npoints, size, rank);
        if ilower > iupper {
            return Err(crate::errors::PintError::Config(format!(
                "worker {rank} owns no layers: {size} workers for {npoints} layers"
            )));
        }

        info!(rank, ilower, iupper, nlayers = config.nlayers, "layer range");

        let mut network = Network::new(ilower, iupper, &config)?;
        network.initialize(1, &config)?;
        network.communicate_neighbours(comm.as_ref())?;
        let ndesign_local = network.ndesign_local();
        let network = Rc::new(RefCell::new(network));

        let app_train =
            Rc::new(App { rank, size, network: Rc::clone(&network), data: train });
        let app_val =
            Rc::new(App { rank, size, network: Rc::clone(&network), data: validation });

        let core_train = Rc::new(RefCell::new(Core::new(
            PrimalNet::new(Rc::clone(&app_train)),
            Rc::clone(&comm),
            config.braid.clone(),
            ntime,
            config.dt(),
            false,
        )));
        let core_val = Rc::new(RefCell::new(Core::new(
            PrimalNet::new(Rc::clone(&app_val)),
            Rc::clone(&comm),
            config.braid.clone(),
            ntime,
            config.dt(),
            false,
        )));
        let adj_cfg = CoreConfig { abs_tol: config.braid_abstoladj, ..config.braid.clone() };
        let core_adj = Core::new(
            AdjointNet::new(Rc::clone(&app_train), Rc::clone(&core_train)),
            Rc::clone(&comm),
            adj_cfg,
            ntime,
            config.dt(),
            true,
        );

        // per-rank design counts, known everywhere
        let gathered = comm.gatherv(MASTER, &[ndesign_local as f64])?;
        let mut counts_buf = gathered.unwrap_or_default();
        comm.broadcast(MASTER, &mut counts_buf)?;
        let counts: Vec<usize> = counts_buf.iter().map(|&c| c as usize).collect();
        let ndesign_global = counts.iter().sum();
        info!(rank, ndesign_local, ndesign_global, "design variables");

        let hessian: Option<Box<dyn HessianApprox>> = if rank == MASTER {
            Some(match config.hessian {
                HessianKind::Identity => Box::new(Identity),
                HessianKind::Bfgs => {
                    if size > 1 {
                        warn!("parallel BFGS is not supported; updates stay local per worker");
                    }
                    Box::new(Bfgs::new(ndesign_global))
                }
                HessianKind::Lbfgs => Box::new(Lbfgs::new(
                    ndesign_global,
                    config.lbfgs_stages,
                    Rc::new(SingleComm),
                )),
            })
        } else {
            None
        };

        let (design, design0, gradient, gradient0, descentdir) = if rank == MASTER {
            (
                vec![0.0; ndesign_global],
                vec![0.0; ndesign_global],
                vec![0.0; ndesign_global],
                vec![0.0; ndesign_global],
                vec![0.0; ndesign_global],
            )
        } else {
            (Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new())
        };

        let mut trainer = Trainer {
            config,
            comm,
            network,
            app_train,
            app_val,
            core_train,
            core_val,
            core_adj,
            hessian,
            ndesign_global,
            counts,
            design,
            design0,
            gradient,
            gradient0,
            descentdir,
            optimfile: None,
        };
        trainer.gather_design()?;
        Ok(trainer)
    }

    pub fn network(&self) -> Rc<RefCell<Network>> {
        Rc::clone(&self.network)
    }

    /// Coordinator copy of the assembled gradient (empty elsewhere).
    pub fn gradient(&self) -> &[f64] {
        &self.gradient
    }

    /// Coordinator copy of the assembled design (empty elsewhere).
    pub fn design(&self) -> &[f64] {
        &self.design
    }

    pub fn ndesign_global(&self) -> usize {
        self.ndesign_global
    }

    /// Replace the global design (coordinator value wins) and push it to
    /// the workers.
    pub fn set_design(&mut self, design: Vec<f64>) -> PintResult<()> {
        if self.comm.rank() == MASTER {
            self.design = design;
        }
        self.scatter_design()
    }

    fn gather_design(&mut self) -> PintResult<()> {
        let local = self.network.borrow().design().to_vec();
        if let Some(global) = self.comm.gatherv(MASTER, &local)? {
            self.design = global;
        }
        Ok(())
    }

    fn scatter_design(&mut self) -> PintResult<()> {
        let send = if self.comm.rank() == MASTER { Some(self.design.as_slice()) } else { None };
        let local = self.comm.scatterv(MASTER, send, &self.counts)?;
        {
            let mut net = self.network.borrow_mut();
            net.design_mut().copy_from_slice(&local);
        }
        self.network.borrow_mut().communicate_neighbours(self.comm.as_ref())
    }

    /// On a warm restart, re-apply the opening layer so the cached initial
    /// state reflects the current opening weights.
    fn opening_prepass(&mut self) -> PintResult<()> {
        let mut core = self.core_train.borrow_mut();
        if !core.warm_restart() {
            return Ok(());
        }
        if let Some(u) = core.vector_mut(0) {
            let mut net = self.network.borrow_mut();
            let dt = net.dt();
            for iex in 0..self.app_train.nexamples() {
                let example = self.app_train.example(iex);
                let mut row = u.state.row_mut(iex);
                let state = row.as_slice_mut().expect("contiguous state row");
                net.step_layer(0, dt, example, state)?;
            }
        }
        Ok(())
    }

    /// Primal sweep plus objective assembly. Returns the reduced objective
    /// and the driver's residual norm.
    pub fn primal_sweep(&mut self) -> PintResult<(Objective, f64)> {
        self.opening_prepass()?;
        let rnorm = self.core_train.borrow_mut().drive()?;
        let objective =
            eval_objective(&self.core_train.borrow(), &self.app_train, self.comm.as_ref())?;
        Ok((objective, rnorm))
    }

    /// Adjoint sweep; reseeds the terminal condition on warm restarts.
    /// Returns the adjoint residual norm.
    pub fn adjoint_sweep(&mut self) -> PintResult<f64> {
        if self.core_adj.warm_restart() {
            let owns_terminal = self.core_adj.range().map_or(false, |(lo, _)| lo == 0);
            if owns_terminal {
                let ubar = self.core_adj.integrator_mut().terminal_condition()?;
                self.core_adj.set_vector(0, ubar)?;
            }
        }
        self.core_adj.drive()
    }

    /// Gather the sharded gradient onto the coordinator and return its
    /// global Euclidean norm.
    pub fn gather_gradient(&mut self) -> PintResult<f64> {
        let local = self.network.borrow().gradient().to_vec();
        if let Some(global) = self.comm.gatherv(MASTER, &local)? {
            self.gradient = global;
        }
        let normsq = self.comm.allreduce_sum(vec_normsq(&local))?;
        Ok(normsq.sqrt())
    }

    fn open_optimfile(&mut self) -> PintResult<()> {
        if self.comm.rank() != MASTER {
            return Ok(());
        }
        let mut f = File::create("optim.dat")?;
        let c = &self.config;
        writeln!(f, "# Problem setup: ntraining            {}", c.ntraining)?;
        writeln!(f, "#                nvalidation          {}", c.nvalidation)?;
        writeln!(f, "#                nfeatures            {}", c.nfeatures)?;
        writeln!(f, "#                nclasses             {}", c.nclasses)?;
        writeln!(f, "#                nchannels            {}", c.nchannels)?;
        writeln!(f, "#                nlayers              {}", c.nlayers)?;
        writeln!(f, "#                T                    {}", c.t_final)?;
        writeln!(f, "#                Activation           {}", c.activation.name())?;
        writeln!(f, "#                type openlayer       {}", c.type_openlayer.name())?;
        writeln!(f, "# Driver setup:  max levels           {}", c.braid.max_levels)?;
        writeln!(f, "#                min coarse           {}", c.braid.min_coarse)?;
        writeln!(f, "#                coarsening           {}", c.braid.cfactor)?;
        writeln!(f, "#                coarsening (level 0) {}", c.braid.cfactor0)?;
        writeln!(f, "#                max. iter            {}", c.braid.max_iter)?;
        writeln!(f, "#                abs. tol             {:e}", c.braid.abs_tol)?;
        writeln!(f, "#                abs. tol (adjoint)   {:e}", c.braid_abstoladj)?;
        writeln!(f, "#                print level          {}", c.braid.print_level)?;
        writeln!(f, "#                access level         {}", c.braid.access_level)?;
        writeln!(f, "#                skip?                {}", c.braid.skip as u8)?;
        writeln!(f, "#                fmg?                 {}", c.braid.fmg as u8)?;
        writeln!(f, "#                nrelax (level 0)     {}", c.braid.nrelax0)?;
        writeln!(f, "#                nrelax               {}", c.braid.nrelax)?;
        writeln!(f, "# Optimization:  gamma_tik            {:e}", c.gamma_tik)?;
        writeln!(f, "#                gamma_ddt            {:e}", c.gamma_ddt)?;
        writeln!(f, "#                gamma_class          {:e}", c.gamma_class)?;
        writeln!(f, "#                stepsize             {}", c.stepsize_init)?;
        writeln!(f, "#                max. optim iter      {}", c.optim_maxiter)?;
        writeln!(f, "#                gtol                 {:e}", c.gtol)?;
        writeln!(f, "#                max. ls iter         {}", c.ls_maxiter)?;
        writeln!(f, "#                ls factor            {}", c.ls_factor)?;
        writeln!(f, "#                weights_init         {}", c.weights_init)?;
        writeln!(f, "#                weights_open_init    {}", c.weights_open_init)?;
        writeln!(f, "#                weights_class_init   {}", c.weights_class_init)?;
        writeln!(f, "#                hessian_approx       {}", c.hessian.name())?;
        writeln!(f, "#                lbfgs_stages         {}", c.lbfgs_stages)?;
        writeln!(f, "#                validationlevel      {}", c.validationlevel)?;
        writeln!(f)?;
        writeln!(
            f,
            "#    || r ||          || r_adj ||      Objective             Loss                  || grad ||            Stepsize  ls_iter   Accur_train  Accur_val   Time(sec)"
        )?;
        self.optimfile = Some(f);
        Ok(())
    }

    /// Run the full optimisation. Returns the coordinator's summary (other
    /// ranks return the same reduced scalars).
    pub fn run(&mut self) -> PintResult<Summary> {
        self.open_optimfile()?;

        let rank = self.comm.rank();
        let start = Instant::now();
        let mut stepsize = self.config.stepsize_init;
        let mut ls_iter = 0usize;
        let mut summary = Summary {
            iterations: 0,
            objective: 0.0,
            loss: 0.0,
            gnorm: 0.0,
            train_accuracy: 0.0,
            val_accuracy: 0.0,
        };

        for iter in 0..self.config.optim_maxiter {
            let (objective, rnorm) = self.primal_sweep()?;
            let rnorm_adj = self.adjoint_sweep()?;

            let (_val_loss, val_accuracy) = if self.config.validationlevel > 0 {
                self.core_val.borrow_mut().drive()?;
                eval_classification_at_end(&self.core_val.borrow(), &self.app_val, self.comm.as_ref())?
            } else {
                (0.0, 0.0)
            };

            let gnorm = self.gather_gradient()?;
            if !objective.objective.is_finite() || !gnorm.is_finite() {
                return Err(crate::errors::PintError::Numeric(format!(
                    "non-finite iterate at iteration {iter}: objective {}, gradient norm {gnorm}",
                    objective.objective
                )));
            }

            summary = Summary {
                iterations: iter,
                objective: objective.objective,
                loss: objective.loss,
                gnorm,
                train_accuracy: objective.accuracy,
                val_accuracy,
            };

            if rank == MASTER {
                let elapsed = start.elapsed().as_secs_f64();
                info!(
                    iter,
                    rnorm,
                    rnorm_adj,
                    objective = objective.objective,
                    loss = objective.loss,
                    gnorm,
                    stepsize,
                    ls_iter,
                    train_accuracy = objective.accuracy,
                    val_accuracy,
                    "optimisation iteration"
                );
                if let Some(f) = self.optimfile.as_mut() {
                    writeln!(
                        f,
                        "{iter:3}  {rnorm:1.8e}  {rnorm_adj:1.8e}  {:1.14e}  {:1.14e}  {gnorm:1.14e}  {stepsize:5}  {ls_iter:2}        {:2.2}%      {val_accuracy:2.2}%     {elapsed:.1}",
                        objective.objective, objective.loss, objective.accuracy
                    )?;
                    f.flush()?;
                }
            }

            if gnorm < self.config.gtol {
                if rank == MASTER {
                    info!("optimisation has converged");
                }
                break;
            }
            if iter == self.config.optim_maxiter - 1 {
                if rank == MASTER {
                    info!("max. optimisation iterations reached");
                }
                break;
            }

            // descent direction and trial step on the coordinator
            stepsize = self.config.stepsize_init;
            let mut wolfe = 0.0;
            if let Some(hessian) = self.hessian.as_mut() {
                hessian.update_memory(iter, &self.design, &self.design0, &self.gradient, &self.gradient0)?;
                hessian.compute_descent_dir(iter, &self.gradient, &mut self.descentdir)?;
                self.design0.copy_from_slice(&self.design);
                self.gradient0.copy_from_slice(&self.gradient);
                wolfe = vecdot(&self.gradient, &self.descentdir);
                for id in 0..self.ndesign_global {
                    self.design[id] -= stepsize * self.descentdir[id];
                }
            }
            let mut wolfe_buf = vec![wolfe];
            self.comm.broadcast(MASTER, &mut wolfe_buf)?;
            let wolfe = wolfe_buf[0];
            self.scatter_design()?;

            let (accepted_stepsize, trials) = {
                let comm = Rc::clone(&self.comm);
                armijo_backtrack(
                    objective.objective,
                    wolfe,
                    stepsize,
                    LS_PARAM,
                    self.config.ls_factor,
                    self.config.ls_maxiter,
                    |s, retry| {
                        if retry {
                            if comm.rank() == MASTER {
                                for id in 0..self.ndesign_global {
                                    self.design[id] += s * self.descentdir[id];
                                }
                            }
                            self.scatter_design()?;
                        }
                        let _ = self.core_train.borrow_mut().drive()?;
                        let ls_objective = eval_objective(
                            &self.core_train.borrow(),
                            &self.app_train,
                            comm.as_ref(),
                        )?;
                        Ok(ls_objective.objective)
                    },
                )?
            };
            stepsize = accepted_stepsize;
            ls_iter = trials;
        }

        // final validation pass
        if self.config.validationlevel > -1 {
            self.core_val.borrow_mut().drive()?;
            let (_, accuracy) =
                eval_classification_at_end(&self.core_val.borrow(), &self.app_val, self.comm.as_ref())?;
            summary.val_accuracy = accuracy;
            if rank == MASTER {
                info!(accuracy, "final validation");
            }
        }

        if rank == MASTER {
            write_vector(Path::new("gradient.dat"), &self.gradient)?;
        }
        Ok(summary)
    }
}

/// Backtracking Armijo line search.
///
/// `trial(stepsize, retry)` evaluates the objective at the current trial
/// design; on a retry it first moves the design back by the freshly reduced
/// step. Returns the accepted step size and the index of the accepted
/// trial. Exhausting `ls_maxiter` logs a warning and keeps the last trial.
pub fn armijo_backtrack(
    objective: f64,
    wolfe: f64,
    mut stepsize: f64,
    ls_param: f64,
    ls_factor: f64,
    ls_maxiter: usize,
    mut trial: impl FnMut(f64, bool) -> PintResult<f64>,
) -> PintResult<(f64, usize)> {
    for trial_idx in 0..ls_maxiter {
        let ls_objective = trial(stepsize, trial_idx > 0)?;
        let threshold = objective - ls_param * stepsize * wolfe;
        debug!(trial_idx, ls_objective, threshold, "line search trial");
        if ls_objective <= threshold {
            return Ok((stepsize, trial_idx));
        }
        if trial_idx == ls_maxiter - 1 {
            warn!("line search failed, keeping the last trial step");
            return Ok((stepsize, trial_idx));
        }
        stepsize *= ls_factor;
    }
    Ok((stepsize, 0))
}

/// Load the datasets named by the configuration and run a full training.
pub fn run_training(config: Config, comm: Rc<dyn Communicator>) -> PintResult<Summary> {
    let rank = comm.rank();
    let size = comm.size();
    let train = DataSet::load(
        &config,
        &config.ftrain_ex,
        &config.ftrain_labels,
        config.ntraining,
        rank,
        size,
    )?;
    let validation =
        DataSet::load(&config, &config.fval_ex, &config.fval_labels, config.nvalidation, rank, size)?;
    Trainer::new(config, comm, train, validation)?.run()
}
