//! The network's implementations of the driver callbacks.
//!
//! [`App`] is the application context shared by the primal, adjoint and
//! validation sweeps of one worker: the network, the worker's slice of the
//! dataset, and the rank topology. [`PrimalNet`] propagates states forward;
//! [`AdjointNet`] propagates adjoints backwards through the stored primal
//! trajectory and assembles the design gradient.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use super::driver::Core;
use super::status::{AccessStatus, StepStatus};
use super::TimeIntegrator;
use crate::dataset::DataSet;
use crate::errors::{PintError, PintResult};
use crate::layers::{Layer, HEADER_LEN};
use crate::network::Network;
use crate::state::{AdjointVector, LayerRef, StateVector};

pub struct App {
    pub rank: usize,
    pub size: usize,
    pub network: Rc<RefCell<Network>>,
    pub data: DataSet,
}

impl App {
    pub fn nexamples(&self) -> usize {
        self.data.nelements
    }

    /// Feature vector of one example; present only where the opening layer
    /// lives.
    pub fn example(&self, iex: usize) -> Option<&[f64]> {
        self.data
            .examples
            .as_ref()
            .map(|ex| ex.row(iex).to_slice().expect("contiguous example row"))
    }

    pub fn label(&self, iex: usize) -> Option<&[f64]> {
        self.data
            .labels
            .as_ref()
            .map(|l| l.row(iex).to_slice().expect("contiguous label row"))
    }
}

/// Primal sweep callbacks.
pub struct PrimalNet {
    app: Rc<App>,
}

impl PrimalNet {
    pub fn new(app: Rc<App>) -> Self {
        PrimalNet { app }
    }

    pub fn app(&self) -> &Rc<App> {
        &self.app
    }

    fn time_index(&self, t: f64) -> usize {
        (t / self.app.network.borrow().dt()).round() as usize
    }
}

impl TimeIntegrator for PrimalNet {
    type Vector = StateVector;

    fn init(&mut self, t: f64) -> PintResult<StateVector> {
        let index = self.time_index(t);
        let net = self.app.network.borrow();
        Ok(StateVector::zeroed(self.app.nexamples(), net.nchannels(), LayerRef::Stored(index)))
    }

    fn clone_vector(&self, u: &StateVector) -> StateVector {
        u.clone()
    }

    fn sum(&self, alpha: f64, x: &StateVector, beta: f64, y: &mut StateVector) {
        ndarray::Zip::from(&mut y.state).and(&x.state).for_each(|y, &x| {
            *y = alpha * x + beta * *y;
        });
    }

    fn spatial_norm(&self, u: &StateVector) -> f64 {
        let dot: f64 = u.state.iter().map(|v| v * v).sum();
        dot.sqrt() / u.nexamples() as f64
    }

    fn step(&mut self, u: &mut StateVector, status: &StepStatus) -> PintResult<()> {
        let deltat = status.t_stop - status.t_start;
        let p_stop = self.time_index(status.t_stop);
        let nexamples = self.app.nexamples();

        match &mut u.layer {
            LayerRef::Stored(index) => {
                let index = *index;
                let mut net = self.app.network.borrow_mut();
                for iex in 0..nexamples {
                    let example = self.app.example(iex);
                    let mut row = u.state.row_mut(iex);
                    let state = row.as_slice_mut().expect("contiguous state row");
                    net.step_layer(index, deltat, example, state)?;
                }
            }
            LayerRef::Migrated(layer) => {
                layer.set_dt(deltat);
                for iex in 0..nexamples {
                    let example =
                        if layer.is_opening() { self.app.example(iex) } else { None };
                    let mut row = u.state.row_mut(iex);
                    let state = row.as_slice_mut().expect("contiguous state row");
                    layer.apply_forward(layer.owned_params(), example, state)?;
                }
            }
        }

        // A migrated layer is consumed by the step it was shipped for;
        // advancing the reference drops it and frees its design.
        u.layer = LayerRef::Stored(p_stop);
        Ok(())
    }

    fn buf_size(&self) -> usize {
        let net = self.app.network.borrow();
        (net.nchannels() * self.app.nexamples() + HEADER_LEN + net.ndesign_layermax())
            * std::mem::size_of::<f64>()
    }

    fn buf_pack(&self, u: &StateVector, buf: &mut Vec<f64>) -> PintResult<()> {
        for iex in 0..u.nexamples() {
            buf.extend_from_slice(u.row_slice(iex));
        }
        let net = self.app.network.borrow();
        match &u.layer {
            LayerRef::Stored(index) => {
                let layer = net.get_layer(*index).ok_or_else(|| {
                    PintError::Comm(format!("cannot pack unknown layer {index}"))
                })?;
                layer.pack(net.params_of(layer), buf);
            }
            LayerRef::Migrated(layer) => layer.pack(layer.owned_params(), buf),
        }
        Ok(())
    }

    fn buf_unpack(&self, buf: &[f64]) -> PintResult<StateVector> {
        let net = self.app.network.borrow();
        let nchannels = net.nchannels();
        let nexamples = self.app.nexamples();
        let nstate = nexamples * nchannels;
        if buf.len() < nstate {
            return Err(PintError::Wire("state buffer truncated".into()));
        }
        let state = ndarray::Array2::from_shape_vec((nexamples, nchannels), buf[..nstate].to_vec())
            .expect("state buffer matches dimensions");
        let (layer, _) = Layer::unpack(&buf[nstate..], net.conv_shape())?;
        Ok(StateVector { state, layer: LayerRef::Migrated(Box::new(layer)) })
    }

    fn access(&mut self, u: &StateVector, status: &AccessStatus) {
        if status.done {
            debug!(t = status.t, norm = self.spatial_norm(u), "final state");
        }
    }
}

/// Adjoint sweep callbacks. The adjoint core runs with reverted rank order
/// so that adjoint time visits the workers in reverse primal order; layers
/// and primal states are fetched from the primal core by index through
/// `primal`.
pub struct AdjointNet {
    app: Rc<App>,
    primal: Rc<RefCell<Core<PrimalNet>>>,
}

impl AdjointNet {
    pub fn new(app: Rc<App>, primal: Rc<RefCell<Core<PrimalNet>>>) -> Self {
        AdjointNet { app, primal }
    }

    fn nlayers(&self) -> usize {
        self.app.network.borrow().nlayers_global()
    }

    /// Primal layer index visited at adjoint time index `ts`.
    fn primal_index(&self, ts: usize) -> usize {
        self.nlayers() - 1 - ts
    }

    /// Terminal adjoint condition, corresponding to the primal's final
    /// index: seed the adjoint with the loss derivative, run the
    /// classification layer's reverse pass, and accumulate its design
    /// gradient (bars are reset first).
    pub fn terminal_condition(&mut self) -> PintResult<AdjointVector> {
        let q = self.nlayers() - 1;
        let nexamples = self.app.nexamples();
        let primal = self.primal.borrow();
        let uprimal = primal.vector(q).ok_or_else(|| {
            PintError::Comm(format!("primal trajectory misses final index {q}"))
        })?;

        let mut net = self.app.network.borrow_mut();
        let nchannels = net.nchannels();
        let mut ubar = AdjointVector::zeroed(nexamples, nchannels);
        let loss_bar = 1.0 / nexamples as f64;
        let mut aux = vec![0.0; nchannels];

        net.reset_bar(q)?;
        for iex in 0..nexamples {
            let label = self.app.label(iex).ok_or_else(|| {
                PintError::Dataset("labels missing on the classification worker".into())
            })?;

            // Recompute the classification output on a scratch copy; the
            // stored final state is still needed by the reverse pass.
            aux.copy_from_slice(uprimal.row_slice(iex));
            net.step_layer(q, 1.0, None, &mut aux)?;

            let mut row = ubar.state.row_mut(iex);
            let ubar_row = row.as_slice_mut().expect("contiguous adjoint row");
            {
                let layer = net.get_layer(q).expect("classification layer is owned");
                layer.eval_loss_diff(&aux, ubar_row, label, loss_bar);
            }
            net.backward_layer(q, 1.0, true, None, uprimal.row_slice(iex), ubar_row)?;
        }
        net.tikh_diff(q, 1.0)?;
        Ok(ubar)
    }
}

impl TimeIntegrator for AdjointNet {
    type Vector = AdjointVector;

    fn init(&mut self, t: f64) -> PintResult<AdjointVector> {
        if t == 0.0 {
            return self.terminal_condition();
        }
        let net = self.app.network.borrow();
        Ok(AdjointVector::zeroed(self.app.nexamples(), net.nchannels()))
    }

    fn clone_vector(&self, u: &AdjointVector) -> AdjointVector {
        u.clone()
    }

    fn sum(&self, alpha: f64, x: &AdjointVector, beta: f64, y: &mut AdjointVector) {
        ndarray::Zip::from(&mut y.state).and(&x.state).for_each(|y, &x| {
            *y = alpha * x + beta * *y;
        });
    }

    fn spatial_norm(&self, u: &AdjointVector) -> f64 {
        let dot: f64 = u.state.iter().map(|v| v * v).sum();
        dot.sqrt() / u.state.nrows() as f64
    }

    fn step(&mut self, u: &mut AdjointVector, status: &StepStatus) -> PintResult<()> {
        let deltat = status.t_stop - status.t_start;
        let dt_fine = self.app.network.borrow().dt();
        let ts_stop = (status.t_stop / dt_fine).round() as usize;
        let q = self.primal_index(ts_stop);
        let compute_gradient = status.is_finest();
        let nexamples = self.app.nexamples();

        let primal = self.primal.borrow();
        let uprimal = primal.vector(q).ok_or_else(|| {
            PintError::Comm(format!("primal trajectory misses index {q}"))
        })?;

        let mut net = self.app.network.borrow_mut();
        if compute_gradient {
            net.reset_bar(q)?;
        }
        for iex in 0..nexamples {
            let example = self.app.example(iex);
            let mut row = u.state.row_mut(iex);
            let ubar_row = row.as_slice_mut().expect("contiguous adjoint row");
            net.backward_layer(
                q,
                deltat,
                compute_gradient,
                example,
                uprimal.row_slice(iex),
                ubar_row,
            )?;
        }
        if compute_gradient {
            net.tikh_diff(q, 1.0)?;
            net.ddt_diff(q, 1.0)?;
        }
        Ok(())
    }

    fn buf_size(&self) -> usize {
        let net = self.app.network.borrow();
        net.nchannels() * self.app.nexamples() * std::mem::size_of::<f64>()
    }

    fn buf_pack(&self, u: &AdjointVector, buf: &mut Vec<f64>) -> PintResult<()> {
        for row in u.state.rows() {
            buf.extend_from_slice(row.to_slice().expect("contiguous adjoint row"));
        }
        Ok(())
    }

    fn buf_unpack(&self, buf: &[f64]) -> PintResult<AdjointVector> {
        let net = self.app.network.borrow();
        let nchannels = net.nchannels();
        let nexamples = self.app.nexamples();
        if buf.len() != nexamples * nchannels {
            return Err(PintError::Wire(format!(
                "adjoint buffer holds {} reals, expected {}",
                buf.len(),
                nexamples * nchannels
            )));
        }
        let state = ndarray::Array2::from_shape_vec((nexamples, nchannels), buf.to_vec())
            .expect("adjoint buffer matches dimensions");
        Ok(AdjointVector { state })
    }
}
