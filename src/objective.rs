//! Objective assembly after a primal sweep.

use crate::comm::Communicator;
use crate::errors::{PintError, PintResult};
use crate::pint::{App, Core, PrimalNet};

/// Reduced scalars of one primal sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct Objective {
    /// `loss + tikhonov + ddt`, summed over all workers.
    pub objective: f64,
    pub loss: f64,
    /// Training accuracy in percent.
    pub accuracy: f64,
}

/// Walk the locally stored time steps, sum the regularisation terms and the
/// classification loss at the final time, and reduce across workers.
pub fn eval_objective(
    core: &Core<PrimalNet>,
    app: &App,
    comm: &dyn Communicator,
) -> PintResult<Objective> {
    let net = app.network.borrow();
    let final_index = net.nlayers_global() - 1;

    let mut tikh = 0.0;
    let mut ddt = 0.0;
    for layer in net.layers() {
        tikh += layer.eval_tikh(net.params_of(layer));

        // time-derivative regularisation of the pair ending at this layer;
        // the boundary pair reads the left ghost
        let index = layer.index();
        if index > 0 && net.is_hidden(index) && net.is_hidden(index - 1) {
            if let Some(prev) = net.get_layer(index - 1) {
                ddt += net.eval_regul_ddt(prev, layer)?;
            }
        }
    }

    let (mut loss, mut accuracy) = (0.0, 0.0);
    if net.owns(final_index) {
        let u = core.vector(final_index).ok_or_else(|| {
            PintError::Comm(format!("final state {final_index} missing from the trajectory"))
        })?;
        let labels = app.data.labels.as_ref().ok_or_else(|| {
            PintError::Dataset("labels missing on the classification worker".into())
        })?;
        let layer = net.get_layer(final_index).expect("classification layer is owned");
        let (l, a) = layer.eval_classification(net.params_of(layer), u.state.view(), labels.view());
        loss = l;
        accuracy = a;
    }

    let objective = comm.allreduce_sum(loss + tikh + ddt)?;
    let loss = comm.allreduce_sum(loss)?;
    let accuracy = comm.allreduce_sum(accuracy)?;
    Ok(Objective { objective, loss, accuracy })
}

/// Classification loss/accuracy of the final state only (validation sweeps).
pub fn eval_classification_at_end(
    core: &Core<PrimalNet>,
    app: &App,
    comm: &dyn Communicator,
) -> PintResult<(f64, f64)> {
    let net = app.network.borrow();
    let final_index = net.nlayers_global() - 1;
    let (mut loss, mut accuracy) = (0.0, 0.0);
    if net.owns(final_index) {
        let u = core.vector(final_index).ok_or_else(|| {
            PintError::Comm(format!("final state {final_index} missing from the trajectory"))
        })?;
        let labels = app.data.labels.as_ref().ok_or_else(|| {
            PintError::Dataset("labels missing on the classification worker".into())
        })?;
        let layer = net.get_layer(final_index).expect("classification layer is owned");
        let (l, a) = layer.eval_classification(net.params_of(layer), u.state.view(), labels.view());
        loss = l;
        accuracy = a;
    }
    Ok((comm.allreduce_sum(loss)?, comm.allreduce_sum(accuracy)?))
}
