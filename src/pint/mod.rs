//! Parallel-in-time machinery: the driver and the network's callback set.
//!
//! [`Core`] is the multigrid-reduction-in-time driver. It owns scheduling,
//! level hierarchy, relaxation and convergence, and talks to the problem
//! exclusively through the [`TimeIntegrator`] callbacks. [`PrimalNet`] and
//! [`AdjointNet`] implement those callbacks for the distributed network.

mod adapter;
mod driver;
mod grid;
mod status;

pub use adapter::{AdjointNet, App, PrimalNet};
pub use driver::{Core, CoreConfig};
pub use grid::{block_distribution, owner_of};
pub use status::{AccessStatus, StepStatus};

use crate::errors::PintResult;

/// The callback contract between the driver and the integrated system.
///
/// One implementor per sweep direction: the driver never needs to know
/// whether it is propagating states or adjoints.
pub trait TimeIntegrator {
    type Vector;

    /// Allocate and initialise the vector at time `t`.
    fn init(&mut self, t: f64) -> PintResult<Self::Vector>;

    /// Deep copy.
    fn clone_vector(&self, u: &Self::Vector) -> Self::Vector;

    /// Release a vector. The default drop is almost always right; migrated
    /// layer designs ride along and are freed with their carrier.
    fn free(&mut self, u: Self::Vector) {
        drop(u);
    }

    /// `y <- alpha * x + beta * y` elementwise on the carried state.
    fn sum(&self, alpha: f64, x: &Self::Vector, beta: f64, y: &mut Self::Vector);

    fn spatial_norm(&self, u: &Self::Vector) -> f64;

    /// Advance `u` across `[t_start, t_stop]`.
    fn step(&mut self, u: &mut Self::Vector, status: &StepStatus) -> PintResult<()>;

    /// Upper bound on the packed size, in bytes.
    fn buf_size(&self) -> usize;

    fn buf_pack(&self, u: &Self::Vector, buf: &mut Vec<f64>) -> PintResult<()>;

    fn buf_unpack(&self, buf: &[f64]) -> PintResult<Self::Vector>;

    /// Observation hook; must not mutate.
    fn access(&mut self, _u: &Self::Vector, _status: &AccessStatus) {}
}
