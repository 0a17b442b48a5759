//! Layer-parallel training of residual networks.
//!
//! The forward pass of a residual network is treated as a time-discretised
//! dynamical system; layer evaluations are distributed across workers along
//! the time axis and both the primal and the adjoint solve run as
//! parallel-in-time sweeps under a multigrid-reduction-in-time driver. The
//! outer loop performs quasi-Newton updates with an Armijo line search.

pub mod activation;
pub mod comm;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod hessian;
pub mod layers;
pub mod linalg;
pub mod network;
pub mod objective;
pub mod optim;
pub mod pint;
pub mod state;

pub use config::Config;
pub use errors::{PintError, PintResult};
pub use network::Network;
pub use optim::{run_training, Summary, Trainer};
