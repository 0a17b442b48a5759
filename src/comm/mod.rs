//! Message-passing runtime used between workers.
//!
//! The trait mirrors the collective surface the training loop needs: rank,
//! size, tagged point-to-point transfers, broadcast, 1-D scatter/gather and
//! an all-reduce sum. Backends: [`SingleComm`] for one worker and the
//! crossbeam channel mesh in [`channel`] for in-process worker pools.

pub mod channel;

pub use channel::{mesh, ChannelComm};

use crate::errors::{PintError, PintResult};

/// Message tags; every transfer carries one and receivers assert pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    GhostRightward,
    GhostLeftward,
    Halo,
    Collective,
}

pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn send(&self, dest: usize, tag: Tag, data: &[f64]) -> PintResult<()>;
    fn recv(&self, src: usize, tag: Tag) -> PintResult<Vec<f64>>;

    /// Broadcast `data` from `root` to every rank.
    fn broadcast(&self, root: usize, data: &mut Vec<f64>) -> PintResult<()>;

    /// Scatter contiguous slices of `send` (root only) according to
    /// `counts`; every rank receives its own slice.
    fn scatterv(&self, root: usize, send: Option<&[f64]>, counts: &[usize]) -> PintResult<Vec<f64>>;

    /// Gather each rank's `data` onto `root` in rank order.
    fn gatherv(&self, root: usize, data: &[f64]) -> PintResult<Option<Vec<f64>>>;

    fn allreduce_sum(&self, x: f64) -> PintResult<f64>;
}

/// Trivial communicator for a single worker.
pub struct SingleComm;

impl Communicator for SingleComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, dest: usize, _tag: Tag, _data: &[f64]) -> PintResult<()> {
        Err(PintError::Comm(format!("send to rank {dest} with a single worker")))
    }

    fn recv(&self, src: usize, _tag: Tag) -> PintResult<Vec<f64>> {
        Err(PintError::Comm(format!("recv from rank {src} with a single worker")))
    }

    fn broadcast(&self, _root: usize, _data: &mut Vec<f64>) -> PintResult<()> {
        Ok(())
    }

    fn scatterv(&self, _root: usize, send: Option<&[f64]>, counts: &[usize]) -> PintResult<Vec<f64>> {
        let send = send.ok_or_else(|| PintError::Comm("scatter without send buffer".into()))?;
        debug_assert_eq!(counts.len(), 1);
        Ok(send.to_vec())
    }

    fn gatherv(&self, _root: usize, data: &[f64]) -> PintResult<Option<Vec<f64>>> {
        Ok(Some(data.to_vec()))
    }

    fn allreduce_sum(&self, x: f64) -> PintResult<f64> {
        Ok(x)
    }
}
