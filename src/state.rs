//! State vectors carried through the time integrator.

use ndarray::Array2;

use crate::layers::Layer;

/// Which layer a state vector is bound to at its current time index.
///
/// `Stored` points at a layer held by the worker's network (owned or
/// ghost). `Migrated` carries a layer that arrived over the wire together
/// with the state; it owns its design and is dropped as soon as the next
/// step has consumed it. The variant itself is the send-flag.
#[derive(Debug, Clone)]
pub enum LayerRef {
    Stored(usize),
    Migrated(Box<Layer>),
}

impl LayerRef {
    pub fn index(&self) -> usize {
        match self {
            LayerRef::Stored(index) => *index,
            LayerRef::Migrated(layer) => layer.index(),
        }
    }

    pub fn is_migrated(&self) -> bool {
        matches!(self, LayerRef::Migrated(_))
    }
}

/// The object flowing through the primal integrator at one time index:
/// per-example channel activations plus the layer active at that time.
#[derive(Debug, Clone)]
pub struct StateVector {
    pub state: Array2<f64>,
    pub layer: LayerRef,
}

impl StateVector {
    pub fn zeroed(nexamples: usize, nchannels: usize, layer: LayerRef) -> Self {
        StateVector { state: Array2::zeros((nexamples, nchannels)), layer }
    }

    pub fn nexamples(&self) -> usize {
        self.state.nrows()
    }

    pub fn row_slice(&self, iex: usize) -> &[f64] {
        self.state.row(iex).to_slice().expect("contiguous state row")
    }
}

/// Adjoint-sweep carrier: only the state adjoint travels; layers used in
/// the adjoint are always fetched from the primal trajectory.
#[derive(Debug, Clone)]
pub struct AdjointVector {
    pub state: Array2<f64>,
}

impl AdjointVector {
    pub fn zeroed(nexamples: usize, nchannels: usize) -> Self {
        AdjointVector { state: Array2::zeros((nexamples, nchannels)) }
    }
}
