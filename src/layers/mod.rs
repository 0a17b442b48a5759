//! Time-step operators of the residual network.
//!
//! A [`Layer`] is one discrete time step: it holds the step's design
//! (weights and bias), applies the forward update, applies the reverse-mode
//! update, and contributes to the regularisation terms. The concrete update
//! rule is selected by [`LayerKind`], which is also the discriminant of the
//! migration wire header.

mod classification;
mod conv;
mod dense;
mod opening;

use crate::activation::Activation;
use crate::errors::{PintError, PintResult};

/// Number of reals in the serialised layer header:
/// `{kind, index, dim_in, dim_out, dim_bias, activation, n_design, gamma}`.
pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Opening layer that copies the example features and zero-pads the
    /// remaining channels. Carries no design variables.
    OpenExpandZero,
    /// Opening layer `y = sigma(W x + b)` lifting features to channels.
    OpenDense,
    /// Hidden residual step `y += dt * sigma(W y + b)`.
    Dense,
    /// Hidden residual step with a depthwise `csize x csize` convolution
    /// over `nconv` image channels in place of the dense weight matrix.
    Conv { csize: usize, nconv: usize },
    /// Final layer producing class logits, shifted by their maximum.
    Classification,
    /// Opening layer for convolutional nets: replicate the example image
    /// into every convolution channel.
    OpenConvReplicate,
    /// Replicating opening layer followed by the activation.
    OpenConvActivate,
}

impl LayerKind {
    pub fn code(self) -> f64 {
        match self {
            LayerKind::OpenExpandZero => 0.0,
            LayerKind::OpenDense => 1.0,
            LayerKind::Dense => 2.0,
            LayerKind::Conv { .. } => 3.0,
            LayerKind::Classification => 4.0,
            LayerKind::OpenConvReplicate => 5.0,
            LayerKind::OpenConvActivate => 6.0,
        }
    }

    pub fn is_opening(self) -> bool {
        matches!(
            self,
            LayerKind::OpenExpandZero
                | LayerKind::OpenDense
                | LayerKind::OpenConvReplicate
                | LayerKind::OpenConvActivate
        )
    }
}

/// Where a layer's design lives.
///
/// Owned layers of a network alias slices of the network-wide design and
/// gradient buffers; ghost and migrated copies own their storage and drop
/// it with the layer.
#[derive(Debug, Clone)]
pub enum ParamStore {
    Aliased { offset: usize },
    Owned(OwnedParams),
}

#[derive(Debug, Clone, Default)]
pub struct OwnedParams {
    pub weights: Vec<f64>,
    pub bias: Vec<f64>,
    pub weights_bar: Vec<f64>,
    pub bias_bar: Vec<f64>,
}

/// Borrowed view of a layer's design.
#[derive(Clone, Copy)]
pub struct Params<'a> {
    pub weights: &'a [f64],
    pub bias: &'a [f64],
}

/// Mutable view of a layer's adjoint (bar) buffers.
pub struct BarsMut<'a> {
    pub weights: &'a mut [f64],
    pub bias: &'a mut [f64],
}

#[derive(Debug, Clone)]
pub struct Layer {
    kind: LayerKind,
    index: usize,
    dim_in: usize,
    dim_out: usize,
    dim_bias: usize,
    ndesign: usize,
    activation: Activation,
    dt: f64,
    gamma: f64,
    pub(crate) params: ParamStore,
}

impl Layer {
    fn new(
        kind: LayerKind,
        index: usize,
        dim_in: usize,
        dim_out: usize,
        dim_bias: usize,
        ndesign: usize,
        activation: Activation,
        dt: f64,
        gamma: f64,
    ) -> Self {
        Layer {
            kind,
            index,
            dim_in,
            dim_out,
            dim_bias,
            ndesign,
            activation,
            dt,
            gamma,
            params: ParamStore::Aliased { offset: 0 },
        }
    }

    pub fn open_expand_zero(dim_in: usize, dim_out: usize) -> Self {
        Layer::new(LayerKind::OpenExpandZero, 0, dim_in, dim_out, 0, 0, Activation::Tanh, 1.0, 0.0)
    }

    pub fn open_dense(dim_in: usize, dim_out: usize, activation: Activation, gamma: f64) -> Self {
        let ndesign = dim_in * dim_out + 1;
        Layer::new(LayerKind::OpenDense, 0, dim_in, dim_out, 1, ndesign, activation, 1.0, gamma)
    }

    pub fn open_conv(dim_in: usize, dim_out: usize, activate: bool, activation: Activation) -> Self {
        let kind = if activate { LayerKind::OpenConvActivate } else { LayerKind::OpenConvReplicate };
        Layer::new(kind, 0, dim_in, dim_out, 0, 0, activation, 1.0, 0.0)
    }

    pub fn dense(
        index: usize,
        dim_in: usize,
        dim_out: usize,
        dt: f64,
        activation: Activation,
        gamma: f64,
    ) -> Self {
        let ndesign = dim_in * dim_out + 1;
        Layer::new(LayerKind::Dense, index, dim_in, dim_out, 1, ndesign, activation, dt, gamma)
    }

    pub fn conv(
        index: usize,
        dim: usize,
        csize: usize,
        nconv: usize,
        dt: f64,
        activation: Activation,
        gamma: f64,
    ) -> Self {
        let ndesign = csize * csize * nconv + 1;
        Layer::new(
            LayerKind::Conv { csize, nconv },
            index,
            dim,
            dim,
            1,
            ndesign,
            activation,
            dt,
            gamma,
        )
    }

    pub fn classification(index: usize, dim_in: usize, dim_out: usize, gamma: f64) -> Self {
        debug_assert!(dim_in >= dim_out, "classification layer needs dim_in >= dim_out");
        let ndesign = dim_in * dim_out + dim_out;
        Layer::new(
            LayerKind::Classification,
            index,
            dim_in,
            dim_out,
            dim_out,
            ndesign,
            Activation::Tanh,
            1.0,
            gamma,
        )
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    pub fn dim_out(&self) -> usize {
        self.dim_out
    }

    pub fn dim_bias(&self) -> usize {
        self.dim_bias
    }

    pub fn ndesign(&self) -> usize {
        self.ndesign
    }

    pub fn nweights(&self) -> usize {
        self.ndesign - self.dim_bias
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn set_dt(&mut self, dt: f64) {
        self.dt = dt;
    }

    pub fn is_opening(&self) -> bool {
        self.kind.is_opening()
    }

    /// Offset of this layer's design inside the network buffers, if aliased.
    pub fn offset(&self) -> Option<usize> {
        match self.params {
            ParamStore::Aliased { offset } => Some(offset),
            ParamStore::Owned(_) => None,
        }
    }

    pub(crate) fn set_offset(&mut self, offset: usize) {
        self.params = ParamStore::Aliased { offset };
    }

    /// Switch the layer to privately owned, zero-initialised storage.
    pub fn make_owned(&mut self) {
        self.params = ParamStore::Owned(OwnedParams {
            weights: vec![0.0; self.nweights()],
            bias: vec![0.0; self.dim_bias],
            weights_bar: vec![0.0; self.nweights()],
            bias_bar: vec![0.0; self.dim_bias],
        });
    }

    pub fn owned(&self) -> Option<&OwnedParams> {
        match &self.params {
            ParamStore::Owned(o) => Some(o),
            ParamStore::Aliased { .. } => None,
        }
    }

    pub fn owned_mut(&mut self) -> Option<&mut OwnedParams> {
        match &mut self.params {
            ParamStore::Owned(o) => Some(o),
            ParamStore::Aliased { .. } => None,
        }
    }

    /// Design view of a layer that owns its storage (ghost or migrated).
    pub fn owned_params(&self) -> Params<'_> {
        let o = self.owned().expect("layer does not own its parameters");
        Params { weights: &o.weights, bias: &o.bias }
    }

    /// Forward propagation of one example's state at this time step.
    ///
    /// `example` must be given for opening layers and is ignored otherwise.
    pub fn apply_forward(
        &self,
        p: Params<'_>,
        example: Option<&[f64]>,
        state: &mut [f64],
    ) -> PintResult<()> {
        match self.kind {
            LayerKind::OpenExpandZero => self.open_expand_zero_forward(self.example_of(example)?, state),
            LayerKind::OpenDense => self.open_dense_forward(p, self.example_of(example)?, state),
            LayerKind::OpenConvReplicate => self.open_conv_forward(self.example_of(example)?, state, false),
            LayerKind::OpenConvActivate => self.open_conv_forward(self.example_of(example)?, state, true),
            LayerKind::Dense => self.dense_forward(p, state),
            LayerKind::Conv { csize, nconv } => self.conv_forward(p, csize, nconv, state),
            LayerKind::Classification => self.class_forward(p, state),
        }
        Ok(())
    }

    /// Reverse-mode propagation of one example.
    ///
    /// On entry `state_bar` is the adjoint with respect to the next-time
    /// state; on exit, with respect to the current-time state. `state` is the
    /// primal state at the current time. When `bars` is given, the design
    /// derivative is accumulated into it; otherwise only the state adjoint is
    /// propagated (coarse multigrid levels).
    pub fn apply_backward(
        &self,
        p: Params<'_>,
        bars: Option<BarsMut<'_>>,
        example: Option<&[f64]>,
        state: &[f64],
        state_bar: &mut [f64],
    ) -> PintResult<()> {
        match self.kind {
            LayerKind::OpenExpandZero => self.open_zero_backward(state_bar),
            LayerKind::OpenConvReplicate | LayerKind::OpenConvActivate => {
                self.open_zero_backward(state_bar)
            }
            LayerKind::OpenDense => {
                self.open_dense_backward(p, bars, self.example_of(example)?, state_bar)
            }
            LayerKind::Dense => self.dense_backward(p, bars, state, state_bar),
            LayerKind::Conv { csize, nconv } => {
                self.conv_backward(p, bars, csize, nconv, state, state_bar)
            }
            LayerKind::Classification => self.class_backward(p, bars, state, state_bar),
        }
        Ok(())
    }

    fn example_of<'a>(&self, example: Option<&'a [f64]>) -> PintResult<&'a [f64]> {
        example.ok_or_else(|| PintError::Dimension {
            expected: format!("example features for opening layer {}", self.index),
            found: "none".into(),
        })
    }

    /// Tikhonov regularisation `gamma/2 * (||W||^2 + ||b||^2)`.
    pub fn eval_tikh(&self, p: Params<'_>) -> f64 {
        let mut tik = 0.0;
        for w in p.weights {
            tik += w * w;
        }
        for b in p.bias {
            tik += b * b;
        }
        self.gamma / 2.0 * tik
    }

    /// Accumulate the Tikhonov derivative, scaled by `regul_bar`.
    pub fn eval_tikh_diff(&self, p: Params<'_>, bars: BarsMut<'_>, regul_bar: f64) {
        let scale = self.gamma * regul_bar;
        for (bb, b) in bars.bias.iter_mut().zip(p.bias) {
            *bb += b * scale;
        }
        for (wb, w) in bars.weights.iter_mut().zip(p.weights) {
            *wb += w * scale;
        }
    }

    /// Serialise the layer as header, weights, bias. Bar buffers are never
    /// migrated; they are strictly local gradient accumulators.
    pub fn pack(&self, p: Params<'_>, buf: &mut Vec<f64>) {
        buf.extend_from_slice(&self.header());
        buf.extend_from_slice(p.weights);
        buf.extend_from_slice(p.bias);
    }

    pub fn header(&self) -> [f64; HEADER_LEN] {
        [
            self.kind.code(),
            self.index as f64,
            self.dim_in as f64,
            self.dim_out as f64,
            self.dim_bias as f64,
            self.activation.code(),
            self.ndesign as f64,
            self.gamma,
        ]
    }

    pub fn packed_len(&self) -> usize {
        HEADER_LEN + self.ndesign
    }

    /// Inverse of [`Layer::pack`]. The reconstructed layer owns its design.
    ///
    /// `conv_shape` supplies the kernel geometry shared by all convolutional
    /// layers of the network; it cannot be recovered from the header alone.
    pub fn unpack(buf: &[f64], conv_shape: Option<(usize, usize)>) -> PintResult<(Layer, usize)> {
        if buf.len() < HEADER_LEN {
            return Err(PintError::Wire("layer header truncated".into()));
        }
        let index = buf[1] as usize;
        let dim_in = buf[2] as usize;
        let dim_out = buf[3] as usize;
        let dim_bias = buf[4] as usize;
        let activation = Activation::from_code(buf[5])?;
        let ndesign = buf[6] as usize;
        let gamma = buf[7];

        let mut layer = match buf[0] as i64 {
            0 => Layer::open_expand_zero(dim_in, dim_out),
            1 => Layer::open_dense(dim_in, dim_out, activation, gamma),
            2 => Layer::dense(index, dim_in, dim_out, 1.0, activation, gamma),
            3 => {
                let (csize, nconv) = conv_shape.ok_or_else(|| {
                    PintError::Wire("convolutional layer received by a dense network".into())
                })?;
                Layer::conv(index, dim_in, csize, nconv, 1.0, activation, gamma)
            }
            4 => Layer::classification(index, dim_in, dim_out, gamma),
            5 => Layer::open_conv(dim_in, dim_out, false, activation),
            6 => Layer::open_conv(dim_in, dim_out, true, activation),
            other => return Err(PintError::Wire(format!("unknown layer kind {other}"))),
        };
        if layer.ndesign != ndesign || layer.dim_bias != dim_bias {
            return Err(PintError::Wire(format!(
                "layer header inconsistent: ndesign {} vs {}, dim_bias {} vs {}",
                ndesign, layer.ndesign, dim_bias, layer.dim_bias
            )));
        }

        let consumed = HEADER_LEN + ndesign;
        if buf.len() < consumed {
            return Err(PintError::Wire("layer design truncated".into()));
        }
        layer.make_owned();
        let nweights = layer.nweights();
        let owned = layer.owned_mut().expect("just allocated");
        owned.weights.copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + nweights]);
        owned.bias.copy_from_slice(&buf[HEADER_LEN + nweights..consumed]);
        Ok((layer, consumed))
    }
}
