//! The time-distributed network: a contiguous slab of layers per worker.
//!
//! Each worker owns the layers whose index falls in `[start_id, end_id]`,
//! one flat design buffer and one equally shaped gradient buffer. Owned
//! layers alias slices of those buffers through their offsets; ghost copies
//! of the neighbours' boundary layers own private storage and are refreshed
//! at the start of every optimisation iteration.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::comm::{Communicator, Tag};
use crate::config::{Config, NetworkType, OpenLayerType};
use crate::dataset::read_vector;
use crate::errors::{PintError, PintResult};
use crate::layers::{BarsMut, Layer, ParamStore, Params};

/// Kernel side length of the depthwise convolutions.
pub const CONV_KSIZE: usize = 3;

pub struct Network {
    nlayers_global: usize,
    start_id: usize,
    end_id: usize,
    nchannels: usize,
    dt: f64,
    gamma_ddt: f64,
    ndesign_local: usize,
    ndesign_layermax: usize,
    conv_shape: Option<(usize, usize)>,
    design: Vec<f64>,
    gradient: Vec<f64>,
    layers: Vec<Layer>,
    layer_left: Option<Layer>,
    layer_right: Option<Layer>,
}

impl Network {
    pub fn new(start_id: usize, end_id: usize, config: &Config) -> PintResult<Network> {
        debug_assert!(start_id <= end_id && end_id < config.nlayers);
        let dt = config.dt();
        let conv_shape = match config.network_type {
            NetworkType::Convolutional => {
                Some((CONV_KSIZE, config.nchannels / config.nfeatures))
            }
            NetworkType::Dense => None,
        };

        let mut layers = Vec::with_capacity(end_id - start_id + 1);
        let mut ndesign_local = 0;
        for index in start_id..=end_id {
            let mut layer = create_layer(index, config, dt);
            layer.set_offset(ndesign_local);
            ndesign_local += layer.ndesign();
            layers.push(layer);
        }

        let ndesign_layermax = (0..config.nlayers)
            .map(|index| create_layer(index, config, dt).ndesign())
            .max()
            .unwrap_or(0);

        Ok(Network {
            nlayers_global: config.nlayers,
            start_id,
            end_id,
            nchannels: config.nchannels,
            dt,
            gamma_ddt: config.gamma_ddt,
            ndesign_local,
            ndesign_layermax,
            conv_shape,
            design: vec![0.0; ndesign_local],
            gradient: vec![0.0; ndesign_local],
            layers,
            layer_left: None,
            layer_right: None,
        })
    }

    pub fn nlayers_global(&self) -> usize {
        self.nlayers_global
    }

    pub fn nchannels(&self) -> usize {
        self.nchannels
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn start_id(&self) -> usize {
        self.start_id
    }

    pub fn end_id(&self) -> usize {
        self.end_id
    }

    pub fn ndesign_local(&self) -> usize {
        self.ndesign_local
    }

    /// Largest per-layer design count across the whole network; sizes the
    /// migration buffer.
    pub fn ndesign_layermax(&self) -> usize {
        self.ndesign_layermax
    }

    pub fn conv_shape(&self) -> Option<(usize, usize)> {
        self.conv_shape
    }

    pub fn design(&self) -> &[f64] {
        &self.design
    }

    pub fn design_mut(&mut self) -> &mut [f64] {
        &mut self.design
    }

    pub fn gradient(&self) -> &[f64] {
        &self.gradient
    }

    pub fn gradient_mut(&mut self) -> &mut [f64] {
        &mut self.gradient
    }

    pub fn owns(&self, index: usize) -> bool {
        (self.start_id..=self.end_id).contains(&index)
    }

    fn local_id(&self, index: usize) -> PintResult<usize> {
        if self.owns(index) {
            Ok(index - self.start_id)
        } else {
            Err(PintError::Dimension {
                expected: format!("layer index in [{}, {}]", self.start_id, self.end_id),
                found: index.to_string(),
            })
        }
    }

    pub fn is_hidden(&self, index: usize) -> bool {
        index >= 1 && index + 1 < self.nlayers_global
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer_left(&self) -> Option<&Layer> {
        self.layer_left.as_ref()
    }

    pub fn layer_right(&self) -> Option<&Layer> {
        self.layer_right.as_ref()
    }

    /// An owned layer, a ghost copy, or nothing.
    pub fn get_layer(&self, index: usize) -> Option<&Layer> {
        if self.owns(index) {
            return self.layers.get(index - self.start_id);
        }
        if let Some(left) = &self.layer_left {
            if left.index() == index {
                return Some(left);
            }
        }
        if let Some(right) = &self.layer_right {
            if right.index() == index {
                return Some(right);
            }
        }
        None
    }

    /// Resolve the design view of a layer, aliased or owned.
    pub fn params_of<'a>(&'a self, layer: &'a Layer) -> Params<'a> {
        match layer.params {
            ParamStore::Aliased { offset } => {
                let nweights = layer.nweights();
                Params {
                    weights: &self.design[offset..offset + nweights],
                    bias: &self.design[offset + nweights..offset + layer.ndesign()],
                }
            }
            ParamStore::Owned(ref o) => Params { weights: &o.weights, bias: &o.bias },
        }
    }

    /// Fill the owned design with scaled uniform random values, overriding
    /// the opening/classification design from files where configured; zero
    /// the gradient.
    ///
    /// Each layer draws from its own stream seeded by `seed + index`, so the
    /// initial design does not depend on the worker partition.
    pub fn initialize(&mut self, seed: u64, config: &Config) -> PintResult<()> {
        for layer in &self.layers {
            let factor = if layer.index() == 0 {
                config.weights_open_init
            } else if layer.index() == self.nlayers_global - 1 {
                config.weights_class_init
            } else {
                config.weights_init
            };
            let offset = layer.offset().expect("owned layers alias the design buffer");
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(layer.index() as u64));
            for d in self.design[offset..offset + layer.ndesign()].iter_mut() {
                *d = factor * rng.gen::<f64>();
            }
        }
        for g in self.gradient.iter_mut() {
            *g = 0.0;
        }

        if let Some(file) = &config.weightsopenfile {
            if self.owns(0) {
                self.read_layer_design(0, Path::new(&config.data_path(file)))?;
            }
        }
        if let Some(file) = &config.weightsclassificationfile {
            if self.owns(self.nlayers_global - 1) {
                self.read_layer_design(self.nlayers_global - 1, Path::new(&config.data_path(file)))?;
            }
        }
        Ok(())
    }

    fn read_layer_design(&mut self, index: usize, path: &Path) -> PintResult<()> {
        let lid = self.local_id(index)?;
        let layer = &self.layers[lid];
        let offset = layer.offset().expect("owned layer");
        let values = read_vector(path, layer.ndesign())?;
        self.design[offset..offset + values.len()].copy_from_slice(&values);
        Ok(())
    }

    /// Apply one forward step of the owned layer at `index` to one example.
    /// The example features are bound only for opening layers.
    pub fn step_layer(
        &mut self,
        index: usize,
        dt: f64,
        example: Option<&[f64]>,
        state: &mut [f64],
    ) -> PintResult<()> {
        let lid = self.local_id(index)?;
        self.layers[lid].set_dt(dt);
        let layer = &self.layers[lid];
        let params = self.params_of(layer);
        let example = if layer.is_opening() { example } else { None };
        layer.apply_forward(params, example, state)
    }

    /// Reverse step of the owned layer at `index`; accumulates into the
    /// layer's bar buffers only when `compute_gradient` is set.
    pub fn backward_layer(
        &mut self,
        index: usize,
        dt: f64,
        compute_gradient: bool,
        example: Option<&[f64]>,
        state: &[f64],
        state_bar: &mut [f64],
    ) -> PintResult<()> {
        let lid = self.local_id(index)?;
        self.layers[lid].set_dt(dt);
        let Network { layers, design, gradient, .. } = self;
        let layer = &layers[lid];
        match layer.params {
            ParamStore::Aliased { offset } => {
                let nweights = layer.nweights();
                let params = Params {
                    weights: &design[offset..offset + nweights],
                    bias: &design[offset + nweights..offset + layer.ndesign()],
                };
                let bars = if compute_gradient {
                    let slice = &mut gradient[offset..offset + layer.ndesign()];
                    let (weights, bias) = slice.split_at_mut(nweights);
                    Some(BarsMut { weights, bias })
                } else {
                    None
                };
                layer.apply_backward(params, bars, example, state, state_bar)
            }
            ParamStore::Owned(_) => Err(PintError::Dimension {
                expected: "owned layers alias the network buffers".into(),
                found: format!("privately stored layer {index}"),
            }),
        }
    }

    /// Zero the bar buffers of the owned layer at `index`.
    pub fn reset_bar(&mut self, index: usize) -> PintResult<()> {
        let lid = self.local_id(index)?;
        let layer = &self.layers[lid];
        let offset = layer.offset().expect("owned layer");
        for g in self.gradient[offset..offset + layer.ndesign()].iter_mut() {
            *g = 0.0;
        }
        Ok(())
    }

    /// Accumulate the Tikhonov derivative of the owned layer at `index`.
    pub fn tikh_diff(&mut self, index: usize, regul_bar: f64) -> PintResult<()> {
        let lid = self.local_id(index)?;
        let Network { layers, design, gradient, .. } = self;
        let layer = &layers[lid];
        let offset = layer.offset().expect("owned layer");
        let nweights = layer.nweights();
        let params = Params {
            weights: &design[offset..offset + nweights],
            bias: &design[offset + nweights..offset + layer.ndesign()],
        };
        let slice = &mut gradient[offset..offset + layer.ndesign()];
        let (weights, bias) = slice.split_at_mut(nweights);
        layer.eval_tikh_diff(params, BarsMut { weights, bias }, regul_bar);
        Ok(())
    }

    /// Time-derivative regularisation of one adjacent pair of hidden layers:
    /// `gamma_ddt/2 * sum(((curr - prev)/dt)^2)` over weights and bias.
    pub fn eval_regul_ddt(&self, prev: &Layer, curr: &Layer) -> PintResult<f64> {
        self.check_hidden_shape(prev)?;
        self.check_hidden_shape(curr)?;
        let pw = self.params_of(prev);
        let cw = self.params_of(curr);
        let mut ddt = 0.0;
        for (c, p) in cw.weights.iter().zip(pw.weights) {
            let diff = (c - p) / self.dt;
            ddt += diff * diff;
        }
        let diff = (cw.bias[0] - pw.bias[0]) / self.dt;
        ddt += diff * diff;
        Ok(self.gamma_ddt / 2.0 * ddt)
    }

    fn check_hidden_shape(&self, layer: &Layer) -> PintResult<()> {
        if layer.dim_in() != self.nchannels
            || layer.dim_out() != self.nchannels
            || layer.dim_bias() != 1
        {
            return Err(PintError::Dimension {
                expected: format!("hidden layer of width {}", self.nchannels),
                found: format!(
                    "layer {} with dims {}x{}, bias {}",
                    layer.index(),
                    layer.dim_in(),
                    layer.dim_out(),
                    layer.dim_bias()
                ),
            });
        }
        Ok(())
    }

    /// Accumulate the ddt-regularisation derivative belonging to the
    /// visited hidden layer at `index`: this layer's share of both adjacent
    /// pairs, written into this layer's bars only.
    ///
    /// The reverse sweep resets each layer's bars when it first visits
    /// that layer, so a visit must never write a neighbour's bars; each
    /// side of a pair is accumulated by its own visit. Neighbour weights
    /// are read from the owned slab or from a ghost copy; ghost bars are
    /// never written.
    pub fn ddt_diff(&mut self, index: usize, regul_bar: f64) -> PintResult<()> {
        if !self.is_hidden(index) {
            return Ok(());
        }
        if index > 0 && self.is_hidden(index - 1) {
            if self.owns(index - 1) {
                self.ddt_diff_into(index, index - 1, regul_bar)?;
            } else if self.layer_left.as_ref().map(|l| l.index()) == Some(index - 1) {
                self.ddt_diff_into_ghost(index, true, regul_bar)?;
            }
        }
        if self.is_hidden(index + 1) {
            if self.owns(index + 1) {
                self.ddt_diff_into(index, index + 1, regul_bar)?;
            } else if self.layer_right.as_ref().map(|l| l.index()) == Some(index + 1) {
                self.ddt_diff_into_ghost(index, false, regul_bar)?;
            }
        }
        Ok(())
    }

    /// Symmetric derivative of one pair, accumulated into both layers'
    /// bars. Requires both layers owned.
    pub fn eval_regul_ddt_diff(
        &mut self,
        prev_id: usize,
        curr_id: usize,
        regul_bar: f64,
    ) -> PintResult<()> {
        self.ddt_diff_into(curr_id, prev_id, regul_bar)?;
        self.ddt_diff_into(prev_id, curr_id, regul_bar)
    }

    /// `d/d(target) gamma/2 ((target - other)/dt)^2`, both layers owned.
    fn ddt_diff_into(&mut self, target: usize, other: usize, regul_bar: f64) -> PintResult<()> {
        let tid = self.local_id(target)?;
        let oid = self.local_id(other)?;
        self.check_hidden_shape(&self.layers[tid])?;
        self.check_hidden_shape(&self.layers[oid])?;
        let toffset = self.layers[tid].offset().expect("owned layer");
        let ooffset = self.layers[oid].offset().expect("owned layer");
        let ndesign = self.layers[tid].ndesign();
        let scale = self.gamma_ddt * regul_bar / (self.dt * self.dt);
        for i in 0..ndesign {
            self.gradient[toffset + i] +=
                scale * (self.design[toffset + i] - self.design[ooffset + i]);
        }
        Ok(())
    }

    fn ddt_diff_into_ghost(&mut self, target: usize, left: bool, regul_bar: f64) -> PintResult<()> {
        let tid = self.local_id(target)?;
        let Network { layers, design, gradient, layer_left, layer_right, dt, gamma_ddt, .. } = self;
        let ghost = if left { layer_left.as_ref() } else { layer_right.as_ref() };
        let ghost = ghost.expect("caller checked the ghost");
        let layer = &layers[tid];
        let toffset = layer.offset().expect("owned layer");
        let other = ghost.owned_params();
        let scale = *gamma_ddt * regul_bar / (*dt * *dt);
        let nweights = layer.nweights();
        for i in 0..nweights {
            gradient[toffset + i] += scale * (design[toffset + i] - other.weights[i]);
        }
        gradient[toffset + nweights] += scale * (design[toffset + nweights] - other.bias[0]);
        Ok(())
    }

    /// Exchange boundary layers with both neighbours.
    ///
    /// Every worker except the rightmost sends its rightmost layer to the
    /// right (stored there as `layer_left`); every worker except the
    /// leftmost sends its leftmost layer to the left (stored there as
    /// `layer_right`). Received ghosts own fresh design storage with zeroed
    /// bars.
    pub fn communicate_neighbours(&mut self, comm: &dyn Communicator) -> PintResult<()> {
        let rank = comm.rank();
        let size = comm.size();
        if size == 1 {
            return Ok(());
        }

        if rank + 1 < size {
            let layer = self.layers.last().expect("network owns at least one layer");
            let mut buf = Vec::with_capacity(layer.packed_len());
            layer.pack(self.params_of(layer), &mut buf);
            comm.send(rank + 1, Tag::GhostRightward, &buf)?;
        }
        if rank > 0 {
            let layer = self.layers.first().expect("network owns at least one layer");
            let mut buf = Vec::with_capacity(layer.packed_len());
            layer.pack(self.params_of(layer), &mut buf);
            comm.send(rank - 1, Tag::GhostLeftward, &buf)?;
        }

        if rank > 0 {
            let buf = comm.recv(rank - 1, Tag::GhostRightward)?;
            let (layer, _) = Layer::unpack(&buf, self.conv_shape)?;
            self.layer_left = Some(layer);
        }
        if rank + 1 < size {
            let buf = comm.recv(rank + 1, Tag::GhostLeftward)?;
            let (layer, _) = Layer::unpack(&buf, self.conv_shape)?;
            self.layer_right = Some(layer);
        }
        Ok(())
    }
}

fn create_layer(index: usize, config: &Config, dt: f64) -> Layer {
    if index == 0 {
        match config.network_type {
            NetworkType::Dense => {
                if config.weights_open_init == 0.0 {
                    Layer::open_expand_zero(config.nfeatures, config.nchannels)
                } else {
                    Layer::open_dense(
                        config.nfeatures,
                        config.nchannels,
                        config.activation,
                        config.gamma_tik,
                    )
                }
            }
            NetworkType::Convolutional => Layer::open_conv(
                config.nfeatures,
                config.nchannels,
                config.type_openlayer == OpenLayerType::Activate,
                config.activation,
            ),
        }
    } else if index < config.nlayers - 1 {
        match config.network_type {
            NetworkType::Dense => Layer::dense(
                index,
                config.nchannels,
                config.nchannels,
                dt,
                config.activation,
                config.gamma_tik,
            ),
            NetworkType::Convolutional => Layer::conv(
                index,
                config.nchannels,
                CONV_KSIZE,
                config.nchannels / config.nfeatures,
                dt,
                config.activation,
                config.gamma_tik,
            ),
        }
    } else {
        Layer::classification(index, config.nchannels, config.nclasses, config.gamma_class)
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("layers", &format!("[{}, {}]", self.start_id, self.end_id))
            .field("ndesign_local", &self.ndesign_local)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.nlayers = 5;
        config.nchannels = 3;
        config.nfeatures = 2;
        config.nclasses = 2;
        config.t_final = 3.0;
        config.activation = Activation::Tanh;
        config.weights_init = 0.1;
        config.weights_open_init = 0.01;
        config.weights_class_init = 0.01;
        config
    }

    #[test]
    fn design_buffer_spans_owned_layers() {
        let config = test_config();
        let net = Network::new(0, 4, &config).unwrap();
        assert_eq!((net.start_id(), net.end_id()), (0, 4));
        // opening (2*3+1), hidden layers 1..=3 (3*3+1 each), classification (3*2+2)
        let expected = (2 * 3 + 1) + 3 * (3 * 3 + 1) + (3 * 2 + 2);
        assert_eq!(net.ndesign_local(), expected);
    }

    #[test]
    fn initialization_is_partition_independent() {
        let config = test_config();
        let mut whole = Network::new(0, 4, &config).unwrap();
        whole.initialize(1, &config).unwrap();
        let mut part = Network::new(2, 4, &config).unwrap();
        part.initialize(1, &config).unwrap();

        let layer_whole = whole.get_layer(3).unwrap();
        let layer_part = part.get_layer(3).unwrap();
        let pw = whole.params_of(layer_whole);
        let pp = part.params_of(layer_part);
        assert_eq!(pw.weights, pp.weights);
        assert_eq!(pw.bias, pp.bias);
    }

    #[test]
    fn ddt_pair_value_matches_formula() {
        let config = test_config();
        let mut net = Network::new(0, 4, &config).unwrap();
        net.initialize(7, &config).unwrap();
        let prev = net.get_layer(1).unwrap();
        let curr = net.get_layer(2).unwrap();
        let pw: Vec<f64> = net.params_of(prev).weights.to_vec();
        let cw: Vec<f64> = net.params_of(curr).weights.to_vec();
        let pb = net.params_of(prev).bias[0];
        let cb = net.params_of(curr).bias[0];
        let dt = net.dt();
        let mut expected = 0.0;
        for (c, p) in cw.iter().zip(&pw) {
            expected += ((c - p) / dt).powi(2);
        }
        expected += ((cb - pb) / dt).powi(2);
        expected *= config.gamma_ddt / 2.0;
        let got = net.eval_regul_ddt(net.get_layer(1).unwrap(), net.get_layer(2).unwrap()).unwrap();
        approx::assert_relative_eq!(got, expected, epsilon = 1e-15);
    }

    #[test]
    fn ddt_rejects_non_hidden_shapes() {
        let config = test_config();
        let net = Network::new(0, 4, &config).unwrap();
        let opening = net.get_layer(0).unwrap();
        let hidden = net.get_layer(1).unwrap();
        assert!(net.eval_regul_ddt(opening, hidden).is_err());
    }

    #[test]
    fn symmetric_ddt_derivative_matches_finite_differences() {
        let mut config = test_config();
        config.gamma_ddt = 0.3;
        let mut net = Network::new(0, 4, &config).unwrap();
        net.initialize(3, &config).unwrap();

        net.eval_regul_ddt_diff(1, 2, 1.0).unwrap();
        let bars = net.gradient().to_vec();

        // the ddt term is quadratic, so the central difference is exact
        let eps = 1e-6;
        let offsets: Vec<(usize, usize)> = [1usize, 2]
            .iter()
            .map(|&i| {
                let layer = net.get_layer(i).unwrap();
                (layer.offset().unwrap(), layer.ndesign())
            })
            .collect();
        for (offset, ndesign) in offsets {
            for i in (0..ndesign).step_by(3) {
                net.design_mut()[offset + i] += eps;
                let plus =
                    net.eval_regul_ddt(net.get_layer(1).unwrap(), net.get_layer(2).unwrap()).unwrap();
                net.design_mut()[offset + i] -= 2.0 * eps;
                let minus =
                    net.eval_regul_ddt(net.get_layer(1).unwrap(), net.get_layer(2).unwrap()).unwrap();
                net.design_mut()[offset + i] += eps;
                let fd = (plus - minus) / (2.0 * eps);
                approx::assert_relative_eq!(bars[offset + i], fd, max_relative = 1e-6, epsilon = 1e-9);
            }
        }
    }
}
