//! Opening layers that carry no design variables.

use super::Layer;

impl Layer {
    /// Copy the example features into the first channels, zero the rest.
    pub(super) fn open_expand_zero_forward(&self, example: &[f64], state: &mut [f64]) {
        state[..self.dim_in()].copy_from_slice(&example[..self.dim_in()]);
        for s in state[self.dim_in()..self.dim_out()].iter_mut() {
            *s = 0.0;
        }
    }

    /// Replicate the example image into every convolution channel,
    /// optionally applying the activation.
    pub(super) fn open_conv_forward(&self, example: &[f64], state: &mut [f64], activate: bool) {
        let img = self.dim_in();
        let nconv = self.dim_out() / img;
        for i in 0..nconv {
            for p in 0..img {
                let v = example[p];
                state[i * img + p] = if activate { self.activation().apply(v) } else { v };
            }
        }
    }

    /// The opening step replaces the state, so the adjoint with respect to
    /// any earlier state vanishes.
    pub(super) fn open_zero_backward(&self, state_bar: &mut [f64]) {
        for s in state_bar[..self.dim_out()].iter_mut() {
            *s = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Layer;
    use crate::activation::Activation;

    #[test]
    fn expand_zero_pads_channels() {
        let layer = Layer::open_expand_zero(2, 5);
        let mut state = [9.0; 5];
        layer
            .apply_forward(layer_params(&layer), Some(&[1.5, -2.5]), &mut state)
            .unwrap();
        assert_eq!(state, [1.5, -2.5, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn replicate_fills_every_channel_block() {
        let layer = Layer::open_conv(2, 6, false, Activation::Tanh);
        let mut state = [0.0; 6];
        layer
            .apply_forward(layer_params(&layer), Some(&[0.25, 0.75]), &mut state)
            .unwrap();
        assert_eq!(state, [0.25, 0.75, 0.25, 0.75, 0.25, 0.75]);
    }

    #[test]
    fn activated_replication_applies_sigma() {
        let layer = Layer::open_conv(1, 2, true, Activation::Tanh);
        let mut state = [0.0; 2];
        layer
            .apply_forward(layer_params(&layer), Some(&[0.5]), &mut state)
            .unwrap();
        assert_eq!(state, [0.5f64.tanh(), 0.5f64.tanh()]);
    }

    #[test]
    fn backward_clears_state_adjoint() {
        let layer = Layer::open_expand_zero(2, 4);
        let mut state_bar = [1.0, 2.0, 3.0, 4.0];
        layer
            .apply_backward(layer_params(&layer), None, Some(&[0.0, 0.0]), &[0.0; 4], &mut state_bar)
            .unwrap();
        assert_eq!(state_bar, [0.0; 4]);
    }

    fn layer_params(layer: &Layer) -> super::super::Params<'_> {
        debug_assert_eq!(layer.ndesign(), 0);
        super::super::Params { weights: &[], bias: &[] }
    }
}
