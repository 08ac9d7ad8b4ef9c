//! Dense neural components: image encoder, image decoder and posterior head.
//!
//! All layers own [`ParamId`]s into a shared [`ParamStore`] and evaluate on a
//! [`Tape`] against [`BoundParams`], so one backward sweep yields gradients for
//! every component at once.

use dscm_ad::matrix::VarMatrix;
use dscm_ad::params::{BoundParams, ParamId, ParamStore};
use dscm_ad::tape::Tape;
use dscm_core::{Error, Result};
use dscm_prob::Distribution;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand_distr::{Distribution as _, Normal};

/// Negative slope of the hidden activations.
pub const LEAKY_SLOPE: f64 = 0.1;

/// Fully connected layer `y = x W + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: ParamId,
    bias: ParamId,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    /// Register `{name}.weight` (`in × out`, `N(0, 1/in)`) and `{name}.bias` (zeros).
    pub fn new(
        store: &mut ParamStore,
        name: &str,
        in_dim: usize,
        out_dim: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(Error::Validation(format!("layer '{name}' needs non-zero dimensions")));
        }
        let std = 1.0 / (in_dim as f64).sqrt();
        let init = Normal::new(0.0, std).map_err(|e| Error::Computation(e.to_string()))?;
        let w = DMatrix::from_fn(in_dim, out_dim, |_, _| init.sample(rng));
        let weight = store.register(format!("{name}.weight"), w)?;
        let bias = store.register(format!("{name}.bias"), DMatrix::zeros(1, out_dim))?;
        Ok(Self { weight, bias, in_dim, out_dim })
    }

    /// Input width.
    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    /// Output width.
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Apply to an `n × in` batch.
    pub fn forward(&self, tape: &mut Tape, params: &BoundParams, x: &VarMatrix) -> Result<VarMatrix> {
        x.matmul(tape, params.get(self.weight))?.add(tape, params.get(self.bias))
    }
}

/// Stack of linear layers with leaky-ReLU activations.
#[derive(Debug, Clone)]
pub struct DenseNet {
    layers: Vec<Linear>,
    activate_last: bool,
}

impl DenseNet {
    /// Layers `in → widths[0] → … → widths[last]`.
    pub fn new(
        store: &mut ParamStore,
        name: &str,
        in_dim: usize,
        widths: &[usize],
        activate_last: bool,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(widths.len());
        let mut d = in_dim;
        for (i, &w) in widths.iter().enumerate() {
            layers.push(Linear::new(store, &format!("{name}.{i}"), d, w, rng)?);
            d = w;
        }
        Ok(Self { layers, activate_last })
    }

    /// Output width (the input width for an empty stack).
    pub fn out_dim(&self) -> Option<usize> {
        self.layers.last().map(Linear::out_dim)
    }

    /// Apply to an `n × in` batch.
    pub fn forward(&self, tape: &mut Tape, params: &BoundParams, x: &VarMatrix) -> Result<VarMatrix> {
        let mut h = *x;
        let last = self.layers.len().saturating_sub(1);
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(tape, params, &h)?;
            if i < last || self.activate_last {
                h = h.leaky_relu(tape, LEAKY_SLOPE);
            }
        }
        Ok(h)
    }
}

/// Widths of a filter list with every stage repeated `num_convolutions` times.
pub fn stage_widths(filters: &[usize], num_convolutions: usize) -> Vec<usize> {
    filters.iter().flat_map(|&f| std::iter::repeat_n(f, num_convolutions.max(1))).collect()
}

/// Maps flattened images to a feature vector.
#[derive(Debug, Clone)]
pub struct ImageEncoder {
    net: DenseNet,
    out_dim: usize,
}

impl ImageEncoder {
    /// Encoder from `num_pixels` inputs through the given filter stages.
    pub fn new(
        store: &mut ParamStore,
        num_pixels: usize,
        filters: &[usize],
        num_convolutions: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let widths = stage_widths(filters, num_convolutions);
        let net = DenseNet::new(store, "encoder", num_pixels, &widths, true, rng)?;
        let out_dim = net
            .out_dim()
            .ok_or_else(|| Error::Validation("encoder needs at least one filter stage".to_string()))?;
        Ok(Self { net, out_dim })
    }

    /// Feature width.
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Encode an `n × pixels` batch.
    pub fn forward(&self, tape: &mut Tape, params: &BoundParams, x: &VarMatrix) -> Result<VarMatrix> {
        self.net.forward(tape, params, x)
    }
}

/// Learned 2×2 stride-2 transposed convolution on a single-channel image.
#[derive(Debug, Clone)]
pub struct UpConv {
    kernel: ParamId,
    bias: ParamId,
    height: usize,
    width: usize,
    /// Input pixel feeding each output pixel.
    source: Vec<usize>,
    /// Kernel tap applied at each output pixel.
    taps: Vec<usize>,
}

impl UpConv {
    /// Upsample `height/2 × width/2` maps to `height × width`.
    pub fn new(store: &mut ParamStore, name: &str, height: usize, width: usize) -> Result<Self> {
        if height % 2 != 0 || width % 2 != 0 || height == 0 || width == 0 {
            return Err(Error::Validation(format!(
                "upsampling needs even image sides, got {height}x{width}"
            )));
        }
        let kernel = store.register(format!("{name}.weight"), DMatrix::from_element(1, 4, 1.0))?;
        let bias = store.register(format!("{name}.bias"), DMatrix::zeros(1, 1))?;
        let half_w = width / 2;
        let (source, taps) = (0..height * width)
            .map(|p| {
                let (y, c) = (p / width, p % width);
                ((y / 2) * half_w + c / 2, (y % 2) * 2 + c % 2)
            })
            .unzip();
        Ok(Self { kernel, bias, height, width, source, taps })
    }

    /// Number of input pixels.
    pub fn in_pixels(&self) -> usize {
        (self.height / 2) * (self.width / 2)
    }

    /// `out[2i + a, 2j + b] = k[a, b] · in[i, j] + bias`
    pub fn forward(&self, tape: &mut Tape, params: &BoundParams, x: &VarMatrix) -> Result<VarMatrix> {
        if x.ncols() != self.in_pixels() {
            return Err(Error::Validation(format!(
                "upconv expects {} input pixels, got {}",
                self.in_pixels(),
                x.ncols()
            )));
        }
        let upsampled = x.select_cols(tape, &self.source)?;
        let kernel = params.get(self.kernel).select_cols(tape, &self.taps)?;
        upsampled.mul(tape, &kernel)?.add(tape, params.get(self.bias))
    }
}

/// Maps `[z, covariates]` to per-pixel locations, with a learned per-pixel log-scale.
#[derive(Debug, Clone)]
pub struct ImageDecoder {
    net: DenseNet,
    upconv: Option<UpConv>,
    logstd: ParamId,
}

impl ImageDecoder {
    /// Decoder for `height × width` images from `in_dim` inputs.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &mut ParamStore,
        in_dim: usize,
        height: usize,
        width: usize,
        filters: &[usize],
        num_convolutions: usize,
        use_upconv: bool,
        logstd_init: f64,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let num_pixels = height * width;
        let upconv = if use_upconv { Some(UpConv::new(store, "decoder.upconv", height, width)?) } else { None };
        let out = upconv.as_ref().map_or(num_pixels, UpConv::in_pixels);
        let mut widths = stage_widths(filters, num_convolutions);
        widths.push(out);
        let net = DenseNet::new(store, "decoder", in_dim, &widths, false, rng)?;
        let logstd = store.register("decoder.logstd", DMatrix::from_element(1, num_pixels, logstd_init))?;
        Ok(Self { net, upconv, logstd })
    }

    /// Per-pixel locations for an `n × in_dim` batch.
    pub fn forward(&self, tape: &mut Tape, params: &BoundParams, h: &VarMatrix) -> Result<VarMatrix> {
        let out = self.net.forward(tape, params, h)?;
        match &self.upconv {
            Some(up) => up.forward(tape, params, &out),
            None => Ok(out),
        }
    }

    /// Per-pixel scale `exp(logstd)`, `1 × pixels`.
    pub fn scale(&self, tape: &mut Tape, params: &BoundParams) -> VarMatrix {
        params.get(self.logstd).exp(tape)
    }
}

/// Diagonal Gaussian head: `Normal(loc(h), softplus(raw(h)))`.
#[derive(Debug, Clone)]
pub struct IndependentNormalHead {
    loc: Linear,
    scale: Linear,
}

impl IndependentNormalHead {
    /// Head from `in_dim` features to a `out_dim`-dimensional Gaussian.
    pub fn new(
        store: &mut ParamStore,
        name: &str,
        in_dim: usize,
        out_dim: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        Ok(Self {
            loc: Linear::new(store, &format!("{name}.loc"), in_dim, out_dim, rng)?,
            scale: Linear::new(store, &format!("{name}.scale"), in_dim, out_dim, rng)?,
        })
    }

    /// Distribution for an `n × in_dim` batch.
    pub fn forward(&self, tape: &mut Tape, params: &BoundParams, h: &VarMatrix) -> Result<Distribution> {
        let loc = self.loc.forward(tape, params, h)?;
        let scale = self.scale.forward(tape, params, h)?.softplus(tape);
        Distribution::normal(loc, scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[test]
    fn test_stage_widths_repeat() {
        assert_eq!(stage_widths(&[16, 32], 3), vec![16, 16, 16, 32, 32, 32]);
        assert_eq!(stage_widths(&[8], 0), vec![8]);
    }

    #[test]
    fn test_linear_registers_named_params() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(42);
        let l = Linear::new(&mut store, "latent_layer", 3, 2, &mut rng).unwrap();
        assert_eq!(store.names(), vec!["latent_layer.weight", "latent_layer.bias"]);
        assert_eq!((l.in_dim(), l.out_dim()), (3, 2));

        let mut tape = Tape::new();
        let bound = store.bind(&mut tape);
        let x = VarMatrix::constant(&mut tape, &DMatrix::from_element(4, 3, 1.0));
        let y = l.forward(&mut tape, &bound, &x).unwrap();
        assert_eq!(y.shape(), (4, 2));
        let w = store.value(store.id_of("latent_layer.weight").unwrap());
        assert_relative_eq!(y.value(&tape)[(0, 1)], w.column(1).sum(), epsilon = 1e-12);
    }

    #[test]
    fn test_upconv_places_kernel_taps() {
        let mut store = ParamStore::new();
        let up = UpConv::new(&mut store, "up", 2, 4).unwrap();
        let k = store.id_of("up.weight").unwrap();
        *store.value_mut(k) = DMatrix::from_row_slice(1, 4, &[1.0, 2.0, 3.0, 4.0]);
        let mut tape = Tape::new();
        let bound = store.bind(&mut tape);
        let x = VarMatrix::constant(&mut tape, &DMatrix::from_row_slice(1, 2, &[10.0, 100.0]));
        let y = up.forward(&mut tape, &bound, &x).unwrap().value(&tape);
        let expected = DMatrix::from_row_slice(
            1,
            8,
            &[10.0, 20.0, 100.0, 200.0, 30.0, 40.0, 300.0, 400.0],
        );
        assert_eq!(y, expected);
        assert!(UpConv::new(&mut store, "odd", 3, 4).is_err());
    }

    #[test]
    fn test_decoder_shapes_with_and_without_upconv() {
        for use_upconv in [false, true] {
            let mut store = ParamStore::new();
            let mut rng = StdRng::seed_from_u64(7);
            let dec = ImageDecoder::new(&mut store, 5, 4, 4, &[6, 3], 1, use_upconv, -5.0, &mut rng).unwrap();
            let mut tape = Tape::new();
            let bound = store.bind(&mut tape);
            let h = VarMatrix::constant(&mut tape, &DMatrix::from_element(2, 5, 0.3));
            assert_eq!(dec.forward(&mut tape, &bound, &h).unwrap().shape(), (2, 16));
            let scale = dec.scale(&mut tape, &bound);
            assert_eq!(scale.shape(), (1, 16));
            assert_relative_eq!(scale.value(&tape)[(0, 0)], (-5.0_f64).exp(), epsilon = 1e-15);
        }
    }

    #[test]
    fn test_normal_head_scale_positive() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(1);
        let head = IndependentNormalHead::new(&mut store, "latent", 4, 3, &mut rng).unwrap();
        let mut tape = Tape::new();
        let bound = store.bind(&mut tape);
        let h = VarMatrix::constant(&mut tape, &DMatrix::from_element(2, 4, -3.0));
        match head.forward(&mut tape, &bound, &h).unwrap() {
            Distribution::Normal { scale, .. } => {
                assert!(scale.value(&tape).iter().all(|&s| s > 0.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
