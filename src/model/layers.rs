use ndarray::{s, Array1, Array4, ArrayView4, ArrayViewMutD, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use rayon::prelude::*;
use tracing::debug;

use super::config::Activation;
use super::context::ComputeContext;
use super::error::{CapsResult, CapsuleError};
use super::patches::output_size;
use super::routing::LambdaMix;

/// Trait pour toutes les couches du réseau
///
/// Les paramètres restent figés pendant `forward`; un optimiseur externe les
/// modifie entre deux passes via `named_parameters_mut`.
pub trait Layer: Send + Sync {
    fn forward(&self, ctx: &ComputeContext, input: &ArrayView4<f32>, mix: LambdaMix) -> Array4<f32>;
    fn name(&self) -> &'static str;
    fn num_parameters(&self) -> usize;
    fn named_parameters_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f32>)>;
}

/// Sigmoïde numériquement stable
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl Activation {
    pub fn apply(&self, v: f32) -> f32 {
        match *self {
            Activation::ReLU => v.max(0.0),
            Activation::LeakyReLU(alpha) => {
                if v > 0.0 {
                    v
                } else {
                    alpha * v
                }
            }
            Activation::Sigmoid => sigmoid(v),
            Activation::Tanh => v.tanh(),
            Activation::None => v,
        }
    }
}

/// Couche de convolution NCHW (forward uniquement)
pub struct ConvLayer {
    /// (out_channels, in_channels, K, K)
    pub weights: Array4<f32>,
    pub biases: Array1<f32>,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,
}

impl ConvLayer {
    /// Initialisation He uniforme, biais nuls
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
        rng: &mut R,
    ) -> CapsResult<Self> {
        if in_channels == 0 || out_channels == 0 || kernel_size == 0 || stride == 0 {
            return Err(CapsuleError::invalid_config(
                "conv channels, kernel and stride must be positive",
            ));
        }

        let scale = (2.0 / (in_channels * kernel_size * kernel_size) as f32).sqrt();
        let dist = Uniform::new(-scale, scale)
            .map_err(|e| CapsuleError::invalid_config(format!("conv init range: {e}")))?;
        let shape = (out_channels, in_channels, kernel_size, kernel_size);
        let weights = Array4::random_using(shape, dist, rng);

        Ok(Self {
            weights,
            biases: Array1::<f32>::zeros(out_channels),
            stride,
            padding,
            activation,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.weights.dim().0
    }

    pub fn kernel_size(&self) -> usize {
        self.weights.dim().2
    }

    /// Convolution directe, parallélisée par batch
    pub fn convolve(&self, input: &ArrayView4<f32>) -> Array4<f32> {
        let (batch_size, in_channels, in_height, in_width) = input.dim();
        let (out_channels, w_channels, kernel_size, _) = self.weights.dim();
        assert_eq!(
            in_channels, w_channels,
            "conv expects {w_channels} input channels, got {in_channels}"
        );

        let out_height = output_size(in_height + 2 * self.padding, kernel_size, self.stride);
        let out_width = output_size(in_width + 2 * self.padding, kernel_size, self.stride);

        let padded = if self.padding > 0 {
            self.pad_input(input)
        } else {
            input.to_owned()
        };

        let mut output = Array4::<f32>::zeros((batch_size, out_channels, out_height, out_width));

        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out_batch)| {
                let input_batch = padded.index_axis(Axis(0), b);

                for oc in 0..out_channels {
                    for oh in 0..out_height {
                        for ow in 0..out_width {
                            let ih_start = oh * self.stride;
                            let iw_start = ow * self.stride;

                            let mut sum = 0.0;
                            for ic in 0..in_channels {
                                for kh in 0..kernel_size {
                                    for kw in 0..kernel_size {
                                        sum += input_batch[[ic, ih_start + kh, iw_start + kw]]
                                            * self.weights[[oc, ic, kh, kw]];
                                    }
                                }
                            }

                            out_batch[[oc, oh, ow]] = self.activation.apply(sum + self.biases[oc]);
                        }
                    }
                }
            });

        output
    }

    fn pad_input(&self, input: &ArrayView4<f32>) -> Array4<f32> {
        let (batch_size, channels, height, width) = input.dim();
        let p = self.padding;

        let mut padded =
            Array4::<f32>::zeros((batch_size, channels, height + 2 * p, width + 2 * p));
        padded
            .slice_mut(s![.., .., p..height + p, p..width + p])
            .assign(input);

        padded
    }
}

impl Layer for ConvLayer {
    fn forward(
        &self,
        ctx: &ComputeContext,
        input: &ArrayView4<f32>,
        _mix: LambdaMix,
    ) -> Array4<f32> {
        let output = ctx.install(|| self.convolve(input));
        debug!(input = ?input.dim(), output = ?output.dim(), "conv2d");
        output
    }

    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn num_parameters(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f32>)> {
        vec![
            ("weight".to_string(), self.weights.view_mut().into_dyn()),
            ("bias".to_string(), self.biases.view_mut().into_dyn()),
        ]
    }
}
