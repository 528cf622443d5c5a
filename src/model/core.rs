use ndarray::{Array2, Array4, ArrayView4, ArrayViewMutD, Axis};
use tracing::{debug, info};

use super::{
    config::NetworkConfig,
    context::ComputeContext,
    layers::Layer,
    routing::LambdaMix,
};

/// Réseau de capsules matricielles principal
pub struct MatrixCapsNet {
    pub config: NetworkConfig,
    pub layers: Vec<Box<dyn Layer>>,
}

impl MatrixCapsNet {
    pub fn new(config: NetworkConfig, layers: Vec<Box<dyn Layer>>) -> Self {
        Self { config, layers }
    }

    /// Activations de classes `(b, E)` pour un batch d'images NCHW
    pub fn forward(
        &self,
        ctx: &ComputeContext,
        images: &ArrayView4<f32>,
        mix: LambdaMix,
    ) -> Array2<f32> {
        let (batch_size, channels, height, width) = images.dim();
        assert_eq!(
            (channels, height, width),
            self.config.input_shape,
            "input images do not match the configured input shape"
        );

        let mut output: Array4<f32> = images.to_owned();
        for layer in &self.layers {
            output = layer.forward(ctx, &output.view(), mix);
        }

        let (_, h, w, classes) = output.dim();
        assert_eq!((h, w), (1, 1), "the last layer must emit one activation vector per sample");
        debug!(batch_size, classes, "forward terminé");

        output
            .into_shape_with_order((batch_size, classes))
            .expect("class activations are contiguous")
    }

    /// Indice de la classe la plus active par échantillon
    pub fn predict(
        &self,
        ctx: &ComputeContext,
        images: &ArrayView4<f32>,
        mix: LambdaMix,
    ) -> Vec<usize> {
        let activations = self.forward(ctx, images, mix);

        activations
            .axis_iter(Axis(0))
            .map(|row| {
                let mut best = 0;
                for (c, &a) in row.iter().enumerate() {
                    if a > row[best] {
                        best = c;
                    }
                }
                best
            })
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(|layer| layer.num_parameters()).sum()
    }

    /// Tous les tenseurs de paramètres, nommés `layer_{i}.{kind}.{param}`
    pub fn named_parameters_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f32>)> {
        let mut params = Vec::new();
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let kind = layer.name();
            for (name, view) in layer.named_parameters_mut() {
                params.push((format!("layer_{i}.{kind}.{name}"), view));
            }
        }
        params
    }

    /// Passe un batch nul dans le réseau et journalise la forme obtenue
    pub fn diagnostic(&self, ctx: &ComputeContext) -> (usize, usize) {
        let (c, h, w) = self.config.input_shape;
        info!(
            layers = self.layers.len(),
            parameters = self.num_parameters(),
            input_shape = ?self.config.input_shape,
            threads = ctx.num_threads(),
            "diagnostic"
        );

        let test_input = Array4::zeros((1, c, h, w));
        let output = self.forward(ctx, &test_input.view(), LambdaMix::default());
        info!(output_shape = ?output.dim(), "modèle opérationnel");

        output.dim()
    }
}
