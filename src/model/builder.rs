use tracing::info;

use super::{
    capsule::{ConvCapsLayer, PrimaryCapsLayer},
    config::{LayerConfig, NetworkConfig},
    context::ComputeContext,
    core::MatrixCapsNet,
    error::{CapsResult, CapsuleError},
    layers::{ConvLayer, Layer},
};

/// Constructeur de modèle: valide une `NetworkConfig` puis instancie ses couches
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self { network_config: None }
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    /// La couche `i` tire ses paramètres initiaux de `ctx.rng(i)`.
    pub fn build(self, ctx: &ComputeContext) -> CapsResult<MatrixCapsNet> {
        let network_config = self
            .network_config
            .ok_or_else(|| CapsuleError::invalid_config("a network configuration is required"))?;

        network_config.validate()?;

        let layers = Self::build_layers(&network_config, ctx)?;
        let model = MatrixCapsNet::new(network_config, layers);
        info!(
            layers = model.layers.len(),
            parameters = model.num_parameters(),
            seed = ctx.seed(),
            "réseau de capsules matricielles construit"
        );

        Ok(model)
    }

    fn build_layers(
        config: &NetworkConfig,
        ctx: &ComputeContext,
    ) -> CapsResult<Vec<Box<dyn Layer>>> {
        let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(config.layers.len());

        for (i, layer_config) in config.layers.iter().enumerate() {
            let mut rng = ctx.rng(i as u64);
            let layer: Box<dyn Layer> = match layer_config {
                LayerConfig::Conv2d {
                    in_channels,
                    out_channels,
                    kernel_size,
                    stride,
                    padding,
                    activation,
                } => Box::new(ConvLayer::new(
                    *in_channels,
                    *out_channels,
                    *kernel_size,
                    *stride,
                    *padding,
                    *activation,
                    &mut rng,
                )?),

                LayerConfig::PrimaryCapsules {
                    in_channels,
                    out_types,
                    kernel_size,
                    pose_dim,
                    stride,
                } => Box::new(PrimaryCapsLayer::new(
                    *in_channels,
                    *out_types,
                    *kernel_size,
                    *pose_dim,
                    *stride,
                    &mut rng,
                )?),

                LayerConfig::ConvCapsules(caps) | LayerConfig::ClassCapsules(caps) => {
                    Box::new(ConvCapsLayer::new(caps.clone(), &mut rng)?)
                }
            };

            layers.push(layer);
        }

        Ok(layers)
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}
