use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{CapsResult, CapsuleError};
use super::patches::output_size;

/// Non-linéarité appliquée après une convolution classique
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    LeakyReLU(f32),
    Sigmoid,
    Tanh,
    None,
}

/// Tirage des matrices de transformation à la construction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InitPolicy {
    /// N(0, 1) / P²
    Dense,
    /// N(0, 1) masqué par un tirage Bernoulli(keep_prob) indépendant, puis / P²
    Sparse { keep_prob: f32 },
}

impl Default for InitPolicy {
    fn default() -> Self {
        InitPolicy::Sparse { keep_prob: 0.5 }
    }
}

/// Paire de températures inverses pour la sigmoïde du M-step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LambdaSchedule {
    pub low: f32,
    pub high: f32,
}

impl LambdaSchedule {
    pub fn new(low: f32, high: f32) -> Self {
        Self { low, high }
    }

    /// Interpolation linéaire entre `low` et `high`
    pub fn at(&self, t: f32) -> f32 {
        self.low + (self.high - self.low) * t
    }
}

impl Default for LambdaSchedule {
    /// Dimensionné pour la pile de référence, où les coûts par type atteignent la centaine
    fn default() -> Self {
        Self { low: 1e-4, high: 1e-3 }
    }
}

/// Configuration d'une couche de capsules routée par EM
///
/// `in_types` et `out_types` sont les nombres de types de capsules (B et C).
/// `pose_dim` vaut P et chaque pose contient P² valeurs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapsLayerConfig {
    pub in_types: usize,
    pub out_types: usize,
    pub kernel_size: usize,
    pub pose_dim: usize,
    pub stride: usize,
    pub iters: usize,
    pub coord_add: bool,
    pub w_shared: bool,
    pub lambda: LambdaSchedule,
    pub eps: f32,
    pub init: InitPolicy,
}

impl Default for CapsLayerConfig {
    fn default() -> Self {
        Self {
            in_types: 32,
            out_types: 32,
            kernel_size: 3,
            pose_dim: 4,
            stride: 2,
            iters: 3,
            coord_add: false,
            w_shared: false,
            lambda: LambdaSchedule::default(),
            eps: 1e-8,
            init: InitPolicy::default(),
        }
    }
}

impl CapsLayerConfig {
    /// Couche localement connectée routant des patchs K×K de `in_types` capsules
    pub fn conv(in_types: usize, out_types: usize, kernel_size: usize, stride: usize) -> Self {
        Self {
            in_types,
            out_types,
            kernel_size,
            stride,
            ..Self::default()
        }
    }

    /// Couche de classes finale, poids partagés et addition des coordonnées
    pub fn class(in_types: usize, out_types: usize) -> Self {
        Self {
            in_types,
            out_types,
            kernel_size: 1,
            stride: 1,
            coord_add: true,
            w_shared: true,
            ..Self::default()
        }
    }

    pub fn with_pose_dim(mut self, pose_dim: usize) -> Self {
        self.pose_dim = pose_dim;
        self
    }

    pub fn with_iters(mut self, iters: usize) -> Self {
        self.iters = iters;
        self
    }

    pub fn with_lambda(mut self, lambda: LambdaSchedule) -> Self {
        self.lambda = lambda;
        self
    }

    pub fn with_init(mut self, init: InitPolicy) -> Self {
        self.init = init;
        self
    }

    pub fn psize(&self) -> usize {
        self.pose_dim * self.pose_dim
    }

    /// Canaux de la grille compacte consommée: B·(P²+1)
    pub fn in_channels(&self) -> usize {
        self.in_types * (self.psize() + 1)
    }

    /// Canaux de la grille compacte produite: C·(P²+1)
    pub fn out_channels(&self) -> usize {
        self.out_types * (self.psize() + 1)
    }

    /// Nombre de lignes (position du noyau × type d'entrée) du tenseur de poids
    pub fn weight_rows(&self) -> usize {
        self.kernel_size * self.kernel_size * self.in_types
    }

    pub fn validate(&self) -> CapsResult<()> {
        if self.in_types == 0 || self.out_types == 0 {
            return Err(CapsuleError::invalid_config(
                "capsule layers need at least one input and one output type",
            ));
        }
        if self.pose_dim == 0 {
            return Err(CapsuleError::invalid_config("pose_dim must be positive"));
        }
        if self.kernel_size == 0 || self.stride == 0 {
            return Err(CapsuleError::invalid_config(
                "kernel_size and stride must be positive",
            ));
        }
        if self.iters == 0 {
            return Err(CapsuleError::invalid_config(
                "EM routing needs at least one iteration",
            ));
        }
        if !(self.eps > 0.0) {
            return Err(CapsuleError::invalid_config("eps must be positive"));
        }
        if !self.lambda.low.is_finite() || !self.lambda.high.is_finite() {
            return Err(CapsuleError::invalid_config("lambda pair must be finite"));
        }
        if self.w_shared && (self.kernel_size != 1 || self.stride != 1) {
            return Err(CapsuleError::invalid_config(format!(
                "shared capsule layers need kernel_size = 1 and stride = 1, got {} and {}",
                self.kernel_size, self.stride
            )));
        }
        if self.coord_add && !self.w_shared {
            return Err(CapsuleError::invalid_config(
                "coordinate addition applies only to shared capsule layers",
            ));
        }
        if self.coord_add && self.psize() < 2 {
            return Err(CapsuleError::invalid_config(format!(
                "coordinate addition writes two pose entries, pose_dim {} has {}",
                self.pose_dim,
                self.psize()
            )));
        }
        if let InitPolicy::Sparse { keep_prob } = self.init {
            if !(keep_prob > 0.0 && keep_prob <= 1.0) {
                return Err(CapsuleError::invalid_config(format!(
                    "keep_prob must lie in (0, 1], got {keep_prob}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LayerConfig {
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
    },
    PrimaryCapsules {
        in_channels: usize,
        out_types: usize,
        kernel_size: usize,
        pose_dim: usize,
        stride: usize,
    },
    ConvCapsules(CapsLayerConfig),
    ClassCapsules(CapsLayerConfig),
}

/// Forme du tenseur entre deux couches, suivie pendant la validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowShape {
    /// Carte de features NCHW
    FeatureMap { channels: usize, height: usize, width: usize },
    /// Grille de capsules NHWC compacte (poses, activations)
    Capsules { types: usize, pose_dim: usize, height: usize, width: usize },
    /// Une activation par classe
    Classes { count: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// (canaux, hauteur, largeur) d'une image d'entrée
    pub input_shape: (usize, usize, usize),
    pub layers: Vec<LayerConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let lambdas = [LambdaSchedule::default(); 3];
        Self::matrix_capsules(32, 32, 32, 32, 10, 3, 4, 3, lambdas)
    }
}

impl NetworkConfig {
    /// Pile de référence pour des images 28×28×1:
    /// ReLU conv 5×5/2 → primary caps 1×1 → conv caps K/2 → conv caps K/1 → class caps.
    #[allow(clippy::too_many_arguments)]
    pub fn matrix_capsules(
        a: usize,
        b: usize,
        c: usize,
        d: usize,
        e: usize,
        k: usize,
        p: usize,
        iters: usize,
        lambdas: [LambdaSchedule; 3],
    ) -> Self {
        Self {
            input_shape: (1, 28, 28),
            layers: vec![
                LayerConfig::Conv2d {
                    in_channels: 1,
                    out_channels: a,
                    kernel_size: 5,
                    stride: 2,
                    padding: 2,
                    activation: Activation::ReLU,
                },
                LayerConfig::PrimaryCapsules {
                    in_channels: a,
                    out_types: b,
                    kernel_size: 1,
                    pose_dim: p,
                    stride: 1,
                },
                LayerConfig::ConvCapsules(
                    CapsLayerConfig::conv(b, c, k, 2)
                        .with_pose_dim(p)
                        .with_iters(iters)
                        .with_lambda(lambdas[0]),
                ),
                LayerConfig::ConvCapsules(
                    CapsLayerConfig::conv(c, d, k, 1)
                        .with_pose_dim(p)
                        .with_iters(iters)
                        .with_lambda(lambdas[1]),
                ),
                LayerConfig::ClassCapsules(
                    CapsLayerConfig::class(d, e)
                        .with_pose_dim(p)
                        .with_iters(iters)
                        .with_lambda(lambdas[2]),
                ),
            ],
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> CapsResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> CapsResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Nombre de classes de la dernière couche, si la pile finit par des capsules de classes
    pub fn num_classes(&self) -> Option<usize> {
        match self.layers.last() {
            Some(LayerConfig::ClassCapsules(cfg)) => Some(cfg.out_types),
            _ => None,
        }
    }

    /// Parcourt les couches et retourne la forme après chacune
    pub fn shape_flow(&self) -> CapsResult<Vec<FlowShape>> {
        let (channels, height, width) = self.input_shape;
        if channels == 0 || height == 0 || width == 0 {
            return Err(CapsuleError::invalid_config("input_shape must be non-empty"));
        }
        if self.layers.is_empty() {
            return Err(CapsuleError::invalid_config(
                "the network needs at least one layer",
            ));
        }

        let mut shape = FlowShape::FeatureMap { channels, height, width };
        let mut flow = Vec::with_capacity(self.layers.len());

        for (i, layer) in self.layers.iter().enumerate() {
            shape = match (layer, shape) {
                (
                    LayerConfig::Conv2d {
                        in_channels,
                        out_channels,
                        kernel_size,
                        stride,
                        padding,
                        ..
                    },
                    FlowShape::FeatureMap { channels, height, width },
                ) => {
                    expect_eq(i, "input channels", *in_channels, channels)?;
                    if *out_channels == 0 || *kernel_size == 0 || *stride == 0 {
                        return Err(CapsuleError::invalid_config(format!(
                            "layer {i}: conv channels, kernel and stride must be positive"
                        )));
                    }
                    if height + 2 * padding < *kernel_size || width + 2 * padding < *kernel_size {
                        return Err(CapsuleError::invalid_config(format!(
                            "layer {i}: kernel {kernel_size} exceeds padded input {height}x{width}"
                        )));
                    }
                    FlowShape::FeatureMap {
                        channels: *out_channels,
                        height: output_size(height + 2 * padding, *kernel_size, *stride),
                        width: output_size(width + 2 * padding, *kernel_size, *stride),
                    }
                }
                (
                    LayerConfig::PrimaryCapsules {
                        in_channels,
                        out_types,
                        kernel_size,
                        pose_dim,
                        stride,
                    },
                    FlowShape::FeatureMap { channels, height, width },
                ) => {
                    expect_eq(i, "input channels", *in_channels, channels)?;
                    if *out_types == 0 || *pose_dim == 0 || *kernel_size == 0 || *stride == 0 {
                        return Err(CapsuleError::invalid_config(format!(
                            "layer {i}: primary capsule sizes must be positive"
                        )));
                    }
                    expect_square(i, height, width)?;
                    expect_fits(i, height, *kernel_size)?;
                    let side = output_size(height, *kernel_size, *stride);
                    FlowShape::Capsules {
                        types: *out_types,
                        pose_dim: *pose_dim,
                        height: side,
                        width: side,
                    }
                }
                (
                    LayerConfig::ConvCapsules(cfg),
                    FlowShape::Capsules { types, pose_dim, height, width },
                ) => {
                    cfg.validate()?;
                    if cfg.w_shared {
                        return Err(CapsuleError::invalid_config(format!(
                            "layer {i}: shared weights belong to class capsules"
                        )));
                    }
                    expect_eq(i, "input capsule types", cfg.in_types, types)?;
                    expect_eq(i, "pose_dim", cfg.pose_dim, pose_dim)?;
                    expect_square(i, height, width)?;
                    expect_fits(i, height, cfg.kernel_size)?;
                    let side = output_size(height, cfg.kernel_size, cfg.stride);
                    FlowShape::Capsules {
                        types: cfg.out_types,
                        pose_dim,
                        height: side,
                        width: side,
                    }
                }
                (
                    LayerConfig::ClassCapsules(cfg),
                    FlowShape::Capsules { types, pose_dim, height, width },
                ) => {
                    cfg.validate()?;
                    if !cfg.w_shared {
                        return Err(CapsuleError::invalid_config(format!(
                            "layer {i}: class capsules must share weights"
                        )));
                    }
                    if i + 1 != self.layers.len() {
                        return Err(CapsuleError::invalid_config(format!(
                            "layer {i}: class capsules must be the last layer"
                        )));
                    }
                    expect_eq(i, "input capsule types", cfg.in_types, types)?;
                    expect_eq(i, "pose_dim", cfg.pose_dim, pose_dim)?;
                    expect_square(i, height, width)?;
                    FlowShape::Classes { count: cfg.out_types }
                }
                (layer, shape) => {
                    return Err(CapsuleError::shape_mismatch(
                        format!("input suited to layer {i} ({})", layer_kind(layer)),
                        format!("{shape:?}"),
                    ));
                }
            };
            flow.push(shape);
        }

        Ok(flow)
    }

    pub fn validate(&self) -> CapsResult<()> {
        match self.shape_flow()?.last() {
            Some(FlowShape::Classes { .. }) => Ok(()),
            other => Err(CapsuleError::shape_mismatch(
                "class activations after the last layer",
                format!("{other:?}"),
            )),
        }
    }
}

fn layer_kind(layer: &LayerConfig) -> &'static str {
    match layer {
        LayerConfig::Conv2d { .. } => "conv2d",
        LayerConfig::PrimaryCapsules { .. } => "primary capsules",
        LayerConfig::ConvCapsules(_) => "conv capsules",
        LayerConfig::ClassCapsules(_) => "class capsules",
    }
}

fn expect_eq(layer: usize, what: &str, expected: usize, got: usize) -> CapsResult<()> {
    if expected != got {
        return Err(CapsuleError::shape_mismatch(
            format!("layer {layer}: {what} = {expected}"),
            got.to_string(),
        ));
    }
    Ok(())
}

fn expect_square(layer: usize, height: usize, width: usize) -> CapsResult<()> {
    if height != width {
        return Err(CapsuleError::shape_mismatch(
            format!("layer {layer}: square capsule grid"),
            format!("{height}x{width}"),
        ));
    }
    Ok(())
}

fn expect_fits(layer: usize, side: usize, kernel_size: usize) -> CapsResult<()> {
    if side < kernel_size {
        return Err(CapsuleError::invalid_config(format!(
            "layer {layer}: kernel {kernel_size} larger than {side}x{side} grid"
        )));
    }
    Ok(())
}
