use ndarray::{concatenate, s, Array1, Array2, Array4, ArrayView4, ArrayViewMutD, Axis, Zip};
use ndarray_rand::rand_distr::{Bernoulli, StandardNormal};
use ndarray_rand::RandomExt;
use rand::Rng;
use tracing::debug;

use super::config::{Activation, CapsLayerConfig, InitPolicy};
use super::context::ComputeContext;
use super::error::{CapsResult, CapsuleError};
use super::layers::{ConvLayer, Layer};
use super::patches::extract_patches;
use super::routing::{EmRouting, LambdaMix, RoutingParams};
use super::transform::{add_coordinates, viewpoint_transform};

/// Couche de capsules primaires: carte de features convertie en grille compacte
///
/// Entrée `(b, A, h, w)`, sortie `(b, h', w', B·(P²+1))`: toutes les poses
/// d'abord, puis les B activations sigmoïdes.
pub struct PrimaryCapsLayer {
    pub pose: ConvLayer,
    pub activation: ConvLayer,
    pub num_types: usize,
    pub pose_dim: usize,
}

impl PrimaryCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        num_types: usize,
        kernel_size: usize,
        pose_dim: usize,
        stride: usize,
        rng: &mut R,
    ) -> CapsResult<Self> {
        let psize = pose_dim * pose_dim;
        let pose = ConvLayer::new(
            in_channels,
            num_types * psize,
            kernel_size,
            stride,
            0,
            Activation::None,
            rng,
        )?;
        let activation = ConvLayer::new(
            in_channels,
            num_types,
            kernel_size,
            stride,
            0,
            Activation::Sigmoid,
            rng,
        )?;

        Ok(Self {
            pose,
            activation,
            num_types,
            pose_dim,
        })
    }

    fn build_grid(&self, input: &ArrayView4<f32>) -> Array4<f32> {
        let poses = self.pose.convolve(input);
        let activations = self.activation.convolve(input);

        concatenate(Axis(1), &[poses.view(), activations.view()])
            .expect("pose and activation maps share batch and spatial axes")
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned()
    }
}

impl Layer for PrimaryCapsLayer {
    fn forward(
        &self,
        ctx: &ComputeContext,
        input: &ArrayView4<f32>,
        _mix: LambdaMix,
    ) -> Array4<f32> {
        let grid = ctx.install(|| self.build_grid(input));
        debug!(
            input = ?input.dim(),
            output = ?grid.dim(),
            types = self.num_types,
            "capsules primaires"
        );
        grid
    }

    fn name(&self) -> &'static str {
        "primary_caps"
    }

    fn num_parameters(&self) -> usize {
        self.pose.num_parameters() + self.activation.num_parameters()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f32>)> {
        let mut params = Vec::new();
        for (prefix, layer) in [("pose", &mut self.pose), ("activation", &mut self.activation)] {
            for (name, view) in layer.named_parameters_mut() {
                params.push((format!("{prefix}.{name}"), view));
            }
        }
        params
    }
}

/// Paramètres appris d'une couche de capsules EM
#[derive(Debug, Clone)]
pub struct CapsuleParams {
    /// (K·K·B, C, P, P)
    pub weights: Array4<f32>,
    /// (C)
    pub beta_u: Array1<f32>,
    /// (C)
    pub beta_a: Array1<f32>,
}

impl CapsuleParams {
    pub fn init<R: Rng + ?Sized>(config: &CapsLayerConfig, rng: &mut R) -> CapsResult<Self> {
        let weights = transform_weights(
            config.weight_rows(),
            config.out_types,
            config.pose_dim,
            config.init,
            rng,
        )?;

        Ok(Self {
            weights,
            beta_u: Array1::ones(config.out_types),
            beta_a: Array1::ones(config.out_types),
        })
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.len() + self.beta_u.len() + self.beta_a.len()
    }
}

/// Tire les matrices de transformation `(rows, C, P, P)` selon `policy`.
pub fn transform_weights<R: Rng + ?Sized>(
    rows: usize,
    num_out: usize,
    pose_dim: usize,
    policy: InitPolicy,
    rng: &mut R,
) -> CapsResult<Array4<f32>> {
    let shape = (rows, num_out, pose_dim, pose_dim);
    let scale = 1.0 / (pose_dim * pose_dim) as f32;
    let mut weights = Array4::<f32>::random_using(shape, StandardNormal, rng);

    match policy {
        InitPolicy::Dense => weights.mapv_inplace(|w| w * scale),
        InitPolicy::Sparse { keep_prob } => {
            let bernoulli = Bernoulli::new(keep_prob as f64)
                .map_err(|e| CapsuleError::invalid_config(format!("keep_prob {keep_prob}: {e}")))?;
            let keep = Array4::<bool>::random_using(shape, bernoulli, rng);
            Zip::from(&mut weights).and(&keep).for_each(|w, &kept| {
                *w = if kept { *w * scale } else { 0.0 };
            });
        }
    }

    Ok(weights)
}

/// Sortie d'une couche de capsules
#[derive(Debug, Clone)]
pub enum CapsOutput {
    /// Grille compacte `(b, H', W', C·(P²+1))` d'une couche localement connectée
    Grid(Array4<f32>),
    /// Activations `(b, C)` de la couche de classes partagée
    Activations(Array2<f32>),
}

/// Couche de capsules L → L+1 avec routage EM
///
/// Localement connectée sauf si `config.w_shared`: la grille entière forme
/// alors un seul ensemble de capsules d'entrée, avec un poids par type.
pub struct ConvCapsLayer {
    pub config: CapsLayerConfig,
    pub params: CapsuleParams,
    routing: EmRouting,
}

impl ConvCapsLayer {
    pub fn new<R: Rng + ?Sized>(config: CapsLayerConfig, rng: &mut R) -> CapsResult<Self> {
        config.validate()?;
        let params = CapsuleParams::init(&config, rng)?;
        let routing = EmRouting::new(config.iters, config.eps);

        Ok(Self { config, params, routing })
    }

    pub fn with_params(config: CapsLayerConfig, params: CapsuleParams) -> CapsResult<Self> {
        config.validate()?;
        let expected = (config.weight_rows(), config.out_types, config.pose_dim, config.pose_dim);
        if params.weights.dim() != expected
            || params.beta_u.len() != config.out_types
            || params.beta_a.len() != config.out_types
        {
            return Err(CapsuleError::shape_mismatch(
                format!("weights {expected:?} and {} betas", config.out_types),
                format!(
                    "weights {:?} and {}/{} betas",
                    params.weights.dim(),
                    params.beta_u.len(),
                    params.beta_a.len()
                ),
            ));
        }
        let routing = EmRouting::new(config.iters, config.eps);

        Ok(Self { config, params, routing })
    }

    fn routing_params(&self) -> RoutingParams<'_> {
        RoutingParams {
            beta_u: self.params.beta_u.view(),
            beta_a: self.params.beta_a.view(),
            lambda: self.config.lambda,
        }
    }

    pub fn forward_caps(
        &self,
        ctx: &ComputeContext,
        x: &ArrayView4<f32>,
        mix: LambdaMix,
    ) -> CapsOutput {
        ctx.install(|| {
            if self.config.w_shared {
                CapsOutput::Activations(self.forward_shared(x, mix))
            } else {
                CapsOutput::Grid(self.forward_local(x, mix))
            }
        })
    }

    fn forward_local(&self, x: &ArrayView4<f32>, mix: LambdaMix) -> Array4<f32> {
        let cfg = &self.config;
        let (batch_size, _, _, channels) = x.dim();
        assert_eq!(
            channels,
            cfg.in_channels(),
            "conv capsules expect {} channels, got {channels}",
            cfg.in_channels()
        );

        let psize = cfg.psize();
        let pose_width = cfg.in_types * psize;
        let kk = cfg.kernel_size * cfg.kernel_size;

        let (patches, out_size) =
            extract_patches(x, cfg.in_types, cfg.kernel_size, psize, cfg.stride);
        let n = batch_size * out_size * out_size;
        let patches = patches
            .into_shape_with_order((n, kk, channels))
            .expect("gathered patches are contiguous");

        let p_in = patches
            .slice(s![.., .., ..pose_width])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n, kk * cfg.in_types, psize))
            .expect("pose block reshapes to (samples, inputs, pose)");
        let a_in = patches
            .slice(s![.., .., pose_width..])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n, kk * cfg.in_types))
            .expect("activation block reshapes to (samples, inputs)");

        let votes = viewpoint_transform(&p_in.view(), &self.params.weights.view(), false);
        let routed = self.routing.route(&votes.view(), &a_in.view(), &self.routing_params(), mix);

        let p_out = routed
            .poses
            .into_shape_with_order((batch_size, out_size, out_size, cfg.out_types * psize))
            .expect("routed poses reshape onto the output grid");
        let a_out = routed
            .activations
            .into_shape_with_order((batch_size, out_size, out_size, cfg.out_types))
            .expect("routed activations reshape onto the output grid");

        concatenate(Axis(3), &[p_out.view(), a_out.view()])
            .expect("pose and activation grids share leading axes")
            .as_standard_layout()
            .into_owned()
    }

    fn forward_shared(&self, x: &ArrayView4<f32>, mix: LambdaMix) -> Array2<f32> {
        let cfg = &self.config;
        let (batch_size, height, width, channels) = x.dim();
        assert_eq!(
            channels,
            cfg.in_channels(),
            "class capsules expect {} channels, got {channels}",
            cfg.in_channels()
        );
        assert_eq!(cfg.kernel_size, 1, "shared capsule layers use a 1x1 kernel");
        assert_eq!(cfg.stride, 1, "shared capsule layers use stride 1");
        assert_eq!(height, width, "capsule grid must be square, got {height}x{width}");

        let psize = cfg.psize();
        let pose_width = cfg.in_types * psize;
        let num_inputs = height * width * cfg.in_types;

        // la grille peut arriver dans n'importe quel ordre mémoire
        let p_in = x
            .slice(s![.., .., .., ..pose_width])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch_size, num_inputs, psize))
            .expect("pose block reshapes to (batch, inputs, pose)");
        let a_in = x
            .slice(s![.., .., .., pose_width..])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch_size, num_inputs))
            .expect("activation block reshapes to (batch, inputs)");

        let mut votes = viewpoint_transform(&p_in.view(), &self.params.weights.view(), true);
        if cfg.coord_add {
            add_coordinates(&mut votes, height, width, cfg.in_types);
        }

        self.routing.route(&votes.view(), &a_in.view(), &self.routing_params(), mix).activations
    }
}

impl Layer for ConvCapsLayer {
    fn forward(
        &self,
        ctx: &ComputeContext,
        input: &ArrayView4<f32>,
        mix: LambdaMix,
    ) -> Array4<f32> {
        let output = match self.forward_caps(ctx, input, mix) {
            CapsOutput::Grid(grid) => grid,
            CapsOutput::Activations(activations) => {
                let (batch_size, classes) = activations.dim();
                activations
                    .into_shape_with_order((batch_size, 1, 1, classes))
                    .expect("class activations are contiguous")
            }
        };
        debug!(
            layer = self.name(),
            input = ?input.dim(),
            output = ?output.dim(),
            ?mix,
            "routage EM"
        );
        output
    }

    fn name(&self) -> &'static str {
        if self.config.w_shared {
            "class_caps"
        } else {
            "conv_caps"
        }
    }

    fn num_parameters(&self) -> usize {
        self.params.num_parameters()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f32>)> {
        vec![
            ("weights".to_string(), self.params.weights.view_mut().into_dyn()),
            ("beta_u".to_string(), self.params.beta_u.view_mut().into_dyn()),
            ("beta_a".to_string(), self.params.beta_a.view_mut().into_dyn()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::routing::EmRouting;
    use ndarray::{Array3, ShapeBuilder};
    use ndarray_rand::rand_distr::Uniform;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn random_grid(
        batch_size: usize,
        side: usize,
        types: usize,
        psize: usize,
        seed: u64,
    ) -> Array4<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let pose_dist = Uniform::new(-1.0f32, 1.0).unwrap();
        let activation_dist = Uniform::new(0.0f32, 1.0).unwrap();
        let poses =
            Array4::random_using((batch_size, side, side, types * psize), pose_dist, &mut rng);
        let activations =
            Array4::random_using((batch_size, side, side, types), activation_dist, &mut rng);
        concatenate(Axis(3), &[poses.view(), activations.view()]).unwrap()
    }

    fn layer(config: CapsLayerConfig, seed: u64) -> ConvCapsLayer {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        ConvCapsLayer::new(config, &mut rng).unwrap()
    }

    #[test]
    fn test_local_output_shape() {
        let caps = layer(CapsLayerConfig::conv(4, 3, 3, 2), 1);
        let x = random_grid(2, 14, 4, 16, 2);

        let out = caps.forward(&ComputeContext::default(), &x.view(), LambdaMix::RoutingMass);

        assert_eq!(out.dim(), (2, 6, 6, 3 * 17));
        assert!(out.slice(s![.., .., .., 3 * 16..]).iter().all(|&a| (0.0..=1.0).contains(&a)));
    }

    #[test]
    fn test_local_output_matches_single_window() {
        let caps = layer(CapsLayerConfig::conv(2, 3, 3, 1), 3);
        let x = random_grid(2, 6, 2, 16, 4);
        let out = caps.forward(&ComputeContext::default(), &x.view(), LambdaMix::RoutingMass);
        let (b, i, j) = (1, 2, 3);

        let window = x
            .slice(s![b, i..i + 3, j..j + 3, ..])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((9, 34))
            .unwrap();
        let p_in = window
            .slice(s![.., ..32])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((1, 18, 16))
            .unwrap();
        let a_in = window
            .slice(s![.., 32..])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((1, 18))
            .unwrap();
        let votes = viewpoint_transform(&p_in.view(), &caps.params.weights.view(), false);
        let routed = EmRouting::new(3, 1e-8).route(
            &votes.view(),
            &a_in.view(),
            &caps.routing_params(),
            LambdaMix::RoutingMass,
        );

        let poses: Array3<f32> = routed.poses;
        for c in 0..3 {
            for h in 0..16 {
                assert_eq!(out[[b, i, j, c * 16 + h]], poses[[0, c, h]]);
            }
            assert_eq!(out[[b, i, j, 48 + c]], routed.activations[[0, c]]);
        }
    }

    #[test]
    fn test_shared_mode_returns_activations() {
        let caps = layer(CapsLayerConfig::class(4, 10), 5);
        let x = random_grid(3, 4, 4, 16, 6);

        match caps.forward_caps(&ComputeContext::default(), &x.view(), LambdaMix::RoutingMass) {
            CapsOutput::Activations(a) => {
                assert_eq!(a.dim(), (3, 10));
                assert!(a.iter().all(|&v| (0.0..=1.0).contains(&v)));
            }
            CapsOutput::Grid(_) => panic!("class capsules must not return a grid"),
        }

        let as_layer = caps.forward(&ComputeContext::default(), &x.view(), LambdaMix::RoutingMass);
        assert_eq!(as_layer.dim(), (3, 1, 1, 10));
    }

    #[test]
    fn test_class_layer_consumes_conv_caps_grid() {
        let ctx = ComputeContext::default();
        let conv = layer(CapsLayerConfig::conv(2, 2, 3, 1), 13);
        let class = layer(CapsLayerConfig::class(2, 3), 14);
        let x = random_grid(2, 5, 2, 16, 15);

        let grid = conv.forward(&ctx, &x.view(), LambdaMix::RoutingMass);
        assert_eq!(grid.dim(), (2, 3, 3, 34));
        assert!(grid.is_standard_layout());

        let out = class.forward(&ctx, &grid.view(), LambdaMix::RoutingMass);
        assert_eq!(out.dim(), (2, 1, 1, 3));
        assert!(out.iter().all(|&a| (0.0..=1.0).contains(&a)));
    }

    #[test]
    fn test_shared_mode_ignores_memory_order() {
        let ctx = ComputeContext::default();
        let class = layer(CapsLayerConfig::class(2, 3), 16);
        let x = random_grid(2, 3, 2, 16, 17).as_standard_layout().into_owned();

        // mêmes valeurs, strides colonne-majeur
        let mut transposed = Array4::<f32>::zeros(x.dim().f());
        transposed.assign(&x);
        assert!(!transposed.is_standard_layout());

        let a = class.forward(&ctx, &x.view(), LambdaMix::RoutingMass);
        let b = class.forward(&ctx, &transposed.view(), LambdaMix::RoutingMass);
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic(expected = "class capsules expect")]
    fn test_shared_rejects_wrong_channels() {
        let caps = layer(CapsLayerConfig::class(4, 10), 5);
        let x = random_grid(1, 4, 3, 16, 6);
        caps.forward(&ComputeContext::default(), &x.view(), LambdaMix::RoutingMass);
    }

    #[test]
    #[should_panic(expected = "conv capsules expect")]
    fn test_local_rejects_wrong_channels() {
        let caps = layer(CapsLayerConfig::conv(4, 3, 3, 1), 1);
        let x = random_grid(1, 6, 5, 16, 2);
        caps.forward(&ComputeContext::default(), &x.view(), LambdaMix::RoutingMass);
    }

    #[test]
    fn test_sparse_init_zeroes_about_half() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let policy = InitPolicy::Sparse { keep_prob: 0.5 };
        let weights = transform_weights(9 * 32, 32, 4, policy, &mut rng).unwrap();

        let zeros = weights.iter().filter(|&&w| w == 0.0).count() as f32 / weights.len() as f32;
        assert!((0.45..0.55).contains(&zeros), "zero fraction {zeros}");

        let kept: Vec<f32> = weights.iter().copied().filter(|&w| w != 0.0).collect();
        let var = kept.iter().map(|w| w * w).sum::<f32>() / kept.len() as f32;
        // N(0, 1) / 16 a une variance de 1/256
        assert!((var * 256.0 - 1.0).abs() < 0.1, "kept variance {var}");
    }

    #[test]
    fn test_dense_init_keeps_every_entry() {
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let weights = transform_weights(9, 4, 4, InitPolicy::Dense, &mut rng).unwrap();

        assert_eq!(weights.dim(), (9, 4, 4, 4));
        assert!(weights.iter().all(|&w| w != 0.0));
    }

    #[test]
    fn test_params_shape_and_betas() {
        let caps = layer(CapsLayerConfig::conv(8, 6, 3, 2), 9);

        assert_eq!(caps.params.weights.dim(), (72, 6, 4, 4));
        assert!(caps.params.beta_u.iter().all(|&b| b == 1.0));
        assert!(caps.params.beta_a.iter().all(|&b| b == 1.0));
        assert_eq!(caps.num_parameters(), 72 * 6 * 16 + 12);
    }

    #[test]
    fn test_with_params_checks_shapes() {
        let config = CapsLayerConfig::conv(2, 2, 3, 1);
        let params = CapsuleParams {
            weights: Array4::zeros((9, 2, 4, 4)),
            beta_u: Array1::ones(2),
            beta_a: Array1::ones(2),
        };

        assert!(ConvCapsLayer::with_params(config.clone(), params).is_err());

        let params = CapsuleParams {
            weights: Array4::zeros((18, 2, 4, 4)),
            beta_u: Array1::ones(2),
            beta_a: Array1::ones(2),
        };
        assert!(ConvCapsLayer::with_params(config, params).is_ok());
    }

    #[test]
    fn test_primary_caps_grid() {
        let mut rng = ChaCha8Rng::seed_from_u64(10);
        let primary = PrimaryCapsLayer::new(8, 4, 1, 4, 1, &mut rng).unwrap();
        let dist = Uniform::new(-1.0f32, 1.0).unwrap();
        let input = Array4::random_using((2, 8, 5, 5), dist, &mut rng);

        let ctx = ComputeContext::default();
        let grid = primary.forward(&ctx, &input.view(), LambdaMix::RoutingMass);

        assert_eq!(grid.dim(), (2, 5, 5, 4 * 17));
        assert!(grid.slice(s![.., .., .., 64..]).iter().all(|&a| a > 0.0 && a < 1.0));
        let poses = primary.pose.convolve(&input.view());
        assert_eq!(grid[[1, 3, 2, 7]], poses[[1, 7, 3, 2]]);
    }

    #[test]
    fn test_layer_parameter_names() {
        let mut caps = layer(CapsLayerConfig::class(2, 3), 11);
        let names: Vec<String> = caps.named_parameters_mut().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["weights", "beta_u", "beta_a"]);

        let mut rng = ChaCha8Rng::seed_from_u64(12);
        let mut primary = PrimaryCapsLayer::new(4, 2, 1, 4, 1, &mut rng).unwrap();
        let names: Vec<String> =
            primary.named_parameters_mut().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["pose.weight", "pose.bias", "activation.weight", "activation.bias"]);
    }
}
