//! Capsules matricielles avec routage EM.
//!
//! Chaque capsule porte une matrice de pose P×P et une activation. Entre deux
//! couches, les votes (poses fois matrices de point de vue apprises) sont
//! regroupés par quelques itérations d'Expectation-Maximization; chaque
//! cluster devient une capsule de niveau supérieur.
//!
//! ```no_run
//! use matrix_capsules::{ComputeContext, LambdaMix, ModelBuilder, NetworkConfig};
//! use ndarray::Array4;
//!
//! let ctx = ComputeContext::cpu(7);
//! let model = ModelBuilder::new()
//!     .with_network_config(NetworkConfig::default())
//!     .build(&ctx)
//!     .unwrap();
//! let images = Array4::<f32>::zeros((4, 1, 28, 28));
//! let activations = model.forward(&ctx, &images.view(), LambdaMix::RoutingMass);
//! assert_eq!(activations.dim(), (4, 10));
//! ```

pub mod model;

pub use model::{
    CapsLayerConfig, CapsOutput, CapsResult, CapsuleError, CapsuleParams, ComputeContext,
    ConvCapsLayer, EmRouting, InitPolicy, LambdaMix, LambdaSchedule, Layer, LayerConfig,
    MatrixCapsNet, ModelBuilder, NetworkConfig, PrimaryCapsLayer,
};
