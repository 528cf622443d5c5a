pub mod config;
pub mod error;
pub mod context;
pub mod layers;
pub mod patches;
pub mod transform;
pub mod routing;
pub mod capsule;
pub mod builder;
pub mod core;

pub use builder::ModelBuilder;
pub use capsule::{CapsOutput, CapsuleParams, ConvCapsLayer, PrimaryCapsLayer};
pub use config::{CapsLayerConfig, InitPolicy, LambdaSchedule, LayerConfig, NetworkConfig};
pub use context::ComputeContext;
pub use self::core::MatrixCapsNet;
pub use error::{CapsResult, CapsuleError};
pub use layers::Layer;
pub use routing::{EmRouting, LambdaMix};
