pub mod builder;
pub mod capsule;
pub mod config;
pub mod core;
pub mod error;
pub mod layers;
pub mod params;
pub mod patches;
pub mod routing;
pub mod transform;

pub use builder::ModelBuilder;
pub use capsule::{capsule_conv_layer, capsule_fc_layer, capsule_flatten, capsules_init, CapsuleGrid, CapsuleSet};
pub use config::{NetworkConfig, LayerConfig, PrimaryCapsConfig, ConvCapsConfig, FcCapsConfig, Padding};
pub use self::core::{CapsNet, Capsules};
pub use error::{CapsError, Result};
pub use layers::{capsule_norm, softmax, squash};
pub use params::{InMemoryParameterStore, ParameterStore};
pub use routing::{DynamicRouting, RoutingOutput};
pub use transform::{vec_transformation_by_conv, TransformShape};
