//! Couches de réseau de capsules avec routage par agreement.
//!
//! Les couches se passent des paires `(poses, activations)`: la couche primaire
//! transforme une feature map en grille de capsules, les couches convolutives
//! routent les voisinages locaux de cette grille, et les couches denses routent
//! un ensemble aplati. Les tenseurs appris viennent d'un [`ParameterStore`].

pub mod model;

pub use model::{
    capsule_conv_layer, capsule_fc_layer, capsule_flatten, capsule_norm, capsules_init, softmax, squash,
    vec_transformation_by_conv, CapsError, CapsNet, CapsuleGrid, CapsuleSet, Capsules, ConvCapsConfig,
    DynamicRouting, FcCapsConfig, InMemoryParameterStore, LayerConfig, ModelBuilder, NetworkConfig, Padding,
    ParameterStore, PrimaryCapsConfig, Result, RoutingOutput, TransformShape,
};
