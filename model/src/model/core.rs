use std::fmt;
use std::sync::Arc;

use ndarray::{Array4, ArrayView4, Axis};
use tracing::info;

use super::capsule::{
    capsule_conv_layer, capsule_fc_layer, capsule_flatten, capsules_init, CapsuleGrid, CapsuleSet,
};
use super::config::{CapsuleShape, LayerConfig, NetworkConfig};
use super::error::{ensure_shape, CapsError, Result};
use super::params::ParameterStore;

/// Sortie d'une couche quelconque de la pile
#[derive(Debug, Clone)]
pub enum Capsules {
    Grid(CapsuleGrid),
    Set(CapsuleSet),
}

impl Capsules {
    /// Forme des poses
    pub fn pose_shape(&self) -> &[usize] {
        match self {
            Capsules::Grid(grid) => grid.poses.shape(),
            Capsules::Set(set) => set.poses.shape(),
        }
    }

    /// Forme des activations
    pub fn activation_shape(&self) -> &[usize] {
        match self {
            Capsules::Grid(grid) => grid.activations.shape(),
            Capsules::Set(set) => set.activations.shape(),
        }
    }
}

/// Tenseur circulant entre deux couches
enum Stage {
    Input(Array4<f32>),
    Caps(Capsules),
}

/// Réseau de capsules configuré, partageant un seul magasin de paramètres
pub struct CapsNet {
    pub network_config: NetworkConfig,
    pub shapes: Vec<CapsuleShape>,
    store: Arc<dyn ParameterStore>,
}

// Le magasin n'implémente pas Debug
impl fmt::Debug for CapsNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapsNet")
            .field("network_config", &self.network_config)
            .field("shapes", &self.shapes)
            .finish_non_exhaustive()
    }
}

impl CapsNet {
    /// Valide la configuration et infère les formes de chaque couche
    pub fn new(network_config: NetworkConfig, store: Arc<dyn ParameterStore>) -> Result<Self> {
        network_config.validate()?;
        let shapes = network_config.infer_shapes()?;
        Ok(Self {
            network_config,
            shapes,
            store,
        })
    }

    /// Magasin de paramètres utilisé par toutes les couches
    pub fn store(&self) -> &Arc<dyn ParameterStore> {
        &self.store
    }

    /// Forward pass de `inputs` `[B, H, W, C]` à travers toutes les couches
    pub fn forward(&self, inputs: &ArrayView4<f32>) -> Result<Capsules> {
        let (height, width, channels) = self.network_config.input_shape;
        ensure_shape(
            "inputs",
            &[inputs.dim().0, height, width, channels],
            inputs.shape(),
        )?;

        let store = self.store.as_ref();
        let mut stage = Stage::Input(inputs.to_owned());

        for layer in &self.network_config.layers {
            stage = match (layer, stage) {
                (LayerConfig::PrimaryCapsules { name, config }, Stage::Input(x)) => {
                    Stage::Caps(Capsules::Grid(capsules_init(&x.view(), config, store, name)?))
                }
                (LayerConfig::ConvCapsules { name, config }, Stage::Caps(Capsules::Grid(grid))) => {
                    Stage::Caps(Capsules::Grid(capsule_conv_layer(&grid, config, store, name)?))
                }
                (LayerConfig::Flatten, Stage::Caps(Capsules::Grid(grid))) => {
                    Stage::Caps(Capsules::Set(capsule_flatten(&grid)?))
                }
                (LayerConfig::FcCapsules { name, config }, Stage::Caps(Capsules::Set(set))) => {
                    Stage::Caps(Capsules::Set(capsule_fc_layer(&set, config, store, name)?))
                }
                (layer, _) => {
                    return Err(CapsError::LayerOrder {
                        layer: layer.name().to_string(),
                        expected: match layer {
                            LayerConfig::PrimaryCapsules { .. } => "raw input",
                            LayerConfig::FcCapsules { .. } => "flat",
                            _ => "grid",
                        },
                    })
                }
            };
        }

        match stage {
            Stage::Caps(caps) => Ok(caps),
            Stage::Input(_) => Err(CapsError::InvalidConfig(
                "network has no capsule layers".to_string(),
            )),
        }
    }

    /// Prédiction: capsule de sortie la plus active pour chaque exemple
    pub fn predict(&self, inputs: &ArrayView4<f32>) -> Result<Vec<usize>> {
        let set = match self.forward(inputs)? {
            Capsules::Set(set) => set,
            Capsules::Grid(_) => {
                return Err(CapsError::LayerOrder {
                    layer: "predict".to_string(),
                    expected: "flat",
                })
            }
        };

        Ok(set
            .activations
            .axis_iter(Axis(0))
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &a)| if a > best.1 { (i, a) } else { best })
                    .0
            })
            .collect())
    }

    /// Diagnostic rapide: batch nul à travers le réseau, formes journalisées
    pub fn diagnostic(&self) -> Result<Capsules> {
        info!(layers = self.network_config.layers.len(), input = ?self.network_config.input_shape, "capsnet diagnostic");
        for (layer, shape) in self.network_config.layers.iter().zip(&self.shapes) {
            info!(layer = layer.name(), ?shape, "layer output");
        }

        let (h, w, c) = self.network_config.input_shape;
        let output = self.forward(&Array4::zeros((1, h, w, c)).view())?;
        info!(poses = ?output.pose_shape(), activations = ?output.activation_shape(), "capsnet operational");
        Ok(output)
    }
}
