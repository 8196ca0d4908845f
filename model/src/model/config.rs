use serde::{Deserialize, Serialize};

use super::error::{CapsError, Result};

/// Padding spatial de la convolution scalaire des capsules primaires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Pas de padding, fenêtres entières uniquement
    Valid,
    /// Sortie `ceil(extent / stride)`, zéros répartis autour de l'entrée
    Same,
}

impl Padding {
    /// Étendue de sortie le long d'un axe spatial
    pub fn output_extent(&self, tensor: &str, extent: usize, kernel: usize, stride: usize) -> Result<usize> {
        let invalid = || CapsError::InvalidKernel {
            tensor: tensor.to_string(),
            extent,
            kernel,
            stride,
        };
        if kernel == 0 || stride == 0 || extent == 0 {
            return Err(invalid());
        }
        match self {
            Padding::Valid => {
                if kernel > extent {
                    return Err(invalid());
                }
                Ok((extent - kernel) / stride + 1)
            }
            Padding::Same => Ok((extent + stride - 1) / stride),
        }
    }

    /// Rangées de zéros insérées avant la première rangée. `Same` met la rangée impaire à la fin.
    pub fn pad_before(&self, extent: usize, kernel: usize, stride: usize, output: usize) -> usize {
        match self {
            Padding::Valid => 0,
            Padding::Same => {
                let needed = (output.saturating_sub(1)) * stride + kernel;
                needed.saturating_sub(extent) / 2
            }
        }
    }
}

/// Activation appliquée en sortie de convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    None,
    ReLU,
}

/// Configuration de la couche de capsules primaires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryCapsConfig {
    /// `[kh, kw, c_in, c_out]`, `c_out` en types de capsules
    pub kernel: [usize; 4],
    /// `[1, sh, sw, 1]`
    pub strides: [usize; 4],
    pub padding: Padding,
    /// Dimension des poses
    pub pose_dim: usize,
    /// Biais de la convolution
    pub add_bias: bool,
}

/// Configuration d'une couche de capsules convolutive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvCapsConfig {
    /// `[kh, kw, c_in, c_out]`
    pub kernel: [usize; 4],
    /// `[1, sh, sw, 1]`
    pub strides: [usize; 4],
    /// Tours de routage
    pub iterations: usize,
}

/// Configuration d'une couche de capsules dense
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FcCapsConfig {
    /// Nombre de capsules de sortie
    pub output_capsule_num: usize,
    /// Par défaut, la dimension des poses d'entrée
    #[serde(default)]
    pub output_capsule_dim: Option<usize>,
    /// Tours de routage
    pub iterations: usize,
}

/// Une couche de la pile, taguée par `kind` en JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerConfig {
    PrimaryCapsules { name: String, config: PrimaryCapsConfig },
    ConvCapsules { name: String, config: ConvCapsConfig },
    Flatten,
    FcCapsules { name: String, config: FcCapsConfig },
}

impl LayerConfig {
    /// Nom de la couche, aussi scope de ses paramètres
    pub fn name(&self) -> &str {
        match self {
            LayerConfig::PrimaryCapsules { name, .. }
            | LayerConfig::ConvCapsules { name, .. }
            | LayerConfig::FcCapsules { name, .. } => name,
            LayerConfig::Flatten => "flatten",
        }
    }
}

/// Configuration complète du réseau
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// `(hauteur, largeur, canaux)` d'une image d'entrée
    pub input_shape: (usize, usize, usize),
    /// Couches dans l'ordre d'application
    pub layers: Vec<LayerConfig>,
}

/// Forme par exemple du tenseur qui circule entre deux couches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsuleShape {
    Input { height: usize, width: usize, channels: usize },
    Grid { height: usize, width: usize, capsules: usize, pose_dim: usize },
    Set { capsules: usize, pose_dim: usize },
}

fn check_strides(layer: &str, strides: &[usize; 4]) -> Result<()> {
    if strides[1] == 0 || strides[2] == 0 {
        return Err(CapsError::InvalidConfig(format!(
            "{layer}: spatial strides must be positive, got {strides:?}"
        )));
    }
    Ok(())
}

fn check_nonzero(layer: &str, what: &str, values: &[usize]) -> Result<()> {
    if values.iter().any(|&v| v == 0) {
        return Err(CapsError::InvalidConfig(format!(
            "{layer}: {what} must be positive, got {values:?}"
        )));
    }
    Ok(())
}

fn check_iterations(layer: &str, iterations: usize) -> Result<()> {
    if iterations == 0 {
        return Err(CapsError::InvalidConfig(format!(
            "{layer}: routing iterations must be >= 1"
        )));
    }
    Ok(())
}

impl PrimaryCapsConfig {
    /// Noyau, strides et dimension des poses non nuls
    pub fn validate(&self) -> Result<()> {
        check_nonzero("primary capsules", "kernel", &self.kernel)?;
        check_strides("primary capsules", &self.strides)?;
        check_nonzero("primary capsules", "pose_dim", &[self.pose_dim])
    }
}

impl ConvCapsConfig {
    /// Noyau et strides non nuls, au moins un tour de routage
    pub fn validate(&self) -> Result<()> {
        check_nonzero("conv capsules", "kernel", &self.kernel)?;
        check_strides("conv capsules", &self.strides)?;
        check_iterations("conv capsules", self.iterations)
    }
}

impl FcCapsConfig {
    /// Dimensions de sortie non nulles, au moins un tour de routage
    pub fn validate(&self) -> Result<()> {
        check_nonzero("fc capsules", "output_capsule_num", &[self.output_capsule_num])?;
        if let Some(dim) = self.output_capsule_dim {
            check_nonzero("fc capsules", "output_capsule_dim", &[dim])?;
        }
        check_iterations("fc capsules", self.iterations)
    }
}

impl NetworkConfig {
    /// Lecture et validation d'une configuration JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let config: NetworkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validation de l'entrée et de chaque couche
    pub fn validate(&self) -> Result<()> {
        let (h, w, c) = self.input_shape;
        check_nonzero("network", "input_shape", &[h, w, c])?;
        if self.layers.is_empty() {
            return Err(CapsError::InvalidConfig(
                "network must have at least one layer".to_string(),
            ));
        }
        for layer in &self.layers {
            match layer {
                LayerConfig::PrimaryCapsules { config, .. } => config.validate()?,
                LayerConfig::ConvCapsules { config, .. } => config.validate()?,
                LayerConfig::FcCapsules { config, .. } => config.validate()?,
                LayerConfig::Flatten => {}
            }
        }
        Ok(())
    }

    /// Forme de sortie de chaque couche, dans l'ordre. Échoue sur la première
    /// couche dont l'entrée ne correspond pas à sa configuration.
    pub fn infer_shapes(&self) -> Result<Vec<CapsuleShape>> {
        let (height, width, channels) = self.input_shape;
        let mut current = CapsuleShape::Input { height, width, channels };
        let mut shapes = Vec::with_capacity(self.layers.len());

        for layer in &self.layers {
            current = match (layer, current) {
                (
                    LayerConfig::PrimaryCapsules { name, config },
                    CapsuleShape::Input { height, width, channels },
                ) => {
                    let [kh, kw, c_in, c_out] = config.kernel;
                    if c_in != channels {
                        return Err(CapsError::shape_mismatch(
                            format!("{name}/inputs channels"),
                            &[c_in],
                            &[channels],
                        ));
                    }
                    CapsuleShape::Grid {
                        height: config.padding.output_extent(name, height, kh, config.strides[1])?,
                        width: config.padding.output_extent(name, width, kw, config.strides[2])?,
                        capsules: c_out,
                        pose_dim: config.pose_dim,
                    }
                }
                (
                    LayerConfig::ConvCapsules { name, config },
                    CapsuleShape::Grid { height, width, capsules, pose_dim },
                ) => {
                    let [kh, kw, c_in, c_out] = config.kernel;
                    if c_in != capsules {
                        return Err(CapsError::shape_mismatch(
                            format!("{name}/poses capsules"),
                            &[c_in],
                            &[capsules],
                        ));
                    }
                    CapsuleShape::Grid {
                        height: Padding::Valid.output_extent(name, height, kh, config.strides[1])?,
                        width: Padding::Valid.output_extent(name, width, kw, config.strides[2])?,
                        capsules: c_out,
                        pose_dim,
                    }
                }
                (
                    LayerConfig::Flatten,
                    CapsuleShape::Grid { height, width, capsules, pose_dim },
                ) => CapsuleShape::Set {
                    capsules: height * width * capsules,
                    pose_dim,
                },
                (LayerConfig::FcCapsules { config, .. }, CapsuleShape::Set { pose_dim, .. }) => {
                    CapsuleShape::Set {
                        capsules: config.output_capsule_num,
                        pose_dim: config.output_capsule_dim.unwrap_or(pose_dim),
                    }
                }
                (layer, _) => {
                    return Err(CapsError::LayerOrder {
                        layer: layer.name().to_string(),
                        expected: match layer {
                            LayerConfig::PrimaryCapsules { .. } => "raw input",
                            LayerConfig::ConvCapsules { .. } | LayerConfig::Flatten => "grid",
                            LayerConfig::FcCapsules { .. } => "flat",
                        },
                    })
                }
            };
            shapes.push(current);
        }

        Ok(shapes)
    }
}

/// Réseau type MNIST: 28x28x1, capsules primaires 9x9 s2, capsules conv 3x3 s2, 10 classes
impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input_shape: (28, 28, 1),
            layers: vec![
                LayerConfig::PrimaryCapsules {
                    name: "primary".to_string(),
                    config: PrimaryCapsConfig {
                        kernel: [9, 9, 1, 8],
                        strides: [1, 2, 2, 1],
                        padding: Padding::Valid,
                        pose_dim: 8,
                        add_bias: true,
                    },
                },
                LayerConfig::ConvCapsules {
                    name: "conv_caps".to_string(),
                    config: ConvCapsConfig {
                        kernel: [3, 3, 8, 8],
                        strides: [1, 2, 2, 1],
                        iterations: 3,
                    },
                },
                LayerConfig::Flatten,
                LayerConfig::FcCapsules {
                    name: "fc_caps".to_string(),
                    config: FcCapsConfig {
                        output_capsule_num: 10,
                        output_capsule_dim: None,
                        iterations: 3,
                    },
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_shapes() {
        let config = NetworkConfig::default();
        config.validate().unwrap();
        let shapes = config.infer_shapes().unwrap();
        assert_eq!(
            shapes,
            vec![
                CapsuleShape::Grid { height: 10, width: 10, capsules: 8, pose_dim: 8 },
                CapsuleShape::Grid { height: 4, width: 4, capsules: 8, pose_dim: 8 },
                CapsuleShape::Set { capsules: 128, pose_dim: 8 },
                CapsuleShape::Set { capsules: 10, pose_dim: 8 },
            ]
        );
    }

    #[test]
    fn test_output_extent() {
        assert_eq!(Padding::Valid.output_extent("x", 5, 3, 1).unwrap(), 3);
        assert_eq!(Padding::Valid.output_extent("x", 6, 3, 2).unwrap(), 2);
        assert_eq!(Padding::Same.output_extent("x", 5, 3, 2).unwrap(), 3);
        assert!(Padding::Valid.output_extent("x", 2, 3, 1).is_err());
        assert!(Padding::Valid.output_extent("x", 4, 3, 0).is_err());
    }

    #[test]
    fn test_same_padding_offsets() {
        // Largeur 5, noyau 3, stride 2: sortie 3, 7 rangées, une de chaque côté
        assert_eq!(Padding::Same.pad_before(5, 3, 2, 3), 1);
        // Largeur 4, noyau 2, stride 1: 5 rangées, la rangée en plus va après
        assert_eq!(Padding::Same.pad_before(4, 2, 1, 4), 0);
        assert_eq!(Padding::Valid.pad_before(4, 2, 1, 3), 0);
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let config = ConvCapsConfig {
            kernel: [2, 2, 1, 2],
            strides: [1, 1, 1, 1],
            iterations: 0,
        };
        assert!(matches!(config.validate(), Err(CapsError::InvalidConfig(_))));
    }

    #[test]
    fn test_channel_mismatch_detected() {
        let mut config = NetworkConfig::default();
        if let LayerConfig::ConvCapsules { config, .. } = &mut config.layers[1] {
            config.kernel[2] = 4;
        }
        let err = config.infer_shapes().unwrap_err();
        assert!(matches!(err, CapsError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_layer_order_detected() {
        let mut config = NetworkConfig::default();
        config.layers.remove(2);
        let err = config.infer_shapes().unwrap_err();
        assert!(matches!(err, CapsError::LayerOrder { .. }));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "input_shape": [4, 4, 3],
            "layers": [
                {"kind": "primary_capsules", "name": "primary", "config": {
                    "kernel": [3, 3, 3, 2], "strides": [1, 1, 1, 1],
                    "padding": "valid", "pose_dim": 4, "add_bias": false}},
                {"kind": "flatten"},
                {"kind": "fc_capsules", "name": "fc", "config": {
                    "output_capsule_num": 3, "iterations": 2}}
            ]
        }"#;
        let config = NetworkConfig::from_json(json).unwrap();
        assert_eq!(config.layers.len(), 3);
        let shapes = config.infer_shapes().unwrap();
        assert_eq!(shapes[2], CapsuleShape::Set { capsules: 3, pose_dim: 4 });
    }
}
