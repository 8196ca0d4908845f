use ndarray::{Array2, Array3, Array4, Array5, ArrayView4, Ix2};
use tracing::debug;

use super::config::{Activation, ConvCapsConfig, FcCapsConfig, PrimaryCapsConfig};
use super::error::{ensure_shape, CapsError, Result};
use super::layers::{capsule_norm, conv2d, squash, Conv2dSpec};
use super::params::{param_path, ParameterStore};
use super::patches::PatchGrid;
use super::routing::DynamicRouting;
use super::transform::{vec_transformation_by_conv, TransformShape};

/// Capsules disposées sur une grille spatiale: poses `[B, H, W, C, D]`, activations `[B, H, W, C]`
#[derive(Debug, Clone)]
pub struct CapsuleGrid {
    /// Vecteurs de pose
    pub poses: Array5<f32>,
    /// Activation de chaque capsule
    pub activations: Array4<f32>,
}

/// Ensemble plat de capsules: poses `[B, N, D]`, activations `[B, N]`
#[derive(Debug, Clone)]
pub struct CapsuleSet {
    /// Vecteurs de pose
    pub poses: Array3<f32>,
    /// Activation de chaque capsule
    pub activations: Array2<f32>,
}

impl CapsuleGrid {
    /// Grille dont les activations doivent couvrir `poses.shape()[..4]`
    pub fn new(poses: Array5<f32>, activations: Array4<f32>) -> Result<Self> {
        ensure_shape("activations", &poses.shape()[..4], activations.shape())?;
        Ok(Self { poses, activations })
    }

    /// Dimension des poses `D`
    pub fn pose_dim(&self) -> usize {
        self.poses.dim().4
    }
}

impl CapsuleSet {
    /// Ensemble dont les activations doivent couvrir `poses.shape()[..2]`
    pub fn new(poses: Array3<f32>, activations: Array2<f32>) -> Result<Self> {
        ensure_shape("activations", &poses.shape()[..2], activations.shape())?;
        Ok(Self { poses, activations })
    }

    /// Dimension des poses `D`
    pub fn pose_dim(&self) -> usize {
        self.poses.dim().2
    }
}

/// Capsules primaires à partir d'une feature map `[B, H, W, C_in]`.
///
/// Une convolution scalaire produit `C_out * pose_dim` canaux, découpés en
/// poses puis squashés. Les activations sont les normes des poses plus un
/// biais appris par type de capsule, `beta_a`.
pub fn capsules_init(
    inputs: &ArrayView4<f32>,
    config: &PrimaryCapsConfig,
    store: &dyn ParameterStore,
    name: &str,
) -> Result<CapsuleGrid> {
    config.validate()?;
    let [kh, kw, c_in, c_out] = config.kernel;
    let pose_dim = config.pose_dim;

    let stacked = conv2d(
        inputs,
        store,
        &param_path(name, "pose_stacked"),
        &Conv2dSpec {
            kernel: [kh, kw, c_in, c_out * pose_dim],
            strides: config.strides,
            padding: config.padding,
            add_bias: config.add_bias,
            activation: Activation::None,
        },
    )?;
    let (batch_size, height, width, _) = stacked.dim();
    let poses = stacked.into_shape_with_order((batch_size, height, width, c_out, pose_dim))?;
    let poses = squash(&poses, -1)?;

    let beta_a = store
        .get_or_create(&param_path(name, "beta_a"), &[1, c_out], 0.0)?
        .into_dimensionality::<Ix2>()?;
    let activations = capsule_norm(&poses, -1)? + &beta_a.row(0);

    debug!(layer = name, poses = ?poses.shape(), activations = ?activations.shape(), "primary capsules");
    CapsuleGrid::new(poses, activations)
}

/// Couche de capsules convolutive: chaque voisinage `kh x kw` de la grille
/// est routé vers `C_out` types de capsules à une position de sortie.
pub fn capsule_conv_layer(
    nets: &CapsuleGrid,
    config: &ConvCapsConfig,
    store: &dyn ParameterStore,
    name: &str,
) -> Result<CapsuleGrid> {
    config.validate()?;
    let [kh, kw, c_in, c_out] = config.kernel;
    let (batch_size, height, width, channels, pose_dim) = nets.poses.dim();
    ensure_shape(&format!("{name}/poses capsules"), &[c_in], &[channels])?;

    let grid = PatchGrid::new(height, width, (kh, kw), (config.strides[1], config.strides[2]))?;
    let poses_patches = grid.unfold_poses(&nets.poses.view());
    debug!(layer = name, patches = ?poses_patches.shape(), "pose patches");

    if tracing::enabled!(tracing::Level::DEBUG) {
        let activation_patches = grid.unfold_activations(&nets.activations.view());
        debug!(layer = name, patches = ?activation_patches.shape(), "activation patches");
    }

    let votes = vec_transformation_by_conv(
        &poses_patches.view(),
        TransformShape {
            input_capsule_dim: pose_dim,
            input_capsule_num: kh * kw * c_in,
            output_capsule_dim: pose_dim,
            output_capsule_num: c_out,
        },
        store,
        name,
    )?;
    debug!(layer = name, votes = ?votes.shape(), "conv capsule votes");

    let routed = DynamicRouting::new(config.iterations).route(&votes.view())?;

    let (out_height, out_width) = (grid.out_height(), grid.out_width());
    let poses = routed
        .poses
        .into_shape_with_order((batch_size, out_height, out_width, c_out, pose_dim))?;
    let activations = routed
        .activations
        .into_shape_with_order((batch_size, out_height, out_width, c_out))?;

    debug!(layer = name, poses = ?poses.shape(), activations = ?activations.shape(), "conv capsules");
    CapsuleGrid::new(poses, activations)
}

/// Couche de capsules dense: chaque capsule d'entrée vote pour chaque capsule de sortie
pub fn capsule_fc_layer(
    nets: &CapsuleSet,
    config: &FcCapsConfig,
    store: &dyn ParameterStore,
    name: &str,
) -> Result<CapsuleSet> {
    config.validate()?;
    let (_, input_capsule_num, input_capsule_dim) = nets.poses.dim();

    let votes = vec_transformation_by_conv(
        &nets.poses.view(),
        TransformShape {
            input_capsule_dim,
            input_capsule_num,
            output_capsule_dim: config.output_capsule_dim.unwrap_or(input_capsule_dim),
            output_capsule_num: config.output_capsule_num,
        },
        store,
        name,
    )?;
    debug!(layer = name, votes = ?votes.shape(), "fc capsule votes");

    let routed = DynamicRouting::new(config.iterations).route(&votes.view())?;

    debug!(layer = name, poses = ?routed.poses.shape(), "fc capsules");
    CapsuleSet::new(routed.poses, routed.activations)
}

/// Aplatit `(H, W, C)` en un seul axe de capsules, H d'abord
pub fn capsule_flatten(nets: &CapsuleGrid) -> Result<CapsuleSet> {
    let (batch_size, height, width, channels, pose_dim) = nets.poses.dim();
    let capsules = height * width * channels;
    if capsules == 0 {
        return Err(CapsError::InvalidConfig(format!(
            "poses: empty capsule axis, got {:?}",
            nets.poses.shape()
        )));
    }

    let poses = nets
        .poses
        .to_shape((batch_size, capsules, pose_dim))?
        .into_owned();
    let activations = nets.activations.to_shape((batch_size, capsules))?.into_owned();

    debug!(poses = ?poses.shape(), activations = ?activations.shape(), "flatten");
    CapsuleSet::new(poses, activations)
}
