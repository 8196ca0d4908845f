use ndarray::{Array4, ArrayView3};
use tracing::debug;

use super::error::{ensure_shape, CapsError, Result};
use super::params::{param_path, ParameterStore};

/// Dimensions d'une transformation de poses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformShape {
    /// `D_in`
    pub input_capsule_dim: usize,
    /// `I`
    pub input_capsule_num: usize,
    /// `D_out`
    pub output_capsule_dim: usize,
    /// `O`
    pub output_capsule_num: usize,
}

impl TransformShape {
    /// Forme de la matrice apprise: noyau de largeur 1 partagé par toutes les capsules d'entrée
    pub fn kernel_shape(&self) -> [usize; 3] {
        [
            1,
            self.input_capsule_dim,
            self.output_capsule_dim * self.output_capsule_num,
        ]
    }
}

/// Transforme les poses `[batch, I, D_in]` en votes `[batch, O, I, D_out]`.
///
/// Le noyau est lu dans `scope/weights`. Chaque capsule d'entrée est multipliée
/// par la même matrice `[D_in, O * D_out]`, puis l'axe des capsules de sortie
/// passe devant celui des entrées pour que le routage réduise sur les entrées.
pub fn vec_transformation_by_conv(
    poses: &ArrayView3<f32>,
    shape: TransformShape,
    store: &dyn ParameterStore,
    scope: &str,
) -> Result<Array4<f32>> {
    let TransformShape {
        input_capsule_dim,
        input_capsule_num,
        output_capsule_dim,
        output_capsule_num,
    } = shape;
    if output_capsule_dim == 0 || output_capsule_num == 0 {
        return Err(CapsError::InvalidConfig(format!(
            "{scope}: output capsule shape must be positive, got {output_capsule_num}x{output_capsule_dim}"
        )));
    }

    let batch_size = poses.dim().0;
    ensure_shape(
        &format!("{scope}/poses"),
        &[batch_size, input_capsule_num, input_capsule_dim],
        poses.shape(),
    )?;

    let kernel = store.get_or_create(&param_path(scope, "weights"), &shape.kernel_shape(), 0.0)?;
    debug!(scope, poses = ?poses.shape(), kernel = ?kernel.shape(), "pose transform");

    let kernel = kernel.to_shape((input_capsule_dim, output_capsule_dim * output_capsule_num))?;
    let flat = poses.to_shape((batch_size * input_capsule_num, input_capsule_dim))?;

    let votes = flat
        .dot(&kernel)
        .into_shape_with_order((batch_size, input_capsule_num, output_capsule_num, output_capsule_dim))?
        .permuted_axes([0, 2, 1, 3]);

    Ok(votes.as_standard_layout().into_owned())
}
