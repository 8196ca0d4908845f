use ndarray::{s, Array, Array4, ArrayBase, ArrayView4, Axis, Data, Dimension, Ix1, Ix4, RemoveAxis};
use rayon::prelude::*;

use super::config::{Activation, Padding};
use super::error::{ensure_shape, CapsError, Result};
use super::params::{param_path, ParameterStore};

/// Garde `squash` fini sur les vecteurs nuls (epsilon du backend Keras)
pub const EPSILON: f32 = 1e-7;

/// Résout un axe éventuellement négatif selon le rang du tenseur
pub fn resolve_axis(ndim: usize, axis: isize) -> Result<Axis> {
    let resolved = if axis < 0 { ndim as isize + axis } else { axis };
    if resolved < 0 || resolved as usize >= ndim {
        return Err(CapsError::InvalidAxis { axis, ndim });
    }
    Ok(Axis(resolved as usize))
}

/// Softmax le long de `axis`, décalé par le max de chaque ligne pour la stabilité numérique
pub fn softmax<S, D>(x: &ArrayBase<S, D>, axis: isize) -> Result<Array<f32, D>>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let axis = resolve_axis(x.ndim(), axis)?;
    let mut out = x.to_owned();
    for mut lane in out.lanes_mut(axis) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    Ok(out)
}

/// Fonction squash: `x * sqrt(|x|² + ε) / (0.5 + |x|² + ε)`.
///
/// Le 0.5 au dénominateur (au lieu de 1.0) fait saturer les vecteurs plus tôt;
/// les poids entraînés en dépendent.
///
/// La norme au carré et l'échelle sont calculées en f64, sinon `|x|²` déborde
/// en f32 au-delà de `|x| ≈ 1.8e19`. La norme de sortie vaut `|x|² / (0.5 + |x|²)`,
/// toujours < 1 en valeur exacte, mais arrondie à exactement 1.0 en f32 dès
/// que `|x|` dépasse environ 4e3.
pub fn squash<S, D>(x: &ArrayBase<S, D>, axis: isize) -> Result<Array<f32, D>>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let axis = resolve_axis(x.ndim(), axis)?;
    let mut out = x.to_owned();
    for mut lane in out.lanes_mut(axis) {
        let squared_norm = lane.iter().map(|&v| v as f64 * v as f64).sum::<f64>() + EPSILON as f64;
        let scale = (squared_norm.sqrt() / (0.5 + squared_norm)) as f32;
        lane.mapv_inplace(|v| v * scale);
    }
    Ok(out)
}

/// Norme euclidienne le long de `axis` (axe supprimé du résultat), sans epsilon
pub fn capsule_norm<S, D>(x: &ArrayBase<S, D>, axis: isize) -> Result<Array<f32, D::Smaller>>
where
    S: Data<Elem = f32>,
    D: RemoveAxis,
{
    let axis = resolve_axis(x.ndim(), axis)?;
    Ok(x.map_axis(axis, |lane| lane.dot(&lane).sqrt()))
}

/// Paramètres d'une convolution 2D scalaire
#[derive(Debug, Clone)]
pub struct Conv2dSpec {
    /// `[kh, kw, c_in, c_out]`
    pub kernel: [usize; 4],
    /// `[1, sh, sw, 1]`
    pub strides: [usize; 4],
    pub padding: Padding,
    /// Ajoute `scope/biases` `[c_out]`
    pub add_bias: bool,
    pub activation: Activation,
}

/// Convolution NHWC, poids lus dans `scope/weights` et, si `add_bias`,
/// biais dans `scope/biases`. Parallélisée par batch.
pub fn conv2d(
    inputs: &ArrayView4<f32>,
    store: &dyn ParameterStore,
    scope: &str,
    spec: &Conv2dSpec,
) -> Result<Array4<f32>> {
    let (batch_size, in_height, in_width, in_channels) = inputs.dim();
    let [kernel_h, kernel_w, kernel_in, out_channels] = spec.kernel;
    let (stride_h, stride_w) = (spec.strides[1], spec.strides[2]);

    ensure_shape(
        &format!("{scope}/inputs channels"),
        &[kernel_in],
        &[in_channels],
    )?;

    let out_height = spec.padding.output_extent(scope, in_height, kernel_h, stride_h)?;
    let out_width = spec.padding.output_extent(scope, in_width, kernel_w, stride_w)?;
    let pad_top = spec.padding.pad_before(in_height, kernel_h, stride_h, out_height);
    let pad_left = spec.padding.pad_before(in_width, kernel_w, stride_w, out_width);

    let weights = store
        .get_or_create(&param_path(scope, "weights"), &spec.kernel, 0.0)?
        .into_dimensionality::<Ix4>()?;
    let biases = if spec.add_bias {
        Some(
            store
                .get_or_create(&param_path(scope, "biases"), &[out_channels], 0.0)?
                .into_dimensionality::<Ix1>()?,
        )
    } else {
        None
    };

    let mut output = Array4::zeros((batch_size, out_height, out_width, out_channels));

    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(b, mut out_batch)| {
            let input_batch = inputs.index_axis(Axis(0), b);

            for oh in 0..out_height {
                for ow in 0..out_width {
                    let mut acc = out_batch.slice_mut(s![oh, ow, ..]);

                    for kh in 0..kernel_h {
                        let ih = (oh * stride_h + kh) as isize - pad_top as isize;
                        if ih < 0 || ih as usize >= in_height {
                            continue;
                        }
                        for kw in 0..kernel_w {
                            let iw = (ow * stride_w + kw) as isize - pad_left as isize;
                            if iw < 0 || iw as usize >= in_width {
                                continue;
                            }
                            let pixel = input_batch.slice(s![ih as usize, iw as usize, ..]);
                            let taps = weights.slice(s![kh, kw, .., ..]);
                            acc += &pixel.dot(&taps);
                        }
                    }

                    if let Some(biases) = &biases {
                        acc += biases;
                    }
                    if spec.activation == Activation::ReLU {
                        acc.mapv_inplace(|v| v.max(0.0));
                    }
                }
            }
        });

    Ok(output)
}
