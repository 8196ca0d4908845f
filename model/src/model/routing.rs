use ndarray::{Array2, Array3, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;
use tracing::trace;

use super::error::{CapsError, Result};
use super::layers::{capsule_norm, softmax, squash};

/// Capsules routées: poses `[batch, O, D]` et leurs normes `[batch, O]`
#[derive(Debug, Clone)]
pub struct RoutingOutput {
    /// Poses squashées `v_j`
    pub poses: Array3<f32>,
    /// Norme de chaque pose
    pub activations: Array2<f32>,
}

/// Routage dynamique par agreement sur un tenseur de votes `[batch, O, I, D]`
pub struct DynamicRouting {
    pub num_iterations: usize,
}

impl DynamicRouting {
    /// Routage à `num_iterations` tours (au moins 1)
    pub fn new(num_iterations: usize) -> Self {
        Self { num_iterations }
    }

    /// Routage qui renvoie aussi les coefficients de couplage `[batch, O, I]` de chaque tour
    pub fn route_with_coeffs(
        &self,
        predictions: &ArrayView4<f32>,
    ) -> Result<(RoutingOutput, Vec<Array3<f32>>)> {
        if self.num_iterations == 0 {
            return Err(CapsError::InvalidConfig(
                "routing iterations must be >= 1".to_string(),
            ));
        }
        let (batch_size, output_caps, input_caps, dim) = predictions.dim();
        if output_caps == 0 || input_caps == 0 || dim == 0 {
            return Err(CapsError::InvalidConfig(format!(
                "u_hat_vecs: empty capsule axis, got {:?}",
                predictions.shape()
            )));
        }

        // b_ij
        let mut logits = Array3::<f32>::zeros((batch_size, output_caps, input_caps));
        let mut history = Vec::with_capacity(self.num_iterations);
        let mut outputs = Array3::<f32>::zeros((batch_size, output_caps, dim));

        for iteration in 0..self.num_iterations {
            // c_ij, normalisés sur les capsules de sortie
            let coupling_coeffs = softmax(&logits, 1)?;

            // v_j = squash(Σ_i c_ij * û_j|i)
            let weighted = Self::weighted_sum_parallel(predictions, &coupling_coeffs.view());
            outputs = squash(&weighted, -1)?;

            if iteration < self.num_iterations - 1 {
                Self::update_logits_parallel(predictions, &outputs.view(), &mut logits);
            }
            trace!(iteration, "routing round done");
            history.push(coupling_coeffs);
        }

        let activations = capsule_norm(&outputs, -1)?;
        Ok((
            RoutingOutput {
                poses: outputs,
                activations,
            },
            history,
        ))
    }

    /// Routage: poses et activations du dernier tour
    pub fn route(&self, predictions: &ArrayView4<f32>) -> Result<RoutingOutput> {
        let (output, _) = self.route_with_coeffs(predictions)?;
        Ok(output)
    }

    /// `s[b, o, :] = Σ_i c[b, o, i] * û[b, o, i, :]`
    fn weighted_sum_parallel(
        predictions: &ArrayView4<f32>,
        coupling_coeffs: &ArrayView3<f32>,
    ) -> Array3<f32> {
        let (batch_size, output_caps, _, dim) = predictions.dim();
        let mut outputs = Array3::zeros((batch_size, output_caps, dim));

        outputs
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut output_batch)| {
                let votes = predictions.index_axis(Axis(0), b);
                let coeffs = coupling_coeffs.index_axis(Axis(0), b);
                for oc in 0..output_caps {
                    let summed = coeffs.row(oc).dot(&votes.index_axis(Axis(0), oc));
                    output_batch.row_mut(oc).assign(&summed);
                }
            });

        outputs
    }

    /// `b[b, o, i] += <v[b, o, :], û[b, o, i, :]>`
    fn update_logits_parallel(
        predictions: &ArrayView4<f32>,
        outputs: &ArrayView3<f32>,
        logits: &mut Array3<f32>,
    ) {
        let output_caps = predictions.dim().1;

        logits
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut logits_batch)| {
                let votes = predictions.index_axis(Axis(0), b);
                for oc in 0..output_caps {
                    let agreement = votes.index_axis(Axis(0), oc).dot(&outputs.slice(ndarray::s![b, oc, ..]));
                    let mut row = logits_batch.row_mut(oc);
                    row += &agreement;
                }
            });
    }
}
