//! Extraction de patches par fenêtre glissante sur les grilles de capsules.
//!
//! Une couche de capsules convolutive route chaque position de sortie
//! indépendamment: son entrée est un batch de voisinages de `kh * kw * C`
//! capsules, un par (exemple, ligne, colonne de sortie). Les fenêtres qui se
//! chevauchent dupliquent leurs capsules communes.

use ndarray::{s, Array2, Array3, ArrayView4, ArrayView5, Axis};
use rayon::prelude::*;

use super::config::Padding;
use super::error::Result;

/// Offsets d'une fenêtre glissante valide (sans padding) avec stride
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchGrid {
    /// `(kh, kw)`
    pub kernel: (usize, usize),
    /// `h_offsets[ho]`: les `kh` lignes d'entrée couvertes par la ligne de sortie `ho`
    pub h_offsets: Vec<Vec<usize>>,
    /// Idem pour les colonnes
    pub w_offsets: Vec<Vec<usize>>,
}

/// Offsets de chaque fenêtre qui commence dans `0..=extent - kernel`, par pas de `stride`
pub fn kernel_offsets(tensor: &str, extent: usize, kernel: usize, stride: usize) -> Result<Vec<Vec<usize>>> {
    let count = Padding::Valid.output_extent(tensor, extent, kernel, stride)?;
    Ok((0..count)
        .map(|i| {
            let start = i * stride;
            (start..start + kernel).collect()
        })
        .collect())
}

impl PatchGrid {
    /// Grille pour une entrée `height x width`; `InvalidKernel` si le noyau ne tient pas
    pub fn new(height: usize, width: usize, kernel: (usize, usize), strides: (usize, usize)) -> Result<Self> {
        Ok(Self {
            kernel,
            h_offsets: kernel_offsets("poses height", height, kernel.0, strides.0)?,
            w_offsets: kernel_offsets("poses width", width, kernel.1, strides.1)?,
        })
    }

    /// Nombre de lignes de sortie
    pub fn out_height(&self) -> usize {
        self.h_offsets.len()
    }

    /// Nombre de colonnes de sortie
    pub fn out_width(&self) -> usize {
        self.w_offsets.len()
    }

    /// Nombre de fenêtres par exemple
    pub fn locations(&self) -> usize {
        self.out_height() * self.out_width()
    }

    /// Déplie les poses `[B, H, W, C, D]` en `[B * H_out * W_out, kh * kw * C, D]`.
    ///
    /// Lignes ordonnées par (batch, ligne de sortie, colonne de sortie); dans une
    /// ligne, capsules ordonnées par (ligne du noyau, colonne du noyau, canal).
    pub fn unfold_poses(&self, poses: &ArrayView5<f32>) -> Array3<f32> {
        let (batch_size, _, _, channels, dim) = poses.dim();
        let (kernel_h, kernel_w) = self.kernel;
        let locations = self.locations();
        let out_width = self.out_width();

        let mut patches = Array3::zeros((batch_size * locations, kernel_h * kernel_w * channels, dim));

        patches
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row, mut patch)| {
                let b = row / locations;
                let ho = (row % locations) / out_width;
                let wo = row % out_width;
                for (ki, &h) in self.h_offsets[ho].iter().enumerate() {
                    for (kj, &w) in self.w_offsets[wo].iter().enumerate() {
                        let start = (ki * kernel_w + kj) * channels;
                        patch
                            .slice_mut(s![start..start + channels, ..])
                            .assign(&poses.slice(s![b, h, w, .., ..]));
                    }
                }
            });

        patches
    }

    /// Déplie les activations `[B, H, W, C]` en `[B * H_out * W_out, kh * kw * C]`,
    /// dans le même ordre que [`PatchGrid::unfold_poses`].
    pub fn unfold_activations(&self, activations: &ArrayView4<f32>) -> Array2<f32> {
        let as_poses = activations.view().insert_axis(Axis(4));
        self.unfold_poses(&as_poses).index_axis_move(Axis(2), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::error::CapsError;
    use ndarray::{Array4, Array5};

    #[test]
    fn test_kernel_offsets() {
        let offsets = kernel_offsets("h", 5, 3, 1).unwrap();
        assert_eq!(offsets, vec![vec![0, 1, 2], vec![1, 2, 3], vec![2, 3, 4]]);

        let offsets = kernel_offsets("h", 6, 2, 3).unwrap();
        assert_eq!(offsets, vec![vec![0, 1], vec![3, 4]]);

        // Les dernières lignes qui ne peuvent pas commencer une fenêtre sont ignorées
        let offsets = kernel_offsets("h", 6, 3, 2).unwrap();
        assert_eq!(offsets, vec![vec![0, 1, 2], vec![2, 3, 4]]);
    }

    #[test]
    fn test_kernel_larger_than_input() {
        let err = kernel_offsets("h", 2, 3, 1).unwrap_err();
        assert!(matches!(err, CapsError::InvalidKernel { .. }));
    }

    #[test]
    fn test_output_extent_formula() {
        for (extent, kernel, stride) in [(7, 3, 2), (8, 3, 2), (9, 1, 3), (4, 4, 1), (10, 3, 3)] {
            let offsets = kernel_offsets("h", extent, kernel, stride).unwrap();
            assert_eq!(offsets.len(), (extent - kernel) / stride + 1);
            assert!(offsets.last().unwrap().last().unwrap() < &extent);
        }
    }

    #[test]
    fn test_unfold_poses_layout() {
        // La valeur encode ses coordonnées d'origine
        let poses = Array5::from_shape_fn((2, 3, 3, 2, 2), |(b, h, w, c, d)| {
            (b * 10000 + h * 1000 + w * 100 + c * 10 + d) as f32
        });
        let grid = PatchGrid::new(3, 3, (2, 2), (1, 1)).unwrap();
        let patches = grid.unfold_poses(&poses.view());
        assert_eq!(patches.dim(), (2 * 4, 2 * 2 * 2, 2));

        // batch 1, sortie (1, 0), noyau (1, 1), canal 1, dim 1
        let row = 4 + 2;
        let capsule = 3 * 2 + 1;
        assert_eq!(patches[[row, capsule, 1]], (10000 + 2 * 1000 + 100 + 10 + 1) as f32);
    }

    #[test]
    fn test_overlapping_windows_duplicate_capsules() {
        let poses = Array5::from_shape_fn((1, 1, 3, 1, 1), |(_, _, w, _, _)| w as f32);
        let grid = PatchGrid::new(1, 3, (1, 2), (1, 1)).unwrap();
        let patches = grid.unfold_poses(&poses.view());
        assert_eq!(patches.slice(s![0, .., 0]).to_vec(), vec![0.0, 1.0]);
        assert_eq!(patches.slice(s![1, .., 0]).to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_unfold_activations_matches_poses() {
        let activations = Array4::from_shape_fn((1, 4, 4, 3), |(_, h, w, c)| (h * 100 + w * 10 + c) as f32);
        let grid = PatchGrid::new(4, 4, (2, 2), (2, 2)).unwrap();
        let unfolded = grid.unfold_activations(&activations.view());
        assert_eq!(unfolded.dim(), (4, 12));

        let poses = activations.clone().insert_axis(Axis(4));
        let from_poses = grid.unfold_poses(&poses.view());
        assert_eq!(unfolded, from_poses.index_axis(Axis(2), 0));
    }
}
