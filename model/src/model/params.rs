//! Stockage des paramètres appris.
//!
//! Les couches ne possèdent pas leurs poids: elles demandent un tenseur au
//! [`ParameterStore`] par nom hiérarchique (`couche/feuille`) et reçoivent un
//! handle partagé, vu par tous les forward passes qui utilisent le magasin.

use std::collections::HashMap;

use ndarray::{ArcArray, ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::error::{CapsError, Result};

/// Tenseur appris partagé
pub type Parameter = ArcArray<f32, IxDyn>;

/// Source des tenseurs appris, indexés par chemin
pub trait ParameterStore: Send + Sync {
    /// Renvoie le paramètre `name`, créé avec `shape` au premier appel.
    /// Redemander avec une autre forme est une erreur.
    fn get_or_create(&self, name: &str, shape: &[usize], decay_factor: f32) -> Result<Parameter>;
}

/// Joint le scope d'une couche et un nom de feuille
pub fn param_path(scope: &str, leaf: &str) -> String {
    if scope.is_empty() {
        leaf.to_string()
    } else {
        format!("{scope}/{leaf}")
    }
}

struct Entry {
    value: Parameter,
    decay_factor: f32,
}

/// Magasin en mémoire avec initialisation uniforme (Glorot)
pub struct InMemoryParameterStore {
    params: RwLock<HashMap<String, Entry>>,
    rng: Mutex<StdRng>,
}

impl InMemoryParameterStore {
    /// Magasin avec une graine aléatoire
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Magasin reproductible
    pub fn with_seed(seed: u64) -> Self {
        Self {
            params: RwLock::new(HashMap::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Enregistre une valeur pré-entraînée sous `name`, en remplaçant l'existante
    pub fn insert(&self, name: &str, value: ArrayD<f32>) {
        self.params.write().insert(
            name.to_string(),
            Entry {
                value: value.into_shared(),
                decay_factor: 0.0,
            },
        );
    }

    /// Paramètre existant, sans création
    pub fn get(&self, name: &str) -> Option<Parameter> {
        self.params.read().get(name).map(|e| e.value.clone())
    }

    /// Noms de tous les paramètres, triés
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.params.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Nombre de paramètres
    pub fn len(&self) -> usize {
        self.params.read().len()
    }

    /// Aucun paramètre créé ni inséré
    pub fn is_empty(&self) -> bool {
        self.params.read().is_empty()
    }

    /// Terme de régularisation L2: `Σ decay * Σ w² / 2` sur les paramètres avec decay
    pub fn regularization_loss(&self) -> f32 {
        self.params
            .read()
            .values()
            .filter(|e| e.decay_factor != 0.0)
            .map(|e| e.decay_factor * e.value.iter().map(|w| w * w).sum::<f32>() / 2.0)
            .sum()
    }

    fn initialize(&self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>> {
        if shape.is_empty() || shape.iter().any(|&d| d == 0) {
            return Err(CapsError::InvalidConfig(format!(
                "parameter `{name}` has degenerate shape {shape:?}"
            )));
        }
        // Les tenseurs de rang 1 sont des biais, initialisés à zéro
        if shape.len() == 1 {
            return Ok(ArrayD::zeros(IxDyn(shape)));
        }
        let fan_out = shape[shape.len() - 1];
        let fan_in: usize = shape[..shape.len() - 1].iter().product();
        let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
        let dist = Uniform::new(-limit, limit)
            .map_err(|e| CapsError::InvalidConfig(format!("parameter `{name}`: {e}")))?;
        let mut rng = self.rng.lock();
        Ok(ArrayD::random_using(IxDyn(shape), dist, &mut *rng))
    }
}

impl Default for InMemoryParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterStore for InMemoryParameterStore {
    fn get_or_create(&self, name: &str, shape: &[usize], decay_factor: f32) -> Result<Parameter> {
        if let Some(entry) = self.params.read().get(name) {
            if entry.value.shape() != shape {
                return Err(CapsError::shape_mismatch(name, shape, entry.value.shape()));
            }
            return Ok(entry.value.clone());
        }

        let mut params = self.params.write();
        // Un autre appelant a pu le créer entre les deux verrous
        if let Some(entry) = params.get(name) {
            if entry.value.shape() != shape {
                return Err(CapsError::shape_mismatch(name, shape, entry.value.shape()));
            }
            return Ok(entry.value.clone());
        }

        let value = self.initialize(name, shape)?.into_shared();
        debug!(name, ?shape, decay_factor, "created parameter");
        params.insert(
            name.to_string(),
            Entry {
                value: value.clone(),
                decay_factor,
            },
        );
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_shared() {
        let store = InMemoryParameterStore::with_seed(7);
        let a = store.get_or_create("layer/weights", &[1, 4, 6], 0.0).unwrap();
        let b = store.get_or_create("layer/weights", &[1, 4, 6], 0.0).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_shape_conflict() {
        let store = InMemoryParameterStore::with_seed(7);
        store.get_or_create("w", &[2, 3], 0.0).unwrap();
        let err = store.get_or_create("w", &[3, 2], 0.0).unwrap_err();
        assert!(matches!(err, CapsError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_glorot_range_and_zero_bias() {
        let store = InMemoryParameterStore::with_seed(1);
        let w = store.get_or_create("w", &[4, 12], 0.0).unwrap();
        let limit = (6.0f32 / 16.0).sqrt();
        assert!(w.iter().all(|v| v.abs() <= limit));

        let b = store.get_or_create("b", &[5], 0.0).unwrap();
        assert!(b.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_seeded_stores_agree() {
        let a = InMemoryParameterStore::with_seed(42);
        let b = InMemoryParameterStore::with_seed(42);
        let wa = a.get_or_create("w", &[3, 3], 0.0).unwrap();
        let wb = b.get_or_create("w", &[3, 3], 0.0).unwrap();
        assert_eq!(wa, wb);
    }

    #[test]
    fn test_insert_overrides_initializer() {
        let store = InMemoryParameterStore::with_seed(0);
        store.insert("beta_a", ArrayD::from_elem(IxDyn(&[1, 2]), 0.5));
        let v = store.get_or_create("beta_a", &[1, 2], 0.0).unwrap();
        assert!(v.iter().all(|&x| x == 0.5));
        assert!(store.get_or_create("beta_a", &[2], 0.0).is_err());
    }

    #[test]
    fn test_regularization_loss() {
        let store = InMemoryParameterStore::with_seed(0);
        store.insert("fixed", ArrayD::from_elem(IxDyn(&[2, 2]), 1.0));
        assert_eq!(store.regularization_loss(), 0.0);

        let w = store.get_or_create("decayed", &[2, 2], 0.1).unwrap();
        let expected = 0.1 * w.iter().map(|v| v * v).sum::<f32>() / 2.0;
        assert!((store.regularization_loss() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_shape_rejected() {
        let store = InMemoryParameterStore::with_seed(0);
        assert!(store.get_or_create("w", &[0, 3], 0.0).is_err());
        assert!(store.get_or_create("w", &[], 0.0).is_err());
    }

    #[test]
    fn test_param_path() {
        assert_eq!(param_path("conv1", "weights"), "conv1/weights");
        assert_eq!(param_path("", "weights"), "weights");
    }
}
