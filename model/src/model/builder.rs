use std::sync::Arc;

use tracing::info;

use super::{
    config::NetworkConfig,
    core::CapsNet,
    error::{CapsError, Result},
    params::{InMemoryParameterStore, ParameterStore},
};

/// Constructeur de modèle: configuration réseau + magasin de paramètres
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
    store: Option<Arc<dyn ParameterStore>>,
    seed: Option<u64>,
}

impl ModelBuilder {
    /// Constructeur vide, sans configuration
    pub fn new() -> Self {
        Self {
            network_config: None,
            store: None,
            seed: None,
        }
    }

    /// Configuration du réseau (obligatoire)
    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    /// Magasin existant, par exemple préchargé avec des poids entraînés
    pub fn with_parameter_store(mut self, store: Arc<dyn ParameterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Graine du magasin en mémoire par défaut, ignorée si un magasin est fourni
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validation, inférence des formes et construction du réseau
    pub fn build(self) -> Result<CapsNet> {
        let network_config = self
            .network_config
            .ok_or_else(|| CapsError::InvalidConfig("network config is required".to_string()))?;

        let store: Arc<dyn ParameterStore> = match (self.store, self.seed) {
            (Some(store), _) => store,
            (None, Some(seed)) => Arc::new(InMemoryParameterStore::with_seed(seed)),
            (None, None) => Arc::new(InMemoryParameterStore::new()),
        };

        let net = CapsNet::new(network_config, store)?;
        info!(
            layers = net.network_config.layers.len(),
            output = ?net.shapes.last(),
            "capsnet built"
        );
        Ok(net)
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::CapsuleShape;
    use crate::model::core::Capsules;
    use ndarray::Array4;

    #[test]
    fn test_build_requires_config() {
        assert!(matches!(
            ModelBuilder::new().build(),
            Err(CapsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_build_default_network() {
        let net = ModelBuilder::new()
            .with_network_config(NetworkConfig::default())
            .with_seed(17)
            .build()
            .unwrap();
        assert_eq!(net.shapes.len(), 4);
        assert_eq!(net.shapes[3], CapsuleShape::Set { capsules: 10, pose_dim: 8 });
    }

    #[test]
    fn test_seeded_builds_agree() {
        let build = || {
            ModelBuilder::new()
                .with_network_config(NetworkConfig::default())
                .with_seed(99)
                .build()
                .unwrap()
        };
        let input = Array4::from_shape_fn((1, 28, 28, 1), |(_, h, w, _)| ((h * 28 + w) % 13) as f32 / 13.0);

        match (build().forward(&input.view()).unwrap(), build().forward(&input.view()).unwrap()) {
            (Capsules::Set(a), Capsules::Set(b)) => assert_eq!(a.activations, b.activations),
            _ => panic!("expected flat output"),
        }
    }

    #[test]
    fn test_build_rejects_bad_config() {
        let mut config = NetworkConfig::default();
        config.input_shape = (4, 4, 1);
        let err = ModelBuilder::new()
            .with_network_config(config)
            .with_seed(1)
            .build()
            .unwrap_err();
        assert!(matches!(err, CapsError::InvalidKernel { .. }));
    }

    #[test]
    fn test_shared_store() {
        let store = Arc::new(InMemoryParameterStore::with_seed(8));
        let net = ModelBuilder::new()
            .with_network_config(NetworkConfig::default())
            .with_parameter_store(store.clone())
            .build()
            .unwrap();
        net.forward(&Array4::zeros((1, 28, 28, 1)).view()).unwrap();
        assert!(!store.is_empty());
    }
}
