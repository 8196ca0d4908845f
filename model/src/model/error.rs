use thiserror::Error;

/// Erreurs des couches de capsules
#[derive(Error, Debug)]
pub enum CapsError {
    /// Forme de tenseur inattendue
    #[error("shape mismatch for `{tensor}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Axe hors du rang du tenseur
    #[error("axis {axis} out of range for tensor of rank {ndim}")]
    InvalidAxis { axis: isize, ndim: usize },

    /// Noyau ou stride incompatible avec l'étendue spatiale
    #[error("kernel {kernel} with stride {stride} does not fit `{tensor}` extent {extent}")]
    InvalidKernel {
        tensor: String,
        extent: usize,
        kernel: usize,
        stride: usize,
    },

    /// Configuration invalide (itérations, dimensions nulles, ...)
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Couche appliquée au mauvais type de capsules
    #[error("layer `{layer}` expects {expected} capsules")]
    LayerOrder { layer: String, expected: &'static str },

    /// Échec de reshape ndarray
    #[error(transparent)]
    Reshape(#[from] ndarray::ShapeError),

    /// Échec de lecture de la configuration JSON
    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Résultat des opérations sur les capsules
pub type Result<T> = std::result::Result<T, CapsError>;

impl CapsError {
    /// Construit un `ShapeMismatch` à partir de formes empruntées
    pub fn shape_mismatch(tensor: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        CapsError::ShapeMismatch {
            tensor: tensor.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// Échoue avec `ShapeMismatch` si `actual != expected`
pub fn ensure_shape(tensor: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(CapsError::shape_mismatch(tensor, expected, actual));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CapsError::shape_mismatch("poses", &[2, 3], &[2, 4]);
        let msg = err.to_string();
        assert!(msg.contains("poses"));
        assert!(msg.contains("[2, 3]"));
        assert!(msg.contains("[2, 4]"));

        let err = CapsError::InvalidAxis { axis: -4, ndim: 3 };
        assert!(err.to_string().contains("rank 3"));

        let err = CapsError::InvalidConfig("iterations must be >= 1".to_string());
        assert!(err.to_string().contains("invalid configuration"));

        let err = CapsError::LayerOrder {
            layer: "fc".to_string(),
            expected: "flat",
        };
        assert!(err.to_string().contains("expects flat"));
    }

    #[test]
    fn test_ensure_shape() {
        assert!(ensure_shape("x", &[1, 2], &[1, 2]).is_ok());
        let err = ensure_shape("x", &[1, 2], &[2, 1]).unwrap_err();
        assert!(matches!(err, CapsError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_from_serde_error() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        if let Err(e) = parse {
            let err: CapsError = e.into();
            assert!(matches!(err, CapsError::Config(_)));
        }
    }
}
