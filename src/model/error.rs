//! Types d'erreurs pour la construction du réseau de capsules.
//!
//! Le forward ne les retourne pas: un tenseur de mauvaise forme est une erreur
//! de programmation et provoque un panic sur l'assertion concernée.

use thiserror::Error;

/// Type de résultat pour les opérations du réseau
pub type CapsResult<T> = Result<T, CapsuleError>;

/// Erreurs de configuration ou de construction des couches
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// Configuration invalide
    #[error("Configuration invalide: {0}")]
    InvalidConfig(String),

    /// Incompatibilité de forme entre deux couches
    #[error("Incompatibilité de forme: attendu {expected}, obtenu {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Erreur d'E/S
    #[error("Erreur d'E/S: {0}")]
    Io(#[from] std::io::Error),

    /// Erreur de sérialisation
    #[error("Erreur de sérialisation: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CapsuleError {
    /// Crée une erreur de configuration invalide
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Crée une erreur d'incompatibilité de forme
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}
