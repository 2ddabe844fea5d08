//! Typed registry errors (§7b of the design doc). Every fallible registry
//! operation resolves to one of these variants so the worker can decide
//! retry eligibility and propagation policy without string-matching.

use thiserror::Error;

use crate::types::FailureKind;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("transient transport error: {0}")]
    TransientTransport(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication or permission error: {0}")]
    AuthPermission(String),
    #[error("invalid credential configuration: {0}")]
    InvalidCredentialConfig(String),
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("operation cancelled")]
    Cancelled,
}

impl RegistryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RegistryError::TransientTransport(_) => FailureKind::TransientTransport,
            RegistryError::NotFound(_) => FailureKind::NotFound,
            RegistryError::AuthPermission(_) => FailureKind::AuthPermission,
            RegistryError::InvalidCredentialConfig(_) => FailureKind::InvalidCredentialConfig,
            RegistryError::DigestMismatch { .. } => FailureKind::DigestMismatch,
            RegistryError::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Classify an `anyhow::Error` coming out of a registry/copier call into a
/// [`FailureKind`], for sites that only hold the opaque error (e.g. after it
/// has passed through a `?` chain with added context). Falls back to
/// `TransientTransport` for anything that didn't originate as a
/// [`RegistryError`], since an unclassified failure is more often a
/// transient network blip than a terminal one.
pub fn classify(err: &anyhow::Error) -> FailureKind {
    err.downcast_ref::<RegistryError>()
        .map(RegistryError::kind)
        .unwrap_or(FailureKind::TransientTransport)
}
