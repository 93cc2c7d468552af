//! Errores semánticos del núcleo.
//!
//! `CoreError` cubre los fallos observables por el ejecutor y los traits de
//! persistencia; `kind()` devuelve el nombre estable de la taxonomía para la
//! API y los payloads persistidos.

use thiserror::Error;
use uuid::Uuid;
use xyn_domain::errors::kinds;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("blueprint not found: {0}")]
    BlueprintNotFound(String),

    #[error("template resolution: {0}")]
    Template(String),

    #[error("lost lease for run {0}")]
    LostLease(Uuid),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::BlueprintNotFound(_) => kinds::BLUEPRINT_NOT_FOUND,
            CoreError::Template(_) => kinds::TEMPLATE_RESOLUTION_ERROR,
            CoreError::LostLease(_) => kinds::LOST_LEASE,
            CoreError::NotFound => kinds::NOT_FOUND,
            CoreError::Conflict(_) => kinds::CONFLICT,
            CoreError::Constraint(_) => kinds::CONSTRAINT_VIOLATION,
            CoreError::Transient(_) => kinds::TRANSIENT_DB_ERROR,
            CoreError::Storage(_) => kinds::TRANSIENT_DB_ERROR,
            CoreError::Internal(_) => "internal",
        }
    }
}
