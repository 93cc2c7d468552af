//! Errores del dominio y taxonomía de kinds expuesta por API y logs.
//!
//! `RunError` es el payload JSON que se persiste en `runs.error`,
//! `steps.error` y `pack_installations.error`. El campo `kind` usa los
//! nombres estables de la taxonomía (módulo `kinds`); `details` es libre.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Nombres estables de la taxonomía de errores. Nunca renombrar: son parte
/// del contrato observable (cuerpos HTTP 409, payloads `error`, logs).
pub mod kinds {
    // Cola / lease
    pub const LOST_LEASE: &str = "lost_lease";
    pub const RUN_DEADLINE_EXCEEDED: &str = "run_deadline_exceeded";
    pub const STEP_BUDGET_EXCEEDED: &str = "step_budget_exceeded";
    // Ejecutor
    pub const HANDLER_CRASH: &str = "handler_crash";
    pub const STEP_HANDLER_ERROR: &str = "step_handler_error";
    pub const TEMPLATE_RESOLUTION_ERROR: &str = "template_resolution_error";
    pub const BLUEPRINT_NOT_FOUND: &str = "blueprint_not_found";
    // Instalación de packs
    pub const PACK_ALREADY_INSTALLED: &str = "pack_already_installed";
    pub const INSTALLATION_IN_PROGRESS: &str = "installation_in_progress";
    pub const INSTALLATION_PREVIOUSLY_FAILED: &str = "installation_previously_failed";
    pub const CONFLICTING_STATE: &str = "conflicting_state";
    pub const OWNERSHIP_VIOLATION: &str = "ownership_violation";
    pub const INVARIANT_VIOLATION: &str = "invariant_violation";
    pub const INVALID_IDENTIFIER: &str = "invalid_identifier";
    pub const MIGRATION_APPLY_FAILED: &str = "migration_apply_failed";
    // Store
    pub const NOT_FOUND: &str = "not_found";
    pub const CONSTRAINT_VIOLATION: &str = "constraint_violation";
    pub const CONFLICT: &str = "conflict";
    pub const TRANSIENT_DB_ERROR: &str = "transient_db_error";
}

/// Error personalizado del dominio.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Error de validación: {0}")]
    ValidationError(String),

    #[error("Identificador inválido: {0}")]
    InvalidIdentifier(String),

    #[error("Error de serialización: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for DomainError {
    fn from(e: serde_json::Error) -> Self {
        DomainError::SerializationError(e.to_string())
    }
}

/// Payload de error persistido junto a runs, steps e instalaciones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RunError {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self { kind: kind.to_string(),
               message: message.into(),
               details: None }
    }

    pub fn with_details(kind: &str, message: impl Into<String>, details: Value) -> Self {
        Self { kind: kind.to_string(),
               message: message.into(),
               details: Some(details) }
    }

    /// Envuelve un error de step en `step_handler_error` conservando el error
    /// anidado en `details` (la política de retry del run aplica sobre éste).
    pub fn wrap_step(inner: RunError) -> Self {
        let details = serde_json::to_value(&inner).unwrap_or(Value::Null);
        Self { kind: kinds::STEP_HANDLER_ERROR.to_string(),
               message: format!("step failed: {}", inner.message),
               details: Some(details) }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_round_trips_as_json() {
        let e = RunError::with_details(kinds::HANDLER_CRASH, "panic", serde_json::json!({"idx": 3}));
        let v = e.to_json();
        let back: RunError = serde_json::from_value(v).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn wrap_step_nests_the_inner_error() {
        let inner = RunError::new(kinds::TEMPLATE_RESOLUTION_ERROR, "missing inputs.x");
        let outer = RunError::wrap_step(inner.clone());
        assert_eq!(outer.kind, kinds::STEP_HANDLER_ERROR);
        let nested: RunError = serde_json::from_value(outer.details.unwrap()).unwrap();
        assert_eq!(nested, inner);
    }
}
