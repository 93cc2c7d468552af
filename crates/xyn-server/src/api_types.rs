//! Tipos de request/response de la API JSON (`/api/v1`).
//!
//! Claves snake_case, timestamps ISO-8601 UTC, ids como strings. Las
//! entidades (`Run`, `StepRecord`, `StoredEvent`) serializan directo desde
//! el core; aquí viven los envoltorios y el cuerpo tipado del 409.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use xyn_persistence::InstallConflict;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub now: DateTime<Utc>,
}

/// Página genérica con cursor opaco.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub name: String,
    #[serde(default)]
    pub blueprint_ref: Option<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateEventRequest {
    pub event_name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub step_id: Option<Uuid>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub resource: Option<ResourceRef>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct InstallAccepted {
    pub run_id: Uuid,
    pub correlation_id: Uuid,
}

/// Cuerpo del 409 de instalación: `{"detail": {...}}`, bit-exacto.
#[derive(Debug, Serialize)]
pub struct ConflictDetail {
    pub error: String,
    pub existing_installation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ConflictBody {
    pub detail: ConflictDetail,
}

impl ConflictBody {
    pub fn from_conflict(conflict: &InstallConflict) -> Self {
        let detail = match conflict {
            InstallConflict::AlreadyInstalled { installation_id, run_id } => ConflictDetail {
                error: conflict.kind().to_string(),
                existing_installation_id: installation_id.to_string(),
                existing_run_id: run_id.map(|r| r.to_string()),
                error_details: None,
                last_error_at: None,
            },
            InstallConflict::InProgress { installation_id, run_id } => ConflictDetail {
                error: conflict.kind().to_string(),
                existing_installation_id: installation_id.to_string(),
                existing_run_id: run_id.map(|r| r.to_string()),
                error_details: None,
                last_error_at: None,
            },
            InstallConflict::PreviouslyFailed { installation_id, error, last_error_at } => ConflictDetail {
                error: conflict.kind().to_string(),
                existing_installation_id: installation_id.to_string(),
                existing_run_id: None,
                error_details: error.clone(),
                last_error_at: *last_error_at,
            },
            InstallConflict::ConflictingState { installation_id, .. } => ConflictDetail {
                error: conflict.kind().to_string(),
                existing_installation_id: installation_id.to_string(),
                existing_run_id: None,
                error_details: None,
                last_error_at: None,
            },
        };
        Self { detail }
    }
}

/// Error genérico de la API; `correlation_id` viaja cuando está disponible.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct PackStatusResponse {
    pub status: String,
    pub installation: Option<xyn_persistence::InstallationRow>,
}
