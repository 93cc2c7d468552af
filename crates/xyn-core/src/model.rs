//! Entidades neutrales del runtime.
//!
//! Estas estructuras son el contrato entre el núcleo y los backends
//! (Postgres o in-memory). Los timestamps son UTC; los payloads (`inputs`,
//! `outputs`, `error`, `data`) son JSON opacos para el núcleo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use xyn_domain::{RunStatus, StepStatus};

/// Un run: la ejecución durable de un workflow nombrado.
///
/// Invariantes (reforzadas también por CHECK constraints en el backend Pg):
/// - `correlation_id` es no-nulo desde la creación.
/// - terminal ⇒ `completed_at` no-nulo.
/// - `Running` ⇒ `locked_by` y `lease_expires_at` no-nulos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub name: String,
    pub blueprint_ref: Option<String>,
    pub status: RunStatus,
    pub run_at: DateTime<Utc>,
    pub priority: i32,
    pub attempt: i32,
    pub max_attempts: Option<i32>,
    pub queued_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub actor: Option<String>,
    pub correlation_id: Uuid,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub error: Option<Value>,
    pub cancel_requested: bool,
    pub parent_run_id: Option<Uuid>,
}

/// Parámetros de inserción de un run en estado `queued`.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub name: String,
    pub blueprint_ref: Option<String>,
    pub inputs: Value,
    /// Menor = antes. Default 100.
    pub priority: Option<i32>,
    /// Momento mínimo de elegibilidad; default `now`.
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<i32>,
    pub actor: Option<String>,
    pub parent_run_id: Option<Uuid>,
    /// Clave idempotente del edge padre→hijo (índice único parcial).
    pub child_key: Option<String>,
    /// Relación del edge (`spawned`, ...). Sólo con `parent_run_id`.
    pub relation: Option<String>,
}

/// Step persistido de un run, ordenado por `idx` (0-based, único por run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub idx: i32,
    pub name: String,
    pub kind: String,
    pub status: StepStatus,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub error: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub logs_artifact_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewStep {
    pub run_id: Uuid,
    pub idx: i32,
    pub name: String,
    pub kind: String,
    pub inputs: Value,
}

/// Evento inmutable del log append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: Uuid,
    pub event_name: String,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub run_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub actor: Option<String>,
    pub resource_kind: Option<String>,
    pub resource_id: Option<String>,
    pub data: Value,
}

/// Parámetros de emisión. `correlation_id` es obligatorio; emitiendo desde
/// el contexto de un run es el id del run.
#[derive(Debug, Clone)]
pub struct EmitEvent {
    pub event_name: String,
    pub data: Value,
    pub correlation_id: Uuid,
    pub run_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub actor: Option<String>,
    pub resource_kind: Option<String>,
    pub resource_id: Option<String>,
}

impl EmitEvent {
    /// Emisión mínima dentro del contexto de un run.
    pub fn for_run(event_name: &str, run: &Run, data: Value) -> Self {
        Self { event_name: event_name.to_string(),
               data,
               correlation_id: run.correlation_id,
               run_id: Some(run.id),
               step_id: None,
               actor: run.actor.clone(),
               resource_kind: Some("run".to_string()),
               resource_id: Some(run.id.to_string()) }
    }

    pub fn with_step(mut self, step_id: Uuid) -> Self {
        self.step_id = Some(step_id);
        self
    }
}

/// Artifact inmutable, direccionado por contenido cuando hay bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub content_type: String,
    pub byte_length: i64,
    pub sha256: Option<String>,
    pub storage_path: Option<String>,
    pub created_by: Option<String>,
    pub run_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub name: String,
    pub kind: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub created_by: Option<String>,
    pub run_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub metadata: Value,
}
