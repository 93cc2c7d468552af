//! Traits de persistencia: runs/steps, log de eventos y artifacts.
//!
//! Contrato de atomicidad: toda transición de step que tiene evento canónico
//! asociado (started/completed/failed/skipped) se confirma junto con su
//! evento en una sola transacción del backend. El log de eventos es la
//! escritura durable (patrón outbox); publicadores externos son aguas abajo
//! y opcionales.

use serde_json::Value;
use uuid::Uuid;
use xyn_domain::RunError;

use crate::errors::CoreError;
use crate::model::{ArtifactRecord, EmitEvent, NewArtifact, NewStep, Run, StepRecord, StoredEvent};

/// Lectura/escritura de runs y steps fuera del protocolo de cola.
pub trait RunStore: Send + Sync {
    fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, CoreError>;

    /// Inserta el step en `created` con sus `inputs` ya resueltos.
    fn insert_step(&self, step: NewStep) -> Result<StepRecord, CoreError>;

    /// `created` → `running`, fija `started_at` y emite `xyn.step.started`.
    fn start_step(&self, run: &Run, step_id: Uuid) -> Result<StepRecord, CoreError>;

    /// `running` → `completed`, fija `outputs`/`completed_at` y emite
    /// `xyn.step.completed`.
    fn complete_step(&self, run: &Run, step_id: Uuid, outputs: Value) -> Result<StepRecord, CoreError>;

    /// → `failed`, fija `error`/`completed_at` y emite `xyn.step.failed`.
    fn fail_step(&self, run: &Run, step_id: Uuid, error: &RunError) -> Result<StepRecord, CoreError>;

    /// → `skipped` y emite `xyn.step.skipped` (gates en v0).
    fn skip_step(&self, run: &Run, step_id: Uuid) -> Result<StepRecord, CoreError>;

    /// Steps de un run ordenados por `idx` ascendente.
    fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, CoreError>;
}

/// Log de eventos append-only.
///
/// `emit` persiste una fila y devuelve su id; nunca bloquea esperando
/// consumidores. La lectura por correlación ordena `(occurred_at, id)`.
pub trait EventLog: Send + Sync {
    fn emit(&self, event: EmitEvent) -> Result<Uuid, CoreError>;
    fn list_by_correlation(&self, correlation_id: Uuid) -> Result<Vec<StoredEvent>, CoreError>;
}

/// Store de artifacts inmutables, direccionados por sha256 del contenido.
pub trait ArtifactStore: Send + Sync {
    /// Persiste contenido + fila, deduplicando por hash, y emite
    /// `xyn.artifact.attached`.
    fn put(&self, artifact: NewArtifact) -> Result<ArtifactRecord, CoreError>;
    fn get(&self, id: Uuid) -> Result<Option<ArtifactRecord>, CoreError>;
}
