//! xyn-core: núcleo neutral del runtime de runs durables.
//!
//! Propósito:
//! - Proveer los contratos neutrales (sin SQL) del runtime: cola con lease,
//!   store de runs/steps, log de eventos append-only y store de artifacts.
//! - Orquestar la ejecución ordenada de steps de un blueprint con emisión de
//!   eventos, aislamiento de fallos y cancelación cooperativa.
//!
//! Componentes principales:
//! - `model`: entidades neutrales (`Run`, `StepRecord`, `StoredEvent`, ...).
//! - `queue`: trait `RunQueue` (claim/renew/reclaim/finalización) y política
//!   de backoff con jitter.
//! - `store`: traits `RunStore`, `EventLog`, `ArtifactStore`.
//! - `blueprint`: definición declarativa de steps y registry por nombre.
//! - `template`: resolución pura de `{{inputs.x}}` / `{{steps.<id>.outputs.y}}`.
//! - `handler`: trait `StepHandler` y registry de despacho por nombre.
//! - `executor`: `RunExecutor`, ciclo de vida por step y presupuesto del run.
//! - `worker`: loop de polling + renovación de lease + loop de reclaim.
//! - `memory`: backend in-memory con paridad de contrato, para tests.
//!
//! Re-exports: se exponen símbolos clave para facilitar el uso desde
//! binarios/tests.

pub mod blueprint;
pub mod errors;
pub mod executor;
pub mod handler;
pub mod memory;
pub mod model;
pub mod queue;
pub mod store;
pub mod template;
pub mod worker;

// Re-exports públicos principales
pub use blueprint::{BlueprintDefinition, BlueprintRegistry, StepKind, StepSpec};
pub use errors::CoreError;
pub use executor::{ExecutorConfig, RunExecutor};
pub use handler::{HandlerRegistry, StepContext, StepHandler};
pub use memory::InMemoryBackend;
pub use model::{ArtifactRecord, EmitEvent, NewArtifact, NewRun, NewStep, Run, StepRecord, StoredEvent};
pub use queue::{BackoffPolicy, FailDisposition, QueueConfig, RunQueue};
pub use store::{ArtifactStore, EventLog, RunStore};
pub use worker::{Worker, WorkerConfig};
