//! Implementaciones Postgres (Diesel) de los traits del core.
//!
//! Objetivo general del módulo:
//! - Proveer la capa durable (Postgres) con paridad 1:1 respecto al backend
//!   in-memory del core.
//! - Mantener el contrato de atomicidad: toda transición de estado confirma
//!   junto con su evento canónico en la misma transacción (patrón outbox).
//! - Aislar el mapeo entidad ↔ fila de DB del resto del runtime.
//!
//! Submódulos:
//! - `queue`: protocolo claim/lease/reclaim/finalización (`PgRunQueue`).
//! - `store`: runs/steps y listados para la API (`PgRunStore`).
//! - `events`: log append-only (`PgEventLog`).
//! - `artifacts`: blobs direccionados por contenido (`PgArtifactStore`).
//! - `installs`: catálogo de packs y máquina de estados de instalación.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use log::warn;
use serde_json::Value;
use uuid::Uuid;
use xyn_core::errors::CoreError;
use xyn_core::model::{EmitEvent, Run, StepRecord, StoredEvent};
use xyn_domain::{events as event_names, RunStatus, StepStatus};

use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;
use crate::schema::{events, runs, steps};

pub mod artifacts;
pub mod events_log;
pub mod installs;
pub mod queue;
pub mod stats;
pub mod store;

/// Alias de tipo para el pool r2d2 de conexiones Postgres.
///
/// Al construirlo se corre automáticamente el set de migraciones pendientes
/// (una sola vez).
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;
pub type PooledConn = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones.
///
/// Permite inyectar un pool real (producción/tests de integración) o
/// factorear en tests unitarios sin acoplar a r2d2.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<PooledConn, PersistenceError>;
}

/// Implementación concreta respaldada por un `PgPool`.
#[derive(Clone)]
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<PooledConn, PersistenceError> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::Unavailable(format!("checkout de pool: {e}")))
    }
}

/// Determina si un error es transitorio (recomendado reintentar con backoff).
/// Los no clasificados se inspeccionan por texto (best-effort, según driver).
fn is_retryable(e: &PersistenceError) -> bool {
    match e {
        PersistenceError::Retryable | PersistenceError::Unavailable(_) => true,
        PersistenceError::Other(msg) => {
            let m = msg.to_lowercase();
            m.contains("deadlock detected")
            || m.contains("could not serialize access due to concurrent update")
            || m.contains("connection closed")
            || m.contains("connection refused")
            || m.contains("timeout")
        }
        _ => false,
    }
}

/// Retry a nivel de sentencia con backoff pequeño (hasta 3 intentos).
/// No altera semántica de negocio; sólo repite la unidad de trabajo `f`.
pub fn with_retry<F, T>(mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_retryable(&e) && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("retryable error (attempt {}): {:?} -> sleeping {}ms", attempts + 1, e, delay_ms);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

// ---------------------------------------------------------------------------
// Filas mapeadas y conversiones a entidades del core
// ---------------------------------------------------------------------------

#[derive(Queryable, QueryableByName, Debug, Clone)]
#[diesel(table_name = runs)]
pub struct RunRow {
    pub id: Uuid,
    pub name: String,
    pub blueprint_ref: Option<String>,
    pub status: String,
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
    pub updated_at: DateTime<Utc>,
}

impl RunRow {
    pub fn into_run(self) -> Result<Run, PersistenceError> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| PersistenceError::Other(format!("status de run desconocido: {}", self.status)))?;
        Ok(Run { id: self.id,
                 name: self.name,
                 blueprint_ref: self.blueprint_ref,
                 status,
                 run_at: self.run_at,
                 priority: self.priority,
                 attempt: self.attempt,
                 max_attempts: self.max_attempts,
                 queued_at: self.queued_at,
                 created_at: self.created_at,
                 locked_at: self.locked_at,
                 locked_by: self.locked_by,
                 lease_expires_at: self.lease_expires_at,
                 started_at: self.started_at,
                 completed_at: self.completed_at,
                 actor: self.actor,
                 correlation_id: self.correlation_id,
                 inputs: self.inputs,
                 outputs: self.outputs,
                 error: self.error,
                 cancel_requested: self.cancel_requested,
                 parent_run_id: self.parent_run_id })
    }
}

#[derive(Queryable, QueryableByName, Debug, Clone)]
#[diesel(table_name = steps)]
pub struct StepRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub idx: i32,
    pub name: String,
    pub kind: String,
    pub status: String,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub error: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub logs_artifact_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl StepRow {
    pub fn into_step(self) -> Result<StepRecord, PersistenceError> {
        let status = StepStatus::parse(&self.status)
            .ok_or_else(|| PersistenceError::Other(format!("status de step desconocido: {}", self.status)))?;
        Ok(StepRecord { id: self.id,
                        run_id: self.run_id,
                        idx: self.idx,
                        name: self.name,
                        kind: self.kind,
                        status,
                        inputs: self.inputs,
                        outputs: self.outputs,
                        error: self.error,
                        started_at: self.started_at,
                        completed_at: self.completed_at,
                        logs_artifact_id: self.logs_artifact_id,
                        created_at: self.created_at })
    }
}

#[derive(Queryable, QueryableByName, Debug, Clone)]
#[diesel(table_name = events)]
pub struct EventRow {
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

impl EventRow {
    pub fn into_event(self) -> StoredEvent {
        StoredEvent { id: self.id,
                      event_name: self.event_name,
                      occurred_at: self.occurred_at,
                      correlation_id: self.correlation_id,
                      run_id: self.run_id,
                      step_id: self.step_id,
                      actor: self.actor,
                      resource_kind: self.resource_kind,
                      resource_id: self.resource_id,
                      data: self.data }
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = events)]
pub struct NewEventRow {
    pub event_name: String,
    pub correlation_id: Uuid,
    pub run_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub actor: Option<String>,
    pub resource_kind: Option<String>,
    pub resource_id: Option<String>,
    pub data: Value,
}

/// Inserta el evento dentro de la transacción en curso y devuelve su id.
/// Valida la forma dotted lowercase antes de tocar la tabla (el CHECK del
/// esquema es la segunda línea).
pub(crate) fn insert_event_tx(conn: &mut PgConnection, ev: EmitEvent) -> Result<Uuid, PersistenceError> {
    if !event_names::is_valid_event_name(&ev.event_name) {
        return Err(PersistenceError::InvariantRejected(format!("event_name inválido: {:?}", ev.event_name)));
    }
    let row = NewEventRow { event_name: ev.event_name,
                            correlation_id: ev.correlation_id,
                            run_id: ev.run_id,
                            step_id: ev.step_id,
                            actor: ev.actor,
                            resource_kind: ev.resource_kind,
                            resource_id: ev.resource_id,
                            data: ev.data };
    diesel::insert_into(events::table).values(&row)
                                      .returning(events::id)
                                      .get_result(conn)
                                      .map_err(PersistenceError::from)
}

pub(crate) fn core_err(e: PersistenceError) -> CoreError {
    e.into()
}

/// Construye un pool Postgres r2d2 a partir de URL.
///
/// Comportamiento:
/// - Valida y ajusta tamaños (si `min_size > max_size`, usa `min = max`).
/// - Ejecuta migraciones inmediatamente tras el primer `get()`.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let pool = build_pool_without_migrations(database_url, min_size, max_size)?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::Unavailable(format!("checkout para migraciones: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Variante sin migraciones: la usa el arranque con
/// `XYN_AUTO_CREATE_SCHEMA=false`, donde el esquema debe existir de antemano
/// y el preflight del ledger decide si el proceso puede servir.
pub fn build_pool_without_migrations(database_url: &str,
                                     min_size: u32,
                                     max_size: u32)
                                     -> Result<PgPool, PersistenceError> {
    let validated_min = if min_size == 0 { 1 } else { min_size };
    let validated_max = if max_size == 0 { 1 } else { max_size };
    if validated_min > validated_max {
        warn!("min_size > max_size ({} > {}), ajustando min=max", validated_min, validated_max);
    }
    let final_min = validated_min.min(validated_max);
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    r2d2::Pool::builder().min_idle(Some(final_min))
                         .max_size(validated_max)
                         .build(manager)
                         .map_err(|e| PersistenceError::Unavailable(format!("construcción de pool: {e}")))
}

/// Helper de desarrollo: lee la configuración del entorno (incluido `.env`)
/// y construye un pool ya migrado.
pub fn build_dev_pool_from_env() -> Result<PgPool, PersistenceError> {
    let cfg = crate::config::DbConfig::from_env()?;
    build_pool(&cfg.url, cfg.pool_min, cfg.pool_max)
}
