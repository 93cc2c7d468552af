//! Catálogo de packs y máquina de estados de instalación.
//!
//! El protocolo es claim-insert → trabajo → finalize con row-lock:
//! - el claim es `INSERT ... ON CONFLICT (pack_ref, env_id) DO NOTHING`; sin
//!   fila devuelta se relee y clasifica el conflicto (409 tipado);
//! - el finalize toma `SELECT ... FOR UPDATE` sólo durante la sección
//!   crítica corta, verifica ownership (`installed_by_run_id`) y confía en
//!   el CHECK constraint como segunda línea del invariante de `installed`.

use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::Uuid as SqlUuid;
use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;
use xyn_core::model::{EmitEvent, NewRun, Run};
use xyn_domain::errors::kinds;
use xyn_domain::{events as event_names, quote_ident, validate_ident, DomainError, InstallationStatus, PackManifest,
                 SchemaMode};

use crate::error::PersistenceError;
use crate::schema::{pack_installations, packs};

use super::queue::insert_run_tx;
use super::{core_err, insert_event_tx, with_retry, ConnectionProvider};

pub const INSTALL_BLUEPRINT: &str = "xyn.pack.install";

#[derive(Queryable, QueryableByName, Debug, Clone)]
#[diesel(table_name = packs)]
pub struct PackRow {
    pub id: Uuid,
    pub pack_ref: String,
    pub version: String,
    pub pack_type: String,
    pub manifest: Value,
    pub dependencies: Value,
    pub created_at: DateTime<Utc>,
}

impl PackRow {
    pub fn manifest(&self) -> Result<PackManifest, PersistenceError> {
        serde_json::from_value(self.manifest.clone())
            .map_err(|e| PersistenceError::Other(format!("manifest ilegible de {}: {e}", self.pack_ref)))
    }
}

#[derive(Queryable, QueryableByName, Debug, Clone, Serialize)]
#[diesel(table_name = pack_installations)]
pub struct InstallationRow {
    pub id: Uuid,
    pub pack_id: Uuid,
    pub pack_ref: String,
    pub env_id: String,
    pub status: String,
    pub schema_mode: String,
    pub schema_name: Option<String>,
    pub migration_provider: String,
    pub installed_version: Option<String>,
    pub migration_state: Option<String>,
    pub installed_at: Option<DateTime<Utc>>,
    pub installed_by_run_id: Option<Uuid>,
    pub updated_by_run_id: Option<Uuid>,
    pub error: Option<Value>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = pack_installations)]
struct NewInstallationRow {
    pack_id: Uuid,
    pack_ref: String,
    env_id: String,
    status: String,
    schema_mode: String,
    schema_name: Option<String>,
    installed_by_run_id: Option<Uuid>,
}

/// Conflicto clasificado del claim (cuerpo tipado del 409).
#[derive(Debug, Clone, Serialize)]
pub enum InstallConflict {
    AlreadyInstalled { installation_id: Uuid, run_id: Option<Uuid> },
    InProgress { installation_id: Uuid, run_id: Option<Uuid> },
    PreviouslyFailed { installation_id: Uuid, error: Option<Value>, last_error_at: Option<DateTime<Utc>> },
    ConflictingState { installation_id: Uuid, status: String },
}

impl InstallConflict {
    pub fn kind(&self) -> &'static str {
        match self {
            InstallConflict::AlreadyInstalled { .. } => kinds::PACK_ALREADY_INSTALLED,
            InstallConflict::InProgress { .. } => kinds::INSTALLATION_IN_PROGRESS,
            InstallConflict::PreviouslyFailed { .. } => kinds::INSTALLATION_PREVIOUSLY_FAILED,
            InstallConflict::ConflictingState { .. } => kinds::CONFLICTING_STATE,
        }
    }

    pub fn installation_id(&self) -> Uuid {
        match self {
            InstallConflict::AlreadyInstalled { installation_id, .. }
            | InstallConflict::InProgress { installation_id, .. }
            | InstallConflict::PreviouslyFailed { installation_id, .. }
            | InstallConflict::ConflictingState { installation_id, .. } => *installation_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("pack desconocido: {0}")]
    PackNotFound(String),
    #[error("identificador inválido: {0}")]
    InvalidIdentifier(String),
    #[error("conflicto de instalación: {}", .0.kind())]
    Conflict(InstallConflict),
    #[error("ownership violation: instalación {installation_id} pertenece a otro run")]
    OwnershipViolation { installation_id: Uuid },
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("migración {id} falló: {message}")]
    MigrationFailed { id: String, message: String },
    #[error(transparent)]
    Storage(#[from] PersistenceError),
}

impl InstallError {
    pub fn kind(&self) -> &'static str {
        match self {
            InstallError::PackNotFound(_) => kinds::NOT_FOUND,
            InstallError::InvalidIdentifier(_) => kinds::INVALID_IDENTIFIER,
            InstallError::Conflict(c) => c.kind(),
            InstallError::OwnershipViolation { .. } => kinds::OWNERSHIP_VIOLATION,
            InstallError::InvariantViolation(_) => kinds::INVARIANT_VIOLATION,
            InstallError::MigrationFailed { .. } => kinds::MIGRATION_APPLY_FAILED,
            InstallError::Storage(_) => kinds::TRANSIENT_DB_ERROR,
        }
    }
}

impl From<DomainError> for InstallError {
    fn from(e: DomainError) -> Self {
        InstallError::InvalidIdentifier(e.to_string())
    }
}

/// Error interno de la transacción de solicitud: un conflicto clasificado
/// debe abortar (rollback) sin perder su payload.
enum InstallTxError {
    Conflict(InstallConflict),
    Db(PersistenceError),
}

impl From<diesel::result::Error> for InstallTxError {
    fn from(e: diesel::result::Error) -> Self {
        InstallTxError::Db(e.into())
    }
}

impl From<PersistenceError> for InstallTxError {
    fn from(e: PersistenceError) -> Self {
        InstallTxError::Db(e)
    }
}

fn classify(row: &InstallationRow) -> InstallConflict {
    match InstallationStatus::parse(&row.status) {
        Some(InstallationStatus::Installed) => InstallConflict::AlreadyInstalled { installation_id: row.id,
                                                                                   run_id: row.installed_by_run_id },
        Some(InstallationStatus::Installing) => InstallConflict::InProgress { installation_id: row.id,
                                                                              run_id: row.installed_by_run_id },
        Some(InstallationStatus::Failed) => InstallConflict::PreviouslyFailed { installation_id: row.id,
                                                                                error: row.error.clone(),
                                                                                last_error_at: row.last_error_at },
        _ => InstallConflict::ConflictingState { installation_id: row.id,
                                                 status: row.status.clone() },
    }
}

pub struct PgInstallRepo<P: ConnectionProvider> {
    provider: P,
}

impl<P: ConnectionProvider> PgInstallRepo<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    // -- catálogo ----------------------------------------------------------

    pub fn get_pack(&self, pack_ref: &str) -> Result<Option<PackRow>, PersistenceError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            packs::table.filter(packs::pack_ref.eq(pack_ref))
                        .first::<PackRow>(&mut conn)
                        .optional()
                        .map_err(PersistenceError::from)
        })
    }

    /// Alta idempotente en el catálogo (seed de arranque).
    pub fn upsert_pack(&self,
                       pack_ref: &str,
                       version: &str,
                       pack_type: &str,
                       manifest: &PackManifest)
                       -> Result<PackRow, PersistenceError> {
        let manifest_json =
            serde_json::to_value(manifest).map_err(|e| PersistenceError::Other(format!("manifest: {e}")))?;
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::insert_into(packs::table)
                .values((packs::pack_ref.eq(pack_ref),
                         packs::version.eq(version),
                         packs::pack_type.eq(pack_type),
                         packs::manifest.eq(manifest_json.clone())))
                .on_conflict(packs::pack_ref)
                .do_update()
                .set((packs::version.eq(version), packs::manifest.eq(manifest_json.clone())))
                .get_result::<PackRow>(&mut conn)
                .map_err(PersistenceError::from)
        })
    }

    pub fn get_installation(&self, pack_ref: &str, env_id: &str)
                            -> Result<Option<InstallationRow>, PersistenceError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            pack_installations::table.filter(pack_installations::pack_ref.eq(pack_ref))
                                     .filter(pack_installations::env_id.eq(env_id))
                                     .first::<InstallationRow>(&mut conn)
                                     .optional()
                                     .map_err(PersistenceError::from)
        })
    }

    // -- solicitud (endpoint) ---------------------------------------------

    /// Crea el run instalador y reclama la fila de instalación en una sola
    /// transacción. Si el claim pierde, no queda run huérfano (rollback) y
    /// el conflicto clasificado viaja al 409 tipado.
    pub fn request_install(&self, pack_ref: &str, env_id: &str, actor: Option<String>)
                           -> Result<(Run, InstallationRow), InstallError> {
        let pack = self.get_pack(pack_ref)?
                       .ok_or_else(|| InstallError::PackNotFound(pack_ref.to_string()))?;
        let schema_name = xyn_domain::schema_name_for_pack(pack_ref)?;

        let mut conn = self.provider.connection().map_err(InstallError::Storage)?;
        let result: Result<(Run, InstallationRow), InstallTxError> =
            conn.build_transaction().read_write().run(|tx| {
                   let run_row = insert_run_tx(tx,
                                               &NewRun { name: format!("install {pack_ref}"),
                                                         blueprint_ref: Some(INSTALL_BLUEPRINT.to_string()),
                                                         inputs: json!({"pack_ref": pack_ref, "env_id": env_id}),
                                                         // Sin auto-retry: un nuevo intento es un run nuevo.
                                                         max_attempts: Some(1),
                                                         actor: actor.clone(),
                                                         ..Default::default() },
                                               None)?;

                   let claimed: Option<InstallationRow> = diesel::insert_into(pack_installations::table)
                       .values(&NewInstallationRow { pack_id: pack.id,
                                                     pack_ref: pack_ref.to_string(),
                                                     env_id: env_id.to_string(),
                                                     status: InstallationStatus::Installing.as_str().to_string(),
                                                     schema_mode: SchemaMode::PerPack.as_str().to_string(),
                                                     schema_name: Some(schema_name.clone()),
                                                     installed_by_run_id: Some(run_row.id) })
                       .on_conflict((pack_installations::pack_ref, pack_installations::env_id))
                       .do_nothing()
                       .get_result(tx)
                       .optional()
                       .map_err(PersistenceError::from)?;

                   match claimed {
                       Some(installation) => {
                           let run = run_row.into_run()?;
                           insert_event_tx(tx,
                                           EmitEvent { event_name: event_names::PACK_INSTALL_REQUESTED.to_string(),
                                                       data: json!({"pack_ref": pack_ref, "env_id": env_id}),
                                                       correlation_id: run.correlation_id,
                                                       run_id: Some(run.id),
                                                       step_id: None,
                                                       actor: run.actor.clone(),
                                                       resource_kind: Some("pack_installation".to_string()),
                                                       resource_id: Some(installation.id.to_string()) })?;
                           Ok((run, installation))
                       }
                       None => {
                           let existing = pack_installations::table
                               .filter(pack_installations::pack_ref.eq(pack_ref))
                               .filter(pack_installations::env_id.eq(env_id))
                               .first::<InstallationRow>(tx)
                               .map_err(PersistenceError::from)?;
                           // Err ⇒ rollback: el run insertado no sobrevive.
                           Err(InstallTxError::Conflict(classify(&existing)))
                       }
                   }
               });

        match result {
            Ok(ok) => Ok(ok),
            Err(InstallTxError::Conflict(conflict)) => Err(InstallError::Conflict(conflict)),
            Err(InstallTxError::Db(other)) => Err(InstallError::Storage(other)),
        }
    }

    // -- steps del blueprint -----------------------------------------------

    /// Claim idempotente desde el step del blueprint: re-ejecutado por el
    /// mismo run (reclaim) encuentra su propia fila y sigue; cualquier otro
    /// dueño produce el conflicto clasificado.
    pub fn claim_for_run(&self,
                         pack: &PackRow,
                         env_id: &str,
                         run_id: Uuid,
                         schema_name: &str)
                         -> Result<InstallationRow, InstallError> {
        let claimed = with_retry(|| {
                          let mut conn = self.provider.connection()?;
                          diesel::insert_into(pack_installations::table)
                              .values(&NewInstallationRow { pack_id: pack.id,
                                                            pack_ref: pack.pack_ref.clone(),
                                                            env_id: env_id.to_string(),
                                                            status: InstallationStatus::Installing.as_str()
                                                                                                  .to_string(),
                                                            schema_mode: SchemaMode::PerPack.as_str().to_string(),
                                                            schema_name: Some(schema_name.to_string()),
                                                            installed_by_run_id: Some(run_id) })
                              .on_conflict((pack_installations::pack_ref, pack_installations::env_id))
                              .do_nothing()
                              .get_result::<InstallationRow>(&mut conn)
                              .optional()
                              .map_err(PersistenceError::from)
                      })?;
        if let Some(row) = claimed {
            return Ok(row);
        }
        let existing = self.get_installation(&pack.pack_ref, env_id)?
                           .ok_or_else(|| PersistenceError::Other("instalación desaparecida tras conflicto".into()))?;
        if existing.installed_by_run_id == Some(run_id)
           && InstallationStatus::parse(&existing.status) == Some(InstallationStatus::Installing)
        {
            return Ok(existing);
        }
        Err(InstallError::Conflict(classify(&existing)))
    }

    /// Aprovisiona el esquema del pack y sus tablas declaradas, todo
    /// idempotente. Los identificadores llegan validados y se interpolan
    /// citados.
    pub fn provision_schema(&self, schema_name: &str, manifest: &PackManifest) -> Result<(), InstallError> {
        validate_ident(schema_name)?;
        for table in &manifest.tables {
            validate_ident(&table.name)?;
        }
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction().read_write().run(|tx| {
                   tx.batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema_name)))
                     .map_err(|e| PersistenceError::from(e))?;
                   for table in &manifest.tables {
                       tx.batch_execute(&format!("SET LOCAL search_path TO {}; {}",
                                                 quote_ident(schema_name),
                                                 table.ddl))
                         .map_err(|e| PersistenceError::from(e))?;
                   }
                   Ok(())
               })
        })?;
        info!("esquema {schema_name} aprovisionado ({} tablas)", manifest.tables.len());
        Ok(())
    }

    /// Aplica en orden de manifiesto las migraciones posteriores a
    /// `migration_state`, cada una en su propia transacción: DDL + avance de
    /// `migration_state` + ledger, o nada.
    pub fn apply_migrations(&self,
                            installation_id: Uuid,
                            schema_name: &str,
                            pack_ref: &str,
                            manifest: &PackManifest)
                            -> Result<usize, InstallError> {
        validate_ident(schema_name)?;
        let current = self.get_installation_by_id(installation_id)?
                          .ok_or(PersistenceError::NotFound)?;
        let pending: Vec<_> = manifest.pending_migrations(current.migration_state.as_deref())
                                      .into_iter()
                                      .cloned()
                                      .collect();
        let mut applied = 0usize;
        for migration in &pending {
            let result = with_retry(|| {
                let mut conn = self.provider.connection()?;
                conn.build_transaction().read_write().run(|tx| {
                       tx.batch_execute(&format!("SET LOCAL search_path TO {}; {}",
                                                 quote_ident(schema_name),
                                                 migration.ddl))
                         .map_err(PersistenceError::from)?;
                       diesel::update(pack_installations::table.filter(pack_installations::id.eq(installation_id)))
                           .set((pack_installations::migration_state.eq(Some(migration.id.clone())),
                                 pack_installations::updated_at.eq(Utc::now())))
                           .execute(tx)
                           .map_err(PersistenceError::from)?;
                       crate::migrations::record_in_ledger(tx, &format!("{pack_ref}:{}", migration.id))?;
                       Ok(())
                   })
            });
            if let Err(e) = result {
                warn!("migración {} de {pack_ref} falló: {e}", migration.id);
                return Err(InstallError::MigrationFailed { id: migration.id.clone(),
                                                           message: e.to_string() });
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Sección crítica del finalize: row-lock corto, ownership, invariantes
    /// y transición a `installed`. Idempotente si el propio run ya la dejó
    /// instalada (reintento tras reclaim).
    pub fn finalize(&self, installation_id: Uuid, run: &Run, installed_version: &str) -> Result<(), InstallError> {
        let result = with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction().read_write().run(|tx| {
                   let row: InstallationRow =
                       diesel::sql_query("SELECT pack_installations.* FROM pack_installations \
                                          WHERE id = $1 FOR UPDATE")
                           .bind::<SqlUuid, _>(installation_id)
                           .get_result(tx)
                           .map_err(PersistenceError::from)?;

                   if InstallationStatus::parse(&row.status) == Some(InstallationStatus::Installed) {
                       // Otro intento de este mismo run ya terminó.
                       return Ok(Ok(()));
                   }
                   if row.installed_by_run_id != Some(run.id) {
                       return Ok(Err(InstallError::OwnershipViolation { installation_id }));
                   }
                   if row.schema_name.is_none() {
                       return Ok(Err(InstallError::InvariantViolation("schema_name nulo al finalizar".into())));
                   }

                   diesel::update(pack_installations::table.filter(pack_installations::id.eq(installation_id)))
                       .set((pack_installations::status.eq(InstallationStatus::Installed.as_str()),
                             pack_installations::installed_version.eq(Some(installed_version.to_string())),
                             pack_installations::installed_at.eq(Some(Utc::now())),
                             pack_installations::error.eq(None::<Value>),
                             pack_installations::updated_by_run_id.eq(Some(run.id)),
                             pack_installations::updated_at.eq(Utc::now())))
                       .execute(tx)
                       .map_err(PersistenceError::from)?;

                   insert_event_tx(tx,
                                   EmitEvent { event_name: event_names::PACK_INSTALL_COMPLETED.to_string(),
                                               data: json!({"pack_ref": row.pack_ref,
                                                            "installed_version": installed_version}),
                                               correlation_id: run.correlation_id,
                                               run_id: Some(run.id),
                                               step_id: None,
                                               actor: run.actor.clone(),
                                               resource_kind: Some("pack_installation".to_string()),
                                               resource_id: Some(installation_id.to_string()) })?;
                   Ok(Ok(()))
               })
        });
        match result {
            Ok(inner) => inner,
            // El CHECK constraint es la segunda línea del invariante.
            Err(PersistenceError::InvariantRejected(m)) => Err(InstallError::InvariantViolation(m)),
            Err(other) => Err(InstallError::Storage(other)),
        }
    }

    /// Camino de fallo: la fila queda en `failed` con el payload de error y
    /// `last_error_at` para inspección y reintento por un run nuevo.
    pub fn mark_failed(&self, installation_id: Uuid, run: &Run, error: &Value) -> Result<(), InstallError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction().read_write().run(|tx| {
                   let row: InstallationRow =
                       diesel::sql_query("SELECT pack_installations.* FROM pack_installations \
                                          WHERE id = $1 FOR UPDATE")
                           .bind::<SqlUuid, _>(installation_id)
                           .get_result(tx)
                           .map_err(PersistenceError::from)?;
                   diesel::update(pack_installations::table.filter(pack_installations::id.eq(installation_id)))
                       .set((pack_installations::status.eq(InstallationStatus::Failed.as_str()),
                             pack_installations::error.eq(Some(error.clone())),
                             pack_installations::last_error_at.eq(Some(Utc::now())),
                             pack_installations::updated_by_run_id.eq(Some(run.id)),
                             pack_installations::updated_at.eq(Utc::now())))
                       .execute(tx)
                       .map_err(PersistenceError::from)?;
                   insert_event_tx(tx,
                                   EmitEvent { event_name: event_names::PACK_INSTALL_FAILED.to_string(),
                                               data: error.clone(),
                                               correlation_id: run.correlation_id,
                                               run_id: Some(run.id),
                                               step_id: None,
                                               actor: run.actor.clone(),
                                               resource_kind: Some("pack_installation".to_string()),
                                               resource_id: Some(row.id.to_string()) })?;
                   Ok(())
               })
        })?;
        Ok(())
    }

    fn get_installation_by_id(&self, id: Uuid) -> Result<Option<InstallationRow>, PersistenceError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            pack_installations::table.filter(pack_installations::id.eq(id))
                                     .first::<InstallationRow>(&mut conn)
                                     .optional()
                                     .map_err(PersistenceError::from)
        })
    }
}

impl<P: ConnectionProvider> PgInstallRepo<P> {
    /// Estado consultable para `GET /packs/{ref}/status`.
    pub fn status(&self, pack_ref: &str, env_id: &str) -> Result<Option<InstallationRow>, xyn_core::CoreError> {
        self.get_installation(pack_ref, env_id).map_err(core_err)
    }
}
