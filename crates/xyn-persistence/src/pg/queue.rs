//! Cola durable sobre Postgres: claim, lease, reclaim y finalización.
//!
//! El claim es una sola sentencia atómica con `FOR UPDATE SKIP LOCKED`:
//! exactamente un claimant gana la fila; el resto salta a la siguiente o
//! duerme. Todas las finalizaciones verifican `locked_by` para que un worker
//! con lease perdido no escriba estado ajeno.

use chrono::{Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel::sql_types::{Double, Text, Uuid as SqlUuid};
use log::debug;
use serde_json::{json, Value};
use uuid::Uuid;
use xyn_core::errors::CoreError;
use xyn_core::model::{EmitEvent, NewRun, Run};
use xyn_core::queue::{FailDisposition, QueueConfig, RunQueue};
use xyn_domain::{events as event_names, RunError, RunStatus};

use crate::error::PersistenceError;
use crate::schema::{run_edges, runs};

use super::{core_err, insert_event_tx, with_retry, ConnectionProvider, RunRow};

/// Profundidad máxima del walk de ancestros al insertar un edge (los edges
/// forman un DAG por convención; esto lo refuerza en la inserción).
const EDGE_DEPTH_CAP: usize = 32;

const CLAIM_SQL: &str = "\
WITH c AS (
    SELECT id FROM runs
    WHERE status = 'queued' AND run_at <= now()
    ORDER BY priority ASC, run_at ASC, queued_at ASC, created_at ASC
    FOR UPDATE SKIP LOCKED
    LIMIT 1
)
UPDATE runs
SET status = 'running',
    locked_at = now(),
    locked_by = $1,
    lease_expires_at = now() + make_interval(secs => $2),
    started_at = coalesce(started_at, now()),
    attempt = attempt + 1,
    updated_at = now()
FROM c
WHERE runs.id = c.id
RETURNING runs.*";

const RECLAIM_SQL: &str = "\
UPDATE runs
SET status = 'queued',
    locked_at = NULL,
    locked_by = NULL,
    lease_expires_at = NULL,
    updated_at = now()
WHERE status = 'running' AND lease_expires_at < now()
RETURNING runs.*";

const SELECT_FOR_FINALIZE_SQL: &str = "\
SELECT runs.* FROM runs
WHERE id = $1 AND locked_by = $2 AND status = 'running'
FOR UPDATE";

const SELECT_FOR_CANCEL_SQL: &str = "SELECT runs.* FROM runs WHERE id = $1 FOR UPDATE";

#[derive(Insertable)]
#[diesel(table_name = runs)]
struct NewRunRow {
    id: Uuid,
    name: String,
    blueprint_ref: Option<String>,
    status: String,
    run_at: chrono::DateTime<Utc>,
    priority: i32,
    max_attempts: Option<i32>,
    actor: Option<String>,
    correlation_id: Uuid,
    inputs: Value,
    parent_run_id: Option<Uuid>,
}

#[derive(Insertable)]
#[diesel(table_name = run_edges)]
struct NewEdgeRow {
    parent_run_id: Uuid,
    child_run_id: Uuid,
    relation: String,
    child_key: Option<String>,
}

/// Inserta el run (estado `queued`), su edge de linaje si corresponde y el
/// evento `xyn.run.created`, dentro de la transacción en curso. Lo comparten
/// `enqueue` y la solicitud de instalación de packs (que necesita run +
/// claim de instalación en un solo commit).
pub(crate) fn insert_run_tx(tx: &mut PgConnection,
                            new_run: &NewRun,
                            default_max_attempts: Option<i32>)
                            -> Result<RunRow, PersistenceError> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let row = NewRunRow { id,
                          name: new_run.name.clone(),
                          blueprint_ref: new_run.blueprint_ref.clone(),
                          status: RunStatus::Queued.as_str().to_string(),
                          run_at: new_run.run_at.unwrap_or(now),
                          priority: new_run.priority.unwrap_or(100),
                          max_attempts: new_run.max_attempts.or(default_max_attempts),
                          actor: new_run.actor.clone(),
                          correlation_id: id,
                          inputs: new_run.inputs.clone(),
                          parent_run_id: new_run.parent_run_id };
    let inserted: RunRow = diesel::insert_into(runs::table).values(&row)
                                                           .get_result(tx)
                                                           .map_err(PersistenceError::from)?;

    if let Some(parent) = new_run.parent_run_id {
        diesel::insert_into(run_edges::table)
            .values(&NewEdgeRow { parent_run_id: parent,
                                  child_run_id: id,
                                  relation: new_run.relation.clone().unwrap_or_else(|| "spawned".into()),
                                  child_key: new_run.child_key.clone() })
            .execute(tx)
            .map_err(PersistenceError::from)?;
    }

    let run = inserted.clone().into_run()?;
    insert_event_tx(tx,
                    EmitEvent::for_run(event_names::RUN_CREATED, &run, json!({"name": run.name})))?;
    Ok(inserted)
}

pub struct PgRunQueue<P: ConnectionProvider> {
    provider: P,
    config: QueueConfig,
}

impl<P: ConnectionProvider> PgRunQueue<P> {
    pub fn new(provider: P, config: QueueConfig) -> Self {
        Self { provider, config }
    }

    fn lease_secs(&self) -> f64 {
        self.config.lease_duration.as_secs_f64()
    }

    /// Walk de ancestros con tope: rechaza edges que excedan la profundidad
    /// (o que cierren un ciclo, que se manifiesta como exceso de profundidad).
    fn check_edge_depth(conn: &mut PgConnection, parent: Uuid) -> Result<(), PersistenceError> {
        let mut current = Some(parent);
        let mut depth = 0usize;
        while let Some(id) = current {
            depth += 1;
            if depth > EDGE_DEPTH_CAP {
                return Err(PersistenceError::InvariantRejected(format!(
                    "profundidad de linaje excede el tope ({EDGE_DEPTH_CAP})"
                )));
            }
            current = runs::table.filter(runs::id.eq(id))
                                 .select(runs::parent_run_id)
                                 .first::<Option<Uuid>>(conn)
                                 .optional()
                                 .map_err(PersistenceError::from)?
                                 .flatten();
        }
        Ok(())
    }

    fn existing_child(conn: &mut PgConnection, parent: Uuid, child_key: &str)
                      -> Result<Option<RunRow>, PersistenceError> {
        let child_id: Option<Uuid> = run_edges::table.filter(run_edges::parent_run_id.eq(parent))
                                                     .filter(run_edges::child_key.eq(child_key))
                                                     .select(run_edges::child_run_id)
                                                     .first(conn)
                                                     .optional()
                                                     .map_err(PersistenceError::from)?;
        match child_id {
            None => Ok(None),
            Some(id) => runs::table.filter(runs::id.eq(id))
                                   .first::<RunRow>(conn)
                                   .optional()
                                   .map_err(PersistenceError::from),
        }
    }

    fn enqueue_tx(&self, new_run: &NewRun) -> Result<RunRow, PersistenceError> {
        let mut conn = self.provider.connection()?;
        conn.build_transaction().read_write().run(|tx| {
            if let (Some(parent), Some(key)) = (new_run.parent_run_id, new_run.child_key.as_deref()) {
                if let Some(existing) = Self::existing_child(tx, parent, key)? {
                    return Ok(existing);
                }
            }
            if let Some(parent) = new_run.parent_run_id {
                Self::check_edge_depth(tx, parent)?;
            }
            insert_run_tx(tx, new_run, self.config.default_max_attempts)
        })
    }
}

impl<P: ConnectionProvider> RunQueue for PgRunQueue<P> {
    fn enqueue(&self, new_run: NewRun) -> Result<Run, CoreError> {
        let row = with_retry(|| match self.enqueue_tx(&new_run) {
                      // Carrera en (parent, child_key): otro submitter ganó el
                      // edge; devolver su hijo (spawning idempotente).
                      Err(PersistenceError::Duplicate(_)) if new_run.child_key.is_some() => {
                          let mut conn = self.provider.connection()?;
                          let parent = new_run.parent_run_id.expect("child_key requiere parent_run_id");
                          let key = new_run.child_key.as_deref().expect("child_key presente");
                          Self::existing_child(&mut conn, parent, key)?
                              .ok_or_else(|| PersistenceError::Other("edge sin run hijo tras conflicto".into()))
                      }
                      other => other,
                  }).map_err(core_err)?;
        row.into_run().map_err(core_err)
    }

    fn claim(&self, worker_id: &str) -> Result<Option<Run>, CoreError> {
        let claimed = with_retry(|| {
                          let mut conn = self.provider.connection()?;
                          conn.build_transaction().read_write().run(|tx| {
                                 let row: Option<RunRow> = diesel::sql_query(CLAIM_SQL)
                                     .bind::<Text, _>(worker_id)
                                     .bind::<Double, _>(self.lease_secs())
                                     .get_result(tx)
                                     .optional()
                                     .map_err(PersistenceError::from)?;
                                 let Some(row) = row else {
                                     return Ok(None);
                                 };
                                 let run = row.clone().into_run()?;
                                 let reclaimed = run.attempt > 1;
                                 insert_event_tx(tx,
                                                 EmitEvent::for_run(event_names::RUN_STARTED,
                                                                    &run,
                                                                    json!({"attempt": run.attempt,
                                                                           "reclaimed": reclaimed})))?;
                                 Ok(Some(row))
                             })
                      }).map_err(core_err)?;
        match claimed {
            None => Ok(None),
            Some(row) => {
                debug!("claim: run {} por {}", row.id, worker_id);
                row.into_run().map(Some).map_err(core_err)
            }
        }
    }

    fn renew(&self, run_id: Uuid, worker_id: &str) -> Result<bool, CoreError> {
        let affected = with_retry(|| {
                           let mut conn = self.provider.connection()?;
                           diesel::sql_query("UPDATE runs SET lease_expires_at = now() + make_interval(secs => $3), \
                                              updated_at = now() \
                                              WHERE id = $1 AND locked_by = $2 AND status = 'running'")
                               .bind::<SqlUuid, _>(run_id)
                               .bind::<Text, _>(worker_id)
                               .bind::<Double, _>(self.lease_secs())
                               .execute(&mut conn)
                               .map_err(PersistenceError::from)
                       }).map_err(core_err)?;
        Ok(affected > 0)
    }

    fn complete(&self, run_id: Uuid, worker_id: &str, outputs: Value) -> Result<(), CoreError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction().read_write().run(|tx| {
                   let row: Option<RunRow> = diesel::sql_query(SELECT_FOR_FINALIZE_SQL)
                       .bind::<SqlUuid, _>(run_id)
                       .bind::<Text, _>(worker_id)
                       .get_result(tx)
                       .optional()
                       .map_err(PersistenceError::from)?;
                   if row.is_none() {
                       return Err(PersistenceError::NotFound);
                   }
                   let updated: RunRow =
                       diesel::update(runs::table.filter(runs::id.eq(run_id)))
                           .set((runs::status.eq(RunStatus::Completed.as_str()),
                                 runs::outputs.eq(Some(outputs.clone())),
                                 runs::completed_at.eq(Some(Utc::now())),
                                 runs::locked_by.eq(None::<String>),
                                 runs::lease_expires_at.eq(None::<chrono::DateTime<Utc>>),
                                 runs::updated_at.eq(Utc::now())))
                           .get_result(tx)
                           .map_err(PersistenceError::from)?;
                   let run = updated.into_run()?;
                   insert_event_tx(tx, EmitEvent::for_run(event_names::RUN_COMPLETED, &run, json!({})))?;
                   Ok(())
               })
        }).map_err(|e| match e {
              PersistenceError::NotFound => {
                  CoreError::Conflict(format!("run {run_id} no está en ejecución por {worker_id}"))
              }
              other => core_err(other),
          })
    }

    fn fail(&self, run_id: Uuid, worker_id: &str, error: RunError, retryable: bool)
            -> Result<FailDisposition, CoreError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction().read_write().run(|tx| {
                   let row: Option<RunRow> = diesel::sql_query(SELECT_FOR_FINALIZE_SQL)
                       .bind::<SqlUuid, _>(run_id)
                       .bind::<Text, _>(worker_id)
                       .get_result(tx)
                       .optional()
                       .map_err(PersistenceError::from)?;
                   let Some(row) = row else {
                       return Err(PersistenceError::NotFound);
                   };

                   let attempts_left = row.max_attempts.map(|m| row.attempt < m).unwrap_or(true);
                   if retryable && attempts_left {
                       let delay = self.config.backoff.delay(row.attempt);
                       let run_at = Utc::now()
                                    + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(1));
                       let updated: RunRow =
                           diesel::update(runs::table.filter(runs::id.eq(run_id)))
                               .set((runs::status.eq(RunStatus::Queued.as_str()),
                                     runs::run_at.eq(run_at),
                                     runs::locked_at.eq(None::<chrono::DateTime<Utc>>),
                                     runs::locked_by.eq(None::<String>),
                                     runs::lease_expires_at.eq(None::<chrono::DateTime<Utc>>),
                                     runs::error.eq(Some(error.to_json())),
                                     runs::updated_at.eq(Utc::now())))
                               .get_result(tx)
                               .map_err(PersistenceError::from)?;
                       let run = updated.into_run()?;
                       insert_event_tx(tx,
                                       EmitEvent::for_run(event_names::RUN_RETRY_SCHEDULED,
                                                          &run,
                                                          json!({"attempt": run.attempt, "run_at": run_at})))?;
                       Ok(FailDisposition::Retried { run_at })
                   } else {
                       let updated: RunRow =
                           diesel::update(runs::table.filter(runs::id.eq(run_id)))
                               .set((runs::status.eq(RunStatus::Failed.as_str()),
                                     runs::completed_at.eq(Some(Utc::now())),
                                     runs::locked_by.eq(None::<String>),
                                     runs::lease_expires_at.eq(None::<chrono::DateTime<Utc>>),
                                     runs::error.eq(Some(error.to_json())),
                                     runs::updated_at.eq(Utc::now())))
                               .get_result(tx)
                               .map_err(PersistenceError::from)?;
                       let run = updated.into_run()?;
                       insert_event_tx(tx, EmitEvent::for_run(event_names::RUN_FAILED, &run, error.to_json()))?;
                       Ok(FailDisposition::Terminal)
                   }
               })
        }).map_err(|e| match e {
              PersistenceError::NotFound => {
                  CoreError::Conflict(format!("run {run_id} no está en ejecución por {worker_id}"))
              }
              other => core_err(other),
          })
    }

    fn complete_cancel(&self, run_id: Uuid, worker_id: &str) -> Result<(), CoreError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction().read_write().run(|tx| {
                   let row: Option<RunRow> = diesel::sql_query(SELECT_FOR_FINALIZE_SQL)
                       .bind::<SqlUuid, _>(run_id)
                       .bind::<Text, _>(worker_id)
                       .get_result(tx)
                       .optional()
                       .map_err(PersistenceError::from)?;
                   if row.is_none() {
                       return Err(PersistenceError::NotFound);
                   }
                   let updated: RunRow =
                       diesel::update(runs::table.filter(runs::id.eq(run_id)))
                           .set((runs::status.eq(RunStatus::Cancelled.as_str()),
                                 runs::completed_at.eq(Some(Utc::now())),
                                 runs::locked_by.eq(None::<String>),
                                 runs::lease_expires_at.eq(None::<chrono::DateTime<Utc>>),
                                 runs::updated_at.eq(Utc::now())))
                           .get_result(tx)
                           .map_err(PersistenceError::from)?;
                   let run = updated.into_run()?;
                   insert_event_tx(tx, EmitEvent::for_run(event_names::RUN_CANCELLED, &run, json!({})))?;
                   Ok(())
               })
        }).map_err(|e| match e {
              PersistenceError::NotFound => {
                  CoreError::Conflict(format!("run {run_id} no está en ejecución por {worker_id}"))
              }
              other => core_err(other),
          })
    }

    fn cancel(&self, run_id: Uuid) -> Result<Run, CoreError> {
        let row = with_retry(|| {
                      let mut conn = self.provider.connection()?;
                      conn.build_transaction().read_write().run(|tx| {
                             let row: Option<RunRow> = diesel::sql_query(SELECT_FOR_CANCEL_SQL)
                                 .bind::<SqlUuid, _>(run_id)
                                 .get_result(tx)
                                 .optional()
                                 .map_err(PersistenceError::from)?;
                             let Some(row) = row else {
                                 return Err(PersistenceError::NotFound);
                             };
                             match RunStatus::parse(&row.status) {
                                 Some(RunStatus::Queued) => {
                                     let updated: RunRow =
                                         diesel::update(runs::table.filter(runs::id.eq(run_id)))
                                             .set((runs::status.eq(RunStatus::Cancelled.as_str()),
                                                   runs::completed_at.eq(Some(Utc::now())),
                                                   runs::updated_at.eq(Utc::now())))
                                             .get_result(tx)
                                             .map_err(PersistenceError::from)?;
                                     let run = updated.clone().into_run()?;
                                     insert_event_tx(tx,
                                                     EmitEvent::for_run(event_names::RUN_CANCELLED,
                                                                        &run,
                                                                        json!({})))?;
                                     Ok(updated)
                                 }
                                 Some(RunStatus::Running) => {
                                     let updated: RunRow =
                                         diesel::update(runs::table.filter(runs::id.eq(run_id)))
                                             .set((runs::cancel_requested.eq(true),
                                                   runs::updated_at.eq(Utc::now())))
                                             .get_result(tx)
                                             .map_err(PersistenceError::from)?;
                                     Ok(updated)
                                 }
                                 // Terminal: idempotente, sin mutación.
                                 _ => Ok(row),
                             }
                         })
                  }).map_err(|e| match e {
                        PersistenceError::NotFound => CoreError::NotFound,
                        other => core_err(other),
                    })?;
        row.into_run().map_err(core_err)
    }

    fn cancel_requested(&self, run_id: Uuid) -> Result<bool, CoreError> {
        let flag = with_retry(|| {
                       let mut conn = self.provider.connection()?;
                       runs::table.filter(runs::id.eq(run_id))
                                  .select(runs::cancel_requested)
                                  .first::<bool>(&mut conn)
                                  .optional()
                                  .map_err(PersistenceError::from)
                   }).map_err(core_err)?;
        Ok(flag.unwrap_or(false))
    }

    fn reclaim_expired(&self) -> Result<Vec<Uuid>, CoreError> {
        let rows = with_retry(|| {
                       let mut conn = self.provider.connection()?;
                       conn.build_transaction().read_write().run(|tx| {
                              let rows: Vec<RunRow> = diesel::sql_query(RECLAIM_SQL)
                                  .load(tx)
                                  .map_err(PersistenceError::from)?;
                              for row in &rows {
                                  let run = row.clone().into_run()?;
                                  insert_event_tx(tx,
                                                  EmitEvent::for_run(event_names::RUN_RECLAIMED,
                                                                     &run,
                                                                     json!({"attempt": run.attempt})))?;
                              }
                              Ok(rows)
                          })
                   }).map_err(core_err)?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }
}
