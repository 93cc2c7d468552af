//! Runs y steps sobre Postgres: ciclo de vida por step con su evento en la
//! misma transacción, y listados con paginación keyset para la API.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::{json, Value};
use uuid::Uuid;
use xyn_core::errors::CoreError;
use xyn_core::model::{EmitEvent, NewStep, Run, StepRecord};
use xyn_core::store::RunStore;
use xyn_domain::{events as event_names, RunError, StepStatus};

use crate::error::PersistenceError;
use crate::schema::{runs, steps};

use super::{core_err, insert_event_tx, with_retry, ConnectionProvider, RunRow, StepRow};

#[derive(Insertable)]
#[diesel(table_name = steps)]
struct NewStepRow {
    run_id: Uuid,
    idx: i32,
    name: String,
    kind: String,
    status: String,
    inputs: Value,
}

pub struct PgRunStore<P: ConnectionProvider> {
    provider: P,
}

impl<P: ConnectionProvider> PgRunStore<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Listado para la API: filtro opcional por status, orden
    /// `(created_at DESC, id DESC)` y keyset opcional `before`.
    pub fn list_runs(&self,
                     status: Option<&str>,
                     limit: i64,
                     before: Option<(DateTime<Utc>, Uuid)>)
                     -> Result<Vec<Run>, CoreError> {
        let rows = with_retry(|| {
                       let mut conn = self.provider.connection()?;
                       let mut query = runs::table.into_boxed();
                       if let Some(s) = status {
                           query = query.filter(runs::status.eq(s.to_string()));
                       }
                       if let Some((ts, id)) = before {
                           query = query.filter(runs::created_at.lt(ts)
                                                                .or(runs::created_at.eq(ts).and(runs::id.lt(id))));
                       }
                       query.order((runs::created_at.desc(), runs::id.desc()))
                            .limit(limit)
                            .load::<RunRow>(&mut conn)
                            .map_err(PersistenceError::from)
                   }).map_err(core_err)?;
        rows.into_iter().map(|r| r.into_run().map_err(core_err)).collect()
    }
}

impl<P: ConnectionProvider> RunStore for PgRunStore<P> {
    fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, CoreError> {
        let row = with_retry(|| {
                      let mut conn = self.provider.connection()?;
                      runs::table.filter(runs::id.eq(run_id))
                                 .first::<RunRow>(&mut conn)
                                 .optional()
                                 .map_err(PersistenceError::from)
                  }).map_err(core_err)?;
        match row {
            None => Ok(None),
            Some(r) => r.into_run().map(Some).map_err(core_err),
        }
    }

    fn insert_step(&self, step: NewStep) -> Result<StepRecord, CoreError> {
        let row = with_retry(|| {
                      let mut conn = self.provider.connection()?;
                      diesel::insert_into(steps::table)
                          .values(&NewStepRow { run_id: step.run_id,
                                                idx: step.idx,
                                                name: step.name.clone(),
                                                kind: step.kind.clone(),
                                                status: StepStatus::Created.as_str().to_string(),
                                                inputs: step.inputs.clone() })
                          .get_result::<StepRow>(&mut conn)
                          .map_err(PersistenceError::from)
                  }).map_err(core_err)?;
        row.into_step().map_err(core_err)
    }

    fn start_step(&self, run: &Run, step_id: Uuid) -> Result<StepRecord, CoreError> {
        let row = with_retry(|| {
                      let mut conn = self.provider.connection()?;
                      conn.build_transaction().read_write().run(|tx| {
                             let updated: StepRow =
                                 diesel::update(steps::table.filter(steps::id.eq(step_id)))
                                     .set((steps::status.eq(StepStatus::Running.as_str()),
                                           steps::started_at.eq(Some(Utc::now()))))
                                     .get_result(tx)
                                     .map_err(PersistenceError::from)?;
                             insert_event_tx(tx,
                                             EmitEvent::for_run(event_names::STEP_STARTED,
                                                                run,
                                                                json!({"idx": updated.idx, "name": updated.name}))
                                                 .with_step(step_id))?;
                             Ok(updated)
                         })
                  }).map_err(core_err)?;
        row.into_step().map_err(core_err)
    }

    fn complete_step(&self, run: &Run, step_id: Uuid, outputs: Value) -> Result<StepRecord, CoreError> {
        let row = with_retry(|| {
                      let mut conn = self.provider.connection()?;
                      conn.build_transaction().read_write().run(|tx| {
                             let updated: StepRow =
                                 diesel::update(steps::table.filter(steps::id.eq(step_id)))
                                     .set((steps::status.eq(StepStatus::Completed.as_str()),
                                           steps::outputs.eq(Some(outputs.clone())),
                                           steps::completed_at.eq(Some(Utc::now()))))
                                     .get_result(tx)
                                     .map_err(PersistenceError::from)?;
                             insert_event_tx(tx,
                                             EmitEvent::for_run(event_names::STEP_COMPLETED,
                                                                run,
                                                                json!({"idx": updated.idx})).with_step(step_id))?;
                             Ok(updated)
                         })
                  }).map_err(core_err)?;
        row.into_step().map_err(core_err)
    }

    fn fail_step(&self, run: &Run, step_id: Uuid, error: &RunError) -> Result<StepRecord, CoreError> {
        let row = with_retry(|| {
                      let mut conn = self.provider.connection()?;
                      conn.build_transaction().read_write().run(|tx| {
                             let updated: StepRow =
                                 diesel::update(steps::table.filter(steps::id.eq(step_id)))
                                     .set((steps::status.eq(StepStatus::Failed.as_str()),
                                           steps::error.eq(Some(error.to_json())),
                                           steps::completed_at.eq(Some(Utc::now()))))
                                     .get_result(tx)
                                     .map_err(PersistenceError::from)?;
                             insert_event_tx(tx,
                                             EmitEvent::for_run(event_names::STEP_FAILED, run, error.to_json())
                                                 .with_step(step_id))?;
                             Ok(updated)
                         })
                  }).map_err(core_err)?;
        row.into_step().map_err(core_err)
    }

    fn skip_step(&self, run: &Run, step_id: Uuid) -> Result<StepRecord, CoreError> {
        let row = with_retry(|| {
                      let mut conn = self.provider.connection()?;
                      conn.build_transaction().read_write().run(|tx| {
                             let updated: StepRow =
                                 diesel::update(steps::table.filter(steps::id.eq(step_id)))
                                     .set((steps::status.eq(StepStatus::Skipped.as_str()),
                                           steps::completed_at.eq(Some(Utc::now()))))
                                     .get_result(tx)
                                     .map_err(PersistenceError::from)?;
                             insert_event_tx(tx,
                                             EmitEvent::for_run(event_names::STEP_SKIPPED,
                                                                run,
                                                                json!({"idx": updated.idx})).with_step(step_id))?;
                             Ok(updated)
                         })
                  }).map_err(core_err)?;
        row.into_step().map_err(core_err)
    }

    fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, CoreError> {
        let rows = with_retry(|| {
                       let mut conn = self.provider.connection()?;
                       steps::table.filter(steps::run_id.eq(run_id))
                                   .order(steps::idx.asc())
                                   .load::<StepRow>(&mut conn)
                                   .map_err(PersistenceError::from)
                   }).map_err(core_err)?;
        rows.into_iter().map(|r| r.into_step().map_err(core_err)).collect()
    }
}
