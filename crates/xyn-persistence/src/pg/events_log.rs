//! Log de eventos append-only sobre Postgres.
//!
//! Sin updates ni deletes: la tabla `events` sólo crece. La lectura por
//! correlación ordena `(occurred_at, id)`; los listados de la API ordenan
//! newest-first con paginación keyset.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;
use xyn_core::errors::CoreError;
use xyn_core::model::{EmitEvent, StoredEvent};
use xyn_core::store::EventLog;

use crate::error::PersistenceError;
use crate::schema::events;

use super::{core_err, insert_event_tx, with_retry, ConnectionProvider, EventRow};

/// Filtros del listado `GET /events`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_name: Option<String>,
    pub run_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
}

pub struct PgEventLog<P: ConnectionProvider> {
    provider: P,
}

impl<P: ConnectionProvider> PgEventLog<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn get(&self, id: Uuid) -> Result<Option<StoredEvent>, CoreError> {
        let row = with_retry(|| {
                      let mut conn = self.provider.connection()?;
                      events::table.filter(events::id.eq(id))
                                   .first::<EventRow>(&mut conn)
                                   .optional()
                                   .map_err(PersistenceError::from)
                  }).map_err(core_err)?;
        Ok(row.map(|r| r.into_event()))
    }

    /// Listado newest-first con keyset `(occurred_at, id)` estricto.
    pub fn list(&self,
                filter: &EventFilter,
                limit: i64,
                before: Option<(DateTime<Utc>, Uuid)>)
                -> Result<Vec<StoredEvent>, CoreError> {
        let rows = with_retry(|| {
                       let mut conn = self.provider.connection()?;
                       let mut query = events::table.into_boxed();
                       if let Some(name) = &filter.event_name {
                           query = query.filter(events::event_name.eq(name.clone()));
                       }
                       if let Some(run_id) = filter.run_id {
                           query = query.filter(events::run_id.eq(run_id));
                       }
                       if let Some(correlation_id) = filter.correlation_id {
                           query = query.filter(events::correlation_id.eq(correlation_id));
                       }
                       if let Some((ts, id)) = before {
                           query = query.filter(events::occurred_at.lt(ts)
                                                                   .or(events::occurred_at.eq(ts)
                                                                                          .and(events::id.lt(id))));
                       }
                       query.order((events::occurred_at.desc(), events::id.desc()))
                            .limit(limit)
                            .load::<EventRow>(&mut conn)
                            .map_err(PersistenceError::from)
                   }).map_err(core_err)?;
        Ok(rows.into_iter().map(|r| r.into_event()).collect())
    }
}

impl<P: ConnectionProvider> EventLog for PgEventLog<P> {
    fn emit(&self, event: EmitEvent) -> Result<Uuid, CoreError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            insert_event_tx(&mut conn, event.clone())
        }).map_err(core_err)
    }

    fn list_by_correlation(&self, correlation_id: Uuid) -> Result<Vec<StoredEvent>, CoreError> {
        let rows = with_retry(|| {
                       let mut conn = self.provider.connection()?;
                       events::table.filter(events::correlation_id.eq(correlation_id))
                                    .order((events::occurred_at.asc(), events::id.asc()))
                                    .load::<EventRow>(&mut conn)
                                    .map_err(PersistenceError::from)
                   }).map_err(core_err)?;
        Ok(rows.into_iter().map(|r| r.into_event()).collect())
    }
}
