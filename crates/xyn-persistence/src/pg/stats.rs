//! Consultas baratas e indexadas para el collector de métricas.
//!
//! Cuatro sentencias por tick, todas cubiertas por los índices parciales de
//! `runs` (`idx_runs_ready`, `idx_runs_lease`). Cero cardinalidad por-run.

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable, Text};

use crate::error::PersistenceError;

use super::ConnectionProvider;

#[derive(QueryableByName, Debug)]
pub struct StatusCount {
    #[diesel(sql_type = Text)]
    pub status: String,
    #[diesel(sql_type = BigInt)]
    pub n: i64,
}

#[derive(QueryableByName, Debug)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

#[derive(QueryableByName, Debug)]
struct EpochRow {
    #[diesel(sql_type = Nullable<diesel::sql_types::Double>)]
    seconds: Option<f64>,
}

/// Snapshot de salud de cola y leases para un tick del collector.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub depth_by_status: Vec<(String, i64)>,
    pub ready_depth: i64,
    pub future_depth: i64,
    pub oldest_ready_seconds: f64,
    pub running_with_expired_lease: i64,
    pub running_with_active_lease: i64,
}

pub fn collect_queue_stats<P: ConnectionProvider>(provider: &P) -> Result<QueueStats, PersistenceError> {
    let mut conn = provider.connection()?;

    let by_status: Vec<StatusCount> =
        diesel::sql_query("SELECT status, count(*) AS n FROM runs GROUP BY status").load(&mut conn)
                                                                                   .map_err(PersistenceError::from)?;

    let ready: CountRow = diesel::sql_query("SELECT count(*) AS n FROM runs \
                                             WHERE status = 'queued' AND run_at <= now()")
        .get_result(&mut conn)
        .map_err(PersistenceError::from)?;
    let future: CountRow = diesel::sql_query("SELECT count(*) AS n FROM runs \
                                              WHERE status = 'queued' AND run_at > now()")
        .get_result(&mut conn)
        .map_err(PersistenceError::from)?;

    let oldest: EpochRow = diesel::sql_query("SELECT extract(epoch FROM (now() - min(queued_at)))::float8 AS seconds \
                                              FROM runs WHERE status = 'queued' AND run_at <= now()")
        .get_result(&mut conn)
        .map_err(PersistenceError::from)?;

    let expired: CountRow = diesel::sql_query("SELECT count(*) AS n FROM runs \
                                               WHERE status = 'running' AND lease_expires_at < now()")
        .get_result(&mut conn)
        .map_err(PersistenceError::from)?;
    let active: CountRow = diesel::sql_query("SELECT count(*) AS n FROM runs \
                                              WHERE status = 'running' AND lease_expires_at >= now()")
        .get_result(&mut conn)
        .map_err(PersistenceError::from)?;

    Ok(QueueStats { depth_by_status: by_status.into_iter().map(|r| (r.status, r.n)).collect(),
                    ready_depth: ready.n,
                    future_depth: future.n,
                    // 0 cuando no hay filas elegibles (valor presente, no ausente).
                    oldest_ready_seconds: oldest.seconds.unwrap_or(0.0).max(0.0),
                    running_with_expired_lease: expired.n,
                    running_with_active_lease: active.n })
}
