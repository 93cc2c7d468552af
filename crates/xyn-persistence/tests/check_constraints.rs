//! Tests manuales que intentan violar los CHECK constraints con SQL
//! directo: la base es la segunda línea de defensa de los invariantes.

mod test_support;

use diesel::prelude::*;
use uuid::Uuid;

#[test]
fn installed_requires_all_installation_fields() {
    let pool = require_pool!();
    let mut conn = pool.get().unwrap();
    // Catálogo + instalación mínima en installing, sin schema_name.
    let pack_ref = format!("constraint.check@{}", Uuid::new_v4().simple());
    diesel::sql_query("INSERT INTO packs (pack_ref, version) VALUES ($1, '1.0.0')")
        .bind::<diesel::sql_types::Text, _>(&pack_ref)
        .execute(&mut conn)
        .unwrap();
    diesel::sql_query("INSERT INTO pack_installations (pack_id, pack_ref, env_id, status, schema_name) \
                       SELECT id, pack_ref, 'test-env', 'installing', NULL FROM packs WHERE pack_ref = $1")
        .bind::<diesel::sql_types::Text, _>(&pack_ref)
        .execute(&mut conn)
        .unwrap();

    // Promover a installed sin los campos requeridos debe fallar.
    let res = diesel::sql_query("UPDATE pack_installations SET status = 'installed' \
                                 WHERE pack_ref = $1 AND schema_name IS NULL")
        .bind::<diesel::sql_types::Text, _>(&pack_ref)
        .execute(&mut conn);
    assert!(res.is_err(), "Debe fallar constraint de installed");
}

#[test]
fn running_requires_lease_fields() {
    let pool = require_pool!();
    let mut conn = pool.get().unwrap();
    let res = diesel::sql_query("INSERT INTO runs (name, status, correlation_id) \
                                 VALUES ('bad-running', 'running', $1)")
        .bind::<diesel::sql_types::Uuid, _>(Uuid::new_v4())
        .execute(&mut conn);
    assert!(res.is_err(), "running sin locked_by/lease debe fallar");
}

#[test]
fn terminal_requires_completed_at() {
    let pool = require_pool!();
    let mut conn = pool.get().unwrap();
    let res = diesel::sql_query("INSERT INTO runs (name, status, correlation_id) \
                                 VALUES ('bad-terminal', 'completed', $1)")
        .bind::<diesel::sql_types::Uuid, _>(Uuid::new_v4())
        .execute(&mut conn);
    assert!(res.is_err(), "terminal sin completed_at debe fallar");
}

#[test]
fn event_name_shape_is_enforced() {
    let pool = require_pool!();
    let mut conn = pool.get().unwrap();
    let res = diesel::sql_query("INSERT INTO events (event_name, correlation_id) VALUES ('INVALID NAME', $1)")
        .bind::<diesel::sql_types::Uuid, _>(Uuid::new_v4())
        .execute(&mut conn);
    assert!(res.is_err(), "Debe fallar constraint de event_name");
}

#[test]
fn step_idx_is_unique_per_run() {
    let pool = require_pool!();
    let mut conn = pool.get().unwrap();
    let correlation = Uuid::new_v4();
    diesel::sql_query("INSERT INTO runs (id, name, status, correlation_id) VALUES ($1, 'idx-test', 'queued', $1)")
        .bind::<diesel::sql_types::Uuid, _>(correlation)
        .execute(&mut conn)
        .unwrap();
    diesel::sql_query("INSERT INTO steps (run_id, idx, name, kind) VALUES ($1, 0, 's0', 'action_task')")
        .bind::<diesel::sql_types::Uuid, _>(correlation)
        .execute(&mut conn)
        .unwrap();
    let res = diesel::sql_query("INSERT INTO steps (run_id, idx, name, kind) VALUES ($1, 0, 's0-dup', 'action_task')")
        .bind::<diesel::sql_types::Uuid, _>(correlation)
        .execute(&mut conn);
    assert!(res.is_err(), "idx duplicado debe fallar el índice único");
}
