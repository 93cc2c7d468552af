//! Wrapper para correr migraciones embebidas y el preflight del ledger.

use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::PersistenceError;
use crate::schema::schema_migrations_ledger;

// Directorio esperado: `migrations/` en este crate.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub fn run_pending_migrations(conn: &mut PgConnection) -> Result<(), PersistenceError> {
    conn.batch_execute("CREATE EXTENSION IF NOT EXISTS pgcrypto;").ok();
    conn.run_pending_migrations(MIGRATIONS)
        .map(|_| ())
        .map_err(|e| PersistenceError::Other(format!("migraciones embebidas: {e}")))
}

/// Preflight de arranque: con `XYN_AUTO_CREATE_SCHEMA=false` el proceso se
/// niega a arrancar salvo que cada id requerido esté en el ledger.
pub fn missing_required_migrations(conn: &mut PgConnection, required: &[String])
                                   -> Result<Vec<String>, PersistenceError> {
    let applied: Vec<String> = schema_migrations_ledger::table.select(schema_migrations_ledger::id)
                                                              .load(conn)
                                                              .map_err(PersistenceError::from)?;
    Ok(required.iter().filter(|r| !applied.contains(r)).cloned().collect())
}

/// Registra un id en el ledger de forma idempotente (mismo conn/tx del DDL
/// que lo aplicó).
pub fn record_in_ledger(conn: &mut PgConnection, id: &str) -> Result<(), PersistenceError> {
    diesel::insert_into(schema_migrations_ledger::table).values(schema_migrations_ledger::id.eq(id))
                                                        .on_conflict_do_nothing()
                                                        .execute(conn)
                                                        .map(|_| ())
                                                        .map_err(PersistenceError::from)
}
