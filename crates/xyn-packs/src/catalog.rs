//! Catálogo builtin de packs.
//!
//! Los packs demo cubren el contrato completo: tablas declaradas,
//! migraciones ordenadas con id estable y dependencias vacías. El seed es
//! idempotente (upsert por `pack_ref`).

use log::info;
use xyn_domain::{PackManifest, PackMigration, TableSpec};
use xyn_persistence::{ConnectionProvider, PersistenceError, PgInstallRepo};

/// Pack de dominio base: dos tablas y dos migraciones.
pub fn core_domain_manifest() -> PackManifest {
    PackManifest {
        tables: vec![TableSpec { name: "entities".into(),
                                 ddl: "CREATE TABLE IF NOT EXISTS entities (\
                                       id UUID PRIMARY KEY, \
                                       entity_type TEXT NOT NULL, \
                                       payload JSONB NOT NULL DEFAULT '{}'::jsonb, \
                                       created_at TIMESTAMPTZ NOT NULL DEFAULT now())".into() },
                     TableSpec { name: "entity_links".into(),
                                 ddl: "CREATE TABLE IF NOT EXISTS entity_links (\
                                       source_id UUID NOT NULL, \
                                       target_id UUID NOT NULL, \
                                       relation TEXT NOT NULL, \
                                       PRIMARY KEY (source_id, target_id, relation))".into() }],
        migrations: vec![PackMigration { id: "0001_entities".into(),
                                         description: "índice por tipo de entidad".into(),
                                         ddl: "CREATE INDEX IF NOT EXISTS idx_entities_type \
                                               ON entities (entity_type)".into() },
                         PackMigration { id: "0002_links".into(),
                                         description: "índice inverso de links".into(),
                                         ddl: "CREATE INDEX IF NOT EXISTS idx_entity_links_target \
                                               ON entity_links (target_id)".into() }],
        pack_type: "domain".into(),
        dependencies: vec![],
    }
}

/// Pack mínimo usado por los tests de locking concurrente.
pub fn test_locking_manifest() -> PackManifest {
    PackManifest { tables: vec![TableSpec { name: "lock_probe".into(),
                                            ddl: "CREATE TABLE IF NOT EXISTS lock_probe (id TEXT PRIMARY KEY)".into() }],
                   migrations: vec![],
                   pack_type: "test".into(),
                   dependencies: vec![] }
}

/// Alta idempotente del catálogo builtin.
pub fn seed_builtin_packs<P: ConnectionProvider>(repo: &PgInstallRepo<P>) -> Result<(), PersistenceError> {
    repo.upsert_pack("core.domain@v1", "1.0.0", "domain", &core_domain_manifest())?;
    repo.upsert_pack("test.locking@v1", "1.0.0", "test", &test_locking_manifest())?;
    info!("catálogo builtin sembrado (core.domain@v1, test.locking@v1)");
    Ok(())
}
