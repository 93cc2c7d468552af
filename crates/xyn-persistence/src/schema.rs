//! Esquema Diesel (mantenido manualmente junto a las migraciones).
//! Reemplazable con `diesel print-schema`.
//!
//! Tablas:
//! - `runs`: cola durable + metadata de ejecución y lease.
//! - `run_edges`: linaje padre→hijo con clave idempotente.
//! - `steps`: steps ordenados por `(run_id, idx)` único.
//! - `events`: log append-only correlacionado.
//! - `artifacts`: blobs inmutables direccionados por sha256.
//! - `packs` / `pack_installations`: catálogo y máquina de estados.
//! - `schema_migrations_ledger`: ledger idempotente para preflight.

diesel::table! {
    runs (id) {
        id -> Uuid,
        name -> Text,
        blueprint_ref -> Nullable<Text>,
        status -> Text,
        run_at -> Timestamptz,
        priority -> Integer,
        attempt -> Integer,
        max_attempts -> Nullable<Integer>,
        queued_at -> Timestamptz,
        created_at -> Timestamptz,
        locked_at -> Nullable<Timestamptz>,
        locked_by -> Nullable<Text>,
        lease_expires_at -> Nullable<Timestamptz>,
        started_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        actor -> Nullable<Text>,
        correlation_id -> Uuid,
        inputs -> Jsonb,
        outputs -> Nullable<Jsonb>,
        error -> Nullable<Jsonb>,
        cancel_requested -> Bool,
        parent_run_id -> Nullable<Uuid>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    run_edges (parent_run_id, child_run_id) {
        parent_run_id -> Uuid,
        child_run_id -> Uuid,
        relation -> Text,
        child_key -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    steps (id) {
        id -> Uuid,
        run_id -> Uuid,
        idx -> Integer,
        name -> Text,
        kind -> Text,
        status -> Text,
        inputs -> Jsonb,
        outputs -> Nullable<Jsonb>,
        error -> Nullable<Jsonb>,
        started_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        logs_artifact_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    events (id) {
        id -> Uuid,
        event_name -> Text,
        occurred_at -> Timestamptz,
        correlation_id -> Uuid,
        run_id -> Nullable<Uuid>,
        step_id -> Nullable<Uuid>,
        actor -> Nullable<Text>,
        resource_kind -> Nullable<Text>,
        resource_id -> Nullable<Text>,
        data -> Jsonb,
    }
}

diesel::table! {
    artifacts (id) {
        id -> Uuid,
        name -> Text,
        kind -> Text,
        content_type -> Text,
        byte_length -> BigInt,
        sha256 -> Nullable<Text>,
        storage_path -> Nullable<Text>,
        created_by -> Nullable<Text>,
        run_id -> Nullable<Uuid>,
        step_id -> Nullable<Uuid>,
        metadata -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    packs (id) {
        id -> Uuid,
        pack_ref -> Text,
        version -> Text,
        pack_type -> Text,
        manifest -> Jsonb,
        dependencies -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    pack_installations (id) {
        id -> Uuid,
        pack_id -> Uuid,
        pack_ref -> Text,
        env_id -> Text,
        status -> Text,
        schema_mode -> Text,
        schema_name -> Nullable<Text>,
        migration_provider -> Text,
        installed_version -> Nullable<Text>,
        migration_state -> Nullable<Text>,
        installed_at -> Nullable<Timestamptz>,
        installed_by_run_id -> Nullable<Uuid>,
        updated_by_run_id -> Nullable<Uuid>,
        error -> Nullable<Jsonb>,
        last_error_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    schema_migrations_ledger (id) {
        id -> Text,
        applied_at -> Timestamptz,
    }
}

diesel::joinable!(steps -> runs (run_id));
diesel::joinable!(pack_installations -> packs (pack_id));

diesel::allow_tables_to_appear_in_same_query!(runs, run_edges, steps, events, artifacts, packs, pack_installations,
                                              schema_migrations_ledger,);
