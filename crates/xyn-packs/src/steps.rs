//! Handlers de step de la instalación de packs.
//!
//! Objetos pequeños que poseen su repositorio; cada uno parsea sus inputs
//! JSON ya resueltos, delega en el repositorio y, ante fallo con la fila de
//! instalación ya reclamada, la deja en `failed` (con `last_error_at`) antes
//! de devolver el error al ejecutor.

use log::warn;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use xyn_core::{HandlerRegistry, StepContext, StepHandler};
use xyn_domain::errors::kinds;
use xyn_domain::{schema_name_for_pack, PackRef, RunError};
use xyn_persistence::{ConnectionProvider, InstallError, PgInstallRepo};

fn req_str(inputs: &Value, key: &str) -> Result<String, RunError> {
    inputs.get(key)
          .and_then(Value::as_str)
          .map(str::to_string)
          .ok_or_else(|| RunError::new(kinds::STEP_HANDLER_ERROR, format!("input requerido ausente: {key}")))
}

fn req_uuid(inputs: &Value, key: &str) -> Result<Uuid, RunError> {
    let raw = req_str(inputs, key)?;
    Uuid::parse_str(&raw).map_err(|_| RunError::new(kinds::STEP_HANDLER_ERROR, format!("uuid inválido en {key}: {raw}")))
}

fn to_run_error(e: InstallError) -> RunError {
    RunError::with_details(e.kind(), e.to_string(), json!({"source": "pack_install"}))
}

/// Deja la instalación en `failed` antes de propagar; el fallo de ese
/// registro no debe enmascarar el error original.
fn fail_install<P: ConnectionProvider>(repo: &PgInstallRepo<P>,
                                       ctx: &StepContext<'_>,
                                       installation_id: Uuid,
                                       error: &RunError)
                                       -> RunError {
    if let Err(e) = repo.mark_failed(installation_id, ctx.run, &error.to_json()) {
        warn!("mark_failed de instalación {installation_id} falló: {e}");
    }
    error.clone()
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

pub struct ValidateManifestStep<P: ConnectionProvider> {
    pub repo: Arc<PgInstallRepo<P>>,
}

impl<P: ConnectionProvider> StepHandler for ValidateManifestStep<P> {
    fn name(&self) -> &str {
        "pack.validate_manifest"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<Value, RunError> {
        let pack_ref = req_str(&ctx.inputs, "pack_ref")?;
        let env_id = req_str(&ctx.inputs, "env_id")?;
        let parsed = PackRef::parse(&pack_ref).map_err(|e| RunError::new(kinds::INVALID_IDENTIFIER, e.to_string()))?;
        let schema_name =
            schema_name_for_pack(&pack_ref).map_err(|e| RunError::new(kinds::INVALID_IDENTIFIER, e.to_string()))?;
        let pack = self.repo
                       .get_pack(&pack_ref)
                       .map_err(|e| RunError::new(kinds::TRANSIENT_DB_ERROR, e.to_string()))?
                       .ok_or_else(|| RunError::new(kinds::NOT_FOUND, format!("pack desconocido: {pack_ref}")))?;
        // El manifiesto debe deserializar y sus tablas validar como idents.
        let manifest = pack.manifest()
                           .map_err(|e| RunError::new(kinds::CONSTRAINT_VIOLATION, e.to_string()))?;
        for table in &manifest.tables {
            xyn_domain::validate_ident(&table.name)
                .map_err(|e| RunError::new(kinds::INVALID_IDENTIFIER, e.to_string()))?;
        }
        ctx.progress("manifest validado", json!({"pack_ref": pack_ref, "tables": manifest.tables.len()}));
        Ok(json!({
            "pack_ref": pack_ref,
            "env_id": env_id,
            "schema_name": schema_name,
            "version": pack.version,
            "name": parsed.name,
        }))
    }
}

// ---------------------------------------------------------------------------
// claim
// ---------------------------------------------------------------------------

pub struct ClaimInstallationStep<P: ConnectionProvider> {
    pub repo: Arc<PgInstallRepo<P>>,
}

impl<P: ConnectionProvider> StepHandler for ClaimInstallationStep<P> {
    fn name(&self) -> &str {
        "pack.claim_installation"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<Value, RunError> {
        let pack_ref = req_str(&ctx.inputs, "pack_ref")?;
        let env_id = req_str(&ctx.inputs, "env_id")?;
        let schema_name = req_str(&ctx.inputs, "schema_name")?;
        let pack = self.repo
                       .get_pack(&pack_ref)
                       .map_err(|e| RunError::new(kinds::TRANSIENT_DB_ERROR, e.to_string()))?
                       .ok_or_else(|| RunError::new(kinds::NOT_FOUND, format!("pack desconocido: {pack_ref}")))?;
        let installation = self.repo
                               .claim_for_run(&pack, &env_id, ctx.run.id, &schema_name)
                               .map_err(to_run_error)?;
        Ok(json!({"installation_id": installation.id}))
    }
}

// ---------------------------------------------------------------------------
// provision
// ---------------------------------------------------------------------------

pub struct ProvisionSchemaStep<P: ConnectionProvider> {
    pub repo: Arc<PgInstallRepo<P>>,
}

impl<P: ConnectionProvider> StepHandler for ProvisionSchemaStep<P> {
    fn name(&self) -> &str {
        "pack.provision_schema"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<Value, RunError> {
        let pack_ref = req_str(&ctx.inputs, "pack_ref")?;
        let schema_name = req_str(&ctx.inputs, "schema_name")?;
        let installation_id = req_uuid(&ctx.inputs, "installation_id")?;
        let manifest = self.load_manifest(&pack_ref)?;
        if let Err(e) = self.repo.provision_schema(&schema_name, &manifest) {
            return Err(fail_install(&self.repo, ctx, installation_id, &to_run_error(e)));
        }
        ctx.progress("esquema aprovisionado", json!({"schema_name": schema_name}));
        Ok(json!({"schema_name": schema_name}))
    }
}

impl<P: ConnectionProvider> ProvisionSchemaStep<P> {
    fn load_manifest(&self, pack_ref: &str) -> Result<xyn_domain::PackManifest, RunError> {
        self.repo
            .get_pack(pack_ref)
            .map_err(|e| RunError::new(kinds::TRANSIENT_DB_ERROR, e.to_string()))?
            .ok_or_else(|| RunError::new(kinds::NOT_FOUND, format!("pack desconocido: {pack_ref}")))?
            .manifest()
            .map_err(|e| RunError::new(kinds::CONSTRAINT_VIOLATION, e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// migrate
// ---------------------------------------------------------------------------

pub struct ApplyMigrationsStep<P: ConnectionProvider> {
    pub repo: Arc<PgInstallRepo<P>>,
}

impl<P: ConnectionProvider> StepHandler for ApplyMigrationsStep<P> {
    fn name(&self) -> &str {
        "pack.apply_migrations"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<Value, RunError> {
        let pack_ref = req_str(&ctx.inputs, "pack_ref")?;
        let schema_name = req_str(&ctx.inputs, "schema_name")?;
        let installation_id = req_uuid(&ctx.inputs, "installation_id")?;
        let pack = self.repo
                       .get_pack(&pack_ref)
                       .map_err(|e| RunError::new(kinds::TRANSIENT_DB_ERROR, e.to_string()))?
                       .ok_or_else(|| RunError::new(kinds::NOT_FOUND, format!("pack desconocido: {pack_ref}")))?;
        let manifest = pack.manifest()
                           .map_err(|e| RunError::new(kinds::CONSTRAINT_VIOLATION, e.to_string()))?;
        match self.repo.apply_migrations(installation_id, &schema_name, &pack_ref, &manifest) {
            Ok(applied) => {
                ctx.progress("migraciones aplicadas", json!({"applied": applied}));
                Ok(json!({"applied": applied}))
            }
            Err(e) => Err(fail_install(&self.repo, ctx, installation_id, &to_run_error(e))),
        }
    }
}

// ---------------------------------------------------------------------------
// finalize
// ---------------------------------------------------------------------------

pub struct FinalizeInstallationStep<P: ConnectionProvider> {
    pub repo: Arc<PgInstallRepo<P>>,
}

impl<P: ConnectionProvider> StepHandler for FinalizeInstallationStep<P> {
    fn name(&self) -> &str {
        "pack.finalize"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<Value, RunError> {
        let installation_id = req_uuid(&ctx.inputs, "installation_id")?;
        let installed_version = req_str(&ctx.inputs, "installed_version")?;
        match self.repo.finalize(installation_id, ctx.run, &installed_version) {
            Ok(()) => Ok(json!({"installation_id": installation_id, "installed_version": installed_version})),
            Err(e) => Err(fail_install(&self.repo, ctx, installation_id, &to_run_error(e))),
        }
    }
}

/// Registra los cinco handlers sobre un repositorio compartido.
pub fn register_install_handlers<P: ConnectionProvider>(registry: &HandlerRegistry, repo: Arc<PgInstallRepo<P>>) {
    registry.register(Arc::new(ValidateManifestStep { repo: Arc::clone(&repo) }));
    registry.register(Arc::new(ClaimInstallationStep { repo: Arc::clone(&repo) }));
    registry.register(Arc::new(ProvisionSchemaStep { repo: Arc::clone(&repo) }));
    registry.register(Arc::new(ApplyMigrationsStep { repo: Arc::clone(&repo) }));
    registry.register(Arc::new(FinalizeInstallationStep { repo }));
}
