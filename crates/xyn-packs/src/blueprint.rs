//! Blueprint `xyn.pack.install`: plan lineal de cinco steps.
//!
//! Los params encadenan outputs vía templates; la identidad del run (y su
//! ownership sobre la fila de instalación) viaja implícita en el contexto
//! del ejecutor.

use serde_json::json;
use xyn_core::{BlueprintDefinition, StepKind, StepSpec};
use xyn_persistence::INSTALL_BLUEPRINT;

pub fn install_blueprint() -> BlueprintDefinition {
    BlueprintDefinition::new(
        INSTALL_BLUEPRINT,
        vec![StepSpec { id: "validate".into(),
                        name: "validate manifest".into(),
                        kind: StepKind::ActionTask,
                        handler: "pack.validate_manifest".into(),
                        params: json!({
                            "pack_ref": "{{inputs.pack_ref}}",
                            "env_id": "{{inputs.env_id}}"
                        }) },
             StepSpec { id: "claim".into(),
                        name: "claim installation".into(),
                        kind: StepKind::ActionTask,
                        handler: "pack.claim_installation".into(),
                        params: json!({
                            "pack_ref": "{{steps.validate.outputs.pack_ref}}",
                            "env_id": "{{steps.validate.outputs.env_id}}",
                            "schema_name": "{{steps.validate.outputs.schema_name}}"
                        }) },
             StepSpec { id: "provision".into(),
                        name: "provision schema".into(),
                        kind: StepKind::ActionTask,
                        handler: "pack.provision_schema".into(),
                        params: json!({
                            "pack_ref": "{{steps.validate.outputs.pack_ref}}",
                            "schema_name": "{{steps.validate.outputs.schema_name}}",
                            "installation_id": "{{steps.claim.outputs.installation_id}}"
                        }) },
             StepSpec { id: "migrate".into(),
                        name: "apply migrations".into(),
                        kind: StepKind::ActionTask,
                        handler: "pack.apply_migrations".into(),
                        params: json!({
                            "pack_ref": "{{steps.validate.outputs.pack_ref}}",
                            "schema_name": "{{steps.validate.outputs.schema_name}}",
                            "installation_id": "{{steps.claim.outputs.installation_id}}"
                        }) },
             StepSpec { id: "finalize".into(),
                        name: "finalize installation".into(),
                        kind: StepKind::ActionTask,
                        handler: "pack.finalize".into(),
                        params: json!({
                            "installation_id": "{{steps.claim.outputs.installation_id}}",
                            "installed_version": "{{steps.validate.outputs.version}}"
                        }) }],
    ).with_max_attempts(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_is_linear_and_complete() {
        let bp = install_blueprint();
        assert_eq!(bp.name, "xyn.pack.install");
        let ids: Vec<&str> = bp.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["validate", "claim", "provision", "migrate", "finalize"]);
        assert_eq!(bp.max_attempts, Some(1));
    }
}
