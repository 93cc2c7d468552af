//! Catálogo canónico de nombres de evento.
//!
//! Los nombres son dotted lowercase (`xyn.run.started`). El log de eventos es
//! append-only: estas constantes son el contrato observable y estable del
//! runtime; los puntos de emisión están documentados en cada componente.

pub const RUN_CREATED: &str = "xyn.run.created";
pub const RUN_STARTED: &str = "xyn.run.started";
pub const RUN_COMPLETED: &str = "xyn.run.completed";
pub const RUN_FAILED: &str = "xyn.run.failed";
pub const RUN_CANCELLED: &str = "xyn.run.cancelled";
pub const RUN_RECLAIMED: &str = "xyn.run.reclaimed";
pub const RUN_RETRY_SCHEDULED: &str = "xyn.run.retry_scheduled";

pub const STEP_STARTED: &str = "xyn.step.started";
pub const STEP_COMPLETED: &str = "xyn.step.completed";
pub const STEP_FAILED: &str = "xyn.step.failed";
pub const STEP_SKIPPED: &str = "xyn.step.skipped";
pub const STEP_PROGRESS: &str = "xyn.step.progress";

pub const ARTIFACT_ATTACHED: &str = "xyn.artifact.attached";

pub const PACK_INSTALL_REQUESTED: &str = "xyn.pack.install.requested";
pub const PACK_INSTALL_COMPLETED: &str = "xyn.pack.install.completed";
pub const PACK_INSTALL_FAILED: &str = "xyn.pack.install.failed";

/// Valida la forma dotted lowercase: al menos dos segmentos `[a-z0-9_]+`
/// separados por `.`.
pub fn is_valid_event_name(name: &str) -> bool {
    let segments: Vec<&str> = name.split('.').collect();
    segments.len() >= 2
    && segments.iter()
               .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_are_valid() {
        for n in [RUN_CREATED, RUN_STARTED, RUN_COMPLETED, RUN_FAILED, RUN_CANCELLED, RUN_RECLAIMED,
                  RUN_RETRY_SCHEDULED, STEP_STARTED, STEP_COMPLETED, STEP_FAILED, STEP_SKIPPED, STEP_PROGRESS,
                  ARTIFACT_ATTACHED, PACK_INSTALL_REQUESTED, PACK_INSTALL_COMPLETED, PACK_INSTALL_FAILED]
        {
            assert!(is_valid_event_name(n), "nombre inválido: {n}");
        }
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(!is_valid_event_name("Run.Started"));
        assert!(!is_valid_event_name("xyn"));
        assert!(!is_valid_event_name("xyn..started"));
        assert!(!is_valid_event_name("xyn.run started"));
    }
}
