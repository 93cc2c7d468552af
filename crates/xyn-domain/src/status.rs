//! Estados finitos de runs, steps e instalaciones.
//!
//! Las transiciones válidas de un run son:
//! - `Queued` -> `Running` (claim)
//! - `Running` -> `Running` (renew)
//! - `Running` -> `Queued` (reclaim / fail con retry)
//! - `Running` -> `Completed` | `Failed`
//! - `Queued` | `Running` -> `Cancelled`
//!
//! Los strings en minúsculas son el contrato persistido (columnas `status`
//! con CHECK constraint) y el contrato JSON de la API.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    /// Un run terminal nunca vuelve a la cola; `completed_at` es no-nulo.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

/// Estado de un step dentro de su run.
///
/// `Created` -> `Running` -> `Completed` | `Failed` | `Skipped`. Un step
/// nunca se borra para un run observado; la mutación es exclusiva del worker
/// que ejecuta el run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Created,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Created => "created",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(StepStatus::Created),
            "running" => Some(StepStatus::Running),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// Máquina de estados de una instalación de pack por entorno.
///
/// Invariante reforzado por CHECK constraint: `Installed` exige
/// `schema_name`, `installed_version`, `installed_at` e
/// `installed_by_run_id` no nulos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationStatus {
    Available,
    Installing,
    Installed,
    Upgrading,
    Failed,
    Uninstalling,
}

impl InstallationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationStatus::Available => "available",
            InstallationStatus::Installing => "installing",
            InstallationStatus::Installed => "installed",
            InstallationStatus::Upgrading => "upgrading",
            InstallationStatus::Failed => "failed",
            InstallationStatus::Uninstalling => "uninstalling",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(InstallationStatus::Available),
            "installing" => Some(InstallationStatus::Installing),
            "installed" => Some(InstallationStatus::Installed),
            "upgrading" => Some(InstallationStatus::Upgrading),
            "failed" => Some(InstallationStatus::Failed),
            "uninstalling" => Some(InstallationStatus::Uninstalling),
            _ => None,
        }
    }
}

/// Modo de aislamiento del esquema de un pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    PerPack,
    Shared,
}

impl SchemaMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaMode::PerPack => "per_pack",
            SchemaMode::Shared => "shared",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "per_pack" => Some(SchemaMode::PerPack),
            "shared" => Some(SchemaMode::Shared),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trip() {
        for s in [RunStatus::Queued, RunStatus::Running, RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RunStatus::parse("paused"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Created.is_terminal());
    }
}
