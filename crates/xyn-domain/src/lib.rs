// xyn-domain library entry point
pub mod errors;
pub mod events;
pub mod ident;
pub mod pack;
pub mod status;
pub use errors::{DomainError, RunError};
pub use ident::{quote_ident, schema_name_for_pack, validate_ident};
pub use pack::{PackManifest, PackMigration, PackRef, TableSpec};
pub use status::{InstallationStatus, RunStatus, SchemaMode, StepStatus};
