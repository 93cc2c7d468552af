//! xyn-persistence
//!
//! Implementaciones Postgres (Diesel) de los contratos del core: cola
//! durable con lease, store de runs/steps, log de eventos append-only,
//! artifacts direccionados por contenido y la máquina de estados de
//! instalación de packs. Incluye utilidades de conexión y el runner de
//! migraciones embebidas.
//!
//! Módulos:
//! - `pg`: implementaciones sobre Postgres y el pool r2d2.
//! - `migrations`: runner embebido + ledger de preflight.
//! - `config`: carga de configuración desde .env.
//! - `schema`: tablas Diesel declaradas para compilar queries.

pub mod config;
pub mod error;
pub mod migrations;
pub mod pg;
pub mod schema;

pub use config::init_dotenv;
pub use error::PersistenceError;
pub use pg::artifacts::PgArtifactStore;
pub use pg::events_log::{EventFilter, PgEventLog};
pub use pg::installs::{InstallConflict, InstallError, InstallationRow, PackRow, PgInstallRepo, INSTALL_BLUEPRINT};
pub use pg::queue::PgRunQueue;
pub use pg::stats::{collect_queue_stats, QueueStats};
pub use pg::store::PgRunStore;
pub use pg::{build_dev_pool_from_env, build_pool, build_pool_without_migrations, ConnectionProvider, PgPool,
             PoolProvider};
