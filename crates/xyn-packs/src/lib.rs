//! xyn-packs: instalación de packs sobre el core neutral
//!
//! Este crate provee:
//! - El catálogo builtin de packs (manifiestos con tablas y migraciones).
//! - El blueprint `xyn.pack.install` y sus handlers de step
//!   (validate → claim → provision → migrate → finalize), respaldados por el
//!   repositorio de instalaciones de xyn-persistence.
//!
//! Nota: el core sólo conoce handlers por nombre e inputs JSON resueltos;
//! la semántica de instalación (row-lock, ownership, invariantes) vive en
//! el repositorio y aquí sólo se orquesta.

pub mod blueprint;
pub mod catalog;
pub mod steps;

pub use blueprint::install_blueprint;
pub use catalog::seed_builtin_packs;
pub use steps::register_install_handlers;
