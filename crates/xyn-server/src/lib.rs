//! xyn-server: superficie HTTP, collector de métricas y bootstrap de
//! workers sobre el runtime durable.
//!
//! `build_router` es el único punto de entrada del router; el binario le
//! adjunta las capas (trace) después, de modo que los tests de `tests/`
//! componen el router pelado con `tower::ServiceExt::oneshot`.

pub mod api_types;
pub mod config;
pub mod metrics;
pub mod pagination;
pub mod routes;
pub mod runtime;
pub mod state;

pub use config::RuntimeConfig;
pub use metrics::Metrics;
pub use routes::build_router;
pub use state::AppState;
