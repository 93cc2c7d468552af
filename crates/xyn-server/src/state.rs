//! Estado compartido del proceso: repositorios Pg, registries y métricas.

use std::sync::Arc;
use std::time::Instant;
use xyn_core::{BlueprintRegistry, HandlerRegistry};
use xyn_persistence::{PgArtifactStore, PgEventLog, PgInstallRepo, PgPool, PgRunQueue, PgRunStore, PoolProvider};

use crate::config::RuntimeConfig;
use crate::metrics::Metrics;

pub struct AppState {
    pub pool: PgPool,
    pub queue: Arc<PgRunQueue<PoolProvider>>,
    pub store: Arc<PgRunStore<PoolProvider>>,
    pub events: Arc<PgEventLog<PoolProvider>>,
    pub artifacts: Arc<PgArtifactStore<PoolProvider>>,
    pub installs: Arc<PgInstallRepo<PoolProvider>>,
    pub blueprints: Arc<BlueprintRegistry>,
    pub handlers: Arc<HandlerRegistry>,
    pub metrics: Arc<Metrics>,
    pub config: RuntimeConfig,
    pub started: Instant,
}

impl AppState {
    pub fn new(pool: PgPool, config: RuntimeConfig) -> Arc<Self> {
        let provider = || PoolProvider { pool: pool.clone() };
        let queue = Arc::new(PgRunQueue::new(provider(), xyn_core::QueueConfig { lease_duration: config.lease_duration,
                                                                                 ..Default::default() }));
        let store = Arc::new(PgRunStore::new(provider()));
        let events = Arc::new(PgEventLog::new(provider()));
        let artifacts = Arc::new(PgArtifactStore::new(provider(), config.artifacts_dir.clone()));
        let installs = Arc::new(PgInstallRepo::new(provider()));

        let blueprints = Arc::new(BlueprintRegistry::new());
        blueprints.register(xyn_core::blueprint::default_blueprint());
        blueprints.register(xyn_packs::install_blueprint());

        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register(Arc::new(xyn_core::handler::NoopHandler));
        handlers.register(Arc::new(xyn_core::handler::EchoHandler));
        xyn_packs::register_install_handlers(&handlers, Arc::clone(&installs));

        Arc::new(Self { pool,
                        queue,
                        store,
                        events,
                        artifacts,
                        installs,
                        blueprints,
                        handlers,
                        metrics: Arc::new(Metrics::new()),
                        config,
                        started: Instant::now() })
    }
}

pub fn uptime_secs(state: &AppState) -> u64 {
    state.started.elapsed().as_secs()
}
