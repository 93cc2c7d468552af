//! xynd: binario del runtime durable.
//!
//! Arranque:
//! 1. `.env` + logger.
//! 2. Pool Postgres (corre migraciones embebidas) y preflight del ledger
//!    cuando `XYN_AUTO_CREATE_SCHEMA=false`.
//! 3. Seed del catálogo builtin de packs.
//! 4. Hilos del runtime (workers + reclaimer + collector) y servidor HTTP.

use log::{error, info};
use tower_http::trace::TraceLayer;
use xyn_persistence::config::DbConfig;
use xyn_persistence::migrations::missing_required_migrations;
use xyn_persistence::{build_pool, build_pool_without_migrations, PgInstallRepo, PoolProvider};
use xyn_server::runtime::spawn_runtime;
use xyn_server::{build_router, AppState, RuntimeConfig};

#[tokio::main]
async fn main() {
    xyn_persistence::init_dotenv();
    env_logger::init();

    let db = match DbConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("configuración de base inválida: {e}");
            std::process::exit(1);
        }
    };
    let config = RuntimeConfig::from_env();

    // Con auto-create el pool corre las migraciones embebidas; sin él, el
    // esquema debe existir de antemano y el preflight del ledger decide.
    let pool_result = if config.auto_create_schema {
        build_pool(&db.url, db.pool_min, db.pool_max)
    } else {
        build_pool_without_migrations(&db.url, db.pool_min, db.pool_max)
    };
    let pool = match pool_result {
        Ok(p) => p,
        Err(e) => {
            error!("no se pudo inicializar el pool: {e}");
            std::process::exit(1);
        }
    };

    if !config.auto_create_schema {
        let mut conn = pool.get().expect("conexión para preflight");
        match missing_required_migrations(&mut conn, &config.required_migrations) {
            Ok(missing) if missing.is_empty() => info!("preflight ok: ledger completo"),
            Ok(missing) => {
                error!("preflight falló; migraciones ausentes del ledger: {missing:?}");
                std::process::exit(1);
            }
            Err(e) => {
                error!("preflight ilegible: {e}");
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = xyn_packs::seed_builtin_packs(&PgInstallRepo::new(PoolProvider { pool: pool.clone() })) {
        error!("seed del catálogo falló: {e}");
        std::process::exit(1);
    }

    let http_addr = config.http_addr.clone();
    let state = AppState::new(pool, config);
    let runtime = spawn_runtime(&state);

    let app = build_router(state).layer(TraceLayer::new_for_http());
    let listener = match tokio::net::TcpListener::bind(&http_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("no se pudo bindear {http_addr}: {e}");
            runtime.stop();
            std::process::exit(1);
        }
    };
    info!("xynd escuchando en {http_addr}");

    let serve = axum::serve(listener, app);
    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!("servidor HTTP terminó con error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("señal de apagado recibida");
        }
    }

    runtime.stop();
    info!("xynd detenido");
}
