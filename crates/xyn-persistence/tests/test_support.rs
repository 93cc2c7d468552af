use once_cell::sync::Lazy;
use xyn_persistence::config::DbConfig;
use xyn_persistence::pg::{build_pool, PgPool};

pub static TEST_POOL: Lazy<Option<PgPool>> = Lazy::new(|| {
    let cfg = match DbConfig::from_env() {
        Ok(c) => c,
        // Sin DATABASE_URL la suite entera se salta.
        Err(_) => return None,
    };
    match build_pool(&cfg.url, 1, 4) {
        Ok(p) => Some(p),
        Err(e) => {
            eprintln!("No se pudo construir pool de test: {e}");
            None
        }
    }
});

pub fn with_pool<F, R>(f: F) -> Option<R>
    where F: FnOnce(&PgPool) -> R
{
    TEST_POOL.as_ref().map(|p| f(p))
}

/// Los tests que drenan la cola compartida se serializan entre sí: un
/// claim de otro test dejaría filas `running` abandonadas a mitad de
/// aserción.
pub static QUEUE_LOCK: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

#[macro_export]
macro_rules! serialize_queue_tests {
    () => {
        test_support::QUEUE_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    };
}

/// Gate estándar: los tests de integración se saltan sin DATABASE_URL.
#[macro_export]
macro_rules! require_pool {
    () => {
        match test_support::with_pool(|p| p.clone()) {
            Some(pool) => pool,
            None => {
                eprintln!("skip (no DATABASE_URL)");
                return;
            }
        }
    };
}
