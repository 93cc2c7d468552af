//! Parámetros de conexión a la base, leídos del entorno.
//!
//! `DATABASE_URL` es obligatorio; su ausencia es un error de configuración
//! (no un pánico) para que el arranque y los tests gateados decidan qué
//! hacer. Los tamaños de pool salen de `DATABASE_MIN_CONNECTIONS` /
//! `DATABASE_MAX_CONNECTIONS`.

use once_cell::sync::Lazy;
use std::env;

use crate::error::PersistenceError;

// El archivo .env se procesa una sola vez por proceso; si no existe, las
// variables ya presentes en el entorno mandan.
static ENV_FILE: Lazy<()> = Lazy::new(|| {
    let _ = dotenvy::dotenv();
});

/// Asegura el procesamiento de `.env` antes de leer variables.
pub fn init_dotenv() {
    Lazy::force(&ENV_FILE);
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub pool_min: u32,
    pub pool_max: u32,
}

impl DbConfig {
    pub fn from_env() -> Result<Self, PersistenceError> {
        init_dotenv();
        let url = env::var("DATABASE_URL")
            .map_err(|_| PersistenceError::Config("DATABASE_URL ausente del entorno".into()))?;
        Ok(Self { url,
                  pool_min: env_u32("DATABASE_MIN_CONNECTIONS", 1),
                  pool_max: env_u32("DATABASE_MAX_CONNECTIONS", 10) })
    }
}
