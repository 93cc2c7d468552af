//! Configuración operativa del runtime (workers, leases, collector, HTTP).
//!
//! Variables:
//! - `WORKER_ID`: id opaco estampado en `locked_by` (default host+pid).
//! - `LEASE_DURATION_SECONDS` (60), `IDLE_POLL_MS` (500).
//! - `METRICS_COLLECTOR_INTERVAL` segundos (5).
//! - `XYN_WORKER_SLOTS` (2), `XYN_ENV_ID` ("default").
//! - `XYN_HTTP_ADDR` ("0.0.0.0:8080"), `XYN_ARTIFACTS_DIR` ("./artifacts").
//! - `XYN_AUTO_CREATE_SCHEMA` (true) y `XYN_REQUIRED_MIGRATIONS`
//!   (ids separados por coma) gobiernan el preflight de arranque.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub worker_id: String,
    pub worker_slots: usize,
    pub lease_duration: Duration,
    pub idle_poll: Duration,
    pub collector_interval: Duration,
    pub env_id: String,
    pub http_addr: String,
    pub artifacts_dir: PathBuf,
    pub auto_create_schema: bool,
    pub required_migrations: Vec<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn default_worker_id() -> String {
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{host}-{}", std::process::id())
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let worker_id = env::var("WORKER_ID").unwrap_or_else(|_| default_worker_id());
        let lease_secs: u64 = env_parse("LEASE_DURATION_SECONDS", 60);
        let idle_ms: u64 = env_parse("IDLE_POLL_MS", 500);
        let collector_secs: u64 = env_parse("METRICS_COLLECTOR_INTERVAL", 5);
        let required_migrations = env::var("XYN_REQUIRED_MIGRATIONS").map(|v| {
                                                                        v.split(',')
                                                                         .map(|s| s.trim().to_string())
                                                                         .filter(|s| !s.is_empty())
                                                                         .collect()
                                                                    })
                                                                    .unwrap_or_default();
        Self { worker_id,
               worker_slots: env_parse("XYN_WORKER_SLOTS", 2),
               lease_duration: Duration::from_secs(lease_secs),
               idle_poll: Duration::from_millis(idle_ms),
               collector_interval: Duration::from_secs(collector_secs),
               env_id: env::var("XYN_ENV_ID").unwrap_or_else(|_| "default".to_string()),
               http_addr: env::var("XYN_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
               artifacts_dir: env::var("XYN_ARTIFACTS_DIR").map(PathBuf::from)
                                                           .unwrap_or_else(|_| PathBuf::from("./artifacts")),
               auto_create_schema: env::var("XYN_AUTO_CREATE_SCHEMA").map(|v| v != "false")
                                                                     .unwrap_or(true),
               required_migrations }
    }
}
