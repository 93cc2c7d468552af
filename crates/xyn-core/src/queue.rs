//! Contrato de la cola durable con lease y política de backoff.
//!
//! El backend relacional es el único sustrato de coordinación: `claim` debe
//! ser una operación atómica (una sola sentencia con `FOR UPDATE SKIP
//! LOCKED` en Pg) que voltea exactamente una fila elegible a `running` y
//! estampa `locked_by` / `lease_expires_at`. Desempate determinista:
//! `priority` ASC, luego `run_at`, `queued_at`, `created_at`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;
use xyn_domain::RunError;

use crate::errors::CoreError;
use crate::model::{NewRun, Run};

/// Política de reintentos: backoff exponencial con full jitter.
///
/// Para el intento k (1-based) el delay es uniforme en
/// `[0, min(cap, base · multiplier^(k-1))]`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base: Duration::from_secs(1),
               cap: Duration::from_secs(60),
               multiplier: 2.0 }
    }
}

impl BackoffPolicy {
    /// Cota superior (sin jitter) para el intento `attempt` (1-based).
    pub fn upper_bound(&self, attempt: i32) -> Duration {
        let exp = (attempt.max(1) - 1) as i32;
        let factor = self.multiplier.powi(exp);
        let raw = self.base.as_secs_f64() * factor;
        let capped = raw.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Delay con full jitter: uniforme en `[0, upper_bound]`.
    pub fn delay(&self, attempt: i32) -> Duration {
        use rand::Rng;
        let upper = self.upper_bound(attempt).as_secs_f64();
        if upper <= 0.0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(0.0..=upper);
        Duration::from_secs_f64(jittered)
    }
}

/// Configuración operativa de la cola.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Duración del lease otorgado en claim/renew.
    pub lease_duration: Duration,
    pub backoff: BackoffPolicy,
    /// Default de `max_attempts` cuando el submitter no lo fija (None =
    /// reintentos ilimitados).
    pub default_max_attempts: Option<i32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { lease_duration: Duration::from_secs(60),
               backoff: BackoffPolicy::default(),
               default_max_attempts: None }
    }
}

/// Resultado de `fail`: reintento agendado o fallo terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum FailDisposition {
    Retried { run_at: DateTime<Utc> },
    Terminal,
}

/// Cola durable de runs. Todas las operaciones que cambian estado emiten su
/// evento canónico dentro de la misma transacción que la transición.
pub trait RunQueue: Send + Sync {
    /// Inserta un run en `queued` y emite `xyn.run.created`.
    fn enqueue(&self, new_run: NewRun) -> Result<Run, CoreError>;

    /// Reclama atómicamente la fila elegible más prioritaria; `None` si no
    /// hay trabajo. Incrementa `attempt` y emite `xyn.run.started`
    /// (`data.reclaimed = true` cuando `attempt > 1`).
    fn claim(&self, worker_id: &str) -> Result<Option<Run>, CoreError>;

    /// Extiende el lease. `false` ⇒ lease perdido: el worker debe abortar
    /// localmente sin más escrituras.
    fn renew(&self, run_id: Uuid, worker_id: &str) -> Result<bool, CoreError>;

    /// `running` → `completed`; fija `outputs` y `completed_at`, limpia el
    /// lease y emite `xyn.run.completed`.
    fn complete(&self, run_id: Uuid, worker_id: &str, outputs: Value) -> Result<(), CoreError>;

    /// Finaliza un fallo. Con `retryable` y presupuesto de intentos
    /// disponible: vuelve a `queued` con `run_at = now + backoff(attempt)` y
    /// emite `xyn.run.retry_scheduled`; si no: `failed` terminal con
    /// `xyn.run.failed`.
    fn fail(&self, run_id: Uuid, worker_id: &str, error: RunError, retryable: bool)
            -> Result<FailDisposition, CoreError>;

    /// `running` → `cancelled` (tras observar el flag en un límite de step).
    fn complete_cancel(&self, run_id: Uuid, worker_id: &str) -> Result<(), CoreError>;

    /// Solicitud de cancelación: inmediata para `queued`, cooperativa
    /// (flag `cancel_requested`) para `running`. Idempotente; devuelve el
    /// run actualizado.
    fn cancel(&self, run_id: Uuid) -> Result<Run, CoreError>;

    /// Lectura barata del flag cooperativo.
    fn cancel_requested(&self, run_id: Uuid) -> Result<bool, CoreError>;

    /// Devuelve a `queued` toda fila `running` con lease vencido, emitiendo
    /// `xyn.run.reclaimed` por cada una. El intento previo queda consumido.
    fn reclaim_expired(&self) -> Result<Vec<Uuid>, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_upper_bounds_follow_the_exponential() {
        let p = BackoffPolicy::default();
        assert_eq!(p.upper_bound(1), Duration::from_secs(1));
        assert_eq!(p.upper_bound(2), Duration::from_secs(2));
        assert_eq!(p.upper_bound(3), Duration::from_secs(4));
        assert_eq!(p.upper_bound(7), Duration::from_secs(60)); // cap
        assert_eq!(p.upper_bound(30), Duration::from_secs(60));
    }

    #[test]
    fn delay_stays_within_the_bound() {
        let p = BackoffPolicy::default();
        for attempt in 1..=10 {
            let upper = p.upper_bound(attempt);
            for _ in 0..50 {
                let d = p.delay(attempt);
                assert!(d <= upper, "attempt={attempt} d={d:?} upper={upper:?}");
            }
        }
    }
}
