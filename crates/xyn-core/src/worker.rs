//! Worker: loop de polling/claim, renovación de lease y reclaim periódico.
//!
//! Cada worker es un hilo de larga vida que ejecuta un run a la vez. Un run
//! reclamado dispara un hilo de renovación que extiende el lease cada
//! `lease_duration / 3`; si la renovación no afecta filas, el lease se
//! perdió y el ejecutor aborta en el próximo límite de step. El reclaim
//! corre en su propio loop y devuelve a la cola los `running` vencidos.

use log::{debug, error, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::executor::{RunExecutor, RunOutcome};
use crate::queue::RunQueue;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Id opaco estampado en `locked_by`.
    pub worker_id: String,
    /// Sueño cuando el poll no devuelve claim (más jitter aleatorio ≤ 50%).
    pub idle_poll: Duration,
    /// Intervalo de renovación (tipicamente lease_duration / 3).
    pub renew_interval: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: String, idle_poll: Duration, lease_duration: Duration) -> Self {
        Self { worker_id,
               idle_poll,
               renew_interval: lease_duration / 3 }
    }
}

pub struct Worker {
    queue: Arc<dyn RunQueue>,
    executor: Arc<RunExecutor>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(queue: Arc<dyn RunQueue>, executor: Arc<RunExecutor>, config: WorkerConfig) -> Self {
        Self { queue,
               executor,
               config }
    }

    /// Loop principal; retorna cuando `shutdown` se activa.
    pub fn run_loop(&self, shutdown: &AtomicBool) {
        info!("worker {} iniciado", self.config.worker_id);
        while !shutdown.load(Ordering::SeqCst) {
            match self.queue.claim(&self.config.worker_id) {
                Ok(Some(run)) => {
                    debug!("worker {} reclamó run {} (attempt {})", self.config.worker_id, run.id, run.attempt);
                    self.drive(run);
                }
                Ok(None) => self.idle_sleep(shutdown),
                Err(e) => {
                    warn!("claim fallido en worker {}: {e}", self.config.worker_id);
                    self.idle_sleep(shutdown);
                }
            }
        }
        info!("worker {} detenido", self.config.worker_id);
    }

    fn drive(&self, run: crate::model::Run) {
        let lease_lost = Arc::new(AtomicBool::new(false));
        let stop_renewal = Arc::new(AtomicBool::new(false));

        let renewal = {
            let queue = Arc::clone(&self.queue);
            let lease_lost = Arc::clone(&lease_lost);
            let stop = Arc::clone(&stop_renewal);
            let worker_id = self.config.worker_id.clone();
            let interval = self.config.renew_interval;
            let run_id = run.id;
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    match queue.renew(run_id, &worker_id) {
                        Ok(true) => debug!("lease renovado para run {run_id}"),
                        Ok(false) => {
                            warn!("lease perdido para run {run_id} (worker {worker_id})");
                            lease_lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => {
                            // Error transitorio: no implica pérdida; el
                            // próximo tick reintenta antes del vencimiento.
                            warn!("renovación con error para run {run_id}: {e}");
                        }
                    }
                }
            })
        };

        let outcome = self.executor.execute(&run, &self.config.worker_id, &lease_lost);
        stop_renewal.store(true, Ordering::SeqCst);
        if let Err(e) = renewal.join() {
            error!("hilo de renovación terminó con pánico: {e:?}");
        }

        match outcome {
            RunOutcome::Completed => info!("run {} completado", run.id),
            RunOutcome::Failed(d) => info!("run {} falló ({d:?})", run.id),
            RunOutcome::Cancelled => info!("run {} cancelado", run.id),
            RunOutcome::LeaseLost => warn!("run {} abortado por lease perdido", run.id),
        }
    }

    fn idle_sleep(&self, shutdown: &AtomicBool) {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        // Jitter aleatorio ≤ 50% para desincronizar pollers.
        let base = self.config.idle_poll;
        let jitter = rand::thread_rng().gen_range(0.0..=0.5);
        thread::sleep(base + base.mul_f64(jitter));
    }
}

/// Loop de reclaim: cualquier proceso puede ejecutarlo; corre cada
/// `interval` y registra los ids devueltos a la cola.
pub fn run_reclaimer(queue: Arc<dyn RunQueue>, interval: Duration, shutdown: &AtomicBool) {
    info!("reclaimer iniciado (cada {interval:?})");
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(interval);
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match queue.reclaim_expired() {
            Ok(ids) if ids.is_empty() => {}
            Ok(ids) => info!("reclaim devolvió {} runs a la cola: {ids:?}", ids.len()),
            Err(e) => warn!("ciclo de reclaim fallido: {e}"),
        }
    }
    info!("reclaimer detenido");
}
