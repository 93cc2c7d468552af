//! Bootstrap de los hilos del runtime: workers, reclaimer y collector.
//!
//! Los workers son hilos de larga vida con sesiones Diesel independientes
//! (slots); no comparten estado en memoria más allá del registro de
//! métricas. El apagado es cooperativo vía `AtomicBool`.

use log::info;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use xyn_core::{ExecutorConfig, RunExecutor, Worker, WorkerConfig};
use xyn_persistence::PoolProvider;

use crate::metrics::run_collector;
use crate::state::AppState;

pub struct RuntimeHandles {
    pub shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl RuntimeHandles {
    pub fn stop(self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        for h in self.handles {
            let _ = h.join();
        }
    }
}

/// Lanza N slots de worker, el loop de reclaim y el collector de métricas.
pub fn spawn_runtime(state: &Arc<AppState>) -> RuntimeHandles {
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    for slot in 0..state.config.worker_slots {
        let executor = Arc::new(RunExecutor::new(state.queue.clone(),
                                                 state.store.clone(),
                                                 state.events.clone(),
                                                 state.blueprints.clone(),
                                                 state.handlers.clone(),
                                                 ExecutorConfig::default()));
        let worker = Worker::new(state.queue.clone(),
                                 executor,
                                 WorkerConfig::new(format!("{}-{slot}", state.config.worker_id),
                                                   state.config.idle_poll,
                                                   state.config.lease_duration));
        let shutdown = Arc::clone(&shutdown);
        handles.push(std::thread::Builder::new().name(format!("xyn-worker-{slot}"))
                                                .spawn(move || worker.run_loop(&shutdown))
                                                .expect("spawn de worker"));
    }

    {
        let queue = state.queue.clone();
        let shutdown = Arc::clone(&shutdown);
        let interval = state.config.lease_duration / 2;
        handles.push(std::thread::Builder::new().name("xyn-reclaimer".into())
                                                .spawn(move || xyn_core::worker::run_reclaimer(queue, interval, &shutdown))
                                                .expect("spawn de reclaimer"));
    }

    {
        let provider = PoolProvider { pool: state.pool.clone() };
        let metrics = state.metrics.clone();
        let interval = state.config.collector_interval;
        let shutdown = Arc::clone(&shutdown);
        handles.push(std::thread::Builder::new().name("xyn-metrics".into())
                                                .spawn(move || run_collector(provider, metrics, interval, &shutdown))
                                                .expect("spawn de collector"));
    }

    info!("runtime iniciado: {} slots de worker + reclaimer + collector", state.config.worker_slots);
    RuntimeHandles { shutdown, handles }
}
