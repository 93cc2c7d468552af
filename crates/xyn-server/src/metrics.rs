//! Registro Prometheus y collector de métricas de cola/lease.
//!
//! Un único hilo cooperativo, independiente de los workers, corre a cadencia
//! fija: abre una sesión efímera del pool, ejecuta las cuatro consultas
//! indexadas y actualiza gauges de proceso. Un tick fallido se loguea y no
//! frena los siguientes; los conteos en cero se escriben (no se ausentan).

use log::warn;
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use xyn_domain::RunStatus;
use xyn_persistence::{collect_queue_stats, ConnectionProvider};

pub struct Metrics {
    registry: Registry,
    queue_depth: GaugeVec,
    queue_ready_depth: Gauge,
    queue_future_depth: Gauge,
    queue_oldest_ready_seconds: Gauge,
    running_with_expired_lease: Gauge,
    running_with_active_lease: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let queue_depth = GaugeVec::new(Opts::new("xyn_queue_depth", "Runs por status"), &["status"]).unwrap();
        let queue_ready_depth =
            Gauge::with_opts(Opts::new("xyn_queue_ready_depth", "Runs queued elegibles ahora")).unwrap();
        let queue_future_depth =
            Gauge::with_opts(Opts::new("xyn_queue_future_depth", "Runs queued agendados a futuro")).unwrap();
        let queue_oldest_ready_seconds =
            Gauge::with_opts(Opts::new("xyn_queue_oldest_ready_seconds",
                                       "Edad del run elegible más viejo (segundos)")).unwrap();
        let running_with_expired_lease =
            Gauge::with_opts(Opts::new("xyn_running_with_expired_lease", "Running con lease vencido")).unwrap();
        let running_with_active_lease =
            Gauge::with_opts(Opts::new("xyn_running_with_active_lease", "Running con lease vigente")).unwrap();

        registry.register(Box::new(queue_depth.clone())).unwrap();
        registry.register(Box::new(queue_ready_depth.clone())).unwrap();
        registry.register(Box::new(queue_future_depth.clone())).unwrap();
        registry.register(Box::new(queue_oldest_ready_seconds.clone())).unwrap();
        registry.register(Box::new(running_with_expired_lease.clone())).unwrap();
        registry.register(Box::new(running_with_active_lease.clone())).unwrap();

        Self { registry,
               queue_depth,
               queue_ready_depth,
               queue_future_depth,
               queue_oldest_ready_seconds,
               running_with_expired_lease,
               running_with_active_lease }
    }

    pub fn apply(&self, stats: &xyn_persistence::QueueStats) {
        // Reset a 0 para todos los status conocidos; los presentes se pisan.
        for status in [RunStatus::Queued, RunStatus::Running, RunStatus::Completed, RunStatus::Failed,
                       RunStatus::Cancelled]
        {
            self.queue_depth.with_label_values(&[status.as_str()]).set(0.0);
        }
        for (status, n) in &stats.depth_by_status {
            self.queue_depth.with_label_values(&[status.as_str()]).set(*n as f64);
        }
        self.queue_ready_depth.set(stats.ready_depth as f64);
        self.queue_future_depth.set(stats.future_depth as f64);
        self.queue_oldest_ready_seconds.set(stats.oldest_ready_seconds);
        self.running_with_expired_lease.set(stats.running_with_expired_lease as f64);
        self.running_with_active_lease.set(stats.running_with_active_lease as f64);
    }

    /// Exposición en formato texto Prometheus 0.0.4.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!("encode de métricas falló: {e}");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Loop del collector; corre hasta que `shutdown` se active.
pub fn run_collector<P: ConnectionProvider>(provider: P,
                                            metrics: std::sync::Arc<Metrics>,
                                            interval: Duration,
                                            shutdown: &AtomicBool) {
    log::info!("collector de métricas iniciado (cada {interval:?})");
    while !shutdown.load(Ordering::SeqCst) {
        match collect_queue_stats(&provider) {
            Ok(stats) => metrics.apply(&stats),
            Err(e) => warn!("tick de métricas fallido: {e}"),
        }
        thread::sleep(interval);
    }
    log::info!("collector de métricas detenido");
}
