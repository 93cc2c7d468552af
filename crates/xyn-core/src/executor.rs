//! Ejecutor de runs: ciclo de vida por step sobre un run ya reclamado.
//!
//! Contrato por step:
//! 1. insertar la fila en `created` con inputs resueltos;
//! 2. `created` → `running` + `xyn.step.started`;
//! 3. invocar el handler (los pánicos se capturan en este borde y se
//!    convierten en `handler_crash`);
//! 4. éxito: `outputs` + `completed` + `xyn.step.completed`;
//! 5. fallo: `error` + `failed` + `xyn.step.failed` y el run delega en la
//!    política de retry de la cola.
//!
//! La cancelación es cooperativa y se observa en el límite entre steps; la
//! pérdida de lease aborta la ejecución local sin más escrituras.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use xyn_domain::errors::kinds;
use xyn_domain::RunError;

use crate::blueprint::{BlueprintRegistry, StepKind, StepSpec, DEFAULT_BLUEPRINT};
use crate::errors::CoreError;
use crate::handler::{HandlerRegistry, StepContext};
use crate::model::{NewStep, Run};
use crate::queue::{FailDisposition, RunQueue};
use crate::store::{EventLog, RunStore};
use crate::template::{resolve, TemplateContext};

/// Presupuestos de seguridad por run.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Máximo de steps por run; excedido ⇒ `step_budget_exceeded`.
    pub max_steps: usize,
    /// Límite de reloj de pared desde `started_at`; excedido ⇒
    /// `run_deadline_exceeded`.
    pub run_deadline: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_steps: 200,
               run_deadline: Duration::from_secs(60 * 60) }
    }
}

/// Resultado observable de ejecutar un run reclamado.
#[derive(Debug, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(FailDisposition),
    Cancelled,
    /// Lease perdido: se abortó localmente sin escrituras de estado.
    LeaseLost,
}

pub struct RunExecutor {
    queue: Arc<dyn RunQueue>,
    store: Arc<dyn RunStore>,
    events: Arc<dyn EventLog>,
    blueprints: Arc<BlueprintRegistry>,
    handlers: Arc<HandlerRegistry>,
    config: ExecutorConfig,
}

impl RunExecutor {
    pub fn new(queue: Arc<dyn RunQueue>,
               store: Arc<dyn RunStore>,
               events: Arc<dyn EventLog>,
               blueprints: Arc<BlueprintRegistry>,
               handlers: Arc<HandlerRegistry>,
               config: ExecutorConfig)
               -> Self {
        Self { queue,
               store,
               events,
               blueprints,
               handlers,
               config }
    }

    /// Ejecuta el run hasta su finalización. `lease_lost` lo alimenta el
    /// loop de renovación del worker; al observarlo no se escribe más
    /// estado (otro worker lo reclamará).
    pub fn execute(&self, run: &Run, worker_id: &str, lease_lost: &AtomicBool) -> RunOutcome {
        let blueprint_name = run.blueprint_ref.as_deref().unwrap_or(DEFAULT_BLUEPRINT);
        let blueprint = match self.blueprints.get(blueprint_name) {
            Ok(b) => b,
            Err(e) => {
                let error = RunError::new(kinds::BLUEPRINT_NOT_FOUND, e.to_string());
                return self.fail_run(run, worker_id, error, false);
            }
        };

        // Intentos previos (reclaim/retry) ya dejaron steps; el idx continúa.
        let mut next_idx = match self.store.list_steps(run.id) {
            Ok(steps) => steps.len() as i32,
            Err(e) => {
                warn!("no se pudieron listar steps de {}: {e}", run.id);
                return self.fail_run(run, worker_id, RunError::new(e.kind(), e.to_string()), true);
            }
        };

        let deadline = self.deadline_for(run);
        let mut steps_outputs: HashMap<String, Value> = HashMap::new();
        let mut last_outputs = Value::Object(serde_json::Map::new());

        for spec in &blueprint.steps {
            if lease_lost.load(Ordering::SeqCst) {
                warn!("lease perdido; abortando run {} localmente", run.id);
                return RunOutcome::LeaseLost;
            }
            match self.queue.cancel_requested(run.id) {
                Ok(true) => {
                    info!("cancelación observada en límite de step; run {}", run.id);
                    if let Err(e) = self.queue.complete_cancel(run.id, worker_id) {
                        warn!("no se pudo finalizar cancelación de {}: {e}", run.id);
                        return RunOutcome::LeaseLost;
                    }
                    return RunOutcome::Cancelled;
                }
                Ok(false) => {}
                Err(e) => warn!("lectura de flag de cancelación fallida para {}: {e}", run.id),
            }
            if next_idx as usize >= self.config.max_steps {
                let error = RunError::new(kinds::STEP_BUDGET_EXCEEDED,
                                          format!("presupuesto de steps agotado ({})", self.config.max_steps));
                return self.fail_run(run, worker_id, error, false);
            }
            if Utc::now() > deadline {
                let error = RunError::new(kinds::RUN_DEADLINE_EXCEEDED,
                                          format!("límite de reloj de pared excedido ({:?})", self.config.run_deadline));
                return self.fail_run(run, worker_id, error, false);
            }

            match self.run_step(run, spec, next_idx, &steps_outputs) {
                Ok(StepResult::Completed(outputs)) => {
                    steps_outputs.insert(spec.id.clone(), outputs.clone());
                    last_outputs = outputs;
                }
                Ok(StepResult::Skipped) => {}
                Ok(StepResult::Failed(step_error)) => {
                    let error = RunError::wrap_step(step_error);
                    return self.fail_run(run, worker_id, error, true);
                }
                Err(e) => {
                    // Error de persistencia al registrar el step; el retry
                    // del run decide si vale otro intento.
                    warn!("escritura de step fallida en run {}: {e}", run.id);
                    let error = RunError::new(e.kind(), e.to_string());
                    return self.fail_run(run, worker_id, error, true);
                }
            }
            next_idx += 1;
        }

        match self.queue.complete(run.id, worker_id, last_outputs) {
            Ok(()) => RunOutcome::Completed,
            Err(e) => {
                // Carrera benigna: el lease expiró justo al final; otro
                // worker re-ejecutará (at-least-once).
                warn!("finalización de run {} rechazada: {e}", run.id);
                RunOutcome::LeaseLost
            }
        }
    }

    fn deadline_for(&self, run: &Run) -> DateTime<Utc> {
        let base = run.started_at.unwrap_or_else(Utc::now);
        base + ChronoDuration::from_std(self.config.run_deadline).unwrap_or_else(|_| ChronoDuration::hours(1))
    }

    fn run_step(&self,
                run: &Run,
                spec: &StepSpec,
                idx: i32,
                steps_outputs: &HashMap<String, Value>)
                -> Result<StepResult, CoreError> {
        let ctx = TemplateContext { inputs: &run.inputs,
                                    steps: steps_outputs };
        let resolved = match resolve(&spec.params, &ctx) {
            Ok(v) => v,
            Err(e) => {
                // La fila del step existe igualmente para auditar el fallo.
                let record = self.store.insert_step(NewStep { run_id: run.id,
                                                              idx,
                                                              name: spec.name.clone(),
                                                              kind: spec.kind.as_str().to_string(),
                                                              inputs: spec.params.clone() })?;
                let error = RunError::new(kinds::TEMPLATE_RESOLUTION_ERROR, e.to_string());
                self.store.fail_step(run, record.id, &error)?;
                return Ok(StepResult::Failed(error));
            }
        };

        let record = self.store.insert_step(NewStep { run_id: run.id,
                                                      idx,
                                                      name: spec.name.clone(),
                                                      kind: spec.kind.as_str().to_string(),
                                                      inputs: resolved.clone() })?;

        if spec.kind == StepKind::Gate {
            // v0: el gate es espera manual fuera del núcleo; queda auditado.
            self.store.skip_step(run, record.id)?;
            return Ok(StepResult::Skipped);
        }

        self.store.start_step(run, record.id)?;

        let handler = match self.handlers.get(&spec.handler) {
            Some(h) => h,
            None => {
                let error = RunError::new(kinds::STEP_HANDLER_ERROR,
                                          format!("handler no registrado: {:?}", spec.handler));
                self.store.fail_step(run, record.id, &error)?;
                return Ok(StepResult::Failed(error));
            }
        };

        let step_ctx = StepContext::new(run, record.id, idx, resolved, self.events.as_ref());
        let invoked = catch_unwind(AssertUnwindSafe(|| handler.run(&step_ctx)));

        match invoked {
            Ok(Ok(outputs)) => {
                self.store.complete_step(run, record.id, outputs.clone())?;
                Ok(StepResult::Completed(outputs))
            }
            Ok(Err(error)) => {
                self.store.fail_step(run, record.id, &error)?;
                Ok(StepResult::Failed(error))
            }
            Err(panic) => {
                let message = panic_message(panic);
                let error = RunError::new(kinds::HANDLER_CRASH, format!("pánico en handler: {message}"));
                self.store.fail_step(run, record.id, &error)?;
                Ok(StepResult::Failed(error))
            }
        }
    }

    fn fail_run(&self, run: &Run, worker_id: &str, error: RunError, retryable: bool) -> RunOutcome {
        match self.queue.fail(run.id, worker_id, error, retryable) {
            Ok(disposition) => RunOutcome::Failed(disposition),
            Err(e) => {
                warn!("registro de fallo rechazado para run {}: {e}", run.id);
                RunOutcome::LeaseLost
            }
        }
    }
}

enum StepResult {
    Completed(Value),
    Skipped,
    Failed(RunError),
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic no representable".to_string()
    }
}
