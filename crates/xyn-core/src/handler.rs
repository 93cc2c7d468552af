//! Despacho polimórfico de handlers de step.
//!
//! Los steps se modelan como variantes por `kind` con despacho por nombre a
//! través de un registry; los handlers son objetos pequeños que poseen sus
//! dependencias. Un handler devuelve `outputs` JSON o un `RunError` con
//! kind de la taxonomía; los pánicos se capturan en el borde del ejecutor.

use log::warn;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;
use xyn_domain::{events, RunError};

use crate::model::{EmitEvent, Run};
use crate::store::EventLog;

/// Contexto de ejecución de un step: inputs resueltos + emisión de progreso.
pub struct StepContext<'a> {
    pub run: &'a Run,
    pub step_id: Uuid,
    pub idx: i32,
    /// Params del step con los templates ya resueltos.
    pub inputs: Value,
    events: &'a dyn EventLog,
}

impl<'a> StepContext<'a> {
    pub fn new(run: &'a Run, step_id: Uuid, idx: i32, inputs: Value, events: &'a dyn EventLog) -> Self {
        Self { run,
               step_id,
               idx,
               inputs,
               events }
    }

    /// Emite `xyn.step.progress` con mensaje libre. El fallo de emisión no
    /// interrumpe el handler: se registra y se sigue.
    pub fn progress(&self, message: &str, data: Value) {
        let ev = EmitEvent::for_run(events::STEP_PROGRESS,
                                    self.run,
                                    serde_json::json!({"message": message, "data": data})).with_step(self.step_id);
        if let Err(e) = self.events.emit(ev) {
            warn!("emisión de progreso fallida run={} step={}: {e}", self.run.id, self.step_id);
        }
    }
}

/// Contrato de un handler de step.
pub trait StepHandler: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, ctx: &StepContext<'_>) -> Result<Value, RunError>;
}

/// Registry de handlers por nombre.
#[derive(Default)]
pub struct HandlerRegistry {
    map: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn StepHandler>) {
        let mut map = self.map.write().expect("handler registry poisoned");
        map.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        let map = self.map.read().expect("handler registry poisoned");
        map.get(name).cloned()
    }
}

/// Handler trivial: devuelve sus inputs como outputs. Respaldo del
/// blueprint por defecto y útil en tests.
pub struct NoopHandler;

impl StepHandler for NoopHandler {
    fn name(&self) -> &str {
        "noop"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<Value, RunError> {
        Ok(ctx.inputs.clone())
    }
}

/// Handler de transformación simple: hace eco del campo `value`.
pub struct EchoHandler;

impl StepHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<Value, RunError> {
        Ok(serde_json::json!({"value": ctx.inputs.get("value").cloned().unwrap_or(Value::Null)}))
    }
}
