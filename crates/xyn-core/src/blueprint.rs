//! Blueprints: plan declarativo y ordenado de steps, despachado por nombre.
//!
//! v0 es lineal: el plan se compila a una secuencia de steps sin ramas. Un
//! `gate` es un step de espera manual y queda fuera del núcleo de ejecución
//! (se registra como `skipped`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::CoreError;
use crate::queue::BackoffPolicy;

/// Tipo de step. El string en snake_case es el contrato persistido en
/// `steps.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ActionTask,
    AgentTask,
    Gate,
    Transform,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ActionTask => "action_task",
            StepKind::AgentTask => "agent_task",
            StepKind::Gate => "gate",
            StepKind::Transform => "transform",
        }
    }
}

/// Step declarado en un blueprint.
///
/// `params` puede referenciar inputs del run y outputs de steps previos vía
/// la sintaxis de templates (`{{inputs.x}}`, `{{steps.<id>.outputs.y}}`);
/// se resuelve inmediatamente antes de insertar el step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Id lógico dentro del blueprint (clave de `{{steps.<id>...}}`).
    pub id: String,
    pub name: String,
    pub kind: StepKind,
    /// Nombre del handler registrado que ejecuta el step.
    pub handler: String,
    #[serde(default)]
    pub params: Value,
}

/// Definición inmutable de un blueprint.
#[derive(Debug, Clone)]
pub struct BlueprintDefinition {
    pub name: String,
    pub steps: Vec<StepSpec>,
    /// Override opcional del presupuesto de intentos del run.
    pub max_attempts: Option<i32>,
    /// Override opcional de la política de backoff.
    pub backoff: Option<BackoffPolicy>,
}

impl BlueprintDefinition {
    pub fn new(name: &str, steps: Vec<StepSpec>) -> Self {
        Self { name: name.to_string(),
               steps,
               max_attempts: None,
               backoff: None }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Registry de blueprints por nombre.
///
/// El lookup fallido es `blueprint_not_found` y produce un fallo terminal
/// del run (error de configuración, no se reintenta).
#[derive(Default)]
pub struct BlueprintRegistry {
    map: RwLock<HashMap<String, Arc<BlueprintDefinition>>>,
}

impl BlueprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, definition: BlueprintDefinition) {
        let mut map = self.map.write().expect("blueprint registry poisoned");
        map.insert(definition.name.clone(), Arc::new(definition));
    }

    pub fn get(&self, name: &str) -> Result<Arc<BlueprintDefinition>, CoreError> {
        let map = self.map.read().expect("blueprint registry poisoned");
        map.get(name)
           .cloned()
           .ok_or_else(|| CoreError::BlueprintNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let map = self.map.read().expect("blueprint registry poisoned");
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Blueprint por defecto cuando el run no referencia ninguno: un único step
/// `noop` que devuelve los inputs del run como outputs.
pub const DEFAULT_BLUEPRINT: &str = "xyn.noop";

pub fn default_blueprint() -> BlueprintDefinition {
    BlueprintDefinition::new(DEFAULT_BLUEPRINT,
                             vec![StepSpec { id: "noop".into(),
                                             name: "noop".into(),
                                             kind: StepKind::ActionTask,
                                             handler: "noop".into(),
                                             params: serde_json::json!({"inputs": "{{inputs}}"}) }])
}
