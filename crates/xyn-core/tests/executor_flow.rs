//! Tests de integración del ejecutor sobre el backend in-memory: orden de
//! eventos, aislamiento de pánicos, cancelación cooperativa y presupuestos.

use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use xyn_core::{BlueprintDefinition, BlueprintRegistry, ExecutorConfig, HandlerRegistry, InMemoryBackend, NewRun,
               RunExecutor, RunQueue, RunStore, StepContext, StepHandler, StepKind, StepSpec};
use xyn_domain::errors::kinds;
use xyn_domain::{RunError, RunStatus, StepStatus};

struct PanicHandler;
impl StepHandler for PanicHandler {
    fn name(&self) -> &str {
        "panics"
    }
    fn run(&self, _ctx: &StepContext<'_>) -> Result<Value, RunError> {
        panic!("boom");
    }
}

struct FailingHandler;
impl StepHandler for FailingHandler {
    fn name(&self) -> &str {
        "always_fails"
    }
    fn run(&self, _ctx: &StepContext<'_>) -> Result<Value, RunError> {
        Err(RunError::new("external_timeout", "upstream no respondió"))
    }
}

fn harness(blueprints: Vec<BlueprintDefinition>) -> (Arc<InMemoryBackend>, RunExecutor) {
    let backend = Arc::new(InMemoryBackend::default());
    let registry = Arc::new(BlueprintRegistry::new());
    registry.register(xyn_core::blueprint::default_blueprint());
    for b in blueprints {
        registry.register(b);
    }
    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register(Arc::new(xyn_core::handler::NoopHandler));
    handlers.register(Arc::new(xyn_core::handler::EchoHandler));
    handlers.register(Arc::new(PanicHandler));
    handlers.register(Arc::new(FailingHandler));
    let executor = RunExecutor::new(backend.clone(),
                                    backend.clone(),
                                    backend.clone(),
                                    registry,
                                    handlers,
                                    ExecutorConfig::default());
    (backend, executor)
}

fn enqueue_and_claim(backend: &InMemoryBackend, new_run: NewRun) -> xyn_core::Run {
    backend.enqueue(new_run).unwrap();
    backend.claim("w-test").unwrap().expect("claim del run recién encolado")
}

#[test]
fn default_blueprint_emits_the_canonical_sequence() {
    let (backend, executor) = harness(vec![]);
    let run = enqueue_and_claim(&backend, NewRun { name: "s1".into(),
                                                   inputs: json!({}),
                                                   ..Default::default() });
    let not_lost = AtomicBool::new(false);
    let outcome = executor.execute(&run, "w-test", &not_lost);
    assert_eq!(outcome, xyn_core::executor::RunOutcome::Completed);

    let names: Vec<String> = backend.all_events()
                                    .into_iter()
                                    .filter(|e| e.correlation_id == run.correlation_id)
                                    .map(|e| e.event_name)
                                    .collect();
    assert_eq!(names,
               vec!["xyn.run.created",
                    "xyn.run.started",
                    "xyn.step.started",
                    "xyn.step.completed",
                    "xyn.run.completed"]);
    let final_run = backend.run_snapshot(run.id).unwrap();
    assert_eq!(final_run.status, RunStatus::Completed);
    assert!(final_run.completed_at.is_some());
}

#[test]
fn steps_chain_outputs_through_templates() {
    let blueprint =
        BlueprintDefinition::new("chain",
                                 vec![StepSpec { id: "first".into(),
                                                 name: "first".into(),
                                                 kind: StepKind::ActionTask,
                                                 handler: "echo".into(),
                                                 params: json!({"value": "{{inputs.seed}}"}) },
                                      StepSpec { id: "second".into(),
                                                 name: "second".into(),
                                                 kind: StepKind::Transform,
                                                 handler: "echo".into(),
                                                 params: json!({"value": "{{steps.first.outputs.value}}"}) }]);
    let (backend, executor) = harness(vec![blueprint]);
    let run = enqueue_and_claim(&backend, NewRun { name: "chain".into(),
                                                   blueprint_ref: Some("chain".into()),
                                                   inputs: json!({"seed": 41}),
                                                   ..Default::default() });
    let not_lost = AtomicBool::new(false);
    executor.execute(&run, "w-test", &not_lost);

    let steps = backend.list_steps(run.id).unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].idx, 0);
    assert_eq!(steps[1].idx, 1);
    assert_eq!(steps[1].outputs, Some(json!({"value": 41})));
    let final_run = backend.run_snapshot(run.id).unwrap();
    assert_eq!(final_run.outputs, Some(json!({"value": 41})));
}

#[test]
fn handler_panic_becomes_handler_crash_and_uses_retry_policy() {
    let blueprint = BlueprintDefinition::new("crashy",
                                             vec![StepSpec { id: "kaboom".into(),
                                                             name: "kaboom".into(),
                                                             kind: StepKind::ActionTask,
                                                             handler: "panics".into(),
                                                             params: json!({}) }]);
    let (backend, executor) = harness(vec![blueprint]);
    let run = enqueue_and_claim(&backend, NewRun { name: "crashy".into(),
                                                   blueprint_ref: Some("crashy".into()),
                                                   inputs: json!({}),
                                                   max_attempts: Some(1),
                                                   ..Default::default() });
    let not_lost = AtomicBool::new(false);
    let outcome = executor.execute(&run, "w-test", &not_lost);
    assert_eq!(outcome, xyn_core::executor::RunOutcome::Failed(xyn_core::FailDisposition::Terminal));

    let steps = backend.list_steps(run.id).unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
    let step_error: RunError = serde_json::from_value(steps[0].error.clone().unwrap()).unwrap();
    assert_eq!(step_error.kind, kinds::HANDLER_CRASH);

    let final_run = backend.run_snapshot(run.id).unwrap();
    assert_eq!(final_run.status, RunStatus::Failed);
    let run_error: RunError = serde_json::from_value(final_run.error.unwrap()).unwrap();
    assert_eq!(run_error.kind, kinds::STEP_HANDLER_ERROR);
}

#[test]
fn step_failure_with_attempts_left_reschedules() {
    let blueprint = BlueprintDefinition::new("flaky",
                                             vec![StepSpec { id: "f".into(),
                                                             name: "f".into(),
                                                             kind: StepKind::ActionTask,
                                                             handler: "always_fails".into(),
                                                             params: json!({}) }]);
    let (backend, executor) = harness(vec![blueprint]);
    let run = enqueue_and_claim(&backend, NewRun { name: "flaky".into(),
                                                   blueprint_ref: Some("flaky".into()),
                                                   inputs: json!({}),
                                                   max_attempts: Some(3),
                                                   ..Default::default() });
    let not_lost = AtomicBool::new(false);
    let outcome = executor.execute(&run, "w-test", &not_lost);
    assert!(matches!(outcome, xyn_core::executor::RunOutcome::Failed(xyn_core::FailDisposition::Retried { .. })));

    let final_run = backend.run_snapshot(run.id).unwrap();
    assert_eq!(final_run.status, RunStatus::Queued);
    assert!(final_run.completed_at.is_none());
    assert!(final_run.lease_expires_at.is_none());
    let names: Vec<String> = backend.all_events().into_iter().map(|e| e.event_name).collect();
    assert!(names.contains(&"xyn.run.retry_scheduled".to_string()));
}

#[test]
fn unknown_blueprint_fails_terminally() {
    let (backend, executor) = harness(vec![]);
    let run = enqueue_and_claim(&backend, NewRun { name: "ghost".into(),
                                                   blueprint_ref: Some("no.such.blueprint".into()),
                                                   inputs: json!({}),
                                                   ..Default::default() });
    let not_lost = AtomicBool::new(false);
    let outcome = executor.execute(&run, "w-test", &not_lost);
    assert_eq!(outcome, xyn_core::executor::RunOutcome::Failed(xyn_core::FailDisposition::Terminal));
    let final_run = backend.run_snapshot(run.id).unwrap();
    let run_error: RunError = serde_json::from_value(final_run.error.unwrap()).unwrap();
    assert_eq!(run_error.kind, kinds::BLUEPRINT_NOT_FOUND);
}

#[test]
fn cancel_requested_lands_cancelled_at_step_boundary() {
    let blueprint =
        BlueprintDefinition::new("two",
                                 vec![StepSpec { id: "a".into(),
                                                 name: "a".into(),
                                                 kind: StepKind::ActionTask,
                                                 handler: "noop".into(),
                                                 params: json!({}) },
                                      StepSpec { id: "b".into(),
                                                 name: "b".into(),
                                                 kind: StepKind::ActionTask,
                                                 handler: "noop".into(),
                                                 params: json!({}) }]);
    let (backend, executor) = harness(vec![blueprint]);
    let run = enqueue_and_claim(&backend, NewRun { name: "two".into(),
                                                   blueprint_ref: Some("two".into()),
                                                   inputs: json!({}),
                                                   ..Default::default() });
    // Flag cooperativo antes de empezar: el primer límite de step lo observa.
    backend.cancel(run.id).unwrap();
    let not_lost = AtomicBool::new(false);
    let outcome = executor.execute(&run, "w-test", &not_lost);
    assert_eq!(outcome, xyn_core::executor::RunOutcome::Cancelled);
    let final_run = backend.run_snapshot(run.id).unwrap();
    assert_eq!(final_run.status, RunStatus::Cancelled);
    assert!(final_run.completed_at.is_some());
    assert!(backend.list_steps(run.id).unwrap().is_empty());
}

#[test]
fn queued_cancel_is_immediate_and_idempotent() {
    let (backend, _executor) = harness(vec![]);
    let run = backend.enqueue(NewRun { name: "q".into(),
                                       inputs: json!({}),
                                       ..Default::default() })
                     .unwrap();
    let cancelled = backend.cancel(run.id).unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    // Segunda cancelación: sin cambios.
    let again = backend.cancel(run.id).unwrap();
    assert_eq!(again.completed_at, cancelled.completed_at);
}

#[test]
fn gate_steps_are_recorded_and_skipped() {
    let blueprint =
        BlueprintDefinition::new("gated",
                                 vec![StepSpec { id: "hold".into(),
                                                 name: "hold".into(),
                                                 kind: StepKind::Gate,
                                                 handler: "noop".into(),
                                                 params: json!({}) },
                                      StepSpec { id: "after".into(),
                                                 name: "after".into(),
                                                 kind: StepKind::ActionTask,
                                                 handler: "noop".into(),
                                                 params: json!({}) }]);
    let (backend, executor) = harness(vec![blueprint]);
    let run = enqueue_and_claim(&backend, NewRun { name: "gated".into(),
                                                   blueprint_ref: Some("gated".into()),
                                                   inputs: json!({}),
                                                   ..Default::default() });
    let not_lost = AtomicBool::new(false);
    let outcome = executor.execute(&run, "w-test", &not_lost);
    assert_eq!(outcome, xyn_core::executor::RunOutcome::Completed);
    let steps = backend.list_steps(run.id).unwrap();
    assert_eq!(steps[0].status, StepStatus::Skipped);
    assert_eq!(steps[1].status, StepStatus::Completed);
}

#[test]
fn step_budget_is_enforced() {
    let blueprint = BlueprintDefinition::new("wide",
                                             (0..3).map(|i| StepSpec { id: format!("s{i}"),
                                                                       name: format!("s{i}"),
                                                                       kind: StepKind::ActionTask,
                                                                       handler: "noop".into(),
                                                                       params: json!({}) })
                                                   .collect());
    let backend = Arc::new(InMemoryBackend::default());
    let registry = Arc::new(BlueprintRegistry::new());
    registry.register(blueprint);
    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register(Arc::new(xyn_core::handler::NoopHandler));
    let executor = RunExecutor::new(backend.clone(),
                                    backend.clone(),
                                    backend.clone(),
                                    registry,
                                    handlers,
                                    ExecutorConfig { max_steps: 2,
                                                     ..Default::default() });
    let run = enqueue_and_claim(&backend, NewRun { name: "wide".into(),
                                                   blueprint_ref: Some("wide".into()),
                                                   inputs: json!({}),
                                                   max_attempts: Some(1),
                                                   ..Default::default() });
    let not_lost = AtomicBool::new(false);
    let outcome = executor.execute(&run, "w-test", &not_lost);
    assert_eq!(outcome, xyn_core::executor::RunOutcome::Failed(xyn_core::FailDisposition::Terminal));
    let final_run = backend.run_snapshot(run.id).unwrap();
    let run_error: RunError = serde_json::from_value(final_run.error.unwrap()).unwrap();
    assert_eq!(run_error.kind, kinds::STEP_BUDGET_EXCEEDED);
}

#[test]
fn lost_lease_aborts_without_state_writes() {
    let (backend, executor) = harness(vec![]);
    let run = enqueue_and_claim(&backend, NewRun { name: "lost".into(),
                                                   inputs: json!({}),
                                                   ..Default::default() });
    let lost = AtomicBool::new(true);
    let outcome = executor.execute(&run, "w-test", &lost);
    assert_eq!(outcome, xyn_core::executor::RunOutcome::LeaseLost);
    // Sin steps ni finalización: la fila sigue running hasta el reclaim.
    assert!(backend.list_steps(run.id).unwrap().is_empty());
    assert_eq!(backend.run_snapshot(run.id).unwrap().status, RunStatus::Running);
}

#[test]
fn queue_claim_order_is_priority_then_fifo() {
    let backend = InMemoryBackend::default();
    for (name, priority) in [("low", 100), ("high", 10), ("mid", 50)] {
        backend.enqueue(NewRun { name: name.into(),
                                 priority: Some(priority),
                                 inputs: json!({}),
                                 ..Default::default() })
               .unwrap();
    }
    let order: Vec<String> = (0..3).map(|_| backend.claim("w").unwrap().unwrap().name).collect();
    assert_eq!(order, vec!["high", "mid", "low"]);
    assert!(backend.claim("w").unwrap().is_none());
}

#[test]
fn reclaim_returns_expired_runs_and_next_claim_counts_attempts() {
    let backend = InMemoryBackend::new(xyn_core::QueueConfig { lease_duration: std::time::Duration::from_millis(10),
                                                               ..Default::default() });
    let run = backend.enqueue(NewRun { name: "zombie".into(),
                                       inputs: json!({}),
                                       ..Default::default() })
                     .unwrap();
    let claimed = backend.claim("w1").unwrap().unwrap();
    assert_eq!(claimed.attempt, 1);
    std::thread::sleep(std::time::Duration::from_millis(20));
    let reclaimed = backend.reclaim_expired().unwrap();
    assert_eq!(reclaimed, vec![run.id]);
    // El worker original ya no puede renovar.
    assert!(!backend.renew(run.id, "w1").unwrap());
    let again = backend.claim("w2").unwrap().unwrap();
    assert_eq!(again.id, run.id);
    assert_eq!(again.attempt, 2);
}

#[test]
fn child_spawning_is_idempotent_by_child_key() {
    let backend = InMemoryBackend::default();
    let parent = backend.enqueue(NewRun { name: "parent".into(),
                                          inputs: json!({}),
                                          ..Default::default() })
                        .unwrap();
    let child_a = backend.enqueue(NewRun { name: "child".into(),
                                           inputs: json!({}),
                                           parent_run_id: Some(parent.id),
                                           child_key: Some("only-once".into()),
                                           relation: Some("spawned".into()),
                                           ..Default::default() })
                         .unwrap();
    let child_b = backend.enqueue(NewRun { name: "child".into(),
                                           inputs: json!({}),
                                           parent_run_id: Some(parent.id),
                                           child_key: Some("only-once".into()),
                                           relation: Some("spawned".into()),
                                           ..Default::default() })
                         .unwrap();
    assert_eq!(child_a.id, child_b.id);
}
