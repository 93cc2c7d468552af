//! Backend in-memory con paridad 1:1 de contrato respecto al backend
//! Postgres (misma semántica de claim, lease, retry, eventos). Se usa en
//! tests del ejecutor y del worker; no es apto para producción (no es
//! durable ni multi-proceso).

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;
use xyn_domain::{events, RunError, RunStatus, StepStatus};

use crate::errors::CoreError;
use crate::model::{ArtifactRecord, EmitEvent, NewArtifact, NewRun, NewStep, Run, StepRecord, StoredEvent};
use crate::queue::{FailDisposition, QueueConfig, RunQueue};
use crate::store::{ArtifactStore, EventLog, RunStore};

#[derive(Default)]
struct State {
    runs: HashMap<Uuid, Run>,
    steps: HashMap<Uuid, StepRecord>,
    events: Vec<StoredEvent>,
    artifacts: HashMap<Uuid, ArtifactRecord>,
    /// (parent, child_key) → child, para spawning idempotente.
    edges: HashMap<(Uuid, String), Uuid>,
}

pub struct InMemoryBackend {
    state: Mutex<State>,
    config: QueueConfig,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl InMemoryBackend {
    pub fn new(config: QueueConfig) -> Self {
        Self { state: Mutex::new(State::default()),
               config }
    }

    fn append_event(state: &mut State, ev: EmitEvent) -> Uuid {
        let id = Uuid::new_v4();
        state.events.push(StoredEvent { id,
                                        event_name: ev.event_name,
                                        occurred_at: Utc::now(),
                                        correlation_id: ev.correlation_id,
                                        run_id: ev.run_id,
                                        step_id: ev.step_id,
                                        actor: ev.actor,
                                        resource_kind: ev.resource_kind,
                                        resource_id: ev.resource_id,
                                        data: ev.data });
        id
    }

    /// Acceso de inspección para tests: copia de todos los eventos en orden
    /// de inserción.
    pub fn all_events(&self) -> Vec<StoredEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn run_snapshot(&self, run_id: Uuid) -> Option<Run> {
        self.state.lock().unwrap().runs.get(&run_id).cloned()
    }
}

impl RunQueue for InMemoryBackend {
    fn enqueue(&self, new_run: NewRun) -> Result<Run, CoreError> {
        let mut state = self.state.lock().unwrap();
        // Spawning idempotente: un edge (parent, child_key) existente
        // devuelve el hijo ya creado sin insertar otro.
        if let (Some(parent), Some(key)) = (new_run.parent_run_id, new_run.child_key.clone()) {
            if let Some(child_id) = state.edges.get(&(parent, key)) {
                return state.runs
                            .get(child_id)
                            .cloned()
                            .ok_or_else(|| CoreError::Internal("edge sin run hijo".into()));
            }
        }
        let now = Utc::now();
        let id = Uuid::new_v4();
        let run = Run { id,
                        name: new_run.name.clone(),
                        blueprint_ref: new_run.blueprint_ref.clone(),
                        status: RunStatus::Queued,
                        run_at: new_run.run_at.unwrap_or(now),
                        priority: new_run.priority.unwrap_or(100),
                        attempt: 0,
                        max_attempts: new_run.max_attempts.or(self.config.default_max_attempts),
                        queued_at: now,
                        created_at: now,
                        locked_at: None,
                        locked_by: None,
                        lease_expires_at: None,
                        started_at: None,
                        completed_at: None,
                        actor: new_run.actor.clone(),
                        correlation_id: id,
                        inputs: new_run.inputs.clone(),
                        outputs: None,
                        error: None,
                        cancel_requested: false,
                        parent_run_id: new_run.parent_run_id };
        if let (Some(parent), Some(key)) = (new_run.parent_run_id, new_run.child_key) {
            state.edges.insert((parent, key), id);
        }
        Self::append_event(&mut state,
                           EmitEvent::for_run(events::RUN_CREATED, &run, json!({"name": run.name})));
        state.runs.insert(id, run.clone());
        Ok(run)
    }

    fn claim(&self, worker_id: &str) -> Result<Option<Run>, CoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut eligible: Vec<&Run> = state.runs
                                           .values()
                                           .filter(|r| r.status == RunStatus::Queued && r.run_at <= now)
                                           .collect();
        // Desempate determinista idéntico al claim SQL.
        eligible.sort_by(|a, b| {
                    a.priority
                     .cmp(&b.priority)
                     .then(a.run_at.cmp(&b.run_at))
                     .then(a.queued_at.cmp(&b.queued_at))
                     .then(a.created_at.cmp(&b.created_at))
                });
        let Some(id) = eligible.first().map(|r| r.id) else {
            return Ok(None);
        };
        let lease = ChronoDuration::from_std(self.config.lease_duration).unwrap_or_else(|_| ChronoDuration::seconds(60));
        let run = state.runs.get_mut(&id).expect("run elegible presente");
        run.status = RunStatus::Running;
        run.locked_at = Some(now);
        run.locked_by = Some(worker_id.to_string());
        run.lease_expires_at = Some(now + lease);
        run.started_at = run.started_at.or(Some(now));
        run.attempt += 1;
        let reclaimed = run.attempt > 1;
        let snapshot = run.clone();
        Self::append_event(&mut state,
                           EmitEvent::for_run(events::RUN_STARTED,
                                              &snapshot,
                                              json!({"attempt": snapshot.attempt, "reclaimed": reclaimed})));
        Ok(Some(snapshot))
    }

    fn renew(&self, run_id: Uuid, worker_id: &str) -> Result<bool, CoreError> {
        let mut state = self.state.lock().unwrap();
        let lease = ChronoDuration::from_std(self.config.lease_duration).unwrap_or_else(|_| ChronoDuration::seconds(60));
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Running && run.locked_by.as_deref() == Some(worker_id) => {
                run.lease_expires_at = Some(Utc::now() + lease);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn complete(&self, run_id: Uuid, worker_id: &str, outputs: Value) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        let run = state.runs.get_mut(&run_id).ok_or(CoreError::NotFound)?;
        if run.status != RunStatus::Running || run.locked_by.as_deref() != Some(worker_id) {
            return Err(CoreError::Conflict(format!("run {run_id} no está en ejecución por {worker_id}")));
        }
        run.status = RunStatus::Completed;
        run.outputs = Some(outputs);
        run.completed_at = Some(Utc::now());
        run.locked_by = None;
        run.lease_expires_at = None;
        let snapshot = run.clone();
        Self::append_event(&mut state, EmitEvent::for_run(events::RUN_COMPLETED, &snapshot, json!({})));
        Ok(())
    }

    fn fail(&self, run_id: Uuid, worker_id: &str, error: RunError, retryable: bool)
            -> Result<FailDisposition, CoreError> {
        let mut state = self.state.lock().unwrap();
        let run = state.runs.get_mut(&run_id).ok_or(CoreError::NotFound)?;
        if run.status != RunStatus::Running || run.locked_by.as_deref() != Some(worker_id) {
            return Err(CoreError::Conflict(format!("run {run_id} no está en ejecución por {worker_id}")));
        }
        let attempts_left = run.max_attempts.map(|m| run.attempt < m).unwrap_or(true);
        if retryable && attempts_left {
            let delay = self.config.backoff.delay(run.attempt);
            let run_at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(1));
            run.status = RunStatus::Queued;
            run.run_at = run_at;
            run.locked_at = None;
            run.locked_by = None;
            run.lease_expires_at = None;
            run.error = Some(error.to_json());
            let snapshot = run.clone();
            Self::append_event(&mut state,
                               EmitEvent::for_run(events::RUN_RETRY_SCHEDULED,
                                                  &snapshot,
                                                  json!({"attempt": snapshot.attempt, "run_at": run_at})));
            Ok(FailDisposition::Retried { run_at })
        } else {
            run.status = RunStatus::Failed;
            run.completed_at = Some(Utc::now());
            run.error = Some(error.to_json());
            run.locked_by = None;
            run.lease_expires_at = None;
            let snapshot = run.clone();
            Self::append_event(&mut state,
                               EmitEvent::for_run(events::RUN_FAILED, &snapshot, error.to_json()));
            Ok(FailDisposition::Terminal)
        }
    }

    fn complete_cancel(&self, run_id: Uuid, worker_id: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        let run = state.runs.get_mut(&run_id).ok_or(CoreError::NotFound)?;
        if run.status != RunStatus::Running || run.locked_by.as_deref() != Some(worker_id) {
            return Err(CoreError::Conflict(format!("run {run_id} no está en ejecución por {worker_id}")));
        }
        run.status = RunStatus::Cancelled;
        run.completed_at = Some(Utc::now());
        run.locked_by = None;
        run.lease_expires_at = None;
        let snapshot = run.clone();
        Self::append_event(&mut state, EmitEvent::for_run(events::RUN_CANCELLED, &snapshot, json!({})));
        Ok(())
    }

    fn cancel(&self, run_id: Uuid) -> Result<Run, CoreError> {
        let mut state = self.state.lock().unwrap();
        let run = state.runs.get_mut(&run_id).ok_or(CoreError::NotFound)?;
        match run.status {
            RunStatus::Queued => {
                run.status = RunStatus::Cancelled;
                run.completed_at = Some(Utc::now());
                let snapshot = run.clone();
                Self::append_event(&mut state, EmitEvent::for_run(events::RUN_CANCELLED, &snapshot, json!({})));
                Ok(snapshot)
            }
            RunStatus::Running => {
                run.cancel_requested = true;
                Ok(run.clone())
            }
            // Terminal: idempotente, sin mutación.
            _ => Ok(run.clone()),
        }
    }

    fn cancel_requested(&self, run_id: Uuid) -> Result<bool, CoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.runs.get(&run_id).map(|r| r.cancel_requested).unwrap_or(false))
    }

    fn reclaim_expired(&self) -> Result<Vec<Uuid>, CoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let expired: Vec<Uuid> = state.runs
                                      .values()
                                      .filter(|r| {
                                          r.status == RunStatus::Running
                                          && r.lease_expires_at.map(|t| t < now).unwrap_or(false)
                                      })
                                      .map(|r| r.id)
                                      .collect();
        for id in &expired {
            let run = state.runs.get_mut(id).expect("run vencido presente");
            run.status = RunStatus::Queued;
            run.locked_at = None;
            run.locked_by = None;
            run.lease_expires_at = None;
            let snapshot = run.clone();
            Self::append_event(&mut state, EmitEvent::for_run(events::RUN_RECLAIMED, &snapshot, json!({})));
        }
        Ok(expired)
    }
}

impl RunStore for InMemoryBackend {
    fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, CoreError> {
        Ok(self.state.lock().unwrap().runs.get(&run_id).cloned())
    }

    fn insert_step(&self, step: NewStep) -> Result<StepRecord, CoreError> {
        let mut state = self.state.lock().unwrap();
        if state.steps.values().any(|s| s.run_id == step.run_id && s.idx == step.idx) {
            return Err(CoreError::Constraint(format!("idx duplicado {} para run {}", step.idx, step.run_id)));
        }
        let record = StepRecord { id: Uuid::new_v4(),
                                  run_id: step.run_id,
                                  idx: step.idx,
                                  name: step.name,
                                  kind: step.kind,
                                  status: StepStatus::Created,
                                  inputs: step.inputs,
                                  outputs: None,
                                  error: None,
                                  started_at: None,
                                  completed_at: None,
                                  logs_artifact_id: None,
                                  created_at: Utc::now() };
        state.steps.insert(record.id, record.clone());
        Ok(record)
    }

    fn start_step(&self, run: &Run, step_id: Uuid) -> Result<StepRecord, CoreError> {
        let mut state = self.state.lock().unwrap();
        let step = state.steps.get_mut(&step_id).ok_or(CoreError::NotFound)?;
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        let snapshot = step.clone();
        Self::append_event(&mut state,
                           EmitEvent::for_run(events::STEP_STARTED, run, json!({"idx": snapshot.idx, "name": snapshot.name}))
                               .with_step(step_id));
        Ok(snapshot)
    }

    fn complete_step(&self, run: &Run, step_id: Uuid, outputs: Value) -> Result<StepRecord, CoreError> {
        let mut state = self.state.lock().unwrap();
        let step = state.steps.get_mut(&step_id).ok_or(CoreError::NotFound)?;
        step.status = StepStatus::Completed;
        step.outputs = Some(outputs);
        step.completed_at = Some(Utc::now());
        let snapshot = step.clone();
        Self::append_event(&mut state,
                           EmitEvent::for_run(events::STEP_COMPLETED, run, json!({"idx": snapshot.idx})).with_step(step_id));
        Ok(snapshot)
    }

    fn fail_step(&self, run: &Run, step_id: Uuid, error: &RunError) -> Result<StepRecord, CoreError> {
        let mut state = self.state.lock().unwrap();
        let step = state.steps.get_mut(&step_id).ok_or(CoreError::NotFound)?;
        step.status = StepStatus::Failed;
        step.error = Some(error.to_json());
        step.completed_at = Some(Utc::now());
        let snapshot = step.clone();
        Self::append_event(&mut state,
                           EmitEvent::for_run(events::STEP_FAILED, run, error.to_json()).with_step(step_id));
        Ok(snapshot)
    }

    fn skip_step(&self, run: &Run, step_id: Uuid) -> Result<StepRecord, CoreError> {
        let mut state = self.state.lock().unwrap();
        let step = state.steps.get_mut(&step_id).ok_or(CoreError::NotFound)?;
        step.status = StepStatus::Skipped;
        step.completed_at = Some(Utc::now());
        let snapshot = step.clone();
        Self::append_event(&mut state,
                           EmitEvent::for_run(events::STEP_SKIPPED, run, json!({"idx": snapshot.idx})).with_step(step_id));
        Ok(snapshot)
    }

    fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, CoreError> {
        let state = self.state.lock().unwrap();
        let mut steps: Vec<StepRecord> = state.steps.values().filter(|s| s.run_id == run_id).cloned().collect();
        steps.sort_by_key(|s| s.idx);
        Ok(steps)
    }
}

impl EventLog for InMemoryBackend {
    fn emit(&self, event: EmitEvent) -> Result<Uuid, CoreError> {
        if !events::is_valid_event_name(&event.event_name) {
            return Err(CoreError::Constraint(format!("event_name inválido: {:?}", event.event_name)));
        }
        let mut state = self.state.lock().unwrap();
        Ok(Self::append_event(&mut state, event))
    }

    fn list_by_correlation(&self, correlation_id: Uuid) -> Result<Vec<StoredEvent>, CoreError> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<StoredEvent> = state.events
                                             .iter()
                                             .filter(|e| e.correlation_id == correlation_id)
                                             .cloned()
                                             .collect();
        // Orden estable: occurred_at y, en empate, orden de inserción.
        out.sort_by_key(|e| e.occurred_at);
        Ok(out)
    }
}

impl ArtifactStore for InMemoryBackend {
    fn put(&self, artifact: NewArtifact) -> Result<ArtifactRecord, CoreError> {
        let mut state = self.state.lock().unwrap();
        let sha = hex::encode(Sha256::digest(&artifact.bytes));
        // Deduplicación por contenido.
        if let Some(existing) = state.artifacts.values().find(|a| a.sha256.as_deref() == Some(sha.as_str())) {
            return Ok(existing.clone());
        }
        let record = ArtifactRecord { id: Uuid::new_v4(),
                                      name: artifact.name,
                                      kind: artifact.kind,
                                      content_type: artifact.content_type,
                                      byte_length: artifact.bytes.len() as i64,
                                      sha256: Some(sha.clone()),
                                      storage_path: Some(format!("{}/{}/{}", &sha[..2], &sha[2..4], sha)),
                                      created_by: artifact.created_by,
                                      run_id: artifact.run_id,
                                      step_id: artifact.step_id,
                                      metadata: artifact.metadata,
                                      created_at: Utc::now() };
        let correlation = artifact.run_id.unwrap_or(record.id);
        Self::append_event(&mut state,
                           EmitEvent { event_name: events::ARTIFACT_ATTACHED.to_string(),
                                       data: json!({"sha256": sha, "byte_length": record.byte_length}),
                                       correlation_id: correlation,
                                       run_id: artifact.run_id,
                                       step_id: artifact.step_id,
                                       actor: record.created_by.clone(),
                                       resource_kind: Some("artifact".to_string()),
                                       resource_id: Some(record.id.to_string()) });
        state.artifacts.insert(record.id, record.clone());
        Ok(record)
    }

    fn get(&self, id: Uuid) -> Result<Option<ArtifactRecord>, CoreError> {
        Ok(self.state.lock().unwrap().artifacts.get(&id).cloned())
    }
}
