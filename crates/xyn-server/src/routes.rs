//! Router axum y todos los handlers HTTP.
//!
//! `build_router` es el único punto de entrada; `main.rs` lo llama y
//! adjunta las capas de middleware. La capa Diesel es síncrona, así que
//! cada handler delega en `spawn_blocking`.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use log::error;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;
use xyn_core::errors::CoreError;
use xyn_core::model::{EmitEvent, NewRun};
use xyn_core::queue::RunQueue;
use xyn_core::store::{EventLog, RunStore};
use xyn_persistence::{EventFilter, InstallError};

use crate::api_types::{ApiError, ConflictBody, CreateEventRequest, CreateRunRequest, HealthResponse, InstallAccepted,
                       ListQuery, PackStatusResponse, Page};
use crate::pagination::{clamp_limit, decode_cursor, encode_cursor};
use crate::state::{uptime_secs, AppState};

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/events", get(list_events).post(create_event))
        .route("/events/:id", get(get_event))
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/runs/:id/steps", get(list_steps))
        .route("/packs/:pack_ref/install", post(install_pack))
        .route("/packs/:pack_ref/status", get(pack_status));
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .nest("/api/v1", api)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn api_error(status: StatusCode, kind: &str, message: String, correlation_id: Option<Uuid>) -> Response {
    (status,
     Json(ApiError { error: kind.to_string(),
                     message,
                     correlation_id })).into_response()
}

fn core_error_response(e: CoreError, correlation_id: Option<Uuid>) -> Response {
    let status = match &e {
        CoreError::NotFound => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::Constraint(_) | CoreError::Template(_) | CoreError::BlueprintNotFound(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.kind(), e.to_string(), correlation_id)
}

/// Ejecuta la unidad Diesel en el pool blocking y aplana el JoinError.
async fn blocking<T, F>(f: F) -> Result<T, Response>
    where T: Send + 'static,
          F: FnOnce() -> Result<T, CoreError> + Send + 'static
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(core_error_response(e, None)),
        Err(join) => {
            error!("tarea blocking abortada: {join}");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", join.to_string(), None))
        }
    }
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse { status: "ok",
                          version: env!("CARGO_PKG_VERSION"),
                          uptime_seconds: uptime_secs(&st),
                          now: Utc::now() })
}

// ---------------------------------------------------------------------------
// GET /metrics
// ---------------------------------------------------------------------------

async fn metrics(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], st.metrics.render())
}

// ---------------------------------------------------------------------------
// events
// ---------------------------------------------------------------------------

async fn list_events(State(st): State<Arc<AppState>>, Query(q): Query<ListQuery>) -> Response {
    let limit = clamp_limit(q.limit);
    let before = match q.cursor.as_deref() {
        None => None,
        Some(raw) => match decode_cursor(raw) {
            Some(key) => Some(key),
            None => return api_error(StatusCode::BAD_REQUEST, "invalid_cursor", format!("cursor ilegible: {raw}"), None),
        },
    };
    let filter = EventFilter { event_name: q.event_name.clone(),
                               run_id: q.run_id,
                               correlation_id: q.correlation_id };
    let events = st.events.clone();
    match blocking(move || events.list(&filter, limit, before)).await {
        Ok(items) => {
            let next_cursor = if items.len() as i64 == limit {
                items.last().map(|e| encode_cursor(e.occurred_at, e.id))
            } else {
                None
            };
            Json(Page { items, next_cursor }).into_response()
        }
        Err(resp) => resp,
    }
}

async fn get_event(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    let events = st.events.clone();
    match blocking(move || events.get(id)).await {
        Ok(Some(event)) => Json(event).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "not_found", format!("event {id} no existe"), None),
        Err(resp) => resp,
    }
}

async fn create_event(State(st): State<Arc<AppState>>, Json(req): Json<CreateEventRequest>) -> Response {
    // Emitiendo desde el contexto de un run, la correlación es el run.
    let correlation_id = req.correlation_id.or(req.run_id).unwrap_or_else(Uuid::new_v4);
    let emit = EmitEvent { event_name: req.event_name,
                           data: if req.data.is_null() { Value::Object(Default::default()) } else { req.data },
                           correlation_id,
                           run_id: req.run_id,
                           step_id: req.step_id,
                           actor: None,
                           resource_kind: req.resource.as_ref().map(|r| r.kind.clone()),
                           resource_id: req.resource.as_ref().map(|r| r.id.clone()) };
    let events = st.events.clone();
    match blocking(move || {
              let id = events.emit(emit)?;
              events.get(id)
          }).await
    {
        Ok(Some(event)) => (StatusCode::CREATED, Json(event)).into_response(),
        Ok(None) => api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", "evento no releíble".into(), None),
        Err(resp) => resp,
    }
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

async fn create_run(State(st): State<Arc<AppState>>, Json(req): Json<CreateRunRequest>) -> Response {
    if req.name.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "validation", "name no puede ser vacío".into(), None);
    }
    // Validación temprana: un blueprint desconocido no entra a la cola.
    if let Some(bp) = &req.blueprint_ref {
        if st.blueprints.get(bp).is_err() {
            return api_error(StatusCode::BAD_REQUEST,
                             "blueprint_not_found",
                             format!("blueprint desconocido: {bp}"),
                             None);
        }
    }
    let queue = st.queue.clone();
    let new_run = NewRun { name: req.name,
                           blueprint_ref: req.blueprint_ref,
                           inputs: if req.inputs.is_null() { Value::Object(Default::default()) } else { req.inputs },
                           priority: req.priority,
                           run_at: req.run_at,
                           max_attempts: req.max_attempts,
                           ..Default::default() };
    match blocking(move || queue.enqueue(new_run)).await {
        Ok(run) => (StatusCode::CREATED, Json(run)).into_response(),
        Err(resp) => resp,
    }
}

async fn list_runs(State(st): State<Arc<AppState>>, Query(q): Query<ListQuery>) -> Response {
    let limit = clamp_limit(q.limit);
    let before = match q.cursor.as_deref() {
        None => None,
        Some(raw) => match decode_cursor(raw) {
            Some(key) => Some(key),
            None => return api_error(StatusCode::BAD_REQUEST, "invalid_cursor", format!("cursor ilegible: {raw}"), None),
        },
    };
    if let Some(s) = &q.status {
        if xyn_domain::RunStatus::parse(s).is_none() {
            return api_error(StatusCode::BAD_REQUEST, "validation", format!("status desconocido: {s}"), None);
        }
    }
    let store = st.store.clone();
    let status = q.status.clone();
    match blocking(move || store.list_runs(status.as_deref(), limit, before)).await {
        Ok(items) => {
            let next_cursor = if items.len() as i64 == limit {
                items.last().map(|r| encode_cursor(r.created_at, r.id))
            } else {
                None
            };
            Json(Page { items, next_cursor }).into_response()
        }
        Err(resp) => resp,
    }
}

async fn get_run(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    let store = st.store.clone();
    match blocking(move || store.get_run(id)).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "not_found", format!("run {id} no existe"), None),
        Err(resp) => resp,
    }
}

async fn cancel_run(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    let queue = st.queue.clone();
    match blocking(move || queue.cancel(id)).await {
        Ok(run) => Json(run).into_response(),
        Err(resp) => resp,
    }
}

async fn list_steps(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    let store = st.store.clone();
    match blocking(move || {
              // 404 si el run no existe; lista vacía es un run sin steps.
              if store.get_run(id)?.is_none() {
                  return Err(CoreError::NotFound);
              }
              store.list_steps(id)
          }).await
    {
        Ok(steps) => Json(steps).into_response(),
        Err(resp) => resp,
    }
}

// ---------------------------------------------------------------------------
// packs
// ---------------------------------------------------------------------------

async fn install_pack(State(st): State<Arc<AppState>>, Path(pack_ref): Path<String>) -> Response {
    let installs = st.installs.clone();
    let env_id = st.config.env_id.clone();
    let result = tokio::task::spawn_blocking(move || installs.request_install(&pack_ref, &env_id, None)).await;
    match result {
        Ok(Ok((run, _installation))) => (StatusCode::CREATED,
                                         Json(InstallAccepted { run_id: run.id,
                                                                correlation_id: run.correlation_id }))
            .into_response(),
        Ok(Err(InstallError::Conflict(conflict))) => {
            (StatusCode::CONFLICT, Json(ConflictBody::from_conflict(&conflict))).into_response()
        }
        Ok(Err(InstallError::PackNotFound(r))) => {
            api_error(StatusCode::NOT_FOUND, "not_found", format!("pack desconocido: {r}"), None)
        }
        Ok(Err(InstallError::InvalidIdentifier(m))) => {
            api_error(StatusCode::BAD_REQUEST, "invalid_identifier", m, None)
        }
        Ok(Err(other)) => api_error(StatusCode::INTERNAL_SERVER_ERROR, other.kind(), other.to_string(), None),
        Err(join) => {
            error!("install_pack abortado: {join}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", join.to_string(), None)
        }
    }
}

async fn pack_status(State(st): State<Arc<AppState>>, Path(pack_ref): Path<String>) -> Response {
    let installs = st.installs.clone();
    let env_id = st.config.env_id.clone();
    match blocking(move || installs.status(&pack_ref, &env_id)).await {
        Ok(Some(installation)) => Json(PackStatusResponse { status: installation.status.clone(),
                                                            installation: Some(installation) }).into_response(),
        Ok(None) => Json(PackStatusResponse { status: "available".to_string(),
                                              installation: None }).into_response(),
        Err(resp) => resp,
    }
}
