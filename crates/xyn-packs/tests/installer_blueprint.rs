//! End-to-end del blueprint de instalación sobre Postgres real: solicitud,
//! claim por worker, ejecución de los cinco steps y verificación de la fila
//! `installed` + eventos canónicos. Asume una base de test dedicada.

use once_cell::sync::Lazy;
use serde_json::json;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use xyn_core::executor::RunOutcome;
use xyn_core::queue::{QueueConfig, RunQueue};
use xyn_core::store::{EventLog, RunStore};
use xyn_core::{BlueprintRegistry, ExecutorConfig, HandlerRegistry, RunExecutor};
use xyn_packs::{install_blueprint, register_install_handlers, seed_builtin_packs};
use xyn_persistence::config::DbConfig;
use xyn_persistence::pg::{build_pool, PgPool};
use xyn_persistence::{PgEventLog, PgInstallRepo, PgRunQueue, PgRunStore, PoolProvider};

static TEST_POOL: Lazy<Option<PgPool>> = Lazy::new(|| {
    let cfg = DbConfig::from_env().ok()?;
    build_pool(&cfg.url, 1, 4).ok()
});

// Los tests que reclaman de la cola compartida no deben pisarse entre sí.
static QUEUE_LOCK: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

struct Harness {
    queue: Arc<PgRunQueue<PoolProvider>>,
    store: Arc<PgRunStore<PoolProvider>>,
    events: Arc<PgEventLog<PoolProvider>>,
    repo: Arc<PgInstallRepo<PoolProvider>>,
    executor: RunExecutor,
}

fn harness(pool: PgPool) -> Harness {
    let provider = || PoolProvider { pool: pool.clone() };
    let queue = Arc::new(PgRunQueue::new(provider(), QueueConfig::default()));
    let store = Arc::new(PgRunStore::new(provider()));
    let events = Arc::new(PgEventLog::new(provider()));
    let repo = Arc::new(PgInstallRepo::new(provider()));
    seed_builtin_packs(&repo).unwrap();

    let blueprints = Arc::new(BlueprintRegistry::new());
    blueprints.register(install_blueprint());
    let handlers = Arc::new(HandlerRegistry::new());
    register_install_handlers(&handlers, Arc::clone(&repo));

    let executor = RunExecutor::new(queue.clone(),
                                    store.clone(),
                                    events.clone(),
                                    blueprints,
                                    handlers,
                                    ExecutorConfig::default());
    Harness { queue,
              store,
              events,
              repo,
              executor }
}

fn claim_specific(queue: &PgRunQueue<PoolProvider>, run_id: uuid::Uuid, worker: &str) -> xyn_core::Run {
    for _ in 0..100 {
        match queue.claim(worker).unwrap() {
            Some(run) if run.id == run_id => return run,
            Some(_) => continue,
            None => std::thread::sleep(std::time::Duration::from_millis(20)),
        }
    }
    panic!("el run {run_id} nunca apareció en la cola");
}

#[test]
fn install_run_completes_and_row_reaches_installed() {
    let _guard = QUEUE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pool) = TEST_POOL.as_ref().cloned() else {
        eprintln!("skip (no DATABASE_URL)");
        return;
    };
    let h = harness(pool);
    // Ref única por corrida para no chocar con ejecuciones previas.
    let pack_ref = format!("e2e.install.{}@v1", uuid::Uuid::new_v4().simple());
    h.repo
     .upsert_pack(&pack_ref, "1.0.0", "domain", &xyn_packs::catalog::core_domain_manifest())
     .unwrap();

    let (run, installation) = h.repo.request_install(&pack_ref, "default", Some("e2e".into())).unwrap();
    assert_eq!(run.blueprint_ref.as_deref(), Some("xyn.pack.install"));

    let claimed = claim_specific(&h.queue, run.id, "w-e2e");
    let not_lost = AtomicBool::new(false);
    let outcome = h.executor.execute(&claimed, "w-e2e", &not_lost);
    assert_eq!(outcome, RunOutcome::Completed);

    // Fila instalada con todos los invariantes.
    let row = h.repo.get_installation(&pack_ref, "default").unwrap().unwrap();
    assert_eq!(row.status, "installed");
    assert_eq!(row.installed_version.as_deref(), Some("1.0.0"));
    assert_eq!(row.installed_by_run_id, Some(run.id));
    assert_eq!(row.migration_state.as_deref(), Some("0002_links"));
    assert!(row.schema_name.as_deref().unwrap().starts_with("pack_e2e_install"));
    assert_eq!(row.id, installation.id);

    // Cinco steps en orden, todos completados.
    let steps = h.store.list_steps(run.id).unwrap();
    assert_eq!(steps.len(), 5);
    for (i, s) in steps.iter().enumerate() {
        assert_eq!(s.idx, i as i32);
        assert_eq!(s.status, xyn_domain::StepStatus::Completed);
    }

    // Eventos canónicos presentes y correlacionados al run.
    let names: Vec<String> = h.events
                              .list_by_correlation(run.correlation_id)
                              .unwrap()
                              .into_iter()
                              .map(|e| e.event_name)
                              .collect();
    for expected in ["xyn.run.created",
                     "xyn.pack.install.requested",
                     "xyn.run.started",
                     "xyn.pack.install.completed",
                     "xyn.run.completed"]
    {
        assert!(names.contains(&expected.to_string()), "falta {expected} en {names:?}");
    }
}

#[test]
fn install_of_unknown_pack_fails_the_run_terminally() {
    let Some(pool) = TEST_POOL.as_ref().cloned() else {
        eprintln!("skip (no DATABASE_URL)");
        return;
    };
    let h = harness(pool);
    let err = h.repo.request_install("ghost.pack@v1", "default", None).unwrap_err();
    assert!(matches!(err, xyn_persistence::InstallError::PackNotFound(_)));
}

#[test]
fn failed_migration_leaves_failed_row_and_events() {
    let _guard = QUEUE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pool) = TEST_POOL.as_ref().cloned() else {
        eprintln!("skip (no DATABASE_URL)");
        return;
    };
    let h = harness(pool);
    let pack_ref = format!("e2e.badddl.{}@v1", uuid::Uuid::new_v4().simple());
    let mut manifest = xyn_packs::catalog::test_locking_manifest();
    manifest.migrations.push(xyn_domain::PackMigration { id: "0001_broken".into(),
                                                         description: "ddl roto".into(),
                                                         ddl: "CREATE TABLE".into() });
    h.repo.upsert_pack(&pack_ref, "1.0.0", "test", &manifest).unwrap();

    let (run, installation) = h.repo.request_install(&pack_ref, "default", None).unwrap();
    let claimed = claim_specific(&h.queue, run.id, "w-bad");
    let not_lost = AtomicBool::new(false);
    let outcome = h.executor.execute(&claimed, "w-bad", &not_lost);
    assert_eq!(outcome, RunOutcome::Failed(xyn_core::FailDisposition::Terminal));

    let row = h.repo.get_installation(&pack_ref, "default").unwrap().unwrap();
    assert_eq!(row.status, "failed");
    assert!(row.last_error_at.is_some());
    assert_eq!(row.id, installation.id);
    let error = row.error.unwrap();
    assert_eq!(error["kind"], json!("migration_apply_failed"));

    let names: Vec<String> = h.events
                              .list_by_correlation(run.correlation_id)
                              .unwrap()
                              .into_iter()
                              .map(|e| e.event_name)
                              .collect();
    assert!(names.contains(&"xyn.pack.install.failed".to_string()));
    assert!(names.contains(&"xyn.run.failed".to_string()));
}
