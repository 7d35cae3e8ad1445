use stageline::shared::ids::PipelineType;
use serde_json::{json, Map};
use stageline::store::{
    Database, EventLog, EventType, NewRun, RunFilter, RunStatus, RunStore, StoreError,
    RUN_STATUSES,
};
use tempfile::tempdir;

fn pipeline(raw: &str) -> PipelineType {
    PipelineType::parse(raw).expect("pipeline type")
}

#[test]
fn store_database_open_creates_schema_under_missing_parent() {
    let temp = tempdir().expect("tempdir");
    let db = Database::open(&temp.path().join("state/nested/engine.db")).expect("open db");
    let tables = db.table_names().expect("table names");
    for expected in [
        "checkpoints",
        "escalations",
        "rejections",
        "workflow_artifacts",
        "workflow_events",
        "workflow_runs",
        "workflow_triggers",
    ] {
        assert!(tables.iter().any(|name| name == expected), "missing {expected}");
    }
    db.ensure_schema().expect("schema is idempotent");
}

#[test]
fn store_run_status_table_allows_only_documented_moves() {
    let allowed = [
        (RunStatus::Pending, RunStatus::Running),
        (RunStatus::Running, RunStatus::Paused),
        (RunStatus::Running, RunStatus::Completed),
        (RunStatus::Running, RunStatus::Failed),
        (RunStatus::Paused, RunStatus::Running),
        (RunStatus::Paused, RunStatus::Failed),
    ];
    for from in RUN_STATUSES {
        for to in RUN_STATUSES {
            assert_eq!(
                from.can_transition_to(to),
                allowed.contains(&(from, to)),
                "{from} -> {to}"
            );
        }
    }
    assert!(RunStatus::Completed.is_terminal());
    assert!(RunStatus::Failed.valid_transitions().is_empty());
}

#[test]
fn store_run_store_creates_pending_runs_and_enforces_transitions() {
    let temp = tempdir().expect("tempdir");
    let db = Database::open(&temp.path().join("engine.db")).expect("open db");
    let runs = RunStore::new(&db);

    let run = runs
        .create(
            NewRun::new(pipeline("drafting"), "book-1").with_input_version("v-1"),
            100,
        )
        .expect("create run");
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.input_version_id.as_deref(), Some("v-1"));
    assert!(run.id.starts_with("run-"));

    let err = runs
        .update_status(&run.id, RunStatus::Completed, 101)
        .expect_err("pending cannot complete");
    assert!(matches!(
        err,
        StoreError::InvalidTransition {
            from: RunStatus::Pending,
            to: RunStatus::Completed,
            ..
        }
    ));
    assert_eq!(
        runs.require(&run.id).expect("reload").status,
        RunStatus::Pending
    );

    let running = runs
        .update_status(&run.id, RunStatus::Running, 102)
        .expect("start");
    assert_eq!(running.status, RunStatus::Running);
    assert_eq!(running.updated_at, 102);

    let same = runs
        .update_status(&run.id, RunStatus::Running, 103)
        .expect_err("same-state move is rejected");
    assert!(matches!(same, StoreError::InvalidTransition { .. }));
}

#[test]
fn store_run_store_lists_with_filters_and_tracks_links() {
    let temp = tempdir().expect("tempdir");
    let db = Database::open(&temp.path().join("engine.db")).expect("open db");
    let runs = RunStore::new(&db);

    let first = runs
        .create(NewRun::new(pipeline("drafting"), "book-1"), 10)
        .expect("first");
    let second = runs
        .create(NewRun::new(pipeline("editing"), "book-1"), 20)
        .expect("second");
    runs.create(NewRun::new(pipeline("drafting"), "book-2"), 30)
        .expect("third");
    runs.update_status(&second.id, RunStatus::Running, 21)
        .expect("run second");

    let by_subject = runs
        .list(&RunFilter {
            subject_id: Some("book-1".to_string()),
            ..RunFilter::default()
        })
        .expect("by subject");
    let ids: Vec<&str> = by_subject.iter().map(|run| run.id.as_str()).collect();
    assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);

    let running = runs
        .list(&RunFilter {
            status: Some(RunStatus::Running),
            ..RunFilter::default()
        })
        .expect("by status");
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, second.id);

    let drafting = runs
        .list(&RunFilter {
            pipeline_type: Some(pipeline("drafting")),
            subject_id: Some("book-2".to_string()),
            ..RunFilter::default()
        })
        .expect("combined filter");
    assert_eq!(drafting.len(), 1);

    runs.set_current_agent(&first.id, Some("writer"), 40)
        .expect("agent");
    runs.link_output_version(&first.id, "v-9", 41)
        .expect("output version");
    let reloaded = runs.require(&first.id).expect("reload");
    assert_eq!(reloaded.current_agent.as_deref(), Some("writer"));
    assert_eq!(reloaded.output_version_id.as_deref(), Some("v-9"));

    let missing = runs.require("run-missing").expect_err("missing run");
    assert!(matches!(missing, StoreError::NotFound { .. }));
    assert!(runs
        .link_output_version("run-missing", "v-1", 42)
        .is_err());
}

#[test]
fn store_run_store_commits_status_and_lifecycle_event_together() {
    let temp = tempdir().expect("tempdir");
    let db = Database::open(&temp.path().join("engine.db")).expect("open db");
    let runs = RunStore::new(&db);
    let events = EventLog::new(&db);
    let run = runs
        .create(NewRun::new(pipeline("drafting"), "book-1"), 100)
        .expect("create run");

    let mut payload = Map::new();
    payload.insert("step".to_string(), json!("outline"));
    let (started, event) = runs
        .update_status_with_event(&run.id, RunStatus::Running, EventType::Started, payload, 101)
        .expect("start run");
    assert_eq!(started.status, RunStatus::Running);
    assert_eq!(event.event_type, EventType::Started);
    assert_eq!(event.payload.get("step"), Some(&json!("outline")));

    let err = runs
        .update_status_with_event(&run.id, RunStatus::Pending, EventType::Resumed, Map::new(), 102)
        .expect_err("running cannot return to pending");
    assert!(matches!(err, StoreError::InvalidTransition { .. }));

    let recorded = events.events_for_run(&run.id).expect("events");
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].event_type, EventType::Started);
    assert_eq!(
        runs.require(&run.id).expect("reload").status,
        RunStatus::Running
    );
}
