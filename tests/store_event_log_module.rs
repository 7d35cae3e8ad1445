use serde_json::{json, Map, Value};
use stageline::shared::ids::PipelineType;
use stageline::store::{
    ArtifactRegistry, ConditionSource, Database, EventLog, EventType, NewRun, RunStatus,
    RunStore, StoreConditions, StoreError,
};
use tempfile::tempdir;

fn open_db(temp: &tempfile::TempDir) -> Database {
    Database::open(&temp.path().join("engine.db")).expect("open db")
}

fn create_run(db: &Database, subject: &str) -> String {
    RunStore::new(db)
        .create(
            NewRun::new(PipelineType::parse("drafting").expect("type"), subject),
            1,
        )
        .expect("create run")
        .id
}

fn payload(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object payload")
}

#[test]
fn store_event_log_appends_in_order_and_filters_by_type() {
    let temp = tempdir().expect("tempdir");
    let db = open_db(&temp);
    let run_id = create_run(&db, "book-1");
    let events = EventLog::new(&db);

    events
        .append(&run_id, EventType::Started, None, Map::new(), 10)
        .expect("started");
    events
        .append(
            &run_id,
            EventType::Paused,
            Some("runner"),
            payload(json!({"reason": "gate"})),
            11,
        )
        .expect("paused");
    events
        .append(&run_id, EventType::Resumed, None, Map::new(), 12)
        .expect("resumed");
    events
        .append(&run_id, EventType::Paused, None, payload(json!({"reason": "retry"})), 13)
        .expect("paused again");

    let all = events.events_for_run(&run_id).expect("events");
    let kinds: Vec<EventType> = all.iter().map(|event| event.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::Started,
            EventType::Paused,
            EventType::Resumed,
            EventType::Paused
        ]
    );
    assert!(all.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    assert_eq!(all[1].actor.as_deref(), Some("runner"));

    let paused = events
        .events_of_type(&run_id, EventType::Paused)
        .expect("paused events");
    assert_eq!(paused.len(), 2);
    let latest = events
        .latest_event(&run_id, EventType::Paused)
        .expect("latest")
        .expect("some paused event");
    assert_eq!(latest.payload["reason"], json!("retry"));
    assert!(events
        .latest_event(&run_id, EventType::Completed)
        .expect("latest completed")
        .is_none());
}

#[test]
fn store_event_log_marks_approval_payloads() {
    let temp = tempdir().expect("tempdir");
    let db = open_db(&temp);
    let run_id = create_run(&db, "book-1");
    let events = EventLog::new(&db);

    let plain = events
        .append(&run_id, EventType::Completed, None, Map::new(), 5)
        .expect("plain");
    let approved = events
        .append(
            &run_id,
            EventType::Completed,
            None,
            payload(json!({"approved": true})),
            6,
        )
        .expect("approved");
    assert!(!plain.is_approval());
    assert!(approved.is_approval());
    assert_eq!(EventType::parse("escalated"), Ok(EventType::Escalated));
    assert!(EventType::parse("exploded").is_err());
}

#[test]
fn store_artifacts_register_and_query_by_run_and_type() {
    let temp = tempdir().expect("tempdir");
    let db = open_db(&temp);
    let first = create_run(&db, "book-1");
    let second = create_run(&db, "book-2");
    let artifacts = ArtifactRegistry::new(&db);

    let outline = artifacts
        .register(
            &first,
            "outline",
            "out/outline.md",
            payload(json!({"words": 120})),
            20,
        )
        .expect("outline");
    artifacts
        .register(&first, "draft", "out/draft.md", Map::new(), 21)
        .expect("draft");
    artifacts
        .register(&second, "draft", "out/draft-2.md", Map::new(), 22)
        .expect("second draft");

    let loaded = artifacts
        .get(&outline.id)
        .expect("get")
        .expect("outline exists");
    assert_eq!(loaded.metadata["words"], json!(120));
    assert_eq!(artifacts.by_run(&first).expect("by run").len(), 2);
    assert_eq!(artifacts.by_type("draft").expect("by type").len(), 2);
    let scoped = artifacts
        .by_run_and_type(&second, "draft")
        .expect("by run and type");
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].artifact_path, "out/draft-2.md");

    let blank = artifacts
        .register(&first, "draft", "   ", Map::new(), 23)
        .expect_err("blank path");
    assert!(matches!(blank, StoreError::InvalidArtifactPath));
}

#[test]
fn store_conditions_answer_precondition_queries() {
    let temp = tempdir().expect("tempdir");
    let db = open_db(&temp);
    let run_id = create_run(&db, "book-1");
    let conditions = StoreConditions::new(&db);

    assert!(!conditions.plan_exists(&run_id).expect("plan"));
    assert!(!conditions.artifacts_exist(&run_id).expect("artifacts"));
    assert!(!conditions.version_exists("v-1").expect("version"));

    conditions.register_plan(&run_id, 2).expect("register plan");
    conditions
        .register_version("v-1", "book-1", 3)
        .expect("register version");
    ArtifactRegistry::new(&db)
        .register(&run_id, "outline", "out/outline.md", Map::new(), 4)
        .expect("artifact");

    assert!(conditions.plan_exists(&run_id).expect("plan"));
    assert!(conditions.artifacts_exist(&run_id).expect("artifacts"));
    assert!(conditions.version_exists("v-1").expect("version"));
    let version = conditions
        .get_version("v-1")
        .expect("get version")
        .expect("version exists");
    assert_eq!(version.subject_id, "book-1");
    assert_eq!(
        conditions.run_status(&run_id).expect("status"),
        Some(RunStatus::Pending)
    );
    assert_eq!(conditions.run_status("run-missing").expect("status"), None);
}
