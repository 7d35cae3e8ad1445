use serde_json::{json, Map};
use stageline::shared::ids::PipelineType;
use stageline::store::{Database, EventLog, EventType, NewRun, RunStatus, RunStore, StoreError};
use stageline::triggers::{NewTrigger, TriggerCondition, TriggerEngine};
use tempfile::tempdir;

fn pipeline(raw: &str) -> PipelineType {
    PipelineType::parse(raw).expect("pipeline type")
}

fn setup() -> (tempfile::TempDir, Database) {
    let temp = tempdir().expect("tempdir");
    let db = Database::open(&temp.path().join("engine.db")).expect("open db");
    (temp, db)
}

fn complete(db: &Database, run_id: &str, now: i64) {
    let runs = RunStore::new(db);
    runs.update_status(run_id, RunStatus::Running, now)
        .expect("running");
    runs.update_status(run_id, RunStatus::Completed, now + 1)
        .expect("completed");
    EventLog::new(db)
        .append(run_id, EventType::Completed, None, Map::new(), now + 1)
        .expect("completed event");
}

#[test]
fn triggers_chain_three_pipelines_on_one_subject() {
    let (_temp, db) = setup();
    let engine = TriggerEngine::new(&db);
    engine
        .register_trigger(
            NewTrigger::new(
                "w1-to-w2",
                pipeline("w1"),
                pipeline("w2"),
                TriggerCondition::OnComplete,
            ),
            1,
        )
        .expect("w1 trigger");
    engine
        .register_trigger(
            NewTrigger::new(
                "w2-to-w3",
                pipeline("w2"),
                pipeline("w3"),
                TriggerCondition::OnComplete,
            ),
            2,
        )
        .expect("w2 trigger");

    let runs = RunStore::new(&db);
    let first = runs
        .create(NewRun::new(pipeline("w1"), "book-1"), 10)
        .expect("w1 run");
    complete(&db, &first.id, 11);

    let results = engine.check_triggers(&first.id, 20).expect("check w1");
    assert_eq!(results.len(), 1);
    assert!(results[0].triggered);
    assert_eq!(results[0].reason, "Trigger \"w1-to-w2\" fired successfully");
    let second_id = results[0].new_run_id.clone().expect("w2 run id");
    let second = runs.require(&second_id).expect("w2 run");
    assert_eq!(second.pipeline_type, pipeline("w2"));
    assert_eq!(second.subject_id, "book-1");
    assert_eq!(second.status, RunStatus::Pending);

    complete(&db, &second_id, 30);
    let results = engine.check_triggers(&second_id, 40).expect("check w2");
    let third_id = results[0].new_run_id.clone().expect("w3 run id");
    let third = runs.require(&third_id).expect("w3 run");
    assert_eq!(third.pipeline_type, pipeline("w3"));
    assert_eq!(third.subject_id, "book-1");

    complete(&db, &third_id, 50);
    assert!(engine
        .check_triggers(&third_id, 60)
        .expect("check w3")
        .is_empty());
}

#[test]
fn triggers_skip_runs_that_have_not_completed() {
    let (_temp, db) = setup();
    let engine = TriggerEngine::new(&db);
    engine
        .register_trigger(
            NewTrigger::new("next", pipeline("w1"), pipeline("w2"), TriggerCondition::OnComplete),
            1,
        )
        .expect("trigger");
    let run = RunStore::new(&db)
        .create(NewRun::new(pipeline("w1"), "book-1"), 10)
        .expect("run");
    assert!(engine.check_triggers(&run.id, 11).expect("check").is_empty());
}

#[test]
fn triggers_on_approve_requires_approval_evidence() {
    let (_temp, db) = setup();
    let engine = TriggerEngine::new(&db);
    let trigger_id = engine
        .register_trigger(
            NewTrigger::new(
                "publish-approved",
                pipeline("editing"),
                pipeline("publishing"),
                TriggerCondition::OnApprove,
            ),
            1,
        )
        .expect("trigger");

    let runs = RunStore::new(&db);
    let plain = runs
        .create(NewRun::new(pipeline("editing"), "book-1"), 10)
        .expect("plain run");
    complete(&db, &plain.id, 11);
    let results = engine.check_triggers(&plain.id, 12).expect("check plain");
    assert_eq!(results.len(), 1);
    assert!(!results[0].triggered);
    assert_eq!(results[0].trigger_id, trigger_id);
    assert_eq!(results[0].reason, "Condition \"on_approve\" not met");

    let approved = runs
        .create(NewRun::new(pipeline("editing"), "book-2"), 20)
        .expect("approved run");
    complete(&db, &approved.id, 21);
    EventLog::new(&db)
        .append(
            &approved.id,
            EventType::Completed,
            Some("editor"),
            json!({"approved": true})
                .as_object()
                .cloned()
                .expect("object"),
            23,
        )
        .expect("approval event");
    let results = engine
        .check_triggers(&approved.id, 24)
        .expect("check approved");
    assert!(results[0].triggered);
    let chained = runs
        .require(results[0].new_run_id.as_deref().expect("new run"))
        .expect("chained run");
    assert_eq!(chained.subject_id, "book-2");
}

#[test]
fn triggers_manual_and_disabled_are_not_auto_fired() {
    let (_temp, db) = setup();
    let engine = TriggerEngine::new(&db);
    let manual_id = engine
        .register_trigger(
            NewTrigger::new("manual", pipeline("w1"), pipeline("w2"), TriggerCondition::Manual),
            1,
        )
        .expect("manual");
    let disabled_id = engine
        .register_trigger(
            NewTrigger::new("off", pipeline("w1"), pipeline("w3"), TriggerCondition::OnComplete),
            2,
        )
        .expect("disabled");
    engine
        .set_trigger_enabled(&disabled_id, false, 3)
        .expect("disable");

    let run = RunStore::new(&db)
        .create(NewRun::new(pipeline("w1"), "book-1"), 10)
        .expect("run");
    complete(&db, &run.id, 11);
    let results = engine.check_triggers(&run.id, 12).expect("check");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].trigger_id, manual_id);
    assert!(!results[0].triggered);
    assert!(results[0].new_run_id.is_none());

    let fired = engine
        .fire_trigger(&manual_id, "book-7", 13)
        .expect("fire manual");
    assert!(fired.triggered);
    let created = RunStore::new(&db)
        .require(fired.new_run_id.as_deref().expect("run id"))
        .expect("created run");
    assert_eq!(created.subject_id, "book-7");

    let refused = engine
        .fire_trigger(&disabled_id, "book-7", 14)
        .expect("fire disabled");
    assert!(!refused.triggered);
    assert_eq!(refused.reason, "Trigger is disabled");
}

#[test]
fn triggers_admin_surface_lists_and_deletes() {
    let (_temp, db) = setup();
    let engine = TriggerEngine::new(&db);
    let first = engine
        .register_trigger(
            NewTrigger::new("a", pipeline("w1"), pipeline("w2"), TriggerCondition::OnComplete),
            1,
        )
        .expect("a");
    engine
        .register_trigger(
            NewTrigger::new("b", pipeline("w2"), pipeline("w3"), TriggerCondition::OnApprove),
            2,
        )
        .expect("b");

    assert_eq!(engine.list_triggers().expect("list").len(), 2);
    let from_w1 = engine
        .triggers_for_source(&pipeline("w1"))
        .expect("by source");
    assert_eq!(from_w1.len(), 1);
    assert_eq!(from_w1[0].name, "a");
    assert!(from_w1[0].enabled);

    engine.delete_trigger(&first).expect("delete");
    assert!(engine.get_trigger(&first).expect("get").is_none());
    let missing = engine.delete_trigger(&first).expect_err("already gone");
    assert!(matches!(missing, StoreError::NotFound { .. }));
    assert!(engine.set_trigger_enabled(&first, true, 3).is_err());
}
