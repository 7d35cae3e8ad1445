use stageline::review::{
    CategoryRoute, EscalationManager, EscalationStatus, RejectionCategory, RejectionTracker,
    RouteTable, SmartRouter, DEFAULT_ESCALATION_TARGET, GENERIC_HANDLER,
};
use stageline::shared::ids::PipelineType;
use stageline::store::{Database, EventLog, EventType, NewRun, RunStore, StoreError};
use tempfile::tempdir;

fn setup() -> (tempfile::TempDir, Database) {
    let temp = tempdir().expect("tempdir");
    let db = Database::open(&temp.path().join("engine.db")).expect("open db");
    (temp, db)
}

fn create_run(db: &Database, subject: &str) -> String {
    RunStore::new(db)
        .create(
            NewRun::new(PipelineType::parse("editing").expect("type"), subject),
            1,
        )
        .expect("create run")
        .id
}

fn reject(db: &Database, run_id: &str, category: RejectionCategory, times: usize, start: i64) {
    let tracker = RejectionTracker::new(db);
    for offset in 0..times {
        tracker
            .record_rejection(run_id, category, "not there yet", start + offset as i64)
            .expect("record rejection");
    }
}

#[test]
fn review_rejections_count_per_run_and_category() {
    let (_temp, db) = setup();
    let run_id = create_run(&db, "book-1");
    let tracker = RejectionTracker::new(&db);

    let first = tracker
        .record_rejection(&run_id, RejectionCategory::Style, "passive voice", 10)
        .expect("first");
    let second = tracker
        .record_rejection(&run_id, RejectionCategory::Style, "still passive", 11)
        .expect("second");
    tracker
        .record_rejection(&run_id, RejectionCategory::Clarity, "muddy", 12)
        .expect("clarity");
    assert_eq!(first.retry_count, 1);
    assert_eq!(second.retry_count, 2);
    assert_eq!(
        tracker
            .get_retry_count(&run_id, RejectionCategory::Clarity)
            .expect("count"),
        1
    );
    assert!(!tracker
        .should_escalate(&run_id, RejectionCategory::Style)
        .expect("below threshold"));

    tracker
        .record_rejection(&run_id, RejectionCategory::Style, "third time", 13)
        .expect("third");
    assert!(tracker
        .should_escalate(&run_id, RejectionCategory::Style)
        .expect("at threshold"));

    tracker.resolve_rejection(&first.id).expect("resolve");
    assert_eq!(
        tracker
            .get_retry_count(&run_id, RejectionCategory::Style)
            .expect("count kept"),
        3
    );
    assert_eq!(tracker.rejections_for_run(&run_id).expect("all").len(), 4);
    assert_eq!(tracker.unresolved_rejections(&run_id).expect("open").len(), 3);
    assert!(tracker
        .get_rejection(&first.id)
        .expect("get")
        .expect("exists")
        .resolved);

    let rejected = EventLog::new(&db)
        .events_of_type(&run_id, EventType::Rejected)
        .expect("events");
    assert_eq!(rejected.len(), 4);
    assert_eq!(rejected[1].payload["retryCount"], serde_json::json!(2));

    let missing = tracker.resolve_rejection("rej-missing").expect_err("missing");
    assert!(matches!(missing, StoreError::NotFound { .. }));
}

#[test]
fn review_rejection_threshold_is_configurable() {
    let (_temp, db) = setup();
    let run_id = create_run(&db, "book-1");
    let tracker = RejectionTracker::with_threshold(&db, 1);
    tracker
        .record_rejection(&run_id, RejectionCategory::Scope, "off topic", 10)
        .expect("record");
    assert_eq!(tracker.threshold(RejectionCategory::Scope), 1);
    assert!(tracker
        .should_escalate(&run_id, RejectionCategory::Scope)
        .expect("escalate"));
}

#[test]
fn review_router_picks_handlers_and_escalation_targets() {
    let (_temp, db) = setup();
    let run_id = create_run(&db, "book-1");
    let tracker = RejectionTracker::new(&db);
    let router = SmartRouter::new(&db);

    let first = tracker
        .record_rejection(&run_id, RejectionCategory::Mechanics, "typos", 10)
        .expect("first");
    let decision = router.route_rejection(&first.id).expect("route first");
    assert_eq!(decision.handler, "mechanics-reviewer");
    assert!(!decision.should_escalate);
    assert_eq!(decision.retry_count, 1);
    assert_eq!(decision.metadata.max_retries, 3);
    assert_eq!(decision.metadata.escalation_target, "human-reviewer");

    reject(&db, &run_id, RejectionCategory::Mechanics, 2, 11);
    let decision = router.route_rejection(&first.id).expect("route again");
    assert_eq!(decision.retry_count, 3);
    assert!(decision.should_escalate);
    assert_eq!(decision.handler, "human-reviewer");

    let mut custom = RouteTable::empty();
    custom.set_route(
        RejectionCategory::Style,
        CategoryRoute::new("house-style", 1, "copy-chief"),
    );
    let custom_router = SmartRouter::with_routes(&db, custom);
    assert_eq!(
        custom_router.route(RejectionCategory::Clarity),
        CategoryRoute::new(GENERIC_HANDLER, 3, DEFAULT_ESCALATION_TARGET)
    );
    assert_eq!(custom_router.route(RejectionCategory::Style).handler, "house-style");
}

#[test]
fn review_routing_stats_sum_by_category_and_handler() {
    let (_temp, db) = setup();
    let first = create_run(&db, "book-1");
    let second = create_run(&db, "book-2");
    reject(&db, &first, RejectionCategory::Style, 3, 10);
    reject(&db, &first, RejectionCategory::Scope, 1, 20);
    reject(&db, &second, RejectionCategory::Style, 1, 30);

    let router = SmartRouter::new(&db);
    let stats = router.routing_stats(None).expect("stats");
    assert_eq!(stats.total_routed, 5);
    assert_eq!(stats.by_category[&RejectionCategory::Style], 4);
    assert_eq!(stats.by_category[&RejectionCategory::Clarity], 0);
    assert_eq!(stats.by_handler["style-editor"], 4);
    assert_eq!(stats.by_handler["scope-reviewer"], 1);
    assert_eq!(stats.escalations, 1);

    let scoped = router.routing_stats(Some(&second)).expect("scoped");
    assert_eq!(scoped.total_routed, 1);
    assert_eq!(scoped.escalations, 0);
}

#[test]
fn review_escalation_is_idempotent_per_run_and_category() {
    let (_temp, db) = setup();
    let run_id = create_run(&db, "book-1");
    let manager = EscalationManager::new(&db);

    reject(&db, &run_id, RejectionCategory::Clarity, 2, 10);
    let early = manager
        .check_and_escalate(&run_id, RejectionCategory::Clarity, 20)
        .expect("below threshold");
    assert!(!early.escalated);
    assert!(early.escalation_id.is_none());
    assert_eq!(early.reason, "Retry count (2) has not reached threshold (3)");

    reject(&db, &run_id, RejectionCategory::Clarity, 1, 21);
    let first = manager
        .check_and_escalate(&run_id, RejectionCategory::Clarity, 30)
        .expect("escalate");
    assert!(first.escalated);
    assert_eq!(first.target.as_deref(), Some("senior-editor"));
    assert_eq!(first.reason, "Retry limit (3) exceeded for clarity rejections");

    reject(&db, &run_id, RejectionCategory::Clarity, 1, 31);
    let again = manager
        .check_and_escalate(&run_id, RejectionCategory::Clarity, 40)
        .expect("escalate again");
    assert!(again.escalated);
    assert_eq!(again.escalation_id, first.escalation_id);
    assert_eq!(again.reason, "Already escalated for this run and category");

    assert_eq!(manager.escalations_for_run(&run_id).expect("for run").len(), 1);
    let escalated_events = EventLog::new(&db)
        .events_of_type(&run_id, EventType::Escalated)
        .expect("events");
    assert_eq!(escalated_events.len(), 1);
    assert_eq!(escalated_events[0].actor.as_deref(), Some("senior-editor"));
}

#[test]
fn review_escalation_categories_are_independent() {
    let (_temp, db) = setup();
    let run_id = create_run(&db, "book-1");
    let manager = EscalationManager::new(&db);
    reject(&db, &run_id, RejectionCategory::Style, 3, 10);
    reject(&db, &run_id, RejectionCategory::Scope, 1, 20);

    let style = manager
        .check_and_escalate(&run_id, RejectionCategory::Style, 30)
        .expect("style");
    let scope = manager
        .check_and_escalate(&run_id, RejectionCategory::Scope, 31)
        .expect("scope");
    assert!(style.escalated);
    assert!(!scope.escalated);

    reject(&db, &run_id, RejectionCategory::Scope, 2, 32);
    let scope = manager
        .check_and_escalate(&run_id, RejectionCategory::Scope, 40)
        .expect("scope again");
    assert!(scope.escalated);
    assert_ne!(scope.escalation_id, style.escalation_id);
    assert_eq!(manager.pending_escalations().expect("pending").len(), 2);
}

#[test]
fn review_escalation_lifecycle_and_stats_totals() {
    let (_temp, db) = setup();
    let first = create_run(&db, "book-1");
    let second = create_run(&db, "book-2");
    let manager = EscalationManager::new(&db);
    reject(&db, &first, RejectionCategory::Style, 3, 10);
    reject(&db, &first, RejectionCategory::Mechanics, 3, 20);
    reject(&db, &second, RejectionCategory::Style, 3, 30);

    let style_id = manager
        .check_and_escalate(&first, RejectionCategory::Style, 100)
        .expect("style")
        .escalation_id
        .expect("style id");
    let mechanics_id = manager
        .check_and_escalate(&first, RejectionCategory::Mechanics, 100)
        .expect("mechanics")
        .escalation_id
        .expect("mechanics id");
    manager
        .check_and_escalate(&second, RejectionCategory::Style, 100)
        .expect("second style");

    let acknowledged = manager.acknowledge(&style_id, 110).expect("ack");
    assert_eq!(acknowledged.status, EscalationStatus::Acknowledged);
    let again = manager.acknowledge(&style_id, 120).expect("ack is idempotent");
    assert_eq!(again.acknowledged_at, Some(110));

    let resolved = manager
        .resolve(&mechanics_id, "fixed by hand", 130)
        .expect("resolve");
    assert_eq!(resolved.status, EscalationStatus::Resolved);
    assert_eq!(resolved.resolution.as_deref(), Some("fixed by hand"));
    manager
        .resolve(&mechanics_id, "again", 140)
        .expect("resolve is idempotent");
    let reopened = manager
        .acknowledge(&mechanics_id, 150)
        .expect_err("resolved cannot be acknowledged");
    assert!(matches!(
        reopened,
        StoreError::InvalidEscalationTransition { .. }
    ));

    let stats = manager.escalation_stats().expect("stats");
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_status.values().sum::<u64>(), stats.total);
    assert_eq!(stats.by_category.values().sum::<u64>(), stats.total);
    assert_eq!(stats.by_target.values().sum::<u64>(), stats.total);
    assert_eq!(stats.by_status[&EscalationStatus::Pending], 1);
    assert_eq!(stats.by_target["senior-editor"], 2);
    assert_eq!(stats.avg_acknowledge_seconds, Some(10.0));
    assert_eq!(stats.avg_resolve_seconds, Some(30.0));
    assert_eq!(
        manager
            .get_escalation(&mechanics_id)
            .expect("get")
            .expect("exists")
            .resolved_at,
        Some(130)
    );
}
