//! Integration tests for tracker lifecycle guarantees

use asktrack::clock::ManualClock;
use asktrack::status::ChartStatus;
use asktrack::testing::{fixtures, MockAiService, RecordingTelemetry};
use asktrack::{
    AdjustmentTaskTracker, AggregateKey, AggregateStore, AppConfig, MemoryStore, PollOutcome,
    RecordKey, RecordPatch, RemoteResult, Services, TaskInput, TaskKind, TaskRecord, TrackerHub,
    TrackerOptions,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    hub: TrackerHub,
    ai: Arc<MockAiService>,
    store: Arc<MemoryStore>,
    telemetry: Arc<RecordingTelemetry>,
}

fn harness() -> Harness {
    let ai = Arc::new(MockAiService::new());
    let store = Arc::new(MemoryStore::new());
    let telemetry = Arc::new(RecordingTelemetry::new());
    let hub = TrackerHub::from_config(
        &AppConfig::default(),
        Services::new(ai.clone(), store.clone()),
        telemetry.clone(),
    );
    Harness {
        hub,
        ai,
        store,
        telemetry,
    }
}

async fn tick(hub: &TrackerHub) -> Vec<PollOutcome> {
    let mut outcomes = Vec::new();
    for tick in hub.tick_all() {
        outcomes.extend(tick.wait().await);
    }
    outcomes
}

#[tokio::test]
async fn test_ask_detail_end_to_end() {
    let h = harness();
    let parent = AggregateKey::thread_response(1);
    h.ai.queue_query_id("q1");

    let snapshot = h
        .hub
        .submit(TaskKind::AskDetail, parent, TaskInput::question("how many orders shipped?"))
        .await
        .unwrap();
    assert_eq!(snapshot.query_id, "q1");
    assert_eq!(snapshot.status, "UNDERSTANDING");

    // Tick 1: status unchanged, nothing written
    h.ai.push_status("q1", "UNDERSTANDING");
    assert_eq!(tick(&h.hub).await, vec![PollOutcome::Unchanged]);
    assert_eq!(h.store.update_count(), 0);
    assert!(h.hub.find_task(TaskKind::AskDetail, "q1").is_some());

    // Tick 2: finished
    h.ai.push_response("q1", "FINISHED", fixtures::ask_detail_response());
    assert_eq!(
        tick(&h.hub).await,
        vec![PollOutcome::Finalized { succeeded: true }]
    );

    let record = h
        .store
        .get(&RecordKey::new(parent, TaskKind::AskDetail))
        .unwrap();
    assert_eq!(record.status.as_deref(), Some("FINISHED"));
    let steps = record.detail.unwrap()["steps"].as_array().unwrap().clone();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["sql"], "SELECT 1");
    assert_eq!(steps[0]["cteName"], "c0");

    assert!(h.hub.find_task(TaskKind::AskDetail, "q1").is_none());
    assert!(h.hub.get_tasks().is_empty());

    let events = h.telemetry.named("question_answered");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].properties["question"], "how many orders shipped?");
    assert_eq!(events[0].service.as_deref(), Some("ai_service"));
    assert!(events[0].success);
}

#[tokio::test]
async fn test_unchanged_polls_never_write() {
    let h = harness();
    let parent = AggregateKey::thread_response(2);
    h.ai.queue_query_id("a1");
    h.hub
        .submit(TaskKind::Ask, parent, TaskInput::question("top products"))
        .await
        .unwrap();

    for status in ["UNDERSTANDING", "UNDERSTANDING", "SEARCHING", "SEARCHING", "SEARCHING", "GENERATING"] {
        h.ai.push_status("a1", status);
    }
    for _ in 0..6 {
        tick(&h.hub).await;
    }

    // one write per transition: SEARCHING, GENERATING
    assert_eq!(h.store.update_count(), 2);
    let task = h.hub.find_task(TaskKind::Ask, "a1").unwrap();
    assert_eq!(task.status, "GENERATING");
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_is_not_polled_twice() {
    let h = harness();
    let parent = AggregateKey::thread_response(3);
    h.ai.queue_query_id("c1");
    h.hub
        .submit(TaskKind::Chart, parent, TaskInput::default())
        .await
        .unwrap();
    h.ai.push_status("c1", "GENERATING");
    h.ai.set_delay("c1", Duration::from_millis(1500));

    let first = h.hub.chart().tick();
    assert_eq!(first.dispatched, 1);

    let second = h.hub.chart().tick();
    assert_eq!(second.dispatched, 0);
    assert_eq!(second.skipped, 1);

    assert_eq!(first.wait().await, vec![PollOutcome::Updated]);
    assert!(second.wait().await.is_empty());
    assert_eq!(h.ai.fetch_count("c1"), 1);
    assert_eq!(h.ai.max_concurrent_fetches("c1"), 1);

    // the guard is released once the slow poll lands
    assert_eq!(h.hub.chart().tick().dispatched, 1);
}

#[tokio::test(start_paused = true)]
async fn test_running_loop_skips_ticks_while_fetch_in_flight() {
    let h = harness();
    h.ai.queue_query_id("c1");
    h.hub
        .submit(TaskKind::Chart, AggregateKey::thread_response(4), TaskInput::default())
        .await
        .unwrap();
    h.ai.push_status("c1", "GENERATING");
    h.ai.set_delay("c1", Duration::from_millis(2500));

    let handle = h.hub.chart().start();
    tokio::time::sleep(Duration::from_millis(5600)).await;
    h.hub.chart().stop();
    handle.await.unwrap();

    assert_eq!(h.ai.max_concurrent_fetches("c1"), 1);
    assert!(h.ai.fetch_count("c1") <= 3);
}

#[tokio::test]
async fn test_transient_errors_then_finish_emit_once() {
    let h = harness();
    let parent = AggregateKey::thread_response(5);
    h.ai.queue_query_id("q5");
    h.hub
        .submit(TaskKind::AskDetail, parent, TaskInput::question("revenue by region"))
        .await
        .unwrap();

    h.ai.push_transient("q5", "connection reset");
    h.ai.push_transient("q5", "connection reset");
    h.ai.push_response("q5", "FINISHED", fixtures::ask_detail_response());

    assert_eq!(tick(&h.hub).await, vec![PollOutcome::Failed]);
    let task = h.hub.find_task(TaskKind::AskDetail, "q5").unwrap();
    assert_eq!(task.consecutive_failures, 1);
    assert!(!task.stuck);

    assert_eq!(tick(&h.hub).await, vec![PollOutcome::Failed]);
    assert_eq!(
        tick(&h.hub).await,
        vec![PollOutcome::Finalized { succeeded: true }]
    );

    // nothing left to poll; the scripted FINISHED would repeat if it were
    for _ in 0..3 {
        assert!(tick(&h.hub).await.is_empty());
    }
    assert_eq!(h.telemetry.named("question_answered").len(), 1);
    assert_eq!(h.telemetry.events().len(), 1);
}

#[tokio::test]
async fn test_cancel_is_observed_on_next_poll() {
    let h = harness();
    let parent = AggregateKey::thread_response(6);
    h.ai.queue_query_id("c6");
    h.hub
        .submit(TaskKind::Chart, parent, TaskInput::default())
        .await
        .unwrap();
    h.ai.push_status("c6", "GENERATING");
    tick(&h.hub).await;

    h.hub.cancel(TaskKind::Chart, "c6").await.unwrap();
    assert_eq!(h.ai.cancelled(), vec![(TaskKind::Chart, "c6".to_string())]);

    let task = h.hub.find_task(TaskKind::Chart, "c6").unwrap();
    assert_eq!(task.status, ChartStatus::Generating.to_string());

    assert_eq!(
        tick(&h.hub).await,
        vec![PollOutcome::Finalized { succeeded: false }]
    );
    assert!(h.hub.find_task(TaskKind::Chart, "c6").is_none());

    let record = h.store.get(&RecordKey::new(parent, TaskKind::Chart)).unwrap();
    assert_eq!(record.status.as_deref(), Some("STOPPED"));

    let events = h.telemetry.named("chart_generated");
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
}

#[tokio::test]
async fn test_cancel_unsupported_kind_is_rejected() {
    let h = harness();
    h.ai.queue_query_id("e1");
    h.hub
        .submit(TaskKind::Explain, AggregateKey::thread_response(7), TaskInput::default())
        .await
        .unwrap();

    let err = h.hub.cancel(TaskKind::Explain, "e1").await.unwrap_err();
    assert_eq!(err.error_code(), "CANCEL_ERROR");
    assert!(h.hub.find_task(TaskKind::Explain, "e1").is_some());
}

async fn seed_answer(store: &MemoryStore, parent: AggregateKey) {
    let key = RecordKey::new(parent, TaskKind::AskDetail);
    store
        .insert(TaskRecord::new(key, "d1", "FINISHED", TaskInput::question("top customers")))
        .await
        .unwrap();
    store
        .update_one(&key, RecordPatch::detail(fixtures::two_step_detail()))
        .await
        .unwrap();
}

fn reference_ids(step: &Value) -> Vec<u64> {
    step["references"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["referenceId"].as_u64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_explain_stitches_references_into_answer() {
    let h = harness();
    let parent = AggregateKey::thread_response(8);
    seed_answer(&h.store, parent).await;

    h.ai.queue_query_id("e8");
    h.hub
        .submit(
            TaskKind::Explain,
            parent,
            TaskInput::default().with_payload(json!({"analysis": fixtures::explain_analysis()})),
        )
        .await
        .unwrap();
    h.ai.push_response("e8", "FINISHED", fixtures::explain_response());
    tick(&h.hub).await;

    let detail = h
        .store
        .get(&RecordKey::new(parent, TaskKind::AskDetail))
        .unwrap()
        .detail
        .unwrap();
    let steps = detail["steps"].as_array().unwrap();
    assert_eq!(reference_ids(&steps[0]), vec![1, 2]);
    assert_eq!(reference_ids(&steps[1]), vec![3]);
    assert_eq!(detail["description"], "top customers by order total");

    for step in steps {
        for reference in step["references"].as_array().unwrap() {
            assert!(reference.get("id").is_none());
        }
    }
    assert_eq!(steps[0]["references"][0]["type"], "RELATION");
    assert_eq!(steps[0]["references"][0]["sqlLocation"]["column"], 38);

    let explain = h.store.get(&RecordKey::new(parent, TaskKind::Explain)).unwrap();
    assert_eq!(explain.status.as_deref(), Some("FINISHED"));
    assert!(explain.merge_error.is_none());
}

#[tokio::test]
async fn test_explain_merge_failure_is_recorded_and_task_retired() {
    let h = harness();
    let parent = AggregateKey::thread_response(9);
    h.ai.queue_query_id("e9");
    h.hub
        .submit(TaskKind::Explain, parent, TaskInput::default())
        .await
        .unwrap();
    h.ai.push_response("e9", "FINISHED", fixtures::explain_response());

    assert_eq!(
        tick(&h.hub).await,
        vec![PollOutcome::Finalized { succeeded: true }]
    );
    let record = h.store.get(&RecordKey::new(parent, TaskKind::Explain)).unwrap();
    assert_eq!(record.status.as_deref(), Some("FINISHED"));
    assert_eq!(record.merge_error.unwrap()["code"], "MERGE_ERROR");
    assert!(h.hub.find_task(TaskKind::Explain, "e9").is_none());
    assert_eq!(h.telemetry.named("sql_explained").len(), 1);
}

#[tokio::test]
async fn test_failed_job_persists_remote_error() {
    let h = harness();
    let parent = AggregateKey::thread_response(10);
    h.ai.queue_query_id("a10");
    h.hub
        .submit(TaskKind::Ask, parent, TaskInput::question("?"))
        .await
        .unwrap();
    h.ai.push_failure("a10", "NO_RELEVANT_DATA", "no tables match");
    tick(&h.hub).await;

    let record = h.store.get(&RecordKey::new(parent, TaskKind::Ask)).unwrap();
    assert_eq!(record.status.as_deref(), Some("FAILED"));
    assert_eq!(record.error.unwrap()["code"], "NO_RELEVANT_DATA");

    let events = h.telemetry.named("ask_candidates_generated");
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert_eq!(events[0].properties["error"]["message"], "no tables match");
}

#[tokio::test]
async fn test_adjustment_retention_window() {
    let ai = Arc::new(MockAiService::new());
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new());
    let tracker = AdjustmentTaskTracker::with_clock(
        Services::new(ai.clone(), store),
        Arc::new(RecordingTelemetry::new()),
        TrackerOptions::default().with_retention(chrono::Duration::seconds(120)),
        clock.clone(),
    );
    let parent = AggregateKey::thread_response(11);

    ai.queue_query_id("adj");
    tracker
        .create(parent, TaskInput::question("exclude refunds"))
        .await
        .unwrap();
    ai.push_response("adj", "FINISHED", fixtures::adjustment_response());
    tracker.tick().wait().await;

    let retained = tracker.get_by_query_id("adj").unwrap();
    assert!(retained.is_finalized());
    assert_eq!(
        retained.result.unwrap()["sql"],
        "SELECT * FROM orders WHERE status = 'paid'"
    );

    clock.advance(chrono::Duration::seconds(119));
    let _ = tracker.tick();
    assert!(tracker.get_by_query_id("adj").is_some());
    assert!(tracker.get_by_parent(&parent).is_some());

    clock.advance(chrono::Duration::seconds(1));
    let swept = tracker.tick();
    assert_eq!(swept.evicted, vec!["adj".to_string()]);
    assert!(tracker.get_by_query_id("adj").is_none());
    assert!(tracker.get_by_parent(&parent).is_none());
}

#[tokio::test]
async fn test_sibling_failure_does_not_block_others() {
    let h = harness();
    h.ai.queue_query_id("bad");
    h.ai.queue_query_id("good");
    h.hub
        .submit(TaskKind::Ask, AggregateKey::thread_response(12), TaskInput::default())
        .await
        .unwrap();
    h.hub
        .submit(TaskKind::Ask, AggregateKey::thread_response(13), TaskInput::default())
        .await
        .unwrap();
    h.ai.push_rejection("bad", 404, "no such job");
    h.ai.push_response("good", "FINISHED", fixtures::ask_response());

    let mut outcomes = tick(&h.hub).await;
    outcomes.sort_by_key(|o| matches!(o, PollOutcome::Failed));
    assert_eq!(
        outcomes,
        vec![PollOutcome::Finalized { succeeded: true }, PollOutcome::Failed]
    );

    let bad = h.hub.find_task(TaskKind::Ask, "bad").unwrap();
    assert!(bad.stuck);
    assert!(h.hub.find_task(TaskKind::Ask, "good").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_rerun_drops_result_of_in_flight_poll() {
    let h = harness();
    let parent = AggregateKey::thread_response(14);
    let key = RecordKey::new(parent, TaskKind::Adjustment);
    h.ai.queue_query_id("adj-1");
    h.hub
        .adjustment()
        .create(parent, TaskInput::question("only paid orders"))
        .await
        .unwrap();

    // adj-1 finishes, but slowly
    h.ai.push_response("adj-1", "FINISHED", fixtures::adjustment_response());
    h.ai.set_delay("adj-1", Duration::from_millis(1500));
    let stale = h.hub.adjustment().tick();
    assert_eq!(stale.dispatched, 1);
    tokio::task::yield_now().await;

    h.ai.queue_query_id("adj-2");
    let rerun = h.hub.adjustment().rerun(parent).await.unwrap();
    assert_eq!(rerun.query_id, "adj-2");

    assert_eq!(stale.wait().await, vec![PollOutcome::Superseded]);
    assert_eq!(h.ai.fetch_count("adj-1"), 1);

    let record = h.store.get(&key).unwrap();
    assert_eq!(record.query_id.as_deref(), Some("adj-2"));
    assert_eq!(record.status.as_deref(), Some("UNDERSTANDING"));
    assert!(record.detail.is_none());
    assert!(h.telemetry.named("sql_adjusted").is_empty());
    assert!(h.hub.adjustment().get_by_query_id("adj-1").is_none());

    // the replacement is tracked and persisted as usual
    h.ai.push_status("adj-2", "GENERATING");
    assert_eq!(
        h.hub.adjustment().tick().wait().await,
        vec![PollOutcome::Updated]
    );
    assert_eq!(h.store.get(&key).unwrap().status.as_deref(), Some("GENERATING"));

    h.ai.push_response("adj-2", "FINISHED", fixtures::adjustment_response());
    assert_eq!(
        h.hub.adjustment().tick().wait().await,
        vec![PollOutcome::Finalized { succeeded: true }]
    );
    let record = h.store.get(&key).unwrap();
    assert_eq!(record.status.as_deref(), Some("FINISHED"));
    assert_eq!(record.query_id.as_deref(), Some("adj-2"));

    let events = h.telemetry.named("sql_adjusted");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].properties["query_id"], "adj-2");
}

#[tokio::test(start_paused = true)]
async fn test_resubmitted_recommendations_replace_previous_job() {
    let h = harness();
    let parent = AggregateKey::thread_response(15);
    let key = RecordKey::new(parent, TaskKind::RecommendQuestions);
    h.ai.queue_query_id("r1");
    h.ai.queue_query_id("r2");

    h.hub
        .submit(TaskKind::RecommendQuestions, parent, TaskInput::default())
        .await
        .unwrap();
    h.ai.push_response("r1", "FINISHED", fixtures::recommend_response());
    h.ai.set_delay("r1", Duration::from_millis(1500));
    let stale = h.hub.recommend().tick();
    assert_eq!(stale.dispatched, 1);
    tokio::task::yield_now().await;

    h.hub
        .submit(TaskKind::RecommendQuestions, parent, TaskInput::default())
        .await
        .unwrap();
    assert!(h.hub.find_task(TaskKind::RecommendQuestions, "r1").is_none());
    assert_eq!(
        h.hub
            .find_task(TaskKind::RecommendQuestions, "r2")
            .unwrap()
            .query_id,
        "r2"
    );
    assert_eq!(h.hub.recommend().get_tasks().len(), 1);

    assert_eq!(stale.wait().await, vec![PollOutcome::Superseded]);
    let record = h.store.get(&key).unwrap();
    assert_eq!(record.query_id.as_deref(), Some("r2"));
    assert_eq!(record.status.as_deref(), Some("NOT_STARTED"));
    assert!(h.telemetry.named("questions_recommended").is_empty());

    h.ai.push_response("r2", "FINISHED", fixtures::recommend_response());
    assert_eq!(
        h.hub.recommend().tick().wait().await,
        vec![PollOutcome::Finalized { succeeded: true }]
    );
    let record = h.store.get(&key).unwrap();
    assert_eq!(record.status.as_deref(), Some("FINISHED"));
    assert_eq!(record.detail.unwrap()["questions"].as_array().unwrap().len(), 2);
    assert_eq!(h.telemetry.named("questions_recommended").len(), 1);
}

#[tokio::test]
async fn test_top_level_result_fields_reach_record_and_telemetry() {
    let h = harness();
    let parent = AggregateKey::thread_response(16);
    h.ai.queue_query_id("a16");
    h.hub
        .submit(TaskKind::Ask, parent, TaskInput::question("orders by customer"))
        .await
        .unwrap();
    h.ai.push_result(
        "a16",
        RemoteResult::status("FINISHED")
            .with_response(json!({"type": "TEXT_TO_SQL", "candidates": [{"sql": "SELECT 1"}]}))
            .with_extra("retrievedTables", json!(["orders", "customers"])),
    );

    assert_eq!(
        tick(&h.hub).await,
        vec![PollOutcome::Finalized { succeeded: true }]
    );
    let detail = h
        .store
        .get(&RecordKey::new(parent, TaskKind::Ask))
        .unwrap()
        .detail
        .unwrap();
    assert_eq!(detail["retrievedTables"][1], "customers");
    assert_eq!(detail["candidates"][0]["sql"], "SELECT 1");

    let events = h.telemetry.named("ask_candidates_generated");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].properties["retrieved_tables"][0], "orders");
    assert_eq!(events[0].properties["candidates"], 1);
}
