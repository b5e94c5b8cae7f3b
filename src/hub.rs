//! One tracker per job kind, wired to shared services.
//!
//! [`TrackerHub`] is what request handlers and the binary talk to: it
//! submits and cancels jobs by kind, re-hydrates unfinished jobs from the
//! store at start-up, and starts and stops every tracker loop together.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::error::Result;
use crate::store::{self, TaskRecord};
use crate::task::{AggregateKey, TaskInput, TaskKind, TaskSnapshot};
use crate::telemetry::Telemetry;
use crate::tracker::{
    AdjustmentTaskTracker, AskDetailStrategy, AskStrategy, ChartStrategy, DispatchedTick,
    ExplainStrategy, RecommendStrategy, Services, Tracker, TrackerOptions, TrackerStrategy,
};

/// Run `$body` with `$t` bound to the tracker for `$kind`.
macro_rules! with_tracker {
    ($hub:expr, $kind:expr, |$t:ident| $body:expr) => {
        match $kind {
            TaskKind::Ask => {
                let $t = &$hub.ask;
                $body
            }
            TaskKind::AskDetail => {
                let $t = &$hub.ask_detail;
                $body
            }
            TaskKind::Explain => {
                let $t = &$hub.explain;
                $body
            }
            TaskKind::Chart => {
                let $t = &$hub.chart;
                $body
            }
            TaskKind::ChartAdjustment => {
                let $t = &$hub.chart_adjustment;
                $body
            }
            TaskKind::RecommendQuestions => {
                let $t = &$hub.recommend;
                $body
            }
            TaskKind::Adjustment => {
                let $t = $hub.adjustment.tracker();
                $body
            }
        }
    };
}

/// All trackers of one process.
pub struct TrackerHub {
    services: Services,
    ask: Tracker<AskStrategy>,
    ask_detail: Tracker<AskDetailStrategy>,
    explain: Tracker<ExplainStrategy>,
    chart: Tracker<ChartStrategy>,
    chart_adjustment: Tracker<ChartStrategy>,
    recommend: Tracker<RecommendStrategy>,
    adjustment: AdjustmentTaskTracker,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TrackerHub {
    /// Build every tracker with the polling settings from `config`.
    #[must_use]
    pub fn from_config(config: &AppConfig, services: Services, telemetry: Arc<dyn Telemetry>) -> Self {
        Self::new(
            services,
            telemetry,
            config.tracker_options(),
            config.adjustment_options(),
        )
    }

    #[must_use]
    pub fn new(
        services: Services,
        telemetry: Arc<dyn Telemetry>,
        options: TrackerOptions,
        adjustment_options: TrackerOptions,
    ) -> Self {
        Self::with_clock(services, telemetry, options, adjustment_options, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        services: Services,
        telemetry: Arc<dyn Telemetry>,
        options: TrackerOptions,
        adjustment_options: TrackerOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ask: build(AskStrategy::new(services.clone()), &telemetry, &options, &clock),
            ask_detail: build(AskDetailStrategy::new(services.clone()), &telemetry, &options, &clock),
            explain: build(ExplainStrategy::new(services.clone()), &telemetry, &options, &clock),
            chart: build(ChartStrategy::new(services.clone()), &telemetry, &options, &clock),
            chart_adjustment: build(
                ChartStrategy::adjustment(services.clone()),
                &telemetry,
                &options,
                &clock,
            ),
            recommend: build(RecommendStrategy::new(services.clone()), &telemetry, &options, &clock),
            adjustment: AdjustmentTaskTracker::with_clock(
                services.clone(),
                Arc::clone(&telemetry),
                adjustment_options,
                Arc::clone(&clock),
            ),
            services,
            handles: Mutex::new(Vec::new()),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[must_use]
    pub fn services(&self) -> &Services {
        &self.services
    }

    #[must_use]
    pub fn ask(&self) -> &Tracker<AskStrategy> {
        &self.ask
    }

    #[must_use]
    pub fn ask_detail(&self) -> &Tracker<AskDetailStrategy> {
        &self.ask_detail
    }

    #[must_use]
    pub fn explain(&self) -> &Tracker<ExplainStrategy> {
        &self.explain
    }

    #[must_use]
    pub fn chart(&self) -> &Tracker<ChartStrategy> {
        &self.chart
    }

    #[must_use]
    pub fn chart_adjustment(&self) -> &Tracker<ChartStrategy> {
        &self.chart_adjustment
    }

    #[must_use]
    pub fn recommend(&self) -> &Tracker<RecommendStrategy> {
        &self.recommend
    }

    #[must_use]
    pub fn adjustment(&self) -> &AdjustmentTaskTracker {
        &self.adjustment
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start every tracker loop.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for kind in TaskKind::all() {
            handles.push(with_tracker!(self, kind, |t| t.start()));
        }
        info!(trackers = handles.len(), "Trackers started");
    }

    /// Stop every tracker loop and wait for them to exit.
    pub async fn shutdown(&self) {
        for kind in TaskKind::all() {
            with_tracker!(self, kind, |t| t.stop());
        }
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Tracker loop ended abnormally");
            }
        }
        info!("Trackers stopped");
    }

    /// Run one tick on every tracker.
    pub fn tick_all(&self) -> Vec<DispatchedTick> {
        TaskKind::all()
            .into_iter()
            .map(|kind| with_tracker!(self, kind, |t| t.tick()))
            .collect()
    }

    /// Re-register every unfinished job found in the store.
    ///
    /// Records whose status cannot be parsed are skipped with a warning.
    /// Returns the number of tasks registered.
    pub async fn rehydrate(&self) -> Result<usize> {
        let records = self.services.store.find_all().await?;
        let mut restored = 0;
        for record in &records {
            match with_tracker!(self, record.key.kind, |t| t.rehydrate_record(record).map(|task| task.is_some())) {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => warn!(record = %record.key, error = %e, "Skipping record with unusable status"),
            }
        }
        info!(restored, records = records.len(), "Re-hydrated unfinished tasks");
        Ok(restored)
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Start a job of `kind` for `parent` and track it.
    pub async fn submit(&self, kind: TaskKind, parent: AggregateKey, input: TaskInput) -> Result<TaskSnapshot> {
        with_tracker!(self, kind, |t| t
            .submit(parent, input)
            .await
            .map(|task| TaskSnapshot::from(&task)))
    }

    /// Ask the AI service to stop a job. Local state follows on the next poll.
    pub async fn cancel(&self, kind: TaskKind, query_id: &str) -> Result<()> {
        with_tracker!(self, kind, |t| t.cancel(query_id).await)
    }

    /// Every actively polled task, all kinds.
    #[must_use]
    pub fn get_tasks(&self) -> Vec<TaskSnapshot> {
        TaskKind::all()
            .into_iter()
            .flat_map(|kind| {
                with_tracker!(self, kind, |t| t
                    .get_tasks()
                    .iter()
                    .map(TaskSnapshot::from)
                    .collect::<Vec<_>>())
            })
            .collect()
    }

    /// Look up an active (or retained) task by kind and query id.
    #[must_use]
    pub fn find_task(&self, kind: TaskKind, query_id: &str) -> Option<TaskSnapshot> {
        with_tracker!(self, kind, |t| t.get_by_query_id(query_id).as_ref().map(TaskSnapshot::from))
    }

    /// Persisted records that have not reached a terminal status.
    pub async fn pending_records(&self) -> Result<Vec<TaskRecord>> {
        store::pending(self.services.store.as_ref()).await
    }
}

fn build<S: TrackerStrategy>(
    strategy: S,
    telemetry: &Arc<dyn Telemetry>,
    options: &TrackerOptions,
    clock: &Arc<dyn Clock>,
) -> Tracker<S> {
    Tracker::with_clock(strategy, Arc::clone(telemetry), options.clone(), Arc::clone(clock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AggregateStore, MemoryStore, RecordKey};
    use crate::testing::{fixtures, MockAiService, RecordingTelemetry};

    fn hub() -> (TrackerHub, Arc<MockAiService>, Arc<MemoryStore>, Arc<RecordingTelemetry>) {
        let ai = Arc::new(MockAiService::new());
        let store = Arc::new(MemoryStore::new());
        let telemetry = Arc::new(RecordingTelemetry::new());
        let hub = TrackerHub::from_config(
            &AppConfig::default(),
            Services::new(ai.clone(), store.clone()),
            telemetry.clone(),
        );
        (hub, ai, store, telemetry)
    }

    #[tokio::test]
    async fn test_submit_routes_to_kind_tracker() {
        let (hub, ai, _, _) = hub();
        ai.queue_query_id("c1");
        let snapshot = hub
            .submit(TaskKind::Chart, AggregateKey::thread_response(1), TaskInput::default())
            .await
            .unwrap();
        assert_eq!(snapshot.status, "FETCHING");
        assert_eq!(hub.chart().get_tasks().len(), 1);
        assert!(hub.chart_adjustment().get_tasks().is_empty());
        assert_eq!(hub.get_tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_recommendation_is_keyed_by_parent() {
        let (hub, ai, _, _) = hub();
        ai.queue_query_id("r1");
        let parent = AggregateKey::thread_response(8);
        let snapshot = hub
            .submit(TaskKind::RecommendQuestions, parent, TaskInput::default())
            .await
            .unwrap();
        assert_eq!(snapshot.id, parent.to_string());
        assert_eq!(snapshot.query_id, "r1");
        assert!(hub.find_task(TaskKind::RecommendQuestions, "r1").is_some());
    }

    #[tokio::test]
    async fn test_rehydrate_restores_only_unfinished_records() {
        let (hub, _, store, _) = hub();
        let parent = AggregateKey::thread_response(1);
        for (kind, query_id, status) in [
            (TaskKind::Ask, "a1", "SEARCHING"),
            (TaskKind::AskDetail, "d1", "FINISHED"),
            (TaskKind::Chart, "c1", "bogus"),
            (TaskKind::Adjustment, "adj1", "correcting"),
        ] {
            store
                .insert(TaskRecord::new(
                    RecordKey::new(parent, kind),
                    query_id,
                    status,
                    TaskInput::default(),
                ))
                .await
                .unwrap();
        }

        assert_eq!(hub.rehydrate().await.unwrap(), 2);
        assert!(hub.ask().get_task("a1").is_some());
        assert!(hub.adjustment().get_by_query_id("adj1").is_some());
        assert!(hub.chart().get_tasks().is_empty());

        let pending: Vec<String> = hub
            .pending_records()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|r| r.query_id)
            .collect();
        assert!(pending.contains(&"a1".to_string()));
        assert!(!pending.contains(&"d1".to_string()));
    }

    #[tokio::test]
    async fn test_tick_all_finishes_submitted_job() {
        let (hub, ai, store, telemetry) = hub();
        ai.queue_query_id("d1");
        let parent = AggregateKey::thread_response(3);
        hub.submit(TaskKind::AskDetail, parent, TaskInput::question("how many orders?"))
            .await
            .unwrap();
        ai.push_response("d1", "FINISHED", fixtures::ask_detail_response());

        for tick in hub.tick_all() {
            tick.wait().await;
        }

        let record = store.get(&RecordKey::new(parent, TaskKind::AskDetail)).unwrap();
        assert_eq!(record.status.as_deref(), Some("FINISHED"));
        assert_eq!(telemetry.named("question_answered").len(), 1);
        assert!(hub.get_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (hub, _, _, _) = hub();
        hub.start();
        hub.shutdown().await;
        assert!(hub.ask().is_stopped());
        assert!(hub.adjustment().tracker().is_stopped());
    }
}
