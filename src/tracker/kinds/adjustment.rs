use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::field;
use crate::status::AdjustmentStatus;
use crate::task::{TaskKind, TrackedTask};
use crate::tracker::{Services, TrackerStrategy};

/// Tracks SQL adjustments driven by user feedback.
///
/// Usually wrapped by [`AdjustmentTaskTracker`](crate::tracker::AdjustmentTaskTracker),
/// which adds re-runs and retention.
pub struct AdjustmentStrategy {
    services: Services,
}

impl AdjustmentStrategy {
    #[must_use]
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl TrackerStrategy for AdjustmentStrategy {
    type Status = AdjustmentStatus;

    fn kind(&self) -> TaskKind {
        TaskKind::Adjustment
    }

    fn services(&self) -> &Services {
        &self.services
    }

    fn normalize(&self, response: &Value) -> Value {
        json!({
            "sql": field(response, "sql"),
            "retrievedTables": field(response, "retrievedTables"),
            "sqlGenerationReasoning": field(response, "sqlGenerationReasoning"),
        })
    }

    fn telemetry_extras(&self, task: &TrackedTask<AdjustmentStatus>, props: &mut Map<String, Value>) {
        if let Some(sql) = task
            .result
            .as_ref()
            .and_then(|r| r.get("sql"))
            .and_then(Value::as_str)
        {
            props.insert("sql".into(), json!(sql));
        }
    }
}
