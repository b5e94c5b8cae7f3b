use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::field;
use crate::status::ChartStatus;
use crate::task::{TaskKind, TrackedTask};
use crate::tracker::{Services, TrackerStrategy};

/// Tracks chart generation or chart adjustment.
///
/// Both jobs share a status vocabulary and a result shape; they differ only
/// in endpoint, record and telemetry event, all of which follow the kind.
pub struct ChartStrategy {
    services: Services,
    kind: TaskKind,
}

impl ChartStrategy {
    /// Strategy for new charts.
    #[must_use]
    pub fn new(services: Services) -> Self {
        Self {
            services,
            kind: TaskKind::Chart,
        }
    }

    /// Strategy for adjustments of an existing chart.
    #[must_use]
    pub fn adjustment(services: Services) -> Self {
        Self {
            services,
            kind: TaskKind::ChartAdjustment,
        }
    }
}

#[async_trait]
impl TrackerStrategy for ChartStrategy {
    type Status = ChartStatus;

    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn services(&self) -> &Services {
        &self.services
    }

    fn normalize(&self, response: &Value) -> Value {
        json!({
            "reasoning": field(response, "reasoning"),
            "chartType": field(response, "chartType"),
            "chartSchema": field(response, "chartSchema"),
        })
    }

    fn telemetry_extras(&self, task: &TrackedTask<ChartStatus>, props: &mut Map<String, Value>) {
        if let Some(chart_type) = task
            .result
            .as_ref()
            .and_then(|r| r.get("chartType"))
            .and_then(Value::as_str)
        {
            props.insert("chart_type".into(), json!(chart_type));
        }
    }
}
