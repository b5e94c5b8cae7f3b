//! One [`TrackerStrategy`](super::TrackerStrategy) per job kind.
//!
//! | Strategy | Kinds | Status | Extra behaviour |
//! |---|---|---|---|
//! | [`AskStrategy`] | ASK | [`AskStatus`](crate::status::AskStatus) | candidate normalisation |
//! | [`AskDetailStrategy`] | ASK_DETAIL | [`AskDetailStatus`](crate::status::AskDetailStatus) | step normalisation |
//! | [`ExplainStrategy`] | EXPLAIN | [`ExplainStatus`](crate::status::ExplainStatus) | stitches references into the answer's steps |
//! | [`ChartStrategy`] | CHART, CHART_ADJUSTMENT | [`ChartStatus`](crate::status::ChartStatus) | chart schema normalisation |
//! | [`RecommendStrategy`] | RECOMMEND_QUESTIONS | [`RecommendationStatus`](crate::status::RecommendationStatus) | keyed by the owning aggregate |
//! | [`AdjustmentStrategy`] | ADJUSTMENT | [`AdjustmentStatus`](crate::status::AdjustmentStatus) | retained after finalization |

mod adjustment;
mod ask;
mod ask_detail;
mod chart;
mod explain;
mod recommend;

pub use adjustment::AdjustmentStrategy;
pub use ask::AskStrategy;
pub use ask_detail::AskDetailStrategy;
pub use chart::ChartStrategy;
pub use explain::ExplainStrategy;
pub use recommend::RecommendStrategy;

use serde_json::Value;

/// `value[key]`, or null.
fn field(value: &Value, key: &str) -> Value {
    value.get(key).cloned().unwrap_or(Value::Null)
}

/// Length of the array at `value[key]`, 0 if absent.
fn array_len(value: Option<&Value>, key: &str) -> usize {
    value
        .and_then(|v| v.get(key))
        .and_then(Value::as_array)
        .map_or(0, Vec::len)
}
