use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::{Result, TrackerError};
use crate::merge::merge_explain_into_detail;
use crate::status::ExplainStatus;
use crate::store::{RecordKey, RecordPatch};
use crate::task::{TaskKind, TrackedTask};
use crate::tracker::{Services, TrackerStrategy};

/// Tracks SQL explanations and stitches them into the answer.
///
/// The explain request's payload carries the per-step `analysis` that the
/// explanations cross-reference. Once the job finishes, the answer's
/// ask-detail record is rewritten with a `references` list on every step.
pub struct ExplainStrategy {
    services: Services,
}

impl ExplainStrategy {
    #[must_use]
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl TrackerStrategy for ExplainStrategy {
    type Status = ExplainStatus;

    fn kind(&self) -> TaskKind {
        TaskKind::Explain
    }

    fn services(&self) -> &Services {
        &self.services
    }

    async fn merge(&self, task: &TrackedTask<ExplainStatus>) -> Result<()> {
        let response = task
            .result
            .as_ref()
            .ok_or_else(|| TrackerError::merge(&task.id, "explanation finished without a response"))?;

        let detail_key = RecordKey::new(task.parent, TaskKind::AskDetail);
        let record = self
            .services
            .store
            .find_one(&detail_key)
            .await?
            .ok_or_else(|| TrackerError::merge(&task.id, format!("no answer record at {}", detail_key)))?;
        let detail = record
            .detail
            .ok_or_else(|| TrackerError::merge(&task.id, "answer has no steps yet"))?;

        let analysis = task
            .input
            .payload
            .get("analysis")
            .cloned()
            .unwrap_or(Value::Null);

        let merged = merge_explain_into_detail(&detail, response, &analysis)
            .map_err(|e| TrackerError::merge(&task.id, e.to_string()))?;

        // the answer may have been rerun since it was read
        let mut patch = RecordPatch::detail(merged);
        if let Some(answer_query_id) = record.query_id {
            patch = patch.owned_by(answer_query_id);
        }
        self.services.store.update_one(&detail_key, patch).await
    }

    fn telemetry_extras(&self, task: &TrackedTask<ExplainStatus>, props: &mut Map<String, Value>) {
        let explained = task
            .result
            .as_ref()
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        props.insert("explained_steps".into(), json!(explained));
    }
}
