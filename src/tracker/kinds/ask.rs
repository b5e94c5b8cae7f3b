use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{array_len, field};
use crate::status::AskStatus;
use crate::task::{TaskKind, TrackedTask};
use crate::tracker::{Services, TrackerStrategy};

/// Tracks candidate SQL generation for a question.
pub struct AskStrategy {
    services: Services,
}

impl AskStrategy {
    #[must_use]
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl TrackerStrategy for AskStrategy {
    type Status = AskStatus;

    fn kind(&self) -> TaskKind {
        TaskKind::Ask
    }

    fn services(&self) -> &Services {
        &self.services
    }

    /// Keeps the answer type, the candidates and the generation context.
    /// Candidates arrive either as `candidates` or, from older services, as
    /// `response`.
    fn normalize(&self, response: &Value) -> Value {
        let candidates = response
            .get("candidates")
            .or_else(|| response.get("response"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        json!({
            "type": field(response, "type"),
            "candidates": candidates,
            "rephrasedQuestion": field(response, "rephrasedQuestion"),
            "intentReasoning": field(response, "intentReasoning"),
            "retrievedTables": field(response, "retrievedTables"),
            "sqlGenerationReasoning": field(response, "sqlGenerationReasoning"),
        })
    }

    fn telemetry_extras(&self, task: &TrackedTask<AskStatus>, props: &mut Map<String, Value>) {
        props.insert(
            "candidates".into(),
            json!(array_len(task.result.as_ref(), "candidates")),
        );
        if let Some(tables) = task.result.as_ref().and_then(|r| r.get("retrievedTables")) {
            if !tables.is_null() {
                props.insert("retrieved_tables".into(), tables.clone());
            }
        }
    }
}
