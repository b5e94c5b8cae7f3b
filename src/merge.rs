//! Explain-reference stitching.
//!
//! A finalized explain job returns, for every SQL step of an answer, a list
//! of typed explanation entries. Each entry carries an internal numeric id
//! that only serves to find the matching record in the step's analysis
//! (produced earlier in the pipeline, stored with the explain request).
//!
//! Stitching turns those entries into user-facing references and attaches
//! them to the persisted steps:
//!
//! ```text
//! steps[i] + explanations[i][j] + analysis[i][id] ──> steps[i].references[j]
//!
//! Reference {
//!   referenceId: global counter starting at 1, in step then entry order
//!   type:        FILTER | GROUP_BY | RELATION | SELECT | SORTING
//!   sqlSnippet:  expression, else criteria, else analysis.tableName
//!   summary:     explanation or ""
//!   sqlLocation: analysis.nodeLocation or null
//! }
//! ```
//!
//! The internal ids never appear in the output. The caller replaces the
//! whole detail blob with the result of [`merge_explain_into_detail`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Explanation categories as reported by the AI service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExplanationType {
    #[serde(rename = "filter")]
    Filter,
    #[serde(rename = "groupByKeys")]
    GroupByKeys,
    #[serde(rename = "relation")]
    Relation,
    #[serde(rename = "selectItems")]
    SelectItems,
    #[serde(rename = "sortings")]
    Sortings,
}

impl ExplanationType {
    /// The reference type shown to users for this explanation category.
    #[must_use]
    pub fn reference_type(self) -> ReferenceType {
        match self {
            Self::Filter => ReferenceType::Filter,
            Self::GroupByKeys => ReferenceType::GroupBy,
            Self::Relation => ReferenceType::Relation,
            Self::SelectItems => ReferenceType::Select,
            Self::Sortings => ReferenceType::Sorting,
        }
    }
}

/// User-facing reference categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceType {
    Filter,
    GroupBy,
    Relation,
    Select,
    Sorting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationPayload {
    /// Cross-reference into the step's analysis; never emitted
    pub id: i64,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub criteria: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationEntry {
    #[serde(rename = "type")]
    pub kind: ExplanationType,
    pub payload: ExplanationPayload,
}

/// Position of a node in the SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlLocation {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub id: i64,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub node_location: Option<SqlLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub reference_id: u32,
    #[serde(rename = "type")]
    pub kind: ReferenceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_snippet: Option<String>,
    pub summary: String,
    pub sql_location: Option<SqlLocation>,
}

/// Why a stitch could not be completed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StitchError {
    #[error("explain result has {explanations} steps but the answer has only {steps}")]
    StepCountMismatch { steps: usize, explanations: usize },

    #[error("step {index} is not an object")]
    StepNotObject { index: usize },

    #[error("detail has no steps array")]
    MissingSteps,

    #[error("invalid {what}: {message}")]
    Decode { what: &'static str, message: String },
}

/// Build references for every step.
///
/// `explanations[i]` and `analysis[i]` belong to step `i`. Steps without
/// explanations get an empty list. Reference ids run from 1 across all
/// steps in order.
///
/// # Example
///
/// ```
/// use asktrack::merge::{build_references, ExplanationEntry};
///
/// let explanations: Vec<Vec<ExplanationEntry>> = serde_json::from_value(serde_json::json!([
///     [{"type": "filter", "payload": {"id": 1, "expression": "amount > 10", "explanation": "big"}}],
/// ])).unwrap();
/// let refs = build_references(1, &explanations, &[]).unwrap();
/// assert_eq!(refs[0][0].reference_id, 1);
/// assert_eq!(refs[0][0].sql_snippet.as_deref(), Some("amount > 10"));
/// ```
///
/// # Errors
///
/// Returns [`StitchError::StepCountMismatch`] if there are more explained
/// steps than steps.
pub fn build_references(
    step_count: usize,
    explanations: &[Vec<ExplanationEntry>],
    analysis: &[Vec<AnalysisRecord>],
) -> Result<Vec<Vec<Reference>>, StitchError> {
    if explanations.len() > step_count {
        return Err(StitchError::StepCountMismatch {
            steps: step_count,
            explanations: explanations.len(),
        });
    }

    let mut next_ref_id: u32 = 1;
    let mut all = Vec::with_capacity(step_count);

    for index in 0..step_count {
        let entries = explanations.get(index).map(Vec::as_slice).unwrap_or(&[]);
        let by_id: HashMap<i64, &AnalysisRecord> = analysis
            .get(index)
            .map(|records| records.iter().map(|r| (r.id, r)).collect())
            .unwrap_or_default();

        let mut references = Vec::with_capacity(entries.len());
        for entry in entries {
            let record = by_id.get(&entry.payload.id).copied();
            let sql_snippet = entry
                .payload
                .expression
                .clone()
                .or_else(|| entry.payload.criteria.clone())
                .or_else(|| record.and_then(|r| r.table_name.clone()));

            references.push(Reference {
                reference_id: next_ref_id,
                kind: entry.kind.reference_type(),
                sql_snippet,
                summary: entry.payload.explanation.clone().unwrap_or_default(),
                sql_location: record.and_then(|r| r.node_location),
            });
            next_ref_id += 1;
        }
        all.push(references);
    }

    Ok(all)
}

/// Attach references to each step, returning a new steps array.
///
/// # Errors
///
/// Fails if a step is not a JSON object or the counts do not line up.
pub fn stitch_steps(
    steps: &[Value],
    explanations: &[Vec<ExplanationEntry>],
    analysis: &[Vec<AnalysisRecord>],
) -> Result<Vec<Value>, StitchError> {
    let references = build_references(steps.len(), explanations, analysis)?;

    steps
        .iter()
        .zip(references)
        .enumerate()
        .map(|(index, (step, refs))| {
            let mut step = step.clone();
            let object = step
                .as_object_mut()
                .ok_or(StitchError::StepNotObject { index })?;
            let refs = serde_json::to_value(refs).map_err(|e| StitchError::Decode {
                what: "references",
                message: e.to_string(),
            })?;
            object.insert("references".to_string(), refs);
            Ok(step)
        })
        .collect()
}

/// Produce the replacement detail blob for an answer.
///
/// `detail` is the persisted ask-detail blob (`{"steps": [...], ...}`),
/// `explain_response` the raw explain result (one array of entries per
/// step) and `analysis` the per-step analysis sent with the explain
/// request. Fields other than `steps` are carried over unchanged.
///
/// # Errors
///
/// Fails if any input does not have the expected shape.
pub fn merge_explain_into_detail(
    detail: &Value,
    explain_response: &Value,
    analysis: &Value,
) -> Result<Value, StitchError> {
    let steps = detail
        .get("steps")
        .and_then(Value::as_array)
        .ok_or(StitchError::MissingSteps)?;

    let explanations: Vec<Vec<ExplanationEntry>> = serde_json::from_value(explain_response.clone())
        .map_err(|e| StitchError::Decode {
            what: "explanations",
            message: e.to_string(),
        })?;

    let analysis: Vec<Vec<AnalysisRecord>> = if analysis.is_null() {
        Vec::new()
    } else {
        serde_json::from_value(analysis.clone()).map_err(|e| StitchError::Decode {
            what: "analysis",
            message: e.to_string(),
        })?
    };

    let stitched = stitch_steps(steps, &explanations, &analysis)?;

    let mut merged = detail.clone();
    if let Some(object) = merged.as_object_mut() {
        object.insert("steps".to_string(), Value::Array(stitched));
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn explanations() -> Vec<Vec<ExplanationEntry>> {
        serde_json::from_value(json!([
            [
                {"type": "relation", "payload": {"id": 10, "criteria": "o.customer_id = c.id", "explanation": "join customers"}},
                {"type": "selectItems", "payload": {"id": 11, "explanation": "customer name"}}
            ],
            [
                {"type": "sortings", "payload": {"id": 1, "expression": "total DESC"}}
            ]
        ]))
        .unwrap()
    }

    fn analysis() -> Vec<Vec<AnalysisRecord>> {
        serde_json::from_value(json!([
            [
                {"id": 10, "tableName": "orders", "nodeLocation": {"line": 3, "column": 5}},
                {"id": 11, "tableName": "customers", "nodeLocation": {"line": 1, "column": 8}}
            ],
            []
        ]))
        .unwrap()
    }

    #[test]
    fn test_reference_ids_are_global_and_ordered() {
        let refs = build_references(2, &explanations(), &analysis()).unwrap();
        let ids: Vec<u32> = refs.iter().flatten().map(|r| r.reference_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_snippet_fallback_order() {
        let refs = build_references(2, &explanations(), &analysis()).unwrap();
        // criteria wins over table name
        assert_eq!(refs[0][0].sql_snippet.as_deref(), Some("o.customer_id = c.id"));
        // no expression/criteria: analysis table name
        assert_eq!(refs[0][1].sql_snippet.as_deref(), Some("customers"));
        // expression without analysis
        assert_eq!(refs[1][0].sql_snippet.as_deref(), Some("total DESC"));
    }

    #[test]
    fn test_missing_analysis_gives_null_location() {
        let refs = build_references(2, &explanations(), &analysis()).unwrap();
        assert_eq!(refs[0][0].sql_location, Some(SqlLocation { line: 3, column: 5 }));
        assert_eq!(refs[1][0].sql_location, None);
        assert_eq!(refs[1][0].summary, "");
    }

    #[test]
    fn test_no_snippet_source_leaves_snippet_absent() {
        let explanations: Vec<Vec<ExplanationEntry>> = serde_json::from_value(json!([
            [{"type": "filter", "payload": {"id": 99, "explanation": "only paid"}}]
        ]))
        .unwrap();
        let refs = build_references(1, &explanations, &[]).unwrap();
        assert!(refs[0][0].sql_snippet.is_none());

        let value = serde_json::to_value(&refs[0][0]).unwrap();
        assert!(value.get("sqlSnippet").is_none());
        assert!(value["sqlLocation"].is_null());
    }

    #[test]
    fn test_reference_types_are_reverse_mapped() {
        let refs = build_references(2, &explanations(), &analysis()).unwrap();
        assert_eq!(refs[0][0].kind, ReferenceType::Relation);
        assert_eq!(refs[0][1].kind, ReferenceType::Select);
        assert_eq!(refs[1][0].kind, ReferenceType::Sorting);
        assert_eq!(ExplanationType::GroupByKeys.reference_type(), ReferenceType::GroupBy);
    }

    #[test]
    fn test_internal_ids_are_not_emitted() {
        let detail = json!({"description": "d", "steps": [
            {"sql": "SELECT 1", "summary": "s0", "cteName": "c0"},
            {"sql": "SELECT 2", "summary": "s1", "cteName": ""}
        ]});
        let explain = serde_json::to_value(explanations()).unwrap();
        let analysis = serde_json::to_value(analysis()).unwrap();

        let merged = merge_explain_into_detail(&detail, &explain, &analysis).unwrap();
        let text = merged.to_string();
        assert!(!text.contains("\"id\""));
        assert_eq!(merged["description"], "d");
        assert_eq!(merged["steps"][0]["references"][1]["referenceId"], 2);
        assert_eq!(merged["steps"][1]["references"][0]["type"], "SORTING");
        assert_eq!(merged["steps"][1]["cteName"], "");
    }

    #[test]
    fn test_fewer_explained_steps_than_steps() {
        let refs = build_references(3, &explanations(), &analysis()).unwrap();
        assert_eq!(refs.len(), 3);
        assert!(refs[2].is_empty());
    }

    #[test]
    fn test_more_explained_steps_than_steps_is_an_error() {
        let err = build_references(1, &explanations(), &analysis()).unwrap_err();
        assert_eq!(
            err,
            StitchError::StepCountMismatch {
                steps: 1,
                explanations: 2
            }
        );
    }

    #[test]
    fn test_merge_requires_steps() {
        let err = merge_explain_into_detail(&json!({}), &json!([]), &Value::Null).unwrap_err();
        assert_eq!(err, StitchError::MissingSteps);
    }

    #[test]
    fn test_non_object_step_is_an_error() {
        let err = stitch_steps(&[json!("SELECT 1")], &[], &[]).unwrap_err();
        assert_eq!(err, StitchError::StepNotObject { index: 0 });
    }
}
