//! Sample AI service payloads.
//!
//! Shapes match what the service returns for each job kind, trimmed to
//! the fields the trackers read.

use serde_json::{json, Value};

/// Finished ask-detail response with a single step.
#[must_use]
pub fn ask_detail_response() -> Value {
    json!({
        "description": "a constant",
        "steps": [{"sql": "SELECT 1", "summary": "s", "cteName": "c0"}]
    })
}

/// Persisted ask-detail blob with two steps, as explained by
/// [`explain_response`].
#[must_use]
pub fn two_step_detail() -> Value {
    json!({
        "description": "top customers by order total",
        "steps": [
            {
                "sql": "SELECT c.name, o.total FROM orders o JOIN customers c ON o.customer_id = c.id",
                "summary": "join orders with customers",
                "cteName": "order_totals"
            },
            {
                "sql": "SELECT * FROM order_totals ORDER BY total DESC",
                "summary": "sort by total",
                "cteName": ""
            }
        ]
    })
}

/// Explanations for [`two_step_detail`]: two entries on the first step,
/// one on the second.
#[must_use]
pub fn explain_response() -> Value {
    json!([
        [
            {"type": "relation", "payload": {"id": 10, "criteria": "o.customer_id = c.id", "explanation": "orders joined to their customers"}},
            {"type": "selectItems", "payload": {"id": 11, "explanation": "customer name and order total"}}
        ],
        [
            {"type": "sortings", "payload": {"id": 1, "expression": "total DESC", "explanation": "largest totals first"}}
        ]
    ])
}

/// Per-step analysis matching the ids in [`explain_response`].
#[must_use]
pub fn explain_analysis() -> Value {
    json!([
        [
            {"id": 10, "tableName": "orders", "nodeLocation": {"line": 1, "column": 38}},
            {"id": 11, "tableName": "customers", "nodeLocation": {"line": 1, "column": 8}}
        ],
        [
            {"id": 1, "nodeLocation": {"line": 1, "column": 38}}
        ]
    ])
}

#[must_use]
pub fn ask_response() -> Value {
    json!({
        "type": "TEXT_TO_SQL",
        "candidates": [{"sql": "SELECT name FROM customers", "type": "llm"}],
        "retrievedTables": ["customers"],
        "sqlGenerationReasoning": "customers holds names"
    })
}

#[must_use]
pub fn chart_response() -> Value {
    json!({
        "reasoning": "monthly totals read best as a line",
        "chartType": "line",
        "chartSchema": {
            "mark": {"type": "line"},
            "encoding": {
                "x": {"field": "month", "type": "temporal"},
                "y": {"field": "total", "type": "quantitative"}
            }
        }
    })
}

#[must_use]
pub fn recommend_response() -> Value {
    json!({
        "questions": [
            {"question": "Which region grew fastest?", "category": "trend", "sql": "SELECT 1"},
            {"question": "Who are the top 10 customers?", "category": "ranking", "sql": "SELECT 2"}
        ]
    })
}

#[must_use]
pub fn adjustment_response() -> Value {
    json!({
        "sql": "SELECT * FROM orders WHERE status = 'paid'",
        "retrievedTables": ["orders"]
    })
}
