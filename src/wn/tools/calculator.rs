//! Calculator built-in backed by `evalexpr`.
//!
//! Evaluates a single arithmetic expression with the `math::PI` and
//! `math::E` constants pre-seeded.  Anything that does not reduce to a
//! number is reported as a failure.

use evalexpr::ContextWithMutableVariables;
use std::sync::Arc;

use crate::wn::provider::{ToolDefinition, ToolResult};

use super::require_str;

/// `calculator { expression }` — evaluate a math expression.
pub fn calculator_tool() -> ToolDefinition {
    ToolDefinition::new(
        "calculator",
        "Evaluate a mathematical expression and return the numeric result.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Expression to evaluate, e.g. \"2 * (3 + 4)\"",
                },
            },
            "required": ["expression"],
        }),
        Arc::new(|args| {
            Box::pin(async move {
                let expression = match require_str(&args, "expression") {
                    Ok(expression) => expression.to_string(),
                    Err(err) => return ToolResult::failure(err),
                };
                match evaluate(&expression) {
                    Ok(value) => ToolResult::success(value),
                    Err(err) => ToolResult::failure(err),
                }
            })
        }),
    )
}

fn evaluate(expression: &str) -> Result<String, String> {
    let mut context: evalexpr::HashMapContext = evalexpr::HashMapContext::new();
    let _ = context.set_value(
        "math::PI".to_string(),
        evalexpr::Value::Float(std::f64::consts::PI),
    );
    let _ = context.set_value(
        "math::E".to_string(),
        evalexpr::Value::Float(std::f64::consts::E),
    );

    match evalexpr::eval_with_context(expression, &context) {
        Ok(value) => match value.as_number() {
            Ok(n) => Ok(format_number(n)),
            Err(_) => Err("result is not a number".to_string()),
        },
        Err(e) => Err(format!("evaluation error: {}", e)),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
