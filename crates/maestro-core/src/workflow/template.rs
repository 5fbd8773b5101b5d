//! `${...}` template interpolation and the small condition language used
//! by `conditional` actions.
//!
//! Placeholders resolve against the execution context with dotted paths
//! and an optional helper prefix:
//!
//! - `${result.status}`        raw value
//! - `${upper:name}`           uppercase
//! - `${lower:name}`           lowercase
//! - `${trim:output}`          trim whitespace
//! - `${len:items}`            array/object/string length
//! - `${json:result}`          compact JSON encoding
//!
//! Unknown placeholders render as-is so a stray `${}` in worker output
//! quoted back into a prompt never vanishes silently.

use regex::Regex;
use serde_json::Value;

use crate::error::OrchestratorError;
use crate::workflow::context::ExecutionContext;

/// Interpolate every `${...}` placeholder in `template`.
pub fn render(template: &str, ctx: &ExecutionContext) -> String {
    let re = match Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return template.to_string(),
    };
    re.replace_all(template, |caps: &regex::Captures<'_>| {
        let inner = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        resolve_placeholder(inner, ctx)
            .unwrap_or_else(|| caps.get(0).map(|m| m.as_str()).unwrap_or_default().to_string())
    })
    .into_owned()
}

fn resolve_placeholder(inner: &str, ctx: &ExecutionContext) -> Option<String> {
    let (helper, path) = match inner.split_once(':') {
        Some((helper, path)) if matches!(helper, "upper" | "lower" | "trim" | "len" | "json") => {
            (Some(helper), path.trim())
        }
        _ => (None, inner.trim()),
    };
    let value = ctx.lookup(path)?;
    Some(match helper {
        Some("upper") => value_to_string(value).to_uppercase(),
        Some("lower") => value_to_string(value).to_lowercase(),
        Some("trim") => value_to_string(value).trim().to_string(),
        Some("len") => value_len(value).to_string(),
        Some("json") => serde_json::to_string(value).unwrap_or_default(),
        _ => value_to_string(value),
    })
}

/// Strings render bare; everything else renders as compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::Null => 0,
        _ => 1,
    }
}

// ── Condition evaluation ───────────────────────────────────────────────
//
// Grammar, loosest-binding first (no parentheses):
//
//   expr     := and ( "||" and )*
//   and      := unary ( "&&" unary )*
//   unary    := "!" unary | compare
//   compare  := operand ("==" | "!=") operand
//             | "contains(" path "," literal ")"
//             | operand                          (truthiness)
//   operand  := quoted literal | context path

/// Evaluate a condition expression against the context.
pub fn eval_condition(expr: &str, ctx: &ExecutionContext) -> Result<bool, OrchestratorError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(OrchestratorError::Validation(
            "Empty condition expression".to_string(),
        ));
    }
    for clause in expr.split("||") {
        let mut all = true;
        for term in clause.split("&&") {
            if !eval_unary(term.trim(), ctx)? {
                all = false;
                break;
            }
        }
        if all {
            return Ok(true);
        }
    }
    Ok(false)
}

fn eval_unary(term: &str, ctx: &ExecutionContext) -> Result<bool, OrchestratorError> {
    if let Some(rest) = term.strip_prefix('!') {
        return Ok(!eval_unary(rest.trim(), ctx)?);
    }
    eval_compare(term, ctx)
}

fn eval_compare(term: &str, ctx: &ExecutionContext) -> Result<bool, OrchestratorError> {
    if let Some(inner) = term
        .strip_prefix("contains(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let (path, needle) = inner.split_once(',').ok_or_else(|| {
            OrchestratorError::Validation(format!("Malformed contains() in '{}'", term))
        })?;
        let haystack = operand_value(path.trim(), ctx);
        let needle = operand_value(needle.trim(), ctx);
        return Ok(match haystack {
            Value::String(s) => s.contains(&value_to_string(&needle)),
            Value::Array(items) => items.contains(&needle),
            _ => false,
        });
    }

    if let Some((lhs, rhs)) = term.split_once("==") {
        if !term.contains("!=") {
            return Ok(operand_value(lhs.trim(), ctx) == operand_value(rhs.trim(), ctx));
        }
    }
    if let Some((lhs, rhs)) = term.split_once("!=") {
        return Ok(operand_value(lhs.trim(), ctx) != operand_value(rhs.trim(), ctx));
    }

    Ok(truthy(&operand_value(term, ctx)))
}

/// A quoted operand is a string literal; anything else is a context path
/// (missing paths resolve to null).
fn operand_value(operand: &str, ctx: &ExecutionContext) -> Value {
    let operand = operand.trim();
    if (operand.starts_with('"') && operand.ends_with('"') && operand.len() >= 2)
        || (operand.starts_with('\'') && operand.ends_with('\'') && operand.len() >= 2)
    {
        return Value::String(operand[1..operand.len() - 1].to_string());
    }
    if operand == "true" {
        return Value::Bool(true);
    }
    if operand == "false" {
        return Value::Bool(false);
    }
    if let Ok(n) = operand.parse::<i64>() {
        return Value::Number(n.into());
    }
    ctx.lookup(operand).cloned().unwrap_or(Value::Null)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::DEFAULT_MAX_ENTRIES;
    use serde_json::json;

    fn ctx_with(pairs: &[(&str, Value)]) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(DEFAULT_MAX_ENTRIES);
        for (key, value) in pairs {
            ctx.set(key.to_string(), value.clone());
        }
        ctx
    }

    #[test]
    fn test_render_paths_and_helpers() {
        let ctx = ctx_with(&[
            ("name", json!("compare")),
            ("result", json!({"status": 200, "items": [1, 2, 3]})),
        ]);

        assert_eq!(render("stage ${name}", &ctx), "stage compare");
        assert_eq!(render("${upper:name}", &ctx), "COMPARE");
        assert_eq!(render("${result.status}", &ctx), "200");
        assert_eq!(render("${len:result.items}", &ctx), "3");
        assert_eq!(render("${json:result.items}", &ctx), "[1,2,3]");
    }

    #[test]
    fn test_unknown_placeholder_left_verbatim() {
        let ctx = ctx_with(&[]);
        assert_eq!(render("echo ${missing}", &ctx), "echo ${missing}");
    }

    #[test]
    fn test_condition_equality_and_literals() {
        let ctx = ctx_with(&[("matched_trigger", json!("COMMIT_FAILED"))]);
        assert!(eval_condition(r#"matched_trigger == "COMMIT_FAILED""#, &ctx).unwrap());
        assert!(eval_condition(r#"matched_trigger != "COMMIT_FINISHED""#, &ctx).unwrap());
        assert!(!eval_condition(r#"matched_trigger == "OTHER""#, &ctx).unwrap());
    }

    #[test]
    fn test_condition_boolean_operators() {
        let ctx = ctx_with(&[("a", json!(1)), ("b", json!(""))]);
        assert!(eval_condition("a && !b", &ctx).unwrap());
        assert!(eval_condition("b || a", &ctx).unwrap());
        assert!(!eval_condition("b && a", &ctx).unwrap());
    }

    #[test]
    fn test_condition_contains() {
        let ctx = ctx_with(&[
            ("last_output", json!("...COMPARE_FINISHED...")),
            ("tags", json!(["fast", "green"])),
        ]);
        assert!(eval_condition(r#"contains(last_output, "FINISHED")"#, &ctx).unwrap());
        assert!(eval_condition(r#"contains(tags, "green")"#, &ctx).unwrap());
        assert!(!eval_condition(r#"contains(tags, "red")"#, &ctx).unwrap());
    }

    #[test]
    fn test_truthiness_of_missing_key() {
        let ctx = ctx_with(&[]);
        assert!(!eval_condition("never_set", &ctx).unwrap());
        assert!(eval_condition("!never_set", &ctx).unwrap());
    }
}
