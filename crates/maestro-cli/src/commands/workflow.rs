//! `maestro workflow` — run, resume, and validate YAML workflows.

use std::collections::HashMap;

use maestro_core::state::OrchestratorState;
use maestro_core::workflow::WorkflowDefinition;
use serde_json::{json, Value};

use super::print_json;

/// Parse `--var key=value` pairs into initial context bindings. Values that
/// parse as JSON are kept structured; anything else becomes a string.
fn parse_vars(vars: &[String]) -> Result<HashMap<String, Value>, String> {
    let mut initial = HashMap::new();
    for pair in vars {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("Invalid --var '{}', expected key=value", pair))?;
        let value = serde_json::from_str(value).unwrap_or(Value::String(value.to_string()));
        initial.insert(key.to_string(), value);
    }
    Ok(initial)
}

pub async fn run(
    state: &OrchestratorState,
    file: &str,
    target: &str,
    vars: &[String],
) -> Result<(), String> {
    let workflow = WorkflowDefinition::load(file)
        .await
        .map_err(|e| e.to_string())?;
    let initial = parse_vars(vars)?;

    let result = state
        .engine
        .run(&workflow, target, initial)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::to_value(&result).unwrap_or_default());
    match result.error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

pub async fn resume(
    state: &OrchestratorState,
    file: &str,
    run_id: &str,
    target: &str,
) -> Result<(), String> {
    let workflow = WorkflowDefinition::load(file)
        .await
        .map_err(|e| e.to_string())?;
    let result = state
        .engine
        .resume(&workflow, run_id, target)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::to_value(&result).unwrap_or_default());
    match result.error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

pub async fn validate(file: &str) -> Result<(), String> {
    let workflow = WorkflowDefinition::load(file)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({
        "valid": true,
        "name": workflow.name,
        "stages": workflow.stages.iter().map(|s| &s.id).collect::<Vec<_>>(),
    }));
    Ok(())
}
