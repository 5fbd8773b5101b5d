//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and reuses the
//! maestro-core domain logic through `OrchestratorState`.

pub mod instance;
pub mod workflow;

use std::sync::Arc;

use maestro_core::session::TmuxTransport;
use maestro_core::state::{OrchestratorState, OrchestratorStateInner};
use maestro_core::store::Database;

/// Initialize shared state from the given SQLite database path and tmux
/// binary.
pub async fn init_state(db_path: &str, tmux_bin: &str) -> OrchestratorState {
    let db = Database::open(db_path).unwrap_or_else(|e| {
        eprintln!("Failed to open database '{}': {}", db_path, e);
        std::process::exit(1);
    });

    Arc::new(OrchestratorStateInner::new(
        db,
        Arc::new(TmuxTransport::with_binary(tmux_bin)),
    ))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
