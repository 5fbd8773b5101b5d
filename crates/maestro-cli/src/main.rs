//! Maestro CLI — command-line interface for instance orchestration.
//!
//! Drives the same core domain logic (maestro-core) used by embedding
//! hosts: tmux-backed sessions, SQLite persistence, YAML workflows.

mod commands;

use clap::{Parser, Subcommand};
use maestro_core::models::InstanceRole;

/// Maestro CLI — hierarchical instance orchestration
#[derive(Parser)]
#[command(name = "maestro", version, about = "Maestro CLI — hierarchical instance orchestration")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "MAESTRO_DB_PATH", default_value = "maestro.db")]
    db: String,

    /// tmux binary to use for sessions
    #[arg(long, env = "MAESTRO_TMUX_BIN", default_value = "tmux")]
    tmux: String,

    /// Role the CLI's tool calls run as: top, mid, or leaf
    #[arg(long, env = "MAESTRO_CALLER_ROLE", default_value = "top", global = true)]
    caller_role: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage instances
    Instance {
        #[command(subcommand)]
        action: InstanceAction,
    },

    /// Run and validate YAML workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
}

#[derive(Subcommand)]
enum InstanceAction {
    /// Spawn a new instance
    Spawn {
        /// Role: top, mid, or leaf
        #[arg(long)]
        role: String,
        /// Working directory for the session
        #[arg(long)]
        work_dir: String,
        /// Parent instance ID (required for mid/leaf)
        #[arg(long)]
        parent_id: Option<String>,
        /// Initial prompt delivered once the instance is active
        #[arg(long)]
        prompt: Option<String>,
        /// Workspace mode: isolated or shared
        #[arg(long, default_value = "isolated")]
        workspace_mode: String,
    },
    /// Send text to an instance's session
    Send {
        /// Instance ID
        #[arg(long)]
        id: String,
        /// Text to deliver
        text: String,
    },
    /// Capture recent output from an instance's session
    Read {
        /// Instance ID
        #[arg(long)]
        id: String,
        /// Number of trailing lines to capture
        #[arg(long, default_value_t = 50)]
        lines: u32,
    },
    /// Terminate an instance
    Terminate {
        /// Instance ID
        #[arg(long)]
        id: String,
        /// Leave children running instead of cascading
        #[arg(long)]
        orphan: bool,
    },
    /// List instances with optional filters
    List {
        /// Filter by role: top, mid, leaf
        #[arg(long)]
        role: Option<String>,
        /// Filter by status: pending, active, terminated, failed
        #[arg(long)]
        status: Option<String>,
        /// Filter by parent instance ID
        #[arg(long)]
        parent_id: Option<String>,
    },
    /// Show an instance with its children
    Progress {
        /// Instance ID
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Run a workflow from a YAML file against a target instance
    Run {
        /// Path to the workflow YAML file
        file: String,
        /// Target instance ID the stages drive
        #[arg(long)]
        target: String,
        /// Initial context bindings as key=value pairs
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },
    /// Validate a workflow YAML file without executing it
    Validate {
        /// Path to the workflow YAML file
        file: String,
    },
    /// Resume a checkpointed run from its last recorded stage
    Resume {
        /// Path to the workflow YAML file
        file: String,
        /// Run ID of the checkpoint
        #[arg(long)]
        run_id: String,
        /// Target instance ID
        #[arg(long)]
        target: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maestro_core=warn,maestro_cli=info".into()),
        )
        .init();

    let caller_role = match InstanceRole::from_str(&cli.caller_role) {
        Some(role) => role,
        None => {
            eprintln!("Error: invalid caller role '{}'", cli.caller_role);
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Instance { action } => {
            let state = commands::init_state(&cli.db, &cli.tmux).await;
            match action {
                InstanceAction::Spawn {
                    role,
                    work_dir,
                    parent_id,
                    prompt,
                    workspace_mode,
                } => {
                    commands::instance::spawn(
                        &state,
                        caller_role,
                        &role,
                        &work_dir,
                        parent_id.as_deref(),
                        prompt.as_deref(),
                        &workspace_mode,
                    )
                    .await
                }
                InstanceAction::Send { id, text } => {
                    commands::instance::send(&state, caller_role, &id, &text).await
                }
                InstanceAction::Read { id, lines } => {
                    commands::instance::read(&state, caller_role, &id, lines).await
                }
                InstanceAction::Terminate { id, orphan } => {
                    commands::instance::terminate(&state, caller_role, &id, orphan).await
                }
                InstanceAction::List {
                    role,
                    status,
                    parent_id,
                } => {
                    commands::instance::list(
                        &state,
                        caller_role,
                        role.as_deref(),
                        status.as_deref(),
                        parent_id.as_deref(),
                    )
                    .await
                }
                InstanceAction::Progress { id } => {
                    commands::instance::progress(&state, caller_role, &id).await
                }
            }
        }

        Commands::Workflow { action } => match action {
            WorkflowAction::Run { file, target, vars } => {
                let state = commands::init_state(&cli.db, &cli.tmux).await;
                commands::workflow::run(&state, &file, &target, &vars).await
            }
            WorkflowAction::Validate { file } => commands::workflow::validate(&file).await,
            WorkflowAction::Resume {
                file,
                run_id,
                target,
            } => {
                let state = commands::init_state(&cli.db, &cli.tmux).await;
                commands::workflow::resume(&state, &file, &run_id, &target).await
            }
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
