//! Troupe CLI — run and inspect agent workflows from the terminal.
//!
//! Thin shell over the troupe-core engine: every subcommand wraps the
//! same APIs an embedding application would call. State lives under the
//! storage root (`--storage-dir` / `TROUPE_STORAGE_DIR`), so separate
//! invocations can run a workflow, then inspect its trace and metrics.

mod commands;

use clap::{Parser, Subcommand};

/// Troupe CLI — orchestrate a troupe of agent personas
#[derive(Parser)]
#[command(name = "troupe", version, about = "Troupe CLI — orchestrate a troupe of agent personas")]
pub struct Cli {
    /// Root directory for sessions, traces, gate records and metrics
    #[arg(long, env = "TROUPE_STORAGE_DIR", global = true)]
    storage_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow from a YAML file
    Run {
        /// Path to the workflow YAML file
        file: String,
        /// Project name recorded in the shared context
        #[arg(long)]
        project: Option<String>,
        /// Directory of persona override files (*.agent.yaml)
        #[arg(long)]
        agents_dir: Option<String>,
        /// Directory of output schema files (*.json)
        #[arg(long)]
        schemas_dir: Option<String>,
    },

    /// Inspect the agent roster
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },

    /// Statically check a workflow project directory
    Lint {
        /// Project directory (workflows/, agents/, schemas/)
        #[arg(default_value = ".")]
        dir: String,
    },

    /// Validate a document against an output schema
    Gate {
        /// Path to the schema JSON file (file stem names the schema)
        #[arg(long)]
        schema: String,
        /// Path to the document JSON file
        #[arg(long)]
        input: String,
        /// Attempt the auto-fix pass when validation fails
        #[arg(long)]
        fix: bool,
        /// Print the full gate record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Render a structured artifact to Markdown
    Render {
        /// Artifact type (e.g. "project-brief", "prd", "architecture")
        artifact_type: String,
        /// Path to the document JSON file
        input: String,
        /// Write the Markdown here instead of stdout
        #[arg(long)]
        out: Option<String>,
    },

    /// Inspect execution traces
    Trace {
        #[command(subcommand)]
        action: TraceAction,
    },

    /// Query step telemetry
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List the roster (builtins plus any overrides)
    List {
        /// Directory of persona override files (*.agent.yaml)
        #[arg(long)]
        agents_dir: Option<String>,
    },
    /// Show one persona in full
    Show {
        /// Agent id (e.g. "developer")
        id: String,
        /// Directory of persona override files (*.agent.yaml)
        #[arg(long)]
        agents_dir: Option<String>,
    },
}

#[derive(Subcommand)]
enum TraceAction {
    /// Show the trace for a session
    Show {
        /// Session id (e.g. "sess-…")
        session_id: String,
        /// Print the raw trace as JSON
        #[arg(long)]
        json: bool,
    },
    /// List sessions with persisted state
    Sessions,
}

#[derive(Subcommand)]
enum MetricsAction {
    /// Token and cost rollup for one session
    Session {
        /// Session id
        session_id: String,
    },
    /// Most recent step records for one session
    Steps {
        /// Session id
        session_id: String,
        /// Maximum rows to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Cost rollup across all sessions
    Costs,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "troupe_core=info,troupe=info".into()),
        )
        .init();

    let storage_dir = cli.storage_dir.as_deref();

    let result = match cli.command {
        Commands::Run {
            file,
            project,
            agents_dir,
            schemas_dir,
        } => {
            commands::run::run(
                &file,
                project.as_deref(),
                agents_dir.as_deref(),
                schemas_dir.as_deref(),
                storage_dir,
            )
            .await
        }

        Commands::Agents { action } => match action {
            AgentsAction::List { agents_dir } => {
                commands::agents::list(agents_dir.as_deref()).await
            }
            AgentsAction::Show { id, agents_dir } => {
                commands::agents::show(&id, agents_dir.as_deref()).await
            }
        },

        Commands::Lint { dir } => commands::lint::run(&dir).await,

        Commands::Gate {
            schema,
            input,
            fix,
            json,
        } => commands::gate::run(&schema, &input, fix, json).await,

        Commands::Render {
            artifact_type,
            input,
            out,
        } => commands::render::run(&artifact_type, &input, out.as_deref()).await,

        Commands::Trace { action } => match action {
            TraceAction::Show { session_id, json } => {
                commands::trace::show(&session_id, json, storage_dir).await
            }
            TraceAction::Sessions => commands::trace::sessions(storage_dir).await,
        },

        Commands::Metrics { action } => match action {
            MetricsAction::Session { session_id } => {
                commands::metrics::session(&session_id, storage_dir).await
            }
            MetricsAction::Steps { session_id, limit } => {
                commands::metrics::steps(&session_id, limit, storage_dir).await
            }
            MetricsAction::Costs => commands::metrics::costs(storage_dir).await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
