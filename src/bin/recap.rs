#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use recap_harness::gateway::{ProviderGateway, TracingUsageSink};
use recap_harness::session::{GroupSummaryRequest, TimeWindow};
use recap_harness::source::JsonDirSessionSource;
use recap_harness::store::{
    ExecutionJournal, ResultStore, SqliteIntermediateStore, SqliteResultStore,
};
use recap_harness::workflow::{WorkflowConfig, WorkflowDeps, WorkflowEngine};

#[derive(Parser)]
#[command(name = "recap", version, about = "Group session summarization CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a group of sessions read from a directory of JSON files
    Summarize {
        /// Directory holding `<session_id>.json` files
        #[arg(long)]
        sessions_dir: PathBuf,
        /// Session ids, in order (repeat or comma-separate)
        #[arg(long = "session", required = true, value_delimiter = ',')]
        sessions: Vec<String>,
        #[arg(long)]
        team_id: i64,
        #[arg(long, default_value_t = 0)]
        requester_id: i64,
        #[arg(long, default_value = "openai/gpt-4.1-mini")]
        model: String,
        /// Start of the time window (RFC 3339); the Unix epoch when omitted
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// End of the time window (RFC 3339); now when omitted
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long)]
        title: Option<String>,
        /// Extra focus passed to every prompt
        #[arg(long)]
        context: Option<String>,
        /// TOML file with workflow settings
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        results: Option<PathBuf>,
        #[arg(long)]
        journal: Option<PathBuf>,
        /// Write the terminal output (and the report, if any) here as JSON
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show the last recorded status of an execution
    Status {
        execution_id: String,
        #[arg(long)]
        journal: Option<PathBuf>,
    },
    /// Print a stored pattern report
    Report {
        result_id: String,
        #[arg(long)]
        results: Option<PathBuf>,
    },
    /// Remove expired intermediate artifacts and old finished executions
    StorePrune {
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        journal: Option<PathBuf>,
        /// Journal rows of finished executions older than this are deleted
        #[arg(long)]
        max_age_days: Option<u64>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RECAP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("RECAP_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<WorkflowConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => WorkflowConfig::load(path)?,
        None => WorkflowConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Summarize {
            sessions_dir,
            sessions,
            team_id,
            requester_id,
            model,
            from,
            to,
            title,
            context,
            config,
            store,
            results,
            journal,
            out,
        } => {
            let config = load_config(config.as_deref())?;
            let gateway = ProviderGateway::from_env(Arc::new(TracingUsageSink))?;
            let intermediate =
                SqliteIntermediateStore::new(store.unwrap_or_else(SqliteIntermediateStore::default_path))?;
            let result_store =
                Arc::new(SqliteResultStore::new(results.unwrap_or_else(SqliteResultStore::default_path))?);
            let journal = ExecutionJournal::open(journal.unwrap_or_else(ExecutionJournal::default_path))?;

            let engine = WorkflowEngine::new(WorkflowDeps {
                gateway: Arc::new(gateway),
                sessions: Arc::new(JsonDirSessionSource::new(sessions_dir)),
                intermediate: Arc::new(intermediate),
                results: result_store.clone(),
                journal: Some(journal),
                config,
            });

            let request = GroupSummaryRequest {
                session_ids: sessions,
                requester_id,
                team_id,
                time_window: TimeWindow {
                    min: from.unwrap_or_default(),
                    max: to.unwrap_or_else(Utc::now),
                },
                summary_title: title,
                model_name: model,
                extra_context: context,
            };

            let handle = engine.start(request).await?;
            eprintln!("[recap] execution {}", handle.execution_id());
            let output = engine.await_result(&handle).await?;

            let report = match output.result_id() {
                Some(id) => result_store.load(id).await?,
                None => None,
            };
            let rendered = serde_json::json!({
                "execution_id": handle.execution_id(),
                "output": output,
                "report": report,
            });
            match out {
                Some(path) => {
                    write_json(&path, &rendered)?;
                    eprintln!("[recap] output written to {}", path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&rendered)?),
            }
        }
        Commands::Status {
            execution_id,
            journal,
        } => {
            let journal = ExecutionJournal::open(journal.unwrap_or_else(ExecutionJournal::default_path))?;
            let entry = journal
                .load(&execution_id)
                .await?
                .ok_or_else(|| format!("no execution {execution_id}"))?;
            let projection = entry.state.projection(Default::default());
            println!("{}", serde_json::to_string_pretty(&projection)?);
        }
        Commands::Report { result_id, results } => {
            let store = SqliteResultStore::new(results.unwrap_or_else(SqliteResultStore::default_path))?;
            let report = store
                .load(&result_id)
                .await?
                .ok_or_else(|| format!("no report {result_id}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::StorePrune {
            store,
            journal,
            max_age_days,
        } => {
            let intermediate =
                SqliteIntermediateStore::new(store.unwrap_or_else(SqliteIntermediateStore::default_path))?;
            let _lock = intermediate.lock_exclusive()?;
            let stats = intermediate.prune_expired().await?;
            println!(
                "pruned {} expired artifacts; {} remain",
                stats.deleted, stats.remaining
            );
            if let Some(days) = max_age_days {
                let journal =
                    ExecutionJournal::open(journal.unwrap_or_else(ExecutionJournal::default_path))?;
                let stats = journal.prune(days).await?;
                println!(
                    "pruned {} finished executions; {} remain",
                    stats.deleted, stats.remaining
                );
            }
        }
    }

    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
