use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use supply_qa::bootstrap;
use supply_qa::config::EngineConfig;
use supply_qa::db::query_history::Feedback;
use supply_qa::execution_loop::CancelHandle;
use supply_qa::model::{QaOutcome, QaRequest};
use supply_qa::schema_rag::indexer::{CorpusIndexer, CorpusSources};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "supply-qa")]
#[command(about = "Natural-language questions over clinical trial supply data")]
struct Args {
    /// Engine configuration file (JSON). Environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer one question and print the response as JSON
    Ask {
        question: String,

        /// Filter hint as key=value; repeatable
        #[arg(short, long = "filter")]
        filters: Vec<String>,

        /// Also write the result rows to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Build the reference corpus from the schema allowlist and policy documents
    Index {
        /// Policies and example questions (JSON)
        #[arg(long, default_value = "config/policies.json")]
        sources: PathBuf,

        /// Output corpus file; defaults to the configured corpus path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the most recent answered questions
    History {
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
    /// Record feedback for an answered question
    Feedback {
        id: Uuid,

        #[arg(long, conflicts_with = "not_helpful")]
        helpful: bool,

        #[arg(long)]
        not_helpful: bool,

        #[arg(long)]
        comment: Option<String>,
    },
}

fn parse_filter(raw: &str) -> Result<(String, String)> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .with_context(|| format!("filter '{}' is not key=value", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = EngineConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Ask {
            question,
            filters,
            csv,
        } => {
            let mut request = QaRequest::new(question);
            for raw in &filters {
                let (key, value) = parse_filter(raw)?;
                request = request.with_filter(key, value);
            }

            let service = bootstrap::build_service(&config).await?;
            let outcome = service.outcome(request, &CancelHandle::new()).await;

            if let (Some(path), QaOutcome::Answer(answer)) = (&csv, &outcome) {
                let result = supply_qa::execution::ExecutionResult::from_rows(
                    answer.data.clone(),
                    answer.data.len(),
                    answer.execution_time_ms,
                );
                let file = std::fs::File::create(path)
                    .with_context(|| format!("cannot create {}", path.display()))?;
                result.export_csv(file)?;
                info!(path = %path.display(), rows = answer.row_count, "Result exported");
            }

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_answer() {
                std::process::exit(1);
            }
        }
        Command::Index { sources, output } => {
            let output = output
                .or_else(|| config.sources.corpus_path.clone())
                .context("no output path given and CORPUS_PATH is not set")?;
            let pool = match config.database.url {
                Some(_) if config.sources.schema_allowlist_path.is_none() => {
                    Some(supply_qa::db::init_pool(&config.database).await?)
                }
                _ => None,
            };
            let allowlist = bootstrap::load_allowlist(&config, pool.as_ref()).await?;
            let sources = CorpusSources::from_json_file(&sources)?;
            let indexer = CorpusIndexer::new(bootstrap::language_model(&config)?);
            let corpus = indexer.build(&allowlist, &sources).await?;
            corpus.save(&output)?;
            println!(
                "Indexed {} documents into {}",
                corpus.document_count(),
                output.display()
            );
        }
        Command::History { limit } => {
            let history = open_history(&config).await?;
            let records = history.recent(limit).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Feedback {
            id,
            helpful,
            not_helpful,
            comment,
        } => {
            if helpful == not_helpful {
                anyhow::bail!("pass exactly one of --helpful or --not-helpful");
            }
            let history = open_history(&config).await?;
            history.append_feedback(id, &Feedback::new(helpful, comment)).await?;
            println!("Feedback recorded for {}", id);
        }
    }

    Ok(())
}

async fn open_history(config: &EngineConfig) -> Result<Arc<dyn supply_qa::db::HistoryStore>> {
    let pool = match (&config.sources.history_db_path, &config.database.url) {
        (None, Some(_)) => Some(supply_qa::db::init_pool(&config.database).await?),
        _ => None,
    };
    Ok(bootstrap::open_history(config, pool.as_ref()).await?)
}
