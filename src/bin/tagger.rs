#![forbid(unsafe_code)]

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use survey_tagger::cache::SqliteCallCache;
use survey_tagger::gateway::{ChatGateway, NoopUsageSink, ProviderGateway, StderrUsageSink};
use survey_tagger::input::{load_responses, DEFAULT_COLUMN};
use survey_tagger::pipeline::{
    spawn_analysis, AnalysisSession, CachedModelClient, GatewayModelClient, JsonlTraceSink,
    LogEntry, ModelClient, PipelineConfig, TraceSink, DEFAULT_MODEL,
};

/// How often the CLI drains session logs while a run is in flight.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "tagger", version, about = "Survey response tagging CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tag, group and summarize survey responses (LLM calls)
    Analyze {
        /// .txt (one response per line), .csv (headed table) or .json (array of
        /// strings or objects)
        #[arg(long)]
        input: PathBuf,
        /// CSV header or JSON object field holding the response text
        #[arg(long, default_value = DEFAULT_COLUMN)]
        column: String,
        #[arg(long)]
        out: PathBuf,
        /// Pipeline configuration JSON (missing fields use defaults)
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, env = "TAGGER_MODEL", default_value = DEFAULT_MODEL)]
        model: String,
        /// SQLite model-call cache (default: $TAGGER_CACHE_PATH or .tagger_model_cache.sqlite)
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long, conflicts_with = "cache")]
        no_cache: bool,
        /// Write one JSON line per model call
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Print provider usage records to stderr
        #[arg(long)]
        usage: bool,
    },
    /// Print the default pipeline configuration
    Config,
    /// Prune the model-call cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            input,
            column,
            out,
            config,
            model,
            cache,
            no_cache,
            trace,
            usage,
        } => {
            let config: PipelineConfig = match config {
                Some(path) => read_json(&path)?,
                None => PipelineConfig::default(),
            };
            config.validate()?;
            let responses = load_responses(&input, &column)?;
            eprintln!(
                "[tagger] loaded {} responses from {}",
                responses.len(),
                input.display()
            );

            let gateway: Arc<dyn ChatGateway> = if usage {
                Arc::new(ProviderGateway::from_env(Arc::new(StderrUsageSink))?)
            } else {
                Arc::new(ProviderGateway::from_env(Arc::new(NoopUsageSink))?)
            };

            let session = Arc::new(AnalysisSession::new());
            let client = GatewayModelClient::new(gateway, model).with_run(session.id());

            let cache = if no_cache {
                None
            } else {
                let path = cache.unwrap_or_else(SqliteCallCache::default_path);
                Some(SqliteCallCache::new(path)?)
            };
            let _lock = match &cache {
                Some(cache) => Some(cache.lock_exclusive()?),
                None => None,
            };
            let model_client: Arc<dyn ModelClient> = match cache {
                Some(cache) => Arc::new(CachedModelClient::new(client, Arc::new(cache))),
                None => Arc::new(client),
            };

            let (trace_sink, trace_worker) = match trace {
                Some(path) => {
                    let (sink, worker) = JsonlTraceSink::new(path)?;
                    (Some(Arc::new(sink) as Arc<dyn TraceSink>), Some(worker))
                }
                None => (None, None),
            };

            let cancel = Arc::new(AtomicBool::new(false));
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("[tagger] interrupt received; stopping before the next model call");
                        cancel.store(true, Ordering::Relaxed);
                    }
                });
            }

            let handle = spawn_analysis(
                model_client,
                config,
                responses,
                session.clone(),
                trace_sink,
                cancel,
            );

            let mut cursor = 0;
            while !handle.is_finished() {
                tokio::time::sleep(POLL_INTERVAL).await;
                cursor = print_logs(&session, cursor);
            }
            print_logs(&session, cursor);

            let result = handle.await?;
            if let Some(worker) = trace_worker {
                worker.join()?;
            }
            let result = result?;

            write_json(&out, &result)?;
            println!(
                "wrote {}: {} raw tags, {} normalized tags, {} summaries ({} model calls)",
                out.display(),
                result.tags_raw.len(),
                result.normalized_tags.len(),
                result.summaries.len(),
                result.meta.model_calls
            );
        }
        Commands::Config => {
            let json = serde_json::to_string_pretty(&PipelineConfig::default())?;
            println!("{json}");
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(SqliteCallCache::default_path);
            let cache = SqliteCallCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}

fn print_logs(session: &AnalysisSession, cursor: usize) -> usize {
    let (entries, next): (Vec<LogEntry>, usize) = session.logs_since(cursor);
    for entry in entries {
        eprintln!(
            "[tagger] {} {:<7} {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.level.as_str(),
            entry.message
        );
    }
    next
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &PathBuf,
) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
