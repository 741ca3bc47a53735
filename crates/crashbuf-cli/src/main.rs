//! crashbuf CLI: inspect, sweep and compact a persisted crash buffer store.
//!
//! Output is JSON on stdout; diagnostics go to stderr (`CRASHBUF_LOG`).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use crashbuf_core::{BufferConfig, Clock, ContextId, SystemClock};
use crashbuf_exec::CrashBuffer;
use crashbuf_store::{build_store_from_config, BufferStore, LogStore};
use serde_json::json;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "crashbuf")]
#[command(about = "Inspect and maintain a rolling-window crash buffer store", long_about = None)]
struct Cli {
    /// YAML config file (defaults to CRASHBUF_* environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store URI, e.g. file:///var/lib/crashbuf (overrides config)
    #[arg(long, global = true)]
    store: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every context with its attributes and heartbeat
    Contexts,

    /// Print the replayable window of one context
    Snapshot {
        #[arg(short, long)]
        context: String,

        /// Window length in ms (defaults to the configured window)
        #[arg(long)]
        window_ms: Option<u64>,

        /// End of the window in epoch ms (defaults to now)
        #[arg(long)]
        now: Option<u64>,
    },

    /// Clear contexts whose heartbeat is older than the max age
    Sweep {
        #[arg(long)]
        max_age_ms: Option<u64>,

        #[arg(long)]
        now: Option<u64>,
    },

    /// Rewrite log files without deleted entries
    Compact {
        /// Only this context (defaults to all)
        #[arg(short, long)]
        context: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CRASHBUF_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match load_config(cli.config.as_ref(), cli.store) {
        Ok(config) => run(cli.command, config).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>, store: Option<String>) -> CliResult<BufferConfig> {
    let mut config = match path {
        Some(path) => BufferConfig::from_yaml_path(path)?,
        None => BufferConfig::from_env(),
    };
    if let Some(uri) = store {
        config.store_uri = Some(uri);
    }
    Ok(config)
}

async fn run(command: Commands, config: BufferConfig) -> CliResult<()> {
    let output = match command {
        Commands::Contexts => {
            let store = build_store_from_config(&config.store_config())?;
            serde_json::to_value(store.list_attrs()?)?
        }
        Commands::Snapshot {
            context,
            window_ms,
            now,
        } => {
            let window_ms = window_ms.unwrap_or(config.window_ms);
            let now = now.unwrap_or_else(|| SystemClock.now_ms());
            let buffer = open_buffer(config)?;
            let snapshot = buffer
                .snapshot(&ContextId::new(context), window_ms, now)
                .await;
            serde_json::to_value(snapshot)?
        }
        Commands::Sweep { max_age_ms, now } => {
            let max_age_ms = max_age_ms.unwrap_or(config.stale_context_max_age_ms);
            let now = now.unwrap_or_else(|| SystemClock.now_ms());
            let buffer = open_buffer(config)?;
            let swept = buffer.sweep_stale_contexts(max_age_ms, now).await;
            json!({ "swept": swept, "metrics": buffer.metrics() })
        }
        Commands::Compact { context } => {
            let store_cfg = config.store_config();
            if !matches!(store_cfg.scheme(), None | Some("file")) {
                return Err("compact needs a file:// log store".into());
            }
            let store = LogStore::open(&store_cfg.root, store_cfg.compaction_min_bytes)?;
            let targets = match context {
                Some(id) => vec![ContextId::new(id)],
                None => store.contexts(),
            };
            let mut compacted = Vec::new();
            for ctx in targets {
                if store.compact(&ctx)? {
                    compacted.push(ctx);
                }
            }
            json!({ "compacted": compacted })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Unlike the library default, a store that fails to open is an error here.
fn open_buffer(config: BufferConfig) -> CliResult<CrashBuffer> {
    let store: Arc<dyn BufferStore> = build_store_from_config(&config.store_config())?;
    Ok(CrashBuffer::new(store, config)?)
}
