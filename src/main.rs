//! # Code Analyzer CLI (`analyzer`)
//!
//! Ask questions about a Git repository from the command line.
//!
//! ## Usage
//!
//! ```bash
//! analyzer --config ./config/analyzer.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `analyzer init` | Create the SQLite database and run schema migrations |
//! | `analyzer analyze <repo> "<query>"` | Ingest the repository if needed, then answer |
//! | `analyzer ingest <repo>` | Ingest only |
//! | `analyzer ask <repo> "<query>"` | Answer from the existing embeddings |
//! | `analyzer runs` | List recorded pipeline runs |
//! | `analyzer resume <run-id> "<query>"` | Take over an interrupted run |
//! | `analyzer chaos serve` | Run the fault-injection toggle server |
//! | `analyzer chaos toggle <fault>` | Flip a fault on the toggle server |
//! | `analyzer completions <shell>` | Print shell completions |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `warn`).
//! Answers go to stdout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use code_analyzer::analyze::{Adapters, AnalyzeOptions, AnalyzeOutcome, Analyzer, PipelineSettings};
use code_analyzer::config::{self, Config};
use code_analyzer::progress::ProgressMode;
use code_analyzer::runs::{PipelineRun, RunLedger};
use code_analyzer::{chaos_server, db, migrate};
use code_analyzer_core::models::RepositoryId;

/// Code Analyzer: ask natural-language questions about a Git repository.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/analyzer.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "analyzer",
    about = "Ask natural-language questions about a Git repository",
    version,
    long_about = "Code Analyzer snapshots a Git repository, embeds every source file, stores the \
    vectors in SQLite and answers questions by retrieving the closest files and passing them to \
    a chat model. Every run is recorded in a durable ledger and can be resumed."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/analyzer.toml")]
    config: PathBuf,

    /// Progress on stderr: `human`, `json` or `off`. Defaults to `human`
    /// when stderr is a terminal.
    #[arg(long, global = true)]
    progress: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Print command results as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file with the `embeddings` and
    /// `pipeline_runs` tables. Running it again is safe.
    Init,

    /// Answer a question about a repository, ingesting it first if needed.
    Analyze {
        /// Repository identifier, usually a clone URL.
        repository: String,

        /// The question.
        query: String,

        /// Number of related files to put in the prompt.
        #[arg(long)]
        top_k: Option<usize>,

        /// Cancel the run after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Ingest a repository without asking anything.
    Ingest {
        repository: String,

        /// Re-ingest even if embeddings already exist.
        #[arg(long)]
        force: bool,
    },

    /// Answer from the stored embeddings without ingesting or recording a run.
    Ask {
        repository: String,
        query: String,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// List recorded runs, newest first.
    Runs {
        /// Only show runs of this repository.
        #[arg(long)]
        repository: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Take over an unfinished run and drive it to an answer.
    Resume {
        run_id: String,
        query: String,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Fault injection for testing retries and cleanup.
    Chaos {
        #[command(subcommand)]
        command: ChaosCommands,
    },

    /// Print shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ChaosCommands {
    /// Run the toggle server polled through `chaos.server_url`.
    Serve {
        #[arg(long, default_value = chaos_server::DEFAULT_BIND)]
        bind: String,
    },

    /// Flip a fault (`github` or `aws`) on a running toggle server.
    Toggle {
        fault: String,

        #[arg(long, default_value = "http://127.0.0.1:8080/")]
        url: String,

        /// Keep the fault on until Ctrl-C, then flip it back.
        #[arg(long)]
        hold: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    // Commands that don't require config
    match cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "analyzer", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Chaos { command } => return run_chaos(command).await,
        _ => {}
    }

    let progress = progress_mode(cli.progress.as_deref())?;
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Analyze {
            repository,
            query,
            top_k,
            timeout_secs,
        } => {
            let analyzer = build_analyzer(&cfg, progress).await?;
            let cancel = cancel_on_ctrl_c();
            let options = AnalyzeOptions {
                top_k,
                timeout: timeout_secs.map(Duration::from_secs),
            };
            let outcome = analyzer
                .analyze(&repository, &query, options, &cancel)
                .await?;
            print_outcome(&outcome, cli.json)?;
        }
        Commands::Ingest { repository, force } => {
            let analyzer = build_analyzer(&cfg, progress).await?;
            let cancel = cancel_on_ctrl_c();
            let outcome = analyzer.ingest(&repository, force, &cancel).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                match outcome.report {
                    Some(report) => println!(
                        "Ingested {} file(s): {} embedded, {} skipped, {} inserted (run {}).",
                        report.keys, report.embedded, report.skipped, report.inserted, outcome.run_id
                    ),
                    None => println!("Already ingested (run {}).", outcome.run_id),
                }
            }
        }
        Commands::Ask {
            repository,
            query,
            top_k,
        } => {
            let analyzer = build_analyzer(&cfg, progress).await?;
            let cancel = cancel_on_ctrl_c();
            let answer = analyzer.ask(&repository, &query, top_k, &cancel).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                print_answer(&answer.response, &answer.sources);
            }
        }
        Commands::Runs { repository, limit } => {
            let pool = db::connect(&cfg).await?;
            migrate::apply_schema(&pool).await?;
            let repository = repository
                .map(|r| RepositoryId::parse(&r).context("--repository must not be empty"))
                .transpose()?;
            let runs = RunLedger::new(pool)
                .list(repository.as_ref(), limit)
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                print_runs(&runs);
            }
        }
        Commands::Resume {
            run_id,
            query,
            top_k,
        } => {
            let analyzer = build_analyzer(&cfg, progress).await?;
            let cancel = cancel_on_ctrl_c();
            let options = AnalyzeOptions {
                top_k,
                timeout: None,
            };
            let outcome = analyzer.resume(&run_id, &query, options, &cancel).await?;
            print_outcome(&outcome, cli.json)?;
        }
        // Handled before the config was loaded.
        Commands::Completions { .. } | Commands::Chaos { .. } => {}
    }

    Ok(())
}

async fn run_chaos(command: ChaosCommands) -> anyhow::Result<()> {
    match command {
        ChaosCommands::Serve { bind } => {
            chaos_server::run_server(&bind, cancel_on_ctrl_c()).await?;
        }
        ChaosCommands::Toggle { fault, url, hold } => {
            let active = chaos_server::toggle(&url, &fault).await?;
            println!("Fault {} is {}.", fault, if active { "on" } else { "off" });
            if hold && active {
                cancel_on_ctrl_c().cancelled().await;
                chaos_server::toggle(&url, &fault).await?;
                println!("Fault {} is off.", fault);
            }
        }
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn progress_mode(flag: Option<&str>) -> anyhow::Result<ProgressMode> {
    Ok(match flag {
        None => ProgressMode::default_for_tty(),
        Some("human") => ProgressMode::Human,
        Some("json") => ProgressMode::Json,
        Some("off") => ProgressMode::Off,
        Some(other) => anyhow::bail!(
            "Unknown progress mode: '{}'. Must be human, json or off.",
            other
        ),
    })
}

async fn build_analyzer(cfg: &Config, progress: ProgressMode) -> anyhow::Result<Analyzer> {
    let pool = db::connect(cfg).await?;
    migrate::apply_schema(&pool).await?;
    let adapters = Adapters::from_config(cfg, pool.clone())?;
    Ok(
        Analyzer::new(adapters, RunLedger::new(pool), PipelineSettings::from_config(cfg))
            .with_progress(Arc::from(progress.reporter())),
    )
}

/// A token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling run");
            token.cancel();
        }
    });
    cancel
}

fn print_outcome(outcome: &AnalyzeOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    print_answer(&outcome.response, &outcome.sources);
    if let Some(ref report) = outcome.ingestion {
        eprintln!(
            "run {}: ingested {} file(s), {} skipped",
            outcome.run_id, report.inserted, report.skipped
        );
    }
    Ok(())
}

fn print_answer(response: &str, sources: &[String]) {
    println!("{}", response);
    if !sources.is_empty() {
        println!();
        println!("Sources:");
        for source in sources {
            println!("  - {}", source);
        }
    }
}

fn print_runs(runs: &[PipelineRun]) {
    if runs.is_empty() {
        println!("No runs.");
        return;
    }
    println!(
        "{:<36}  {:<20}  {:<19}  REPOSITORY",
        "RUN", "STAGE", "UPDATED"
    );
    for run in runs {
        let updated = chrono::DateTime::from_timestamp(run.updated_at, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let stage = match run.failed_stage {
            Some(failed) if run.error.is_some() => format!("{} ({})", run.stage, failed),
            _ => run.stage.to_string(),
        };
        println!(
            "{:<36}  {:<20}  {:<19}  {}",
            run.run_id, stage, updated, run.repository
        );
    }
}
