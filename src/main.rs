//! asktrack - asynchronous AI job tracker
//!
//! Runs the trackers as a long-lived process, or submits and follows a
//! single job from the command line.

use anyhow::Context;
use asktrack::task::AggregateKind;
use asktrack::{
    AggregateKey, AiServiceClient, AppConfig, Services, SqliteStore, TaskInput, TaskKind,
    TrackerError, TrackerHub, DEFAULT_CONFIG_FILE,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "asktrack")]
#[command(version)]
#[command(about = "Track asynchronous AI jobs until they finish", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "ASKTRACK_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-hydrate unfinished jobs and poll until interrupted
    Run,

    /// Ask a question and wait for its step-by-step answer
    Ask {
        /// The question
        question: String,

        /// Id of the owning thread response
        #[arg(long)]
        parent: i64,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "300")]
        timeout: u64,
    },

    /// Submit a job and optionally follow it to completion
    Submit {
        /// Job kind (ask, ask-detail, explain, chart, chart-adjustment,
        /// recommend-questions, adjustment)
        #[arg(short, long)]
        kind: TaskKind,

        /// Kind of the owning aggregate
        #[arg(long, default_value = "thread_response")]
        parent_kind: AggregateKind,

        /// Id of the owning aggregate
        #[arg(long)]
        parent: i64,

        /// The user's question
        #[arg(short, long)]
        question: Option<String>,

        /// Request body as JSON (defaults to {"query": <question>})
        #[arg(long)]
        payload: Option<String>,

        /// Poll until the job finishes
        #[arg(short, long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "300")]
        timeout: u64,
    },

    /// Ask the AI service to stop a job
    Cancel {
        /// Job kind
        #[arg(short, long)]
        kind: TaskKind,

        /// Query id of the job
        query_id: String,
    },

    /// List persisted jobs that have not finished
    Pending {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing; RUST_LOG wins over the built-in levels
    let default_filter = if cli.verbose {
        "asktrack=debug,info"
    } else {
        "asktrack=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    if let Err(e) = execute(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        let code = e
            .downcast_ref::<TrackerError>()
            .map_or(1, TrackerError::exit_code);
        std::process::exit(code);
    }
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Run => {
            config.validate()?;
            let hub = open_hub(&config)?;

            let restored = hub.rehydrate().await?;
            hub.start();
            println!(
                "{} Tracking {} unfinished job(s) from {}",
                "OK".green().bold(),
                restored,
                config.store.path.display()
            );

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            println!("\n{} Shutting down...", "Info:".blue());
            hub.shutdown().await;
        }

        Commands::Ask {
            question,
            parent,
            timeout,
        } => {
            config.validate()?;
            let hub = open_hub(&config)?;
            let input = TaskInput::question(question);
            let parent = AggregateKey::thread_response(parent);
            let query_id = submit(&hub, TaskKind::AskDetail, parent, input).await?;
            follow(
                &hub,
                TaskKind::AskDetail,
                &query_id,
                Duration::from_secs(timeout),
                &config,
            )
            .await?;
        }

        Commands::Submit {
            kind,
            parent_kind,
            parent,
            question,
            payload,
            wait,
            timeout,
        } => {
            config.validate()?;
            let hub = open_hub(&config)?;

            let mut input = match question {
                Some(question) => TaskInput::question(question),
                None => TaskInput::default(),
            };
            if let Some(payload) = payload {
                let body = serde_json::from_str(&payload).context("--payload is not valid JSON")?;
                input = input.with_payload(body);
            }

            let parent = AggregateKey::new(parent_kind, parent);
            let query_id = submit(&hub, kind, parent, input).await?;
            if wait {
                follow(&hub, kind, &query_id, Duration::from_secs(timeout), &config).await?;
            }
        }

        Commands::Cancel { kind, query_id } => {
            config.validate()?;
            let hub = open_hub(&config)?;
            hub.cancel(kind, &query_id).await?;
            println!(
                "{} Cancellation requested for {}; it takes effect on the next poll",
                "OK".green().bold(),
                query_id
            );
        }

        Commands::Pending { json } => {
            let store = SqliteStore::open(&config.store.path)?;
            let pending = asktrack::store::pending(&store).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else if pending.is_empty() {
                println!("{} No unfinished jobs", "OK".green());
            } else {
                println!("{} {} unfinished job(s):\n", "Pending:".cyan().bold(), pending.len());
                for record in &pending {
                    println!(
                        "  {:<36} {:<20} {:<14} {}",
                        record.query_id.as_deref().unwrap_or("-"),
                        record.key.kind.to_string(),
                        record.status.as_deref().unwrap_or("-"),
                        record.key.parent
                    );
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show { json } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                } else {
                    print!("{}", config.to_toml()?);
                }
            }

            ConfigAction::Validate => {
                config.validate()?;
                println!(
                    "{} Configuration is valid: {}",
                    "OK".green().bold(),
                    cli.config.display()
                );
            }
        },
    }

    Ok(())
}

fn open_hub(config: &AppConfig) -> anyhow::Result<TrackerHub> {
    let ai = Arc::new(AiServiceClient::new(
        config.ai_service.endpoint.as_str(),
        config.request_timeout(),
    )?);
    let store = Arc::new(SqliteStore::open(&config.store.path)?);
    let telemetry = asktrack::telemetry::from_config(&config.telemetry)?;
    Ok(TrackerHub::from_config(
        config,
        Services::new(ai, store),
        telemetry,
    ))
}

async fn submit(
    hub: &TrackerHub,
    kind: TaskKind,
    parent: AggregateKey,
    input: TaskInput,
) -> anyhow::Result<String> {
    let snapshot = hub.submit(kind, parent, input).await?;
    println!(
        "{} Submitted {} job {}",
        "OK".green().bold(),
        kind,
        snapshot.query_id.bold()
    );
    println!("   {}", snapshot.status.dimmed());
    Ok(snapshot.query_id)
}

/// Tick until the job is finalized, printing each status change.
async fn follow(
    hub: &TrackerHub,
    kind: TaskKind,
    query_id: &str,
    timeout: Duration,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let interval = Duration::from_millis(config.tracker.poll_interval_ms);
    let mut last = hub
        .find_task(kind, query_id)
        .map(|task| task.status)
        .unwrap_or_default();

    loop {
        for tick in hub.tick_all() {
            tick.wait().await;
        }

        match hub.find_task(kind, query_id) {
            Some(task) if task.finalized_at.is_none() => {
                if task.status != last {
                    println!("   {}", task.status.dimmed());
                    last = task.status;
                }
                if task.stuck {
                    println!(
                        "   {} {} failed polls in a row",
                        "Warning:".yellow().bold(),
                        task.consecutive_failures
                    );
                }
            }
            _ => break,
        }

        if started.elapsed() >= timeout {
            anyhow::bail!("{} did not finish within {}s", query_id, timeout.as_secs());
        }
        tokio::time::sleep(interval).await;
    }

    let record = hub
        .services()
        .store
        .find_by_query_id(query_id)
        .await?
        .with_context(|| format!("no record for {}", query_id))?;
    let status = record.status.as_deref().unwrap_or("-");

    if status == "FINISHED" {
        println!("{} {} finished", "OK".green().bold(), query_id);
        if let Some(detail) = &record.detail {
            println!("{}", serde_json::to_string_pretty(detail)?);
        }
    } else {
        println!("{} {} ended {}", "Warning:".yellow().bold(), query_id, status);
        if let Some(error) = &record.error {
            println!("{}", serde_json::to_string_pretty(error)?);
        }
    }
    if let Some(merge_error) = &record.merge_error {
        println!(
            "{} explanation could not be merged: {}",
            "Warning:".yellow().bold(),
            merge_error
        );
    }
    Ok(())
}
