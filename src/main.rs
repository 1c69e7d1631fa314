mod fixture;

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use switchyard_core::config::AppConfig;
use switchyard_core::event::RunEvent;
use switchyard_engine::{RunStatus, WorkflowDef, WorkflowRunner};

use fixture::FixtureAgent;

#[derive(Parser)]
#[command(name = "switchyard", version, about = "Conditional workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "switchyard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition and print its structure
    Validate {
        /// Workflow definition (TOML)
        workflow: PathBuf,
        /// Print the graph snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a workflow offline; agent nodes answer with their fixtures
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,
        /// Print the full run result as JSON
        #[arg(long)]
        json: bool,
        /// Run input (read from stdin when omitted)
        #[arg(trailing_var_arg = true)]
        input: Vec<String>,
    },
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("switchyard=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "switchyard", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { workflow, json } => validate(&workflow, json),
        Commands::Run {
            workflow,
            json,
            input,
        } => run(config, &workflow, input, json).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        Ok(AppConfig::default())
    }
}

fn validate(workflow: &Path, json: bool) -> anyhow::Result<()> {
    let def = WorkflowDef::load(workflow)?;
    let fixtures = def.fixtures();
    let graph = def.into_graph(Arc::new(FixtureAgent::new(fixtures)))?;
    let snapshot = graph.snapshot();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("Workflow '{}' is valid.", snapshot.name);
    println!("  start: {}", snapshot.start);
    println!("  nodes: {}", snapshot.nodes.len());
    for edge in &snapshot.edges {
        match (&edge.condition, edge.fallback) {
            (Some(cond), Some(fallback)) => println!(
                "  {} -> {}  when {} (fallback: {})",
                edge.from, edge.to, cond, fallback
            ),
            _ => println!("  {} -> {}", edge.from, edge.to),
        }
    }
    println!("  terminals: {}", snapshot.terminals.join(", "));
    Ok(())
}

async fn run(config: AppConfig, workflow: &Path, input: Vec<String>, json: bool) -> anyhow::Result<()> {
    let def = WorkflowDef::load(workflow)?;
    let agent = Arc::new(FixtureAgent::new(def.fixtures()));
    let graph = Arc::new(def.into_graph(agent)?);

    let text = if input.is_empty() {
        let stdin = io::stdin();
        stdin
            .lock()
            .lines()
            .map_while(|l| l.ok())
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        input.join(" ")
    };

    let runner = WorkflowRunner::new(config);
    let mut rx = runner.subscribe();
    let handle = runner.start_run(graph, text);
    let run_id = handle.run_id().clone();

    // Cancel the run on Ctrl-C
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel.cancel();
    });

    // Spawn event printer
    let print_handle = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if event.run_id() != &run_id {
                continue;
            }
            match event {
                RunEvent::NodeStarted { node, attempt, .. } => {
                    eprintln!("[{}] started (attempt {})", node, attempt);
                }
                RunEvent::NodeRetrying { node, backoff_ms, error, .. } => {
                    eprintln!("[{}] retrying in {}ms: {}", node, backoff_ms, error);
                }
                RunEvent::NodeCompleted { node, elapsed_ms, .. } => {
                    eprintln!("[{}] ok ({}ms)", node, elapsed_ms);
                }
                RunEvent::NodeFailed { node, error, .. } => {
                    eprintln!("[{}] FAILED: {}", node, error);
                }
                RunEvent::EdgeSkipped { from, to, .. } => {
                    eprintln!("  {} -> {} skipped", from, to);
                }
                RunEvent::ConditionFallback { from, to, value, reason, .. } => {
                    eprintln!("  {} -> {} fallback={} ({})", from, to, value, reason);
                }
                RunEvent::Anomaly { anomaly, .. } => {
                    eprintln!("  anomaly: {}", anomaly);
                }
                RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. } => break,
                _ => {}
            }
        }
    });

    let result = handle.await_result().await;
    // The printer stops at the run's final event; don't hang if it never came.
    tokio::time::timeout(Duration::from_millis(500), print_handle).await.ok();

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if let Some(output) = result.final_output() {
        println!("{}", output.text());
    }

    match (result.status, result.error) {
        (RunStatus::Completed, _) => Ok(()),
        (_, Some(e)) => Err(anyhow::anyhow!("run {} failed: {}", result.run_id, e.message)),
        (status, None) => Err(anyhow::anyhow!("run {} ended {}", result.run_id, status)),
    }
}
