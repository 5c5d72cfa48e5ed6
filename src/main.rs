use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use troupe_agent::{build_graphs, ToolRegistry, Workflow};
use troupe_core::config::WorkflowConfig;
use troupe_core::types::{WorkflowEvent, WorkflowResult, WorkflowStatus};
use troupe_llm::ProviderRegistry;

#[derive(Parser)]
#[command(name = "troupe", version, about = "Run multi-agent task workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow to completion
    Run {
        /// Workflow file (TOML)
        file: PathBuf,
        /// Workflow input as KEY=VALUE (repeatable)
        #[arg(short, long = "input", value_parser = parse_input)]
        inputs: Vec<(String, String)>,
        /// Override the configured max concurrency
        #[arg(long)]
        concurrency: Option<usize>,
        /// Write the workflow log as JSON lines to this file
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Print the execution plan and context edges
    Graph {
        /// Workflow file (TOML)
        file: PathBuf,
    },
    /// Show the parsed workflow file
    Config {
        /// Workflow file (TOML)
        file: PathBuf,
    },
}

fn parse_input(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty input name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("troupe=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            inputs,
            concurrency,
            log,
        } => {
            let mut config = load(&file)?;
            if let Some(max) = concurrency {
                config.workflow.max_concurrency = max;
            }
            let inputs = inputs
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            run(&config, inputs, log.as_deref()).await?;
        }
        Commands::Graph { file } => {
            let config = load(&file)?;
            print_plan(&config)?;
        }
        Commands::Config { file } => {
            let config = load(&file)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load(path: &Path) -> anyhow::Result<WorkflowConfig> {
    WorkflowConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

async fn run(
    config: &WorkflowConfig,
    inputs: HashMap<String, Value>,
    log_path: Option<&Path>,
) -> anyhow::Result<()> {
    let providers = ProviderRegistry::with_builtins();
    let tools = ToolRegistry::new();
    let workflow = Workflow::from_config(config, &providers, &tools)?;
    info!(workflow = %workflow.name(), run_id = %workflow.run_id(), "Loaded workflow");

    let mut rx = workflow.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                WorkflowEvent::TaskStatusChanged { task_id, from, to, .. } => {
                    eprintln!("[task {task_id}] {from} -> {to}");
                }
                WorkflowEvent::ToolFinished { tool, result, .. } => {
                    let tag = if result.is_error { "ERROR" } else { "ok" };
                    eprintln!("  [{tool}: {tag}] {}", truncate(&result.content, 200));
                }
                WorkflowEvent::WorkflowStatusChanged { to, .. } if to.is_terminal() => break,
                _ => {}
            }
        }
    });

    let stopper = workflow.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stopping workflow...");
            if let Err(e) = stopper.stop().await {
                warn!(error = %e, "Stop failed");
            }
        }
    });

    let outcome = workflow.start(inputs).await;
    ctrl_c.abort();
    if outcome.is_ok() {
        printer.await.ok();
    } else {
        printer.abort();
    }

    if let Some(path) = log_path {
        std::fs::write(path, workflow.log_jsonl()?)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    match outcome {
        Ok(result) => {
            print_result(&result);
            if result.status != WorkflowStatus::Finished {
                std::process::exit(2);
            }
            Ok(())
        }
        Err(e) => {
            let stats = workflow.stats();
            eprintln!(
                "\n[{} iterations, {} LLM calls, {} ms]",
                stats.iterations, stats.llm_calls, stats.duration_ms
            );
            Err(e.into())
        }
    }
}

fn print_result(result: &WorkflowResult) {
    match &result.result {
        Some(Value::String(text)) => println!("{text}"),
        Some(other) => println!("{other}"),
        None => {}
    }
    let stats = &result.stats;
    eprintln!(
        "\n[{}: {}/{} tasks, {} iterations, {} tool calls, {} in / {} out tokens, {} ms]",
        result.status,
        stats.tasks_completed,
        stats.task_count,
        stats.iterations,
        stats.tool_calls,
        stats.input_tokens,
        stats.output_tokens,
        stats.duration_ms
    );
}

fn print_plan(config: &WorkflowConfig) -> anyhow::Result<()> {
    let tasks = config.build_tasks();
    let graphs = build_graphs(&tasks)?;

    println!(
        "Workflow: {} ({:?}, concurrency {})",
        config.workflow.name,
        config.workflow.mode,
        config.workflow.effective_concurrency()
    );
    println!("\nExecution plan:");
    for (level, nodes) in graphs.execution.levels().iter().enumerate() {
        let names: Vec<&str> = nodes.iter().map(|&n| tasks[n].id.as_str()).collect();
        println!("  {}. {}", level + 1, names.join(", "));
    }

    let edges = graphs.context.edges();
    println!("\nContext edges:");
    if edges.is_empty() {
        println!("  (none)");
    }
    for (from, to) in edges {
        println!("  {} -> {}", tasks[from].id, tasks[to].id);
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
