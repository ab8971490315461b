mod config;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use conductor_core::{HumanInterrupt, HumanResponse};
use conductor_orchestrator::{
    Goal, GuardedExecutor, StaticAnalyzer, ToolStatus, WorkflowEngine, WorkflowState,
};
use config::ConductorConfig;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: durable human-in-the-loop workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a workflow thread for a goal
    Run {
        /// Business goal in plain language
        goal: String,
        /// Plan file (JSON or TOML) describing workers and the work plan
        #[arg(short, long)]
        plan: PathBuf,
        /// Thread id (generated when omitted)
        #[arg(short, long)]
        thread: Option<String>,
        #[arg(long)]
        kpi: Vec<String>,
        #[arg(long)]
        constraint: Vec<String>,
        #[arg(long)]
        budget: Option<String>,
        #[arg(long)]
        timeline: Option<String>,
    },
    /// Answer an open interrupt and continue the thread
    Resume {
        thread: String,
        #[arg(short, long)]
        plan: PathBuf,
        /// Interrupt to answer (defaults to the oldest open one)
        #[arg(long)]
        interrupt: Option<Uuid>,
        /// Input as key=value; values that parse as JSON are kept as JSON
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        #[arg(long, conflicts_with = "reject")]
        approve: bool,
        /// Reject with a reason
        #[arg(long)]
        reject: Option<String>,
    },
    /// Continue a thread after a crash
    Recover {
        thread: String,
        #[arg(short, long)]
        plan: PathBuf,
    },
    /// Show a thread's state, or list threads
    Status {
        thread: Option<String>,
        /// Print the full state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the open interrupts of a thread
    Pending { thread: String },
    /// Show a thread's checkpoints, newest first
    History {
        thread: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Record a tool connection status
    ConnectTool {
        thread: String,
        tool: String,
        #[arg(long, default_value = "connected")]
        status: String,
    },
    /// Delete a thread and all its checkpoints
    Delete { thread: String },
}

/// Parses `key=value`. A value that is valid JSON is kept as JSON, anything else as a string.
fn parse_input(raw: &str) -> anyhow::Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("input '{raw}' is not in key=value form");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("input '{raw}' has an empty key");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn build_response(
    interrupt_id: Uuid,
    inputs: &[String],
    approve: bool,
    reject: Option<String>,
) -> anyhow::Result<HumanResponse> {
    let mut response = match reject {
        Some(reason) => HumanResponse::reject(interrupt_id, reason),
        None if approve => HumanResponse::approve(interrupt_id),
        None => HumanResponse::new(interrupt_id),
    };
    for raw in inputs {
        let (key, value) = parse_input(raw)?;
        response = response.with_input(key, value);
    }
    Ok(response)
}

fn engine(config: &ConductorConfig, plan: Option<&PathBuf>) -> anyhow::Result<WorkflowEngine> {
    let analyzer = match plan {
        Some(path) => StaticAnalyzer::from_file(path)
            .with_context(|| format!("Failed to load plan '{}'", path.display()))?,
        None => StaticAnalyzer::default(),
    };
    Ok(WorkflowEngine::new(
        config.open_store()?,
        Arc::new(analyzer),
        Arc::new(GuardedExecutor::checklist()),
    )
    .with_config(config.engine_config()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_summary(thread: &str, state: &WorkflowState) {
    println!("Thread:    {thread}");
    println!("Goal:      {}", state.goal.text);
    println!("Phase:     {}", state.phase);
    if let Some(error) = &state.error {
        println!("Error:     {error}");
    }
    println!("Workers:   {}", state.workers.len());
    println!("Projects:  {}", state.projects.len());
    let mut tasks: Vec<_> = state.tasks.values().collect();
    tasks.sort_by_key(|t| t.seq);
    println!("Tasks:     {}", tasks.len());
    for task in tasks {
        println!("  [{}] {} ({})", task.status, task.name, task.id);
    }
    if state.pending_interrupts.is_empty() {
        if !state.should_continue {
            println!("\nThread finished.");
        }
    } else {
        println!("\nWaiting on {} interrupt(s):", state.pending_interrupts.len());
        for interrupt in &state.pending_interrupts {
            println!("  {} {}: {}", interrupt.id, interrupt.kind, interrupt.message);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = ConductorConfig::load(&cli.config)?;
    config.init_logging();

    match cli.command {
        Commands::Run {
            goal,
            plan,
            thread,
            kpi,
            constraint,
            budget,
            timeline,
        } => {
            let engine = engine(&config, Some(&plan))?;
            let thread = thread.unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut goal = Goal::new(goal).with_kpis(kpi).with_constraints(constraint);
            if let Some(budget) = budget {
                goal = goal.with_budget(budget);
            }
            if let Some(timeline) = timeline {
                goal = goal.with_timeline(timeline);
            }
            info!(thread_id = %thread, "Starting workflow");
            let state = engine.run(&thread, goal).await?;
            print_summary(&thread, &state);
        }
        Commands::Resume {
            thread,
            plan,
            interrupt,
            inputs,
            approve,
            reject,
        } => {
            let engine = engine(&config, Some(&plan))?;
            let interrupt_id = match interrupt {
                Some(id) => id,
                None => match engine.get_pending_interrupt(&thread).await? {
                    Some(view) => view.id,
                    None => bail!("thread '{thread}' has no open interrupt"),
                },
            };
            let response = build_response(interrupt_id, &inputs, approve, reject)?;
            let state = engine.resume(&thread, response).await?;
            print_summary(&thread, &state);
        }
        Commands::Recover { thread, plan } => {
            let engine = engine(&config, Some(&plan))?;
            let state = engine.recover(&thread).await?;
            print_summary(&thread, &state);
        }
        Commands::Status { thread, json } => {
            let engine = engine(&config, None)?;
            match thread {
                Some(thread) => match engine.get_state(&thread).await? {
                    Some(state) if json => print_json(&state)?,
                    Some(state) => print_summary(&thread, &state),
                    None => bail!("thread '{thread}' not found"),
                },
                None => {
                    let threads = engine.threads().await?;
                    if threads.is_empty() {
                        println!("No threads.");
                    }
                    for thread in threads {
                        let suspended = engine.is_suspended(&thread).await?;
                        println!("{thread}{}", if suspended { "  (suspended)" } else { "" });
                    }
                }
            }
        }
        Commands::Pending { thread } => {
            let engine = engine(&config, None)?;
            let views: Vec<_> = engine
                .pending_interrupts(&thread)
                .await?
                .iter()
                .map(HumanInterrupt::display)
                .collect();
            print_json(&views)?;
        }
        Commands::History { thread, limit } => {
            let engine = engine(&config, None)?;
            for checkpoint in engine.history(&thread, limit).await? {
                println!(
                    "{}  {}  step={:<3} {:<7} writes={:<18} next={}",
                    checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
                    checkpoint.id,
                    checkpoint.metadata.step,
                    format!("{:?}", checkpoint.metadata.source).to_lowercase(),
                    checkpoint.metadata.writes.as_deref().unwrap_or("-"),
                    checkpoint.metadata.next.as_deref().unwrap_or("(end)"),
                );
            }
        }
        Commands::ConnectTool {
            thread,
            tool,
            status,
        } => {
            let status: ToolStatus = status.parse().map_err(anyhow::Error::msg)?;
            let engine = engine(&config, None)?;
            engine.connect_tool(&thread, &tool, status).await?;
            println!("Tool '{tool}' recorded as {status:?} on thread '{thread}'");
        }
        Commands::Delete { thread } => {
            let engine = engine(&config, None)?;
            engine.delete(&thread).await?;
            println!("Deleted thread '{thread}'");
        }
    }

    Ok(())
}
