//! Command-line interface for pipewright.
//!
//! Provides commands for validating and running pipeline definitions,
//! inspecting executions, recovering interrupted ones and listing the
//! node kinds and definition versions the engine knows about.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::config::{config, ResolvedConfig};
use crate::core::{InvalidDefinition, Orchestrator, SubscriptionItem, ValidationError, Validator};
use crate::domain::{Execution, ExecutionFilter, ExecutionStatus, Health, PipelineDefinition};
use crate::registry::NodeRegistry;

/// pipewright - Pipeline definition and execution engine
#[derive(Parser, Debug)]
#[command(name = "pipewright")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a definition and print its execution plan
    Validate {
        /// Definition file (.yaml, .yml or .json)
        file: PathBuf,

        /// Print the plan (or errors) as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a definition and follow it until it finishes (Ctrl-C cancels)
    Run {
        /// Definition file (.yaml, .yml or .json)
        file: PathBuf,

        /// Only print the final result
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show the state of an execution
    Status {
        /// Execution ID (UUID)
        execution_id: String,

        /// Also print the raw transition log
        #[arg(long)]
        events: bool,
    },

    /// List executions, most recent first
    Executions {
        /// Only executions in this status
        #[arg(short, long, value_enum)]
        status: Option<StatusArg>,

        /// Only executions of this pipeline id
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Only Running executions whose scheduler stopped heartbeating
        #[arg(long)]
        stalled: bool,

        /// Maximum number of executions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Resume every unfinished execution and wait for them (Ctrl-C drains)
    Recover,

    /// List registered node kinds
    Kinds,

    /// List stored definition versions
    Definitions {
        /// Only versions of this pipeline id
        id: Option<String>,
    },

    /// Show the resolved configuration
    Config,
}

/// Execution status filter for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl From<StatusArg> for ExecutionStatus {
    fn from(s: StatusArg) -> Self {
        match s {
            StatusArg::Pending => ExecutionStatus::Pending,
            StatusArg::Running => ExecutionStatus::Running,
            StatusArg::Succeeded => ExecutionStatus::Succeeded,
            StatusArg::Failed => ExecutionStatus::Failed,
            StatusArg::Cancelled => ExecutionStatus::Cancelled,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Validate { file, json } => validate_definition(&file, json).await,
            Commands::Run { file, quiet } => run_definition(&file, quiet).await,
            Commands::Status {
                execution_id,
                events,
            } => show_status(&execution_id, events).await,
            Commands::Executions {
                status,
                pipeline,
                stalled,
                limit,
            } => {
                let filter = ExecutionFilter {
                    status: status.map(Into::into),
                    pipeline_id: pipeline,
                    stalled_only: stalled,
                    unfinished_only: false,
                    limit: Some(limit),
                };
                list_executions(&filter).await
            }
            Commands::Recover => recover_executions().await,
            Commands::Kinds => list_kinds(),
            Commands::Definitions { id } => list_definitions(id.as_deref()).await,
            Commands::Config => show_config(),
        }
    }
}

/// Install the process-wide registry for this configuration
fn registry(config: &ResolvedConfig) -> Result<Arc<NodeRegistry>> {
    Ok(NodeRegistry::install(
        NodeRegistry::with_builtins(&config.safety).build(),
    )?)
}

async fn orchestrator() -> Result<Orchestrator> {
    let config = config()?;
    Orchestrator::from_config(config, registry(config)?).await
}

fn parse_execution_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid execution ID: {}", s))
}

fn print_validation_errors(pipeline: &str, errors: &[ValidationError]) {
    eprintln!("Pipeline '{}' is invalid:", pipeline);
    for error in errors {
        eprintln!("  - {}", error);
    }
}

/// Validate a definition file without running it
async fn validate_definition(path: &Path, json: bool) -> Result<()> {
    let config = config()?;
    let registry = registry(config)?;
    let definition = PipelineDefinition::from_file(path)?;

    let result = Validator::new(&registry)
        .with_limits(&config.safety)
        .validate(&definition);

    match result {
        Ok(plan) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("Pipeline '{}' is valid", definition.id);
                println!("Fingerprint: {}", plan.fingerprint());
                println!("\n{:<6} {:<24} {:<22} {}", "RANK", "STEP", "KIND", "DEPENDS ON");
                println!("{}", "-".repeat(75));
                for step in &plan.steps {
                    let deps: Vec<&str> = step.depends_on.iter().map(String::as_str).collect();
                    println!("{:<6} {:<24} {:<22} {}", step.rank, step.id, step.kind, deps.join(", "));
                }
            }
            Ok(())
        }
        Err(errors) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&errors)?);
            } else {
                print_validation_errors(&definition.id, &errors);
            }
            std::process::exit(1);
        }
    }
}

/// Run a definition and follow its progress
async fn run_definition(path: &Path, quiet: bool) -> Result<()> {
    let definition = PipelineDefinition::from_file(path)?;
    let orchestrator = orchestrator().await?;

    let handle = match orchestrator.start(&definition).await {
        Ok(handle) => handle,
        Err(e) => {
            if let Some(invalid) = e.downcast_ref::<InvalidDefinition>() {
                print_validation_errors(&invalid.pipeline, &invalid.errors);
                std::process::exit(1);
            }
            return Err(e);
        }
    };
    eprintln!("[Execution {} started]", handle.id());

    if let Some(mut updates) = handle.subscribe() {
        let mut cancelled = false;
        loop {
            tokio::select! {
                item = updates.next() => match item {
                    Some(SubscriptionItem::Update(update)) => {
                        if !quiet {
                            let step = update.step_id.as_deref().unwrap_or("-");
                            let status = update
                                .step_status
                                .map(|s| s.to_string())
                                .unwrap_or_else(|| update.execution_status.to_string());
                            match &update.error {
                                Some(error) => eprintln!(
                                    "  {} {:<20} {:<10} attempt {}: {}",
                                    update.timestamp.format("%H:%M:%S"), step, status, update.attempt, error
                                ),
                                None => eprintln!(
                                    "  {} {:<20} {:<10} attempt {}",
                                    update.timestamp.format("%H:%M:%S"), step, status, update.attempt
                                ),
                            }
                        }
                    }
                    Some(SubscriptionItem::Missed(n)) => {
                        if !quiet {
                            eprintln!("  ... {} updates missed", n);
                        }
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c(), if !cancelled => {
                    eprintln!("\n[Cancelling execution {}]", handle.id());
                    handle.cancel();
                    cancelled = true;
                }
            }
        }
    }

    let execution = handle.wait().await?;
    print_steps(&execution);

    match execution.status {
        ExecutionStatus::Succeeded => {
            eprintln!("\n[Execution {} succeeded]", execution.id);
            Ok(())
        }
        status => {
            let reason = execution.error.as_deref().unwrap_or("no error recorded");
            eprintln!("\n[Execution {} {}: {}]", execution.id, status, reason);
            std::process::exit(1);
        }
    }
}

fn print_steps(execution: &Execution) {
    println!("\n{:<24} {:<10} {:<8} {:<10} {}", "STEP", "STATUS", "ATTEMPTS", "DURATION", "DETAIL");
    println!("{}", "-".repeat(80));
    for (step_id, step) in &execution.steps {
        let duration = step
            .duration_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        let detail = step
            .error
            .as_deref()
            .or(step.output_summary.as_deref())
            .unwrap_or("");
        println!(
            "{:<24} {:<10} {:<8} {:<10} {}",
            step_id,
            step.status.to_string(),
            step.attempts,
            duration,
            detail
        );
    }
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}

/// Show the state of an execution
async fn show_status(execution_id: &str, show_events: bool) -> Result<()> {
    let id = parse_execution_id(execution_id)?;
    let orchestrator = orchestrator().await?;

    let execution = orchestrator
        .get(id)
        .await?
        .with_context(|| format!("Execution not found: {}", id))?;
    let timeout = chrono::Duration::seconds(orchestrator.settings().step_heartbeat_timeout_seconds as i64);

    println!("Execution ID: {}", execution.id);
    println!("Pipeline: {} ({})", execution.pipeline_name, execution.definition);
    println!("Status: {}", execution.status);
    if execution.health(Utc::now(), timeout) == Health::Stalled {
        println!("Health: STALLED (no scheduler heartbeat for over {}s)", timeout.num_seconds());
    }
    println!("Created: {}", execution.created_at.to_rfc3339());
    println!("Started: {}", format_time(execution.started_at));
    println!("Ended: {}", format_time(execution.ended_at));
    if let Some(error) = &execution.error {
        println!("Error: {}", error);
    }
    print_steps(&execution);

    if show_events {
        println!("\nTransitions:");
        for event in orchestrator.store().events(id).await? {
            println!(
                "  {} {:<20} {:<18} {}",
                event.timestamp.to_rfc3339(),
                event.step_id.as_deref().unwrap_or("-"),
                event.event_type.as_str(),
                event.payload_summary
            );
        }
    }

    Ok(())
}

/// List executions
async fn list_executions(filter: &ExecutionFilter) -> Result<()> {
    let orchestrator = orchestrator().await?;
    let summaries = orchestrator.list(filter).await?;

    if summaries.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<10} {:<9} {:<25} {}",
        "EXECUTION ID", "PIPELINE", "STATUS", "HEALTH", "CREATED", "STEPS (ok/fail/skip/total)"
    );
    println!("{}", "-".repeat(120));

    for s in summaries {
        let health = match s.health {
            Health::Active => "active",
            Health::Stalled => "stalled",
            Health::Finished => "-",
        };
        let total = s.steps.pending + s.steps.running + s.steps.succeeded + s.steps.failed + s.steps.skipped;
        println!(
            "{:<38} {:<20} {:<10} {:<9} {:<25} {}/{}/{}/{}",
            s.id,
            s.definition.to_string(),
            s.status.to_string(),
            health,
            s.created_at.format("%Y-%m-%d %H:%M:%S"),
            s.steps.succeeded,
            s.steps.failed,
            s.steps.skipped,
            total
        );
    }

    Ok(())
}

/// Resume unfinished executions and wait for them
async fn recover_executions() -> Result<()> {
    let orchestrator = orchestrator().await?;
    let ids = orchestrator.recover().await?;

    if ids.is_empty() {
        println!("No unfinished executions");
        return Ok(());
    }
    for id in &ids {
        eprintln!("[Resumed execution {}]", id);
    }

    let grace = orchestrator.settings().cancel_grace_period();
    let wait_all = async {
        let mut finished = Vec::new();
        for id in &ids {
            finished.push(orchestrator.wait(*id).await?);
        }
        Ok::<_, anyhow::Error>(finished)
    };

    tokio::select! {
        finished = wait_all => {
            for execution in finished? {
                println!("{} {}", execution.id, execution.status);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n[Draining {} execution(s)]", ids.len());
            orchestrator.shutdown(grace).await?;
        }
    }

    Ok(())
}

/// List registered node kinds
fn list_kinds() -> Result<()> {
    let config = config()?;
    let registry = registry(config)?;

    for descriptor in registry.descriptors() {
        println!("{} ({})", descriptor.kind, descriptor.role);
        println!("  {}", descriptor.description);
        for port in &descriptor.inputs {
            let optional = if port.optional { ", optional" } else { "" };
            println!("  in  {}: {}{}", port.name, port.port_type, optional);
        }
        for port in &descriptor.outputs {
            println!("  out {}: {}", port.name, port.port_type);
        }
        for field in &descriptor.config.fields {
            let required = if field.required { "required" } else { "optional" };
            println!("  cfg {}: {:?} ({})", field.name, field.field_type, required);
        }
        println!();
    }

    Ok(())
}

/// List stored definition versions
async fn list_definitions(id: Option<&str>) -> Result<()> {
    let orchestrator = orchestrator().await?;
    let versions: Vec<_> = orchestrator
        .definitions()
        .list()?
        .into_iter()
        .filter(|v| id.map_or(true, |id| v.id == id))
        .collect();

    if versions.is_empty() {
        println!("No definitions stored");
        return Ok(());
    }

    println!("{:<24} {:<8} {:<24} {:<14} {}", "PIPELINE", "VERSION", "NAME", "HASH", "SAVED");
    println!("{}", "-".repeat(100));
    for v in versions {
        println!(
            "{:<24} {:<8} {:<24} {:<14} {}",
            v.id,
            v.version,
            v.name,
            &v.content_hash[..12.min(v.content_hash.len())],
            v.saved_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let config = config()?;

    println!("Configuration:");
    println!(
        "  Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!("  Home: {}", config.home.display());
    println!("  Definitions: {}", config.definitions_db().display());
    println!("\nEngine:");
    println!("  maxConcurrentSteps: {}", config.engine.max_concurrent_steps);
    println!("  defaultRetryLimit: {}", config.engine.default_retry_limit);
    println!("  stepHeartbeatTimeoutSeconds: {}", config.engine.step_heartbeat_timeout_seconds);
    println!("  cancelGracePeriodSeconds: {}", config.engine.cancel_grace_period_seconds);
    println!("  subscriptionBuffer: {}", config.engine.subscription_buffer);
    println!("\nSafety:");
    println!("  max_nodes: {}", config.safety.max_nodes);
    println!("  max_output_bytes: {}", config.safety.max_output_bytes);
    println!("  denylist: {}", config.safety.denylist_patterns.join(", "));
    println!("\nSources:");
    if config.sources.is_empty() {
        println!("  (none)");
    }
    for (id, source) in &config.sources {
        println!("  {}: {}", id, serde_json::to_string(source)?);
    }

    Ok(())
}
