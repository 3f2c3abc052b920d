use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use rotor::client::WorkerClient;
use rotor::config::DEFAULT_WORKER_URL;
use rotor::engine::registry::WorkflowState;
use rotor::engine::signals::SignalRequest;
use rotor::maintenance::{MaintenanceConfig, SAMPLE_CONFIG};
use rotor::report;
use rotor::types::{ClusterDiscoveryInput, MultiRestartInput, OutputFormat, RestartOptions};

#[derive(Parser, Debug)]
#[command(name = "rotor", about = "Rolling-restart orchestrator for CrateDB clusters on Kubernetes")]
struct Cli {
    /// Worker API endpoint.
    #[arg(long, global = true, default_value = DEFAULT_WORKER_URL)]
    worker_url: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Restart the given clusters (or `all`) one pod at a time.
    Restart(RestartArgs),
    /// Show the live status and result of a workflow.
    Status { workflow_id: String },
    /// List recent workflows.
    ListWorkflows {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Stop a restart gracefully after the in-flight pod completes.
    Cancel {
        workflow_id: String,
        #[arg(long)]
        reason: Option<String>,
        /// Abort in-flight activities instead of finishing the current pod.
        #[arg(long)]
        hard: bool,
    },
    /// Override a maintenance-window wait and proceed immediately.
    ForceRestart {
        workflow_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Pause a restart before the next pod.
    Pause {
        workflow_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Resume a paused restart.
    Resume { workflow_id: String },
    /// Maintenance-window configuration helpers.
    Maintenance {
        #[command(subcommand)]
        command: MaintenanceCommands,
    },
}

#[derive(Subcommand, Debug)]
enum MaintenanceCommands {
    /// Write a sample maintenance-windows configuration file.
    CreateConfig {
        #[arg(long, default_value = "maintenance-windows.toml")]
        output: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Evaluate the window predicate for one cluster.
    Check {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        cluster: String,
        /// RFC 3339 instant to evaluate at; defaults to now.
        #[arg(long)]
        at: Option<String>,
    },
    /// Print every configured cluster's windows.
    ListWindows {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RestartArgs {
    /// Cluster names, or the single word `all`. Options must come BEFORE
    /// cluster names.
    #[arg(required = true)]
    clusters: Vec<String>,

    #[arg(long)]
    context: Option<String>,
    #[arg(long)]
    kubeconfig: Option<String>,
    /// Walk every state without touching the cluster.
    #[arg(long)]
    dry_run: bool,
    /// Submit and exit; follow along with `rotor status`.
    #[arg(long = "async")]
    async_submit: bool,
    #[arg(long)]
    maintenance_config: Option<String>,
    #[arg(long)]
    ignore_maintenance_windows: bool,
    #[arg(long)]
    skip_hook_warning: bool,
    /// Only restart pods scheduled on suspended nodes.
    #[arg(long)]
    only_on_suspended_nodes: bool,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output_format: OutputFormat,
    #[arg(long, default_value_t = 300)]
    pod_ready_timeout: u64,
    #[arg(long, default_value_t = 300)]
    health_check_timeout: u64,
}

/// Option-looking words that clap would otherwise accept as cluster names.
/// Catching them prevents an intended `--dry-run` from silently becoming a
/// real restart.
const DRY_RUN_LOOKALIKES: &[&str] = &[
    "--dry-run", "dry-run", "--dry", "dry", "--dryrun", "dryrun", "-dry-run", "-dry", "--test",
    "test", "--simulate", "simulate",
];

fn validate_cluster_names(names: &[String]) -> Result<(), String> {
    for name in names {
        let lowered = name.to_lowercase();
        if DRY_RUN_LOOKALIKES.contains(&lowered.as_str()) {
            return Err(format!(
                "found '{name}' in cluster names - this looks like a misplaced dry-run flag.\n\
                 All options must come BEFORE cluster names.\n\
                 Correct:   rotor restart --context xxx --dry-run cluster1\n\
                 Incorrect: rotor restart --context xxx cluster1 --dry-run"
            ));
        }
        if name.starts_with('-') {
            return Err(format!(
                "found '{name}' in cluster names - this looks like a misplaced option.\n\
                 All options must come BEFORE cluster names. Run 'rotor restart --help'."
            ));
        }
    }
    Ok(())
}

fn setup_logging(log_level: &str) {
    let directive = log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(directive.into())
                .from_env_lossy(),
        )
        .compact()
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let client = WorkerClient::new(&cli.worker_url)?;

    let exit_code = match cli.command {
        Commands::Restart(args) => cli_restart(&client, args, &cli.log_level).await?,
        Commands::Status { workflow_id } => cli_status(&client, &workflow_id).await?,
        Commands::ListWorkflows { limit } => cli_list(&client, limit).await?,
        Commands::Cancel {
            workflow_id,
            reason,
            hard,
        } => cli_cancel(&client, &workflow_id, reason, hard).await?,
        Commands::ForceRestart {
            workflow_id,
            reason,
        } => {
            client
                .signal(&workflow_id, &SignalRequest::ForceRestart { reason })
                .await?;
            info!(%workflow_id, "force-restart signal sent");
            0
        }
        Commands::Pause {
            workflow_id,
            reason,
        } => {
            client
                .signal(&workflow_id, &SignalRequest::PauseRestart { reason })
                .await?;
            info!(%workflow_id, "pause signal sent");
            0
        }
        Commands::Resume { workflow_id } => {
            client
                .signal(&workflow_id, &SignalRequest::ResumeRestart)
                .await?;
            info!(%workflow_id, "resume signal sent");
            0
        }
        Commands::Maintenance { command } => cli_maintenance(command)?,
    };

    std::process::exit(exit_code);
}

async fn cli_restart(client: &WorkerClient, args: RestartArgs, log_level: &str) -> Result<i32> {
    if let Err(message) = validate_cluster_names(&args.clusters) {
        eprintln!("error: {message}");
        return Ok(1);
    }

    let restart_all = args.clusters.len() == 1 && args.clusters[0].eq_ignore_ascii_case("all");
    if restart_all && !args.dry_run && !confirm_restart_all()? {
        info!("operation cancelled by user");
        return Ok(0);
    }
    let cluster_names = if restart_all {
        None
    } else {
        Some(args.clusters.clone())
    };

    let options = RestartOptions {
        kubeconfig: args.kubeconfig.clone(),
        context: args.context.clone(),
        dry_run: args.dry_run,
        skip_hook_warning: args.skip_hook_warning,
        output_format: args.output_format,
        log_level: log_level.to_string(),
        pod_ready_timeout: args.pod_ready_timeout,
        health_check_timeout: args.health_check_timeout,
        maintenance_config_path: args.maintenance_config.clone(),
        ignore_maintenance_windows: args.ignore_maintenance_windows,
        only_on_suspended_nodes: args.only_on_suspended_nodes,
    };

    // Discover first so a typoed cluster name fails before any workflow runs.
    let discovery = client
        .discover(&ClusterDiscoveryInput {
            cluster_names: cluster_names.clone(),
            kubeconfig: options.kubeconfig.clone(),
            context: options.context.clone(),
            maintenance_config_path: options.maintenance_config_path.clone(),
        })
        .await?;
    for error in &discovery.errors {
        warn!("discovery: {error}");
    }
    if discovery.clusters.is_empty() {
        eprintln!("error: no matching CrateDB clusters found");
        return Ok(1);
    }
    if let Some(names) = &cluster_names {
        let found: Vec<&str> = discovery
            .clusters
            .iter()
            .map(|cluster| cluster.name.as_str())
            .collect();
        let missing: Vec<&String> = names
            .iter()
            .filter(|name| !found.contains(&name.as_str()))
            .collect();
        if !missing.is_empty() {
            eprintln!(
                "error: cluster(s) not found: {}",
                missing
                    .iter()
                    .map(|name| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            return Ok(1);
        }
    }
    info!(
        clusters = discovery.clusters.len(),
        dry_run = args.dry_run,
        "submitting restart"
    );

    let summary = client
        .start_restart(&MultiRestartInput {
            cluster_names,
            options,
        })
        .await?;
    println!("workflow id: {}", summary.id);

    if args.async_submit {
        info!("submitted asynchronously; follow along with: rotor status {}", summary.id);
        return Ok(0);
    }

    let detail = client.wait_for_completion(&summary.id).await?;
    let result = detail
        .result
        .context("workflow finished without a result")?;
    println!("{}", report::render(&result, args.output_format)?);

    let ok = detail.summary.state == WorkflowState::Completed && result.failed_clusters == 0;
    Ok(if ok { 0 } else { 1 })
}

fn confirm_restart_all() -> Result<bool> {
    print!("WARNING: you are about to restart ALL CrateDB clusters. Proceed? [y/N]: ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

async fn cli_status(client: &WorkerClient, workflow_id: &str) -> Result<i32> {
    let detail = client.get_workflow(workflow_id).await?;
    println!("{}", serde_yaml::to_string(&detail)?);
    Ok(0)
}

async fn cli_list(client: &WorkerClient, limit: usize) -> Result<i32> {
    let workflows = client.list_workflows(limit).await?;
    if workflows.is_empty() {
        println!("no workflows");
        return Ok(0);
    }
    for workflow in workflows {
        let finished = workflow
            .finished_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<50} {:>10?} started={} finished={}",
            workflow.id,
            workflow.state,
            workflow.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            finished,
        );
    }
    Ok(0)
}

async fn cli_cancel(
    client: &WorkerClient,
    workflow_id: &str,
    reason: Option<String>,
    hard: bool,
) -> Result<i32> {
    if hard {
        client.terminate(workflow_id).await?;
        info!(%workflow_id, "workflow terminated");
    } else {
        client
            .signal(workflow_id, &SignalRequest::CancelRestart { reason })
            .await?;
        info!(%workflow_id, "cancel signal sent; the in-flight pod will finish first");
    }
    Ok(0)
}

fn cli_maintenance(command: MaintenanceCommands) -> Result<i32> {
    match command {
        MaintenanceCommands::CreateConfig { output, force } => {
            if output.exists() && !force {
                eprintln!(
                    "error: {} already exists (use --force to overwrite)",
                    output.display()
                );
                return Ok(1);
            }
            std::fs::write(&output, SAMPLE_CONFIG)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("wrote sample maintenance config to {}", output.display());
            Ok(0)
        }
        MaintenanceCommands::Check {
            config,
            cluster,
            at,
        } => {
            let loaded = MaintenanceConfig::load(&config)?;
            let now = match at {
                Some(raw) => chrono::DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("invalid --at instant: {raw}"))?
                    .with_timezone(&chrono::Utc),
                None => chrono::Utc::now(),
            };
            let result = loaded.check(&cluster, now);
            println!("cluster:       {}", result.cluster_name);
            println!("at:            {}", result.current_time.to_rfc3339());
            println!("in window:     {}", result.in_maintenance_window);
            println!("should wait:   {}", result.should_wait);
            if let Some(next) = result.next_window_start {
                println!("next window:   {}", next.to_rfc3339());
            }
            println!("reason:        {}", result.reason);
            Ok(0)
        }
        MaintenanceCommands::ListWindows { config } => {
            let loaded = MaintenanceConfig::load(&config)?;
            for cluster in loaded.clusters() {
                println!("{}:", cluster.cluster_name);
                if cluster.windows.is_empty() {
                    println!("  (no windows)");
                }
                for (index, window) in cluster.windows.iter().enumerate() {
                    let days = match (&window.weekdays, &window.ordinal_days) {
                        (Some(weekdays), _) => {
                            let mut names: Vec<String> =
                                weekdays.iter().map(|day| day.to_string()).collect();
                            names.sort();
                            names.join(",")
                        }
                        (None, Some(ordinals)) => ordinals
                            .iter()
                            .map(|day| format!("{:?} {:?}", day.ordinal, day.weekday))
                            .collect::<Vec<_>>()
                            .join(","),
                        (None, None) => "every day".to_string(),
                    };
                    println!(
                        "  {} {}-{} [{}]",
                        window.describe(index),
                        window.start.format("%H:%M"),
                        window.end.format("%H:%M:%S"),
                        days,
                    );
                }
            }
            Ok(0)
        }
    }
}
