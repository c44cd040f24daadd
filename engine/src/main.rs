use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use relay_observability::{init_process_logging, LogConfig, ProcessKind};
use relay_providers::EnvConfig;
use relay_registry::ProjectRegistry;
use relay_runtime::{
    resolve_global_dir, ActionRequest, DispatchRuntime, PathMapping, RuntimeConfig, MERKLE_DIR,
    PROJECT_REGISTRY_FILE,
};
use relay_sync::MerkleSynchronizer;

#[derive(Parser, Debug)]
#[command(name = "relay-engine")]
#[command(about = "Headless Relay dispatch runtime")]
struct Cli {
    /// Override the global state directory (SPEC_WORKFLOW_HOME).
    #[arg(long)]
    home: Option<String>,

    /// Project workspace the dispatched agents operate on.
    #[arg(long, default_value = ".")]
    project: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one action: JSON from --json or stdin, response on stdout.
    Act {
        #[arg(long)]
        json: Option<String>,
    },
    /// Print the snapshot for a run.
    Snapshot { run_id: String },
    /// Print aggregated telemetry for a run.
    Telemetry { run_id: String },
    /// List known runs.
    Runs,
    /// Scan the project tree and report file changes since the last sync.
    Sync,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut env: HashMap<String, String> = std::env::vars().collect();
    if let Some(home) = &cli.home {
        env.insert(relay_runtime::ENV_WORKFLOW_HOME.to_string(), home.clone());
    }

    let global_dir = resolve_global_dir(&env)?;
    let _guard = init_process_logging(ProcessKind::Engine, &LogConfig::new(global_dir.clone())).ok();

    let mapping = PathMapping::from_env(&env)?;
    let project_path = resolve_project_path(&cli.project, mapping.as_ref())?;
    let runtime = build_runtime(&env, global_dir.clone(), project_path.clone()).await?;

    let registry = if mapping.is_some() {
        ProjectRegistry::assume_pids_alive(global_dir.join(PROJECT_REGISTRY_FILE))
    } else {
        ProjectRegistry::new(global_dir.join(PROJECT_REGISTRY_FILE))
    };
    registry
        .register_project(&project_path.to_string_lossy(), std::process::id(), false)
        .await?;
    registry.cleanup_stale_projects().await?;

    let result = run_command(&runtime, &global_dir, &project_path, cli.command).await;

    runtime.flush().await?;
    registry
        .unregister_project(
            &project_path.to_string_lossy(),
            Some(std::process::id()),
        )
        .await?;
    result
}

async fn run_command(
    runtime: &DispatchRuntime,
    global_dir: &PathBuf,
    project_path: &PathBuf,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Act { json } => {
            let raw = match json {
                Some(raw) => raw,
                None => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buffer)
                        .context("reading action from stdin")?;
                    buffer
                }
            };
            let request: ActionRequest =
                serde_json::from_str(&raw).context("parsing action request")?;
            let response = runtime.handle(request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Snapshot { run_id } => {
            let response = runtime.get_snapshot(&run_id).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Telemetry { run_id } => {
            let response = runtime.get_telemetry(&run_id).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Runs => {
            let runs = runtime.list_runs().await;
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
        Command::Sync => {
            let synchronizer =
                MerkleSynchronizer::new(project_path.clone(), global_dir.join(MERKLE_DIR));
            let report = synchronizer.sync().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn resolve_project_path(
    project: &str,
    mapping: Option<&PathMapping>,
) -> anyhow::Result<PathBuf> {
    let absolute = std::fs::canonicalize(project)
        .with_context(|| format!("project path {project} does not exist"))?;
    Ok(match mapping {
        Some(mapping) => mapping.host_to_container(&absolute),
        None => absolute,
    })
}

async fn build_runtime(
    env: &HashMap<String, String>,
    global_dir: PathBuf,
    project_path: PathBuf,
) -> anyhow::Result<DispatchRuntime> {
    let env_config = EnvConfig::from_env(env)?;
    info!(
        global_dir = %global_dir.display(),
        project = %project_path.display(),
        dispatch_runtime_v2 = env_config.dispatch_runtime_v2,
        "starting relay-engine"
    );
    let mut config = RuntimeConfig::new(global_dir, project_path);
    config.env = env_config;
    Ok(DispatchRuntime::new(config).await?)
}
