use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ralph_parallel_lib::config::{merge_cli_overrides, CliOverrides, ConfigManager};
use ralph_parallel_lib::events::EventEmitter;
use ralph_parallel_lib::models::load_tasks;
use ralph_parallel_lib::parallel::recovery::CoordinatorLock;
use ralph_parallel_lib::parallel::{TaskSeparationAnalyzer, WorkspaceManager};
use ralph_parallel_lib::shutdown::{register_signal_handlers, ShutdownState};
use ralph_parallel_lib::{ParallelCoordinator, ParallelScheduler};
use std::path::{Path, PathBuf};

/// Ralph Parallel - run independent tasks side by side in isolated git worktrees
#[derive(Parser, Debug)]
#[command(name = "ralph-parallel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a backlog of tasks in parallel and merge the results
    Run {
        /// Task file (YAML or JSON)
        #[arg(long)]
        tasks: PathBuf,

        /// Project repository (defaults to the current directory)
        #[arg(long, env = "RALPH_PROJECT")]
        project: Option<PathBuf>,

        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Branch that finished work is merged into
        #[arg(long)]
        primary_branch: Option<String>,

        /// Worker command started once per task
        #[arg(long, env = "RALPH_WORKER")]
        worker: Option<String>,

        /// Worker argument; repeatable. Supports {task_id}, {label}, {branch}, {workspace}
        #[arg(long = "worker-arg", allow_hyphen_values = true)]
        worker_args: Vec<String>,
    },

    /// Print the separation report for a set of tasks
    Analyze {
        #[arg(long)]
        tasks: PathBuf,

        #[arg(long, env = "RALPH_PROJECT")]
        project: Option<PathBuf>,
    },

    /// Show every workspace of the project with its status
    Status {
        #[arg(long, env = "RALPH_PROJECT")]
        project: Option<PathBuf>,
    },

    /// Remove a preserved task workspace and its branch
    Cleanup {
        task_id: String,

        /// Remove even with uncommitted or unmerged work
        #[arg(long)]
        force: bool,

        #[arg(long, env = "RALPH_PROJECT")]
        project: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    let success = rt.block_on(dispatch(cli.command))?;

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn dispatch(command: Command) -> Result<bool> {
    match command {
        Command::Run {
            tasks,
            project,
            max_concurrent,
            primary_branch,
            worker,
            worker_args,
        } => {
            let overrides = CliOverrides {
                max_concurrent,
                primary_branch,
                worker_command: worker,
                worker_args,
                workspace_root: None,
            };
            run(&project_dir(project)?, &tasks, &overrides).await
        }
        Command::Analyze { tasks, project } => {
            analyze(&project_dir(project)?, &tasks)?;
            Ok(true)
        }
        Command::Status { project } => {
            status(&project_dir(project)?)?;
            Ok(true)
        }
        Command::Cleanup {
            task_id,
            force,
            project,
        } => {
            cleanup(&project_dir(project)?, &task_id, force)?;
            Ok(true)
        }
    }
}

fn project_dir(project: Option<PathBuf>) -> Result<PathBuf> {
    match project {
        Some(path) => Ok(path),
        None => std::env::current_dir().context("Failed to read current directory"),
    }
}

/// Run the backlog; returns whether every task was merged
async fn run(project: &Path, tasks_path: &Path, overrides: &CliOverrides) -> Result<bool> {
    let file_config = ConfigManager::new(project).read()?;
    let config = merge_cli_overrides(&file_config, overrides);
    let backlog = load_tasks(tasks_path)?;

    let shutdown = ShutdownState::new();
    if let Err(e) = register_signal_handlers(shutdown.clone()) {
        log::warn!("Failed to register signal handlers: {}", e);
    }

    let (emitter, mut events) = EventEmitter::channel();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => log::warn!("Failed to serialize event {}: {}", event.name(), e),
            }
        }
    });

    let mut coordinator = ParallelCoordinator::new(project, config)?.with_events(emitter);

    let recovered = coordinator.recover()?;
    if !recovered.is_empty() {
        log::info!("Recovered {} instance(s) from a previous run: {:?}", recovered.len(), recovered);
    }

    let scheduler = ParallelScheduler::for_coordinator(&coordinator, shutdown);
    let summary = scheduler.run(&mut coordinator, backlog).await;

    // Closes the event channel
    drop(coordinator);
    if let Err(e) = forwarder.await {
        log::warn!("Event forwarder stopped abnormally: {}", e);
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary.is_success())
}

fn analyze(project: &Path, tasks_path: &Path) -> Result<()> {
    let config = ConfigManager::new(project).read()?;
    let tasks = load_tasks(tasks_path)?;

    let report = TaskSeparationAnalyzer::new(config.separation).analyze(&tasks)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn status(project: &Path) -> Result<()> {
    let config = ConfigManager::new(project).read()?;
    let manager = WorkspaceManager::new(project, &config)?;

    let mut rows = Vec::new();
    for workspace in manager.list_workspaces()? {
        let status = manager.get_status(&workspace).ok();
        rows.push(serde_json::json!({
            "workspace": workspace,
            "status": status,
        }));
    }
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn cleanup(project: &Path, task_id: &str, force: bool) -> Result<()> {
    let config = ConfigManager::new(project).read()?;
    let manager = WorkspaceManager::new(project, &config)?;
    // Never race a running coordinator for the same project
    let _lock = CoordinatorLock::acquire(manager.project_path())?;

    let Some(workspace) = manager.workspace_for_task(task_id)? else {
        anyhow::bail!("No workspace found for task {}", task_id);
    };
    manager.remove_workspace(&workspace, force)?;
    log::info!("Removed workspace {:?} ({})", workspace.path, workspace.branch_name);
    Ok(())
}
