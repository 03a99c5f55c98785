use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kiln::core::TaskGraph;
use kiln::log::LogLevel;
use kiln::manifest::{Manifest, MANIFEST_FILE};
use kiln::orchestration::{
    RunReport, Scheduler, SchedulerEvent, SchedulerOptions, EXIT_FAILED, EXIT_GRAPH_ERROR,
    EXIT_SUCCESS,
};
use kiln::state::FingerprintStore;
use kiln::{Error, Result};

/// Kiln - incremental task runner with content fingerprints
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    \
    KILN_JOBS=N     Concurrency bound (overridden by --jobs)\n    \
    KILN_LOG=...    Tracing filter directives\n    \
    KILN_DEBUG=1    Enable debug logging (alternative to --debug)\n\n\
EXIT CODES:\n    \
    0  success\n    \
    1  a task failed\n    \
    2  invalid task definitions or dependency cycle\n    \
    3  cancelled")]
pub struct Cli {
    /// Project root; task paths are relative to it
    #[arg(short = 'C', long, default_value = ".")]
    pub root: PathBuf,

    /// Manifest file, relative to the project root
    #[arg(short = 'f', long, default_value = MANIFEST_FILE)]
    pub file: PathBuf,

    /// Log level
    #[arg(short = 'l', long, value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Bring tasks up to date, running only what changed
    Run {
        /// Tasks to build, with their dependencies (default: all)
        targets: Vec<String>,

        /// Run every task regardless of fingerprints
        #[arg(long)]
        force: bool,

        /// Report what would run without running it
        #[arg(long, short = 'n')]
        dry_run: bool,

        /// Maximum number of tasks in flight
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the task graph in topological layers
    Graph {
        /// Restrict to these tasks and their dependencies
        targets: Vec<String>,
    },

    /// Delete the fingerprint store so the next run rebuilds everything
    Clean,
}

fn main() {
    let cli = Cli::parse();
    kiln::log::init(cli.log_level, cli.debug);

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(error: &Error) -> i32 {
    if error.is_graph_error() {
        EXIT_GRAPH_ERROR
    } else {
        EXIT_FAILED
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    let manifest_path = cli.root.join(&cli.file);
    match cli.command {
        Command::Run {
            targets,
            force,
            dry_run,
            jobs,
            json,
        } => {
            let manifest = Manifest::load(&manifest_path)?;
            let graph = select(TaskGraph::build(manifest.tasks)?, &targets)?;
            let options = SchedulerOptions {
                jobs: manifest.settings.effective_jobs(jobs),
                force,
                dry_run,
                grace_period: manifest.settings.grace_period(),
                task_timeout: manifest.settings.task_timeout(),
                root: cli.root.clone(),
            };
            let store = FingerprintStore::load(manifest.settings.store_path(&cli.root));
            let report = run_build(graph, options, store, !json)?;
            if json {
                println!("{}", report.to_json()?);
            } else {
                println!("{}", report);
            }
            Ok(report.exit_code())
        }
        Command::Graph { targets } => {
            let manifest = Manifest::load(&manifest_path)?;
            let graph = select(TaskGraph::build(manifest.tasks)?, &targets)?;
            for (depth, layer) in graph.topological_layers().iter().enumerate() {
                println!("{}: {}", depth, layer.join(" "));
            }
            Ok(EXIT_SUCCESS)
        }
        Command::Clean => {
            let settings = match Manifest::load(&manifest_path) {
                Ok(manifest) => manifest.settings,
                Err(e) => {
                    debug!("Using default settings for clean: {}", e);
                    Default::default()
                }
            };
            let path = settings.store_path(&cli.root);
            if FingerprintStore::remove_file(&path)? {
                println!("Removed {}", path.display());
            } else {
                println!("Nothing to clean");
            }
            Ok(EXIT_SUCCESS)
        }
    }
}

fn select(graph: TaskGraph, targets: &[String]) -> Result<TaskGraph> {
    if targets.is_empty() {
        Ok(graph)
    } else {
        graph.subgraph_reachable_from(targets)
    }
}

/// Run the scheduler on a fresh runtime, cancelling on Ctrl-C.
fn run_build(
    graph: TaskGraph,
    options: SchedulerOptions,
    mut store: FingerprintStore,
    progress: bool,
) -> Result<RunReport> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling run");
                on_signal.cancel();
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SchedulerEvent::TaskStarted { task } if progress => {
                        eprintln!("started  {}", task);
                    }
                    SchedulerEvent::TaskFinished { task, state } if progress => {
                        eprintln!("finished {} ({})", task, state);
                    }
                    SchedulerEvent::RunFinished { status } => {
                        info!("Run finished: {}", status);
                        break;
                    }
                    _ => {}
                }
            }
        });

        let scheduler = Scheduler::new(Arc::new(graph), options).with_events(tx);
        let report = scheduler.run(&mut store, cancel).await;
        drop(scheduler);
        let _ = printer.await;
        report
    })
}
