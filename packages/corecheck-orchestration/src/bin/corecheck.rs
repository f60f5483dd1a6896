//! corecheck CLI
//!
//! One binary for every deployable unit.
//!
//! # Usage
//!
//! ```bash
//! # Bring the schema to the latest version
//! corecheck --config corecheck.yaml migrate up
//!
//! # Reconcile repositories and publish corecheck tasks
//! corecheck --config corecheck.yaml sync
//!
//! # Run one coverage execution and wait for it
//! corecheck --config corecheck.yaml start --params '{"target": "acme/repo-42"}'
//!
//! # Turn queued tasks into executions until Ctrl+C
//! corecheck --config corecheck.yaml consume
//!
//! # Same, writing Prometheus counters on exit (`metrics` feature)
//! corecheck --config corecheck.yaml --metrics-file corecheck.prom consume
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use corecheck_orchestration::{
    ConsumerConfig, CoordinatorConfig, CorecheckConsumer, CoverageHandler, DatabaseTarget,
    GithubSource, JobDefinition, MigrationRequest, MigrationRunner, PipelineCoordinator,
    PipelineMetrics, ProcessBackend, QueueOptions, Settings, SqliteQueue, SyncWorker, Unit,
    WorkQueue,
};
use corecheck_storage::{
    ExecutionId, ExecutionState, PgConnectOptions, PipelineStore, PostgresStore, SchemaStore,
    SqliteStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "corecheck")]
#[command(about = "Coverage pipeline orchestration", long_about = None)]
struct Cli {
    /// YAML settings file (version 1); CORECHECK_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write Prometheus text metrics here when `start`, `resume` or
    /// `consume` exits (`metrics` feature; "-" for stderr)
    #[arg(long, global = true)]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum MigrateAction {
    Up,
    Down,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply schema migrations
    Migrate {
        #[arg(value_enum)]
        action: MigrateAction,

        /// Version to stop at (default: latest for up, one step back for down)
        #[arg(long)]
        target: Option<u32>,
    },

    /// Reconcile repository metadata from the code host
    Sync,

    /// Start a coverage execution
    Start {
        /// Input params, a JSON object
        #[arg(long)]
        params: String,

        /// Print the execution id and exit; `resume` drives it later
        #[arg(long)]
        detach: bool,
    },

    /// Show an execution
    Status { execution_id: ExecutionId },

    /// Cancel an execution
    Cancel {
        execution_id: ExecutionId,

        #[arg(long, default_value = "cancelled from the command line")]
        reason: String,
    },

    /// Drive every unfinished execution to a terminal state
    Resume,

    /// Start executions for queued corecheck tasks until interrupted
    Consume,
}

struct Stores {
    pipeline: Arc<dyn PipelineStore>,
    schema: Arc<dyn SchemaStore>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    let metrics = PipelineMetrics::standalone()?;

    let code = match cli.command {
        Commands::Migrate { action, target } => migrate(&settings, action, target).await,
        Commands::Sync => sync(&settings).await,
        Commands::Start { params, detach } => {
            start(&settings, &metrics, &params, detach).await
        }
        Commands::Status { execution_id } => status(&settings, execution_id).await,
        Commands::Cancel {
            execution_id,
            reason,
        } => cancel(&settings, &metrics, execution_id, &reason).await,
        Commands::Resume => resume(&settings, &metrics).await,
        Commands::Consume => consume(&settings, &metrics).await,
    }?;

    if let Some(path) = &cli.metrics_file {
        write_metrics(&metrics, path)?;
    }
    Ok(code)
}

fn write_metrics(metrics: &PipelineMetrics, path: &Path) -> Result<()> {
    let text = metrics.render()?;
    if text.is_empty() {
        warn!("Built without the `metrics` feature; nothing written to {}", path.display());
        return Ok(());
    }
    if path == Path::new("-") {
        eprint!("{}", text);
    } else {
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }
    Ok(())
}

async fn open_stores(settings: &Settings, unit: Unit) -> Result<Stores> {
    match settings.database_target(unit)? {
        DatabaseTarget::Sqlite(path) => {
            let store = Arc::new(
                SqliteStore::open(&path)
                    .with_context(|| format!("Failed to open {}", path.display()))?,
            );
            Ok(Stores {
                pipeline: store.clone(),
                schema: store,
            })
        }
        DatabaseTarget::Postgres {
            host,
            port,
            user,
            password,
            name,
            max_connections,
        } => {
            let options = PgConnectOptions::new()
                .host(&host)
                .port(port)
                .username(&user)
                .password(&password)
                .database(&name);
            let store = Arc::new(
                PostgresStore::connect_with(options, max_connections)
                    .await
                    .with_context(|| format!("Failed to connect to {}:{}/{}", host, port, name))?,
            );
            Ok(Stores {
                pipeline: store.clone(),
                schema: store,
            })
        }
    }
}

fn open_queue(settings: &Settings, unit: Unit) -> Result<Arc<dyn WorkQueue>> {
    let path = settings.queue_path(unit)?;
    let queue = SqliteQueue::open(
        &path,
        QueueOptions {
            max_deliveries: settings.queue.max_deliveries,
        },
    )
    .with_context(|| format!("Failed to open queue {}", path.display()))?;
    Ok(Arc::new(queue))
}

fn coordinator(
    settings: &Settings,
    store: Arc<dyn PipelineStore>,
    metrics: &PipelineMetrics,
) -> Result<Arc<PipelineCoordinator>> {
    settings.require(Unit::Coordinator)?;
    let job = &settings.job;

    let program = job.program.clone().context("job.program is required")?;
    let definition_ref = job
        .definition_ref
        .clone()
        .context("job.definition_ref is required")?;
    let mut definition = JobDefinition::new(
        definition_ref,
        job.queue_ref.clone().unwrap_or_else(|| "default".to_string()),
    );
    if let Some(result_path) = &job.result_path {
        definition = definition.with_result_path(result_path.clone());
    }

    let config = CoordinatorConfig::new(definition, settings.timeout_policy(Unit::Coordinator)?);
    Ok(Arc::new(
        PipelineCoordinator::new(
            store.clone(),
            Arc::new(ProcessBackend::new(program, job.args.clone())),
            Arc::new(CoverageHandler::new(store)),
            config,
        )
        .with_metrics(metrics.clone()),
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn migrate(
    settings: &Settings,
    action: MigrateAction,
    target: Option<u32>,
) -> Result<ExitCode> {
    settings.require(Unit::Migrator)?;
    let stores = open_stores(settings, Unit::Migrator).await?;
    let runner = MigrationRunner::new(stores.schema)
        .with_timeout(settings.unit_timeout(Unit::Migrator)?);

    let request = match action {
        MigrateAction::Up => MigrationRequest::up(target),
        MigrateAction::Down => MigrationRequest::down(target),
    };
    let outcome = runner.apply(request).await?;
    print_json(&outcome)?;
    Ok(ExitCode::SUCCESS)
}

async fn sync(settings: &Settings) -> Result<ExitCode> {
    settings.require(Unit::SyncWorker)?;
    let stores = open_stores(settings, Unit::SyncWorker).await?;
    let upstream = &settings.upstream;

    let source = GithubSource::new(
        upstream.base_url.as_deref(),
        upstream.org.clone().context("upstream.org is required")?,
        upstream.token.clone().context("upstream.token is required")?,
        settings.unit_timeout(Unit::SyncWorker)?,
    )?;
    let mut worker = SyncWorker::new(Arc::new(source), stores.pipeline)
        .with_retry(settings.retry_policy());
    if settings.queue.path.is_some() {
        worker = worker.with_queue(open_queue(settings, Unit::SyncWorker)?);
    } else {
        warn!("No queue configured; repositories are synced without publishing tasks");
    }

    let report = worker.run().await?;
    print_json(&report)?;
    Ok(if report.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

async fn start(
    settings: &Settings,
    metrics: &PipelineMetrics,
    params: &str,
    detach: bool,
) -> Result<ExitCode> {
    let params: serde_json::Value =
        serde_json::from_str(params).context("--params must be valid JSON")?;
    let stores = open_stores(settings, Unit::Coordinator).await?;
    let coordinator = coordinator(settings, stores.pipeline, metrics)?;

    if detach {
        println!("{}", coordinator.create(params).await?);
        return Ok(ExitCode::SUCCESS);
    }

    let execution_id = coordinator.start(params).await?;
    let execution = coordinator.wait_terminal(execution_id).await?;
    print_json(&execution)?;
    Ok(exit_code(execution.current_state))
}

async fn status(settings: &Settings, execution_id: ExecutionId) -> Result<ExitCode> {
    let stores = open_stores(settings, Unit::Coordinator).await?;
    let execution = stores
        .pipeline
        .get_execution(execution_id)
        .await?
        .with_context(|| format!("Execution {} not found", execution_id))?;
    print_json(&execution)?;
    Ok(ExitCode::SUCCESS)
}

async fn cancel(
    settings: &Settings,
    metrics: &PipelineMetrics,
    execution_id: ExecutionId,
    reason: &str,
) -> Result<ExitCode> {
    let stores = open_stores(settings, Unit::Coordinator).await?;
    let execution = coordinator(settings, stores.pipeline, metrics)?
        .cancel(execution_id, reason)
        .await?;
    print_json(&execution)?;
    Ok(ExitCode::SUCCESS)
}

async fn resume(settings: &Settings, metrics: &PipelineMetrics) -> Result<ExitCode> {
    let stores = open_stores(settings, Unit::Coordinator).await?;
    let coordinator = coordinator(settings, stores.pipeline, metrics)?;

    let resumed = coordinator.resume_incomplete().await?;
    info!("Resumed {} executions", resumed.len());

    let mut failed = 0usize;
    for execution_id in resumed {
        let execution = coordinator.wait_terminal(execution_id).await?;
        if execution.current_state != ExecutionState::Succeeded {
            failed += 1;
        }
        println!("{} {}", execution_id, execution.current_state);
    }
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

async fn consume(settings: &Settings, metrics: &PipelineMetrics) -> Result<ExitCode> {
    settings.require(Unit::Consumer)?;
    let stores = open_stores(settings, Unit::Consumer).await?;
    let coordinator = coordinator(settings, stores.pipeline.clone(), metrics)?;
    let queue = open_queue(settings, Unit::Consumer)?;

    let lease = settings.lease_duration();
    let defaults = ConsumerConfig::default();
    let config = ConsumerConfig {
        batch_size: settings.consumer.batch_size.unwrap_or(defaults.batch_size),
        concurrency: settings.consumer_concurrency(),
        lease_duration: lease,
        poll_interval: settings
            .consumer
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval),
        stale_claim_after: lease,
    };
    let consumer = CorecheckConsumer::new(queue, stores.pipeline, coordinator.clone(), config)
        .with_metrics(metrics.clone());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.cancel();
        }
    });

    let report = consumer.run(shutdown).await;
    info!(
        "Consumer report: {} started, {} duplicates, {} deferred, {} failed",
        report.started, report.duplicates, report.deferred, report.failed
    );

    // Let running executions finish; a second Ctrl+C leaves them to `resume`
    let drain = async {
        while coordinator.active_drivers() > 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    tokio::select! {
        _ = drain => {}
        _ = tokio::signal::ctrl_c() => warn!(
            "Leaving {} executions unfinished; run `corecheck resume` to continue them",
            coordinator.active_drivers()
        ),
    }
    Ok(ExitCode::SUCCESS)
}

fn exit_code(state: ExecutionState) -> ExitCode {
    match state {
        ExecutionState::Succeeded => ExitCode::SUCCESS,
        ExecutionState::Failed => ExitCode::from(2),
        _ => ExitCode::from(3),
    }
}
