//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use stitcher_callback::ProbeOptions;
use stitcher_core::{
    BundleDto, CallbackTarget, ProgressReporter, StitchRequest, Stitcher, TaskDto, WorkerPool,
};
use stitcher_shared::{
    AppConfig, Bundle, DocumentTask, TaskId, TaskState, init_config, load_config,
    resolve_credential,
};
use stitcher_storage::{AuditDispatcher, NoopRepository, Storage, TaskRepository};

/// Audit workers draining the mutation queue.
const AUDIT_WORKERS: usize = 2;
/// Mutation events buffered before new ones are dropped.
const AUDIT_QUEUE: usize = 256;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Stitcher: merge remote case documents into one published bundle.
#[derive(Parser)]
#[command(
    name = "stitcher",
    version,
    about = "Merge remote case documents into one published, annotated bundle.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Stitch one bundle and print the case response.
    Stitch {
        /// Bundle definition (JSON).
        #[arg(long)]
        bundle: PathBuf,

        /// Case the bundle belongs to.
        #[arg(long, default_value = "cli")]
        case_id: String,

        /// Callback URL probed before the task is accepted.
        #[arg(long)]
        callback: Option<String>,

        /// Case property receiving the stitched document.
        #[arg(long, default_value = stitcher_core::case_update::DEFAULT_PROPERTY_NAME)]
        property: String,

        /// Do not record the task in the task database.
        #[arg(long)]
        ephemeral: bool,
    },

    /// Stitch every bundle definition in a directory.
    Batch {
        /// Directory of bundle definitions (*.json).
        #[arg(long)]
        dir: PathBuf,

        /// Concurrent tasks (defaults to pipeline.workers).
        #[arg(short, long)]
        workers: Option<usize>,

        /// Do not record the tasks in the task database.
        #[arg(long)]
        ephemeral: bool,
    },

    /// Probe a callback URL the way bundle definitions are checked.
    ValidateCallback {
        /// Callback URL.
        url: String,
    },

    /// List recorded tasks.
    Tasks {
        /// Only tasks in this state (NEW, PROCESSING, DONE, FAILED).
        #[arg(long)]
        state: Option<String>,
    },

    /// Remove a recorded task (and its bundle once unused).
    DeleteTask {
        /// Task identifier.
        id: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "stitcher=info,audit=warn",
        1 => "stitcher=debug,audit=info",
        _ => "stitcher=trace,audit=info",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Stitch {
            bundle,
            case_id,
            callback,
            property,
            ephemeral,
        } => {
            let callback = callback.map(|url| CallbackTarget {
                url,
                property_name: property,
            });
            cmd_stitch(&bundle, case_id, callback, ephemeral).await
        }
        Command::Batch {
            dir,
            workers,
            ephemeral,
        } => cmd_batch(&dir, workers, ephemeral).await,
        Command::ValidateCallback { url } => cmd_validate_callback(&url).await,
        Command::Tasks { state } => cmd_tasks(state.as_deref()).await,
        Command::DeleteTask { id } => cmd_delete_task(&id).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Task database
// ---------------------------------------------------------------------------

/// Task database plus the audit dispatcher fed by it.
struct Recording {
    storage: Option<Arc<Storage>>,
    audit: Option<Arc<AuditDispatcher>>,
}

impl Recording {
    async fn open(config: &AppConfig, ephemeral: bool) -> Result<Self> {
        if ephemeral {
            return Ok(Self {
                storage: None,
                audit: None,
            });
        }

        let audit = Arc::new(AuditDispatcher::tracing(AUDIT_WORKERS, AUDIT_QUEUE));
        let storage = Storage::open(Path::new(&config.storage.db_path))
            .await?
            .with_events(audit.clone());
        Ok(Self {
            storage: Some(Arc::new(storage)),
            audit: Some(audit),
        })
    }

    fn repository(&self) -> Arc<dyn TaskRepository> {
        match &self.storage {
            Some(storage) => storage.clone(),
            None => Arc::new(NoopRepository),
        }
    }

    /// Store a freshly created task before it runs.
    async fn insert(&self, task: &DocumentTask) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.insert_task(task).await?;
        }
        Ok(())
    }

    /// Drop the database handle and flush pending audit events.
    async fn close(self) {
        drop(self.storage);
        if let Some(audit) = self.audit {
            match Arc::try_unwrap(audit) {
                Ok(audit) => {
                    let dropped = audit.dropped();
                    audit.shutdown().await;
                    if dropped > 0 {
                        warn!(dropped, "audit events were dropped");
                    }
                }
                Err(_) => warn!("audit dispatcher still in use, pending events skipped"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn read_bundle(path: &Path) -> Result<BundleDto> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| eyre!("cannot read bundle '{}': {e}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|e| eyre!("invalid bundle definition '{}': {e}", path.display()))
}

async fn cmd_stitch(
    bundle_path: &Path,
    case_id: String,
    callback: Option<CallbackTarget>,
    ephemeral: bool,
) -> Result<()> {
    let config = load_config()?;
    let credential = resolve_credential(&config)?;

    let request = StitchRequest {
        case_id,
        bundle: read_bundle(bundle_path)?,
        callback,
    };
    request.validate(&ProbeOptions::from(&config)).await?;

    let recording = Recording::open(&config, ephemeral).await?;
    let progress = Arc::new(CliProgress::spinner());
    let stitcher = Stitcher::from_config(&config)?
        .with_repository(recording.repository())
        .with_progress(progress);

    let (context, task) = request.into_task(credential);
    info!(task_id = %task.id, case_id = %context.case_id, "stitching bundle");
    recording.insert(&task).await?;

    let task = stitcher.process(task).await;
    let response = stitcher_core::StitchResponse::new(&context, &task);
    drop(stitcher);
    recording.close().await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    if task.state == TaskState::Failed {
        return Err(eyre!(
            "stitch failed: {}",
            task.failure_description.as_deref().unwrap_or("unknown failure")
        ));
    }
    Ok(())
}

async fn cmd_batch(dir: &Path, workers: Option<usize>, ephemeral: bool) -> Result<()> {
    let config = load_config()?;
    let credential = resolve_credential(&config)?;

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| eyre!("cannot read '{}': {e}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(eyre!("no bundle definitions (*.json) in '{}'", dir.display()));
    }

    let recording = Recording::open(&config, ephemeral).await?;
    let mut tasks = Vec::with_capacity(files.len());
    for path in &files {
        let bundle = Bundle::from(read_bundle(path)?);
        let task = DocumentTask::new(bundle, credential.clone());
        recording.insert(&task).await?;
        tasks.push(task);
    }

    let progress = Arc::new(CliProgress::bar(tasks.len() as u64));
    let stitcher = Stitcher::from_config(&config)?
        .with_repository(recording.repository())
        .with_progress(progress.clone());
    let pool = WorkerPool::new(
        Arc::new(stitcher),
        workers.unwrap_or(config.pipeline.workers),
    );

    let start = Instant::now();
    info!(tasks = tasks.len(), workers = pool.workers(), "running batch");
    let finished = pool.run(tasks).await;
    progress.finish();
    drop(pool);
    recording.close().await;

    let failed = finished
        .iter()
        .filter(|t| t.state == TaskState::Failed)
        .count();
    for (path, task) in files.iter().zip(&finished) {
        let outcome = match task.state {
            TaskState::Done => task.bundle.stitched_document_uri.clone().unwrap_or_default(),
            _ => task.failure_description.clone().unwrap_or_default(),
        };
        println!("  {:<10} {}  {outcome}", task.state.as_str(), path.display());
    }
    println!();
    println!(
        "  {} done, {failed} failed in {:.1}s",
        finished.len() - failed,
        start.elapsed().as_secs_f64()
    );

    let report: Vec<TaskDto> = finished.iter().map(TaskDto::from).collect();
    info!(report = %serde_json::to_string(&report)?, "batch report");

    if failed > 0 {
        return Err(eyre!("{failed} of {} tasks failed", finished.len()));
    }
    Ok(())
}

async fn cmd_validate_callback(url: &str) -> Result<()> {
    let config = load_config()?;
    stitcher_callback::probe(url, &ProbeOptions::from(&config)).await?;
    println!("{url} is reachable");
    Ok(())
}

async fn cmd_tasks(state: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let state: Option<TaskState> = state.map(str::parse).transpose()?;

    let storage = Storage::open(Path::new(&config.storage.db_path)).await?;
    let tasks = storage.list_tasks(state).await?;
    if tasks.is_empty() {
        println!("no tasks");
        return Ok(());
    }

    for task in tasks {
        println!(
            "  {}  {:<10} v{}  {}  {}",
            task.id,
            task.state.as_str(),
            task.version,
            task.updated_at.format("%Y-%m-%d %H:%M:%S"),
            task.failure_description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_delete_task(id: &str) -> Result<()> {
    let config = load_config()?;
    let id: TaskId = id.parse().map_err(|e| eyre!("invalid task id '{id}': {e}"))?;

    let recording = Recording::open(&config, false).await?;
    let deleted = match &recording.storage {
        Some(storage) => storage.delete_task(&id).await?,
        None => false,
    };
    recording.close().await;

    if !deleted {
        return Err(eyre!("no task {id}"));
    }
    println!("deleted task {id}");
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using indicatif spinners/bars.
struct CliProgress {
    bar: ProgressBar,
    batch: bool,
}

impl CliProgress {
    fn spinner() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar, batch: false }
    }

    fn bar(len: u64) -> Self {
        let bar = ProgressBar::new(len);
        bar.set_style(
            ProgressStyle::with_template("{bar:30.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar, batch: true }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, task: &DocumentTask, name: &str) {
        if self.batch {
            self.bar.set_message(format!("{}: {name}", task.bundle.title));
        } else {
            self.bar.set_message(name.to_string());
        }
    }

    fn document_merged(&self, filename: &str, current: usize, total: usize) {
        if !self.batch {
            self.bar
                .set_message(format!("Merging [{current}/{total}] {filename}"));
        }
    }

    fn done(&self, _task: &DocumentTask) {
        if self.batch {
            self.bar.inc(1);
        } else {
            self.bar.finish_and_clear();
        }
    }
}
