//! `foreman` command-line entry point.
//!
//! State lives under `state_dir` (tasks, milestones, interaction log, lock
//! files); the workspace is the sandbox root the agents write into.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;

use foreman::core::status::TaskStatus;
use foreman::core::types::{NewTask, TaskType};
use foreman::dispatcher::{self, DispatchOptions, Dispatcher, JobReport, JobResult};
use foreman::engine::Engine;
use foreman::exit_codes;
use foreman::io::config::{ForemanConfig, load_config, write_config};
use foreman::io::json_store::JsonFileStore;
use foreman::io::llm::ProcessChatClient;
use foreman::io::locks::FileLocks;
use foreman::io::store::Store;
use foreman::{logging, retention, status};

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Orchestrate LLM-driven development tasks through ordered milestones"
)]
struct Cli {
    /// Configuration file; relative paths inside it resolve against its directory.
    #[arg(long, global = true, default_value = "foreman.toml")]
    config: PathBuf,
    /// Log progress at info level (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config and create the state and workspace directories.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Create a pending task.
    Seed {
        title: String,
        #[arg(long = "type", default_value = "feature")]
        task_type: TaskType,
        #[arg(long, default_value = "")]
        description: String,
        /// Lower runs first.
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i64,
        /// Free-form JSON payload.
        #[arg(long)]
        content: Option<String>,
    },
    /// Claim pending tasks and process them, waiting for completion.
    Dispatch {
        #[arg(long)]
        limit: Option<usize>,
        /// Also take over tasks whose lock is still live.
        #[arg(long)]
        force: bool,
    },
    /// Dispatch periodically.
    Work {
        /// Seconds between passes (defaults to `dispatcher.interval_secs`).
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
        /// Run a single pass and exit.
        #[arg(long)]
        once: bool,
    },
    /// Show tasks, their milestones and failure details.
    Status {
        task_id: Option<u64>,
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        json: bool,
    },
    /// Cancel a pending, in-progress or failed task.
    Cancel { task_id: u64 },
    /// Requeue a failed or cancelled task with a fresh attempt count.
    Retry { task_id: u64 },
    /// Delete interaction records and log files older than the retention window.
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = cli.config;
    match cli.command {
        Command::Init { force } => cmd_init(&config, force),
        Command::Seed {
            title,
            task_type,
            description,
            priority,
            content,
        } => cmd_seed(&load(&config)?, title, task_type, description, priority, content),
        Command::Dispatch { limit, force } => cmd_dispatch(&load(&config)?, limit, force),
        Command::Work {
            interval,
            limit,
            once,
        } => cmd_work(&load(&config)?, interval, limit, once),
        Command::Status {
            task_id,
            status,
            json,
        } => cmd_status(&load(&config)?, task_id, status, json),
        Command::Cancel { task_id } => cmd_cancel(&load(&config)?, task_id),
        Command::Retry { task_id } => cmd_retry(&load(&config)?, task_id),
        Command::Cleanup { days, dry_run } => cmd_cleanup(&load(&config)?, days, dry_run),
    }
}

fn load(config_path: &Path) -> Result<ForemanConfig> {
    let cfg = load_config(config_path)?;
    let base = config_dir(config_path)?;
    Ok(cfg.resolve_paths(&base))
}

fn config_dir(config_path: &Path) -> Result<PathBuf> {
    match config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => Ok(parent.to_path_buf()),
        None => std::env::current_dir().context("resolve current directory"),
    }
}

fn open_store(cfg: &ForemanConfig) -> Result<Arc<JsonFileStore>> {
    Ok(Arc::new(JsonFileStore::open(&cfg.state_dir)?))
}

fn build_engine(cfg: &ForemanConfig, store: Arc<JsonFileStore>) -> Result<Engine> {
    let transcripts = cfg.state_dir.join("transcripts");
    fs::create_dir_all(&transcripts)
        .with_context(|| format!("create {}", transcripts.display()))?;
    let client = Arc::new(ProcessChatClient::new(&cfg.llm, Some(transcripts)));
    let locks = Arc::new(FileLocks::new(&cfg.state_dir.join("locks"))?);
    Engine::from_config(cfg, store, client, locks)
}

fn build_dispatcher(cfg: &ForemanConfig) -> Result<Dispatcher> {
    let store = open_store(cfg)?;
    let engine = Arc::new(build_engine(cfg, store)?);
    let worker_id = cfg
        .dispatcher
        .worker_id
        .clone()
        .unwrap_or_else(dispatcher::worker_id);
    Ok(Dispatcher::new(engine, worker_id, cfg.locks.task_ttl()))
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        println!("{} exists (use --force to overwrite)", config_path.display());
    } else {
        write_config(config_path, &ForemanConfig::default())?;
        println!("wrote {}", config_path.display());
    }
    let cfg = load(config_path)?;
    for dir in [&cfg.state_dir, &cfg.workspace.root] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    JsonFileStore::open(&cfg.state_dir)?;
    Ok(exit_codes::OK)
}

fn cmd_seed(
    cfg: &ForemanConfig,
    title: String,
    task_type: TaskType,
    description: String,
    priority: i64,
    content: Option<String>,
) -> Result<i32> {
    let content = match content {
        Some(raw) => serde_json::from_str::<Value>(&raw).context("parse --content as JSON")?,
        None => Value::Object(Default::default()),
    };
    let store = open_store(cfg)?;
    let task = store.create_task(NewTask {
        task_type,
        title,
        description,
        content,
        priority,
    })?;
    println!("{}", task.id);
    Ok(exit_codes::OK)
}

fn cmd_dispatch(cfg: &ForemanConfig, limit: Option<usize>, force: bool) -> Result<i32> {
    let dispatcher = build_dispatcher(cfg)?;
    let opts = DispatchOptions {
        limit: limit.unwrap_or(cfg.dispatcher.limit),
        force,
    };
    let dispatch = dispatcher.dispatch(opts)?;
    for task_id in &dispatch.skipped {
        println!("{}", serde_json::json!({ "task_id": task_id, "result": "skipped" }));
    }
    let reports = dispatch.wait();
    print_reports(&reports)?;
    Ok(exit_code(&reports))
}

fn cmd_work(
    cfg: &ForemanConfig,
    interval: Option<u64>,
    limit: Option<usize>,
    once: bool,
) -> Result<i32> {
    let dispatcher = build_dispatcher(cfg)?;
    let opts = DispatchOptions {
        limit: limit.unwrap_or(cfg.dispatcher.limit),
        force: false,
    };
    let interval = Duration::from_secs(interval.unwrap_or(cfg.dispatcher.interval_secs));
    let mut code = exit_codes::OK;
    let mut print_err = None;
    dispatcher::work_loop(&dispatcher, opts, interval, once.then_some(1), |reports| {
        if let Err(err) = print_reports(reports)
            && print_err.is_none()
        {
            print_err = Some(err);
        }
        code = code.max(exit_code(reports));
    })?;
    if let Some(err) = print_err {
        return Err(err);
    }
    Ok(code)
}

fn cmd_status(
    cfg: &ForemanConfig,
    task_id: Option<u64>,
    filter: Option<TaskStatus>,
    json: bool,
) -> Result<i32> {
    let store = open_store(cfg)?;
    let reports = match task_id {
        Some(id) => vec![status::task_report(store.as_ref(), id)?],
        None => status::task_reports(store.as_ref(), filter)?,
    };
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("serialize status")?
        );
    } else if reports.is_empty() {
        println!("no tasks");
    } else {
        print!("{}", status::render_text(&reports));
    }
    Ok(exit_codes::OK)
}

fn cmd_cancel(cfg: &ForemanConfig, task_id: u64) -> Result<i32> {
    let store = open_store(cfg)?;
    let now = Utc::now();
    let mut task = store.get_task(task_id)?;
    task.transition_to(TaskStatus::Cancelled, now)
        .map_err(|err| anyhow!("task {task_id}: {err}"))?;
    task.unlock(now);
    store.update_task(&task)?;
    println!("task {task_id} cancelled");
    Ok(exit_codes::OK)
}

fn cmd_retry(cfg: &ForemanConfig, task_id: u64) -> Result<i32> {
    let store = open_store(cfg)?;
    let now = Utc::now();
    let mut task = store.get_task(task_id)?;
    task.transition_to(TaskStatus::Pending, now)
        .map_err(|err| anyhow!("task {task_id}: {err}"))?;
    task.unlock(now);
    task.attempts = 0;
    task.last_error = None;
    store.update_task(&task)?;
    println!("task {task_id} requeued");
    Ok(exit_codes::OK)
}

fn cmd_cleanup(cfg: &ForemanConfig, days: Option<u32>, dry_run: bool) -> Result<i32> {
    let store = open_store(cfg)?;
    let report = retention::sweep(
        store.as_ref(),
        cfg.retention.log_dir.as_deref(),
        days.unwrap_or(cfg.retention.days),
        dry_run,
        Utc::now(),
    )?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize sweep report")?
    );
    Ok(exit_codes::OK)
}

fn print_reports(reports: &[JobReport]) -> Result<()> {
    for report in reports {
        println!(
            "{}",
            serde_json::to_string(report).context("serialize job report")?
        );
    }
    Ok(())
}

fn exit_code(reports: &[JobReport]) -> i32 {
    if reports
        .iter()
        .any(|r| matches!(r.result, JobResult::Failed { .. } | JobResult::Crashed))
    {
        exit_codes::TASK_FAILED
    } else {
        exit_codes::OK
    }
}
