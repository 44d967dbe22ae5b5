//! Kiln CI command-line interface
//!
//! ## Commands
//!
//! - `validate`: Parse and validate a build manifest, printing its plan
//! - `run`: Run a manifest locally on the `os` driver
//! - `next-run`: Show when a cron schedule fires next
//! - `sign`: Compute the webhook signature of a payload
//! - `hooks`: Inspect and replay webhook deliveries

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use kiln_core::hook::sign;
use kiln_core::{
    plan, BuildRequest, Creator, EventBus, FsStore, HookDispatcher, Manifest, Store, Task,
};
use kiln_runner::os::{self, OsDriver};
use kiln_runner::{DriverRegistry, Worker};
use kiln_state::fakes::MemoryState;
use kiln_state::model::{NewTrigger, NewUser, NewVariable, Schedule, Status, TriggerKind};
use kiln_state::{BuildStore, DeliveryLog, SurrealHandle, UserStore};
use tracing::{info, Level};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Kiln continuous integration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "KILN_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a build manifest and print its stages
    Validate {
        /// Path to the manifest (YAML)
        manifest: PathBuf,
    },

    /// Run a manifest on this machine with the os driver
    Run {
        /// Path to the manifest (YAML)
        manifest: PathBuf,

        /// Build variable as KEY=VALUE (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Masked build variable as KEY=VALUE (repeatable)
        #[arg(long = "secret", value_name = "KEY=VALUE")]
        secrets: Vec<String>,

        /// Where collected artifacts are kept (default: a temporary directory)
        #[arg(long, env = "KILN_STORE_DIR")]
        store_dir: Option<PathBuf>,

        /// Per-artifact size limit in bytes, 0 for none
        #[arg(long, default_value = "0", env = "KILN_STORE_LIMIT")]
        store_limit: u64,
    },

    /// Show the next run of a cron schedule (daily, weekly or monthly)
    NextRun {
        schedule: String,

        /// Reference time, RFC 3339 (default: now)
        #[arg(long)]
        from: Option<String>,
    },

    /// Sign a webhook payload with a secret
    Sign {
        /// Payload file
        payload: PathBuf,

        #[arg(long, env = "KILN_HOOK_SECRET")]
        secret: String,
    },

    /// Webhook delivery log
    Hooks {
        /// Local database directory when no SurrealDB endpoint is configured
        #[arg(long, default_value = ".kiln/db", env = "KILN_DATA_DIR")]
        data_dir: String,

        #[command(subcommand)]
        action: HookAction,
    },
}

#[derive(Subcommand)]
enum HookAction {
    /// List the deliveries of a webhook
    Deliveries { webhook_id: i64 },

    /// Send an event to a webhook again
    Redeliver { webhook_id: i64, event_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    kiln_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Validate { manifest } => cmd_validate(&manifest),
        Commands::Run {
            manifest,
            vars,
            secrets,
            store_dir,
            store_limit,
        } => cmd_run(&manifest, &vars, &secrets, store_dir, store_limit).await,
        Commands::NextRun { schedule, from } => cmd_next_run(&schedule, from.as_deref()),
        Commands::Sign { payload, secret } => cmd_sign(&payload, &secret),
        Commands::Hooks { data_dir, action } => {
            let handle = SurrealHandle::setup_from_env(&data_dir)
                .await
                .context("Failed to connect to Kiln database")?;
            match action {
                HookAction::Deliveries { webhook_id } => {
                    cmd_deliveries(&handle, webhook_id).await
                }
                HookAction::Redeliver {
                    webhook_id,
                    event_id,
                } => cmd_redeliver(handle, webhook_id, event_id).await,
            }
        }
    }
}

fn read_manifest(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read manifest {:?}", path))
}

fn cmd_validate(path: &Path) -> Result<()> {
    let text = read_manifest(path)?;
    let manifest = Manifest::parse(&text).context("Invalid manifest")?;
    manifest.validate().context("Invalid manifest")?;

    println!("driver: {}", manifest.driver_type());
    for stage in plan(&manifest) {
        let suffix = if stage.can_fail { " (may fail)" } else { "" };
        println!("stage {}{}", stage.name, suffix);
        for job in &stage.jobs {
            if job.depends.is_empty() {
                println!("  {}", job.name);
            } else {
                println!("  {} <- {}", job.name, job.depends.join(", "));
            }
        }
    }
    Ok(())
}

fn parse_vars(vars: &[String], masked: bool) -> Result<Vec<NewVariable>> {
    vars.iter()
        .map(|kv| -> Result<NewVariable> {
            let (key, value) = kv
                .split_once('=')
                .filter(|(k, _)| !k.is_empty())
                .with_context(|| format!("Expected KEY=VALUE, got {kv:?}"))?;
            Ok(NewVariable {
                key: key.to_string(),
                value: value.to_string(),
                masked,
            })
        })
        .collect()
}

/// Run `manifest` to completion against an in-memory state. Returns the
/// final status and the build output.
async fn run_local(
    manifest: String,
    variables: Vec<NewVariable>,
    store: Arc<dyn Store>,
) -> Result<(Status, String)> {
    let state = Arc::new(MemoryState::new());
    let user = state
        .create_user(NewUser {
            username: "local".into(),
            email: "local@localhost".into(),
            cleanup: false,
        })
        .await?;

    let creator = Creator::new(state.clone(), state.clone(), EventBus::noop());
    let mut req = BuildRequest::new(
        user.id,
        manifest,
        NewTrigger::new(TriggerKind::Manual, "local run"),
    );
    req.variables = variables;
    let (build, manifest) = creator.create(req).await?;
    if manifest.driver_type() != os::KIND {
        anyhow::bail!(
            "Local runs use the {} driver, manifest asks for {}",
            os::KIND,
            manifest.driver_type()
        );
    }

    let drivers = Arc::new(DriverRegistry::new());
    drivers.register(os::KIND, OsDriver::factory(None)).await;
    let worker = Worker::new(state.clone(), drivers, store, EventBus::noop());
    let status = worker.process(&Task::run_build(&build)?).await?;

    let build = state.get_build(build.id).await?;
    for job in state.jobs(build.id).await? {
        info!(job = %job.name, status = %job.status, "job finished");
    }
    Ok((status, build.output.unwrap_or_default()))
}

async fn cmd_run(
    path: &Path,
    vars: &[String],
    secrets: &[String],
    store_dir: Option<PathBuf>,
    store_limit: u64,
) -> Result<()> {
    let manifest = read_manifest(path)?;
    let mut variables = parse_vars(vars, false)?;
    variables.extend(parse_vars(secrets, true)?);

    let scratch = tempfile::tempdir().context("Failed to create artifact directory")?;
    let dir = store_dir.unwrap_or_else(|| scratch.path().to_path_buf());
    let store = FsStore::new(&dir, store_limit);
    store
        .init()
        .with_context(|| format!("Failed to prepare artifact store {:?}", dir))?;

    let (status, output) = run_local(manifest, variables, Arc::new(store)).await?;
    print!("{output}");
    println!("build {status}");
    if status.is_failure() {
        anyhow::bail!("Build {status}");
    }
    Ok(())
}

fn cmd_next_run(schedule: &str, from: Option<&str>) -> Result<()> {
    let schedule: Schedule = schedule.parse()?;
    let now = match from {
        Some(ts) => DateTime::parse_from_rfc3339(ts)
            .with_context(|| format!("Invalid timestamp {ts:?}"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    println!("{}", schedule.next(now).to_rfc3339());
    Ok(())
}

fn cmd_sign(payload: &Path, secret: &str) -> Result<()> {
    let body =
        std::fs::read(payload).with_context(|| format!("Failed to read payload {:?}", payload))?;
    println!("{}", sign(secret, &body)?);
    Ok(())
}

async fn cmd_deliveries(log: &dyn DeliveryLog, webhook_id: i64) -> Result<()> {
    let deliveries = log.deliveries(webhook_id).await?;
    if deliveries.is_empty() {
        println!("No deliveries for webhook {webhook_id}");
        return Ok(());
    }
    for d in deliveries {
        let outcome = match (&d.error, d.response_code) {
            (Some(err), _) => format!("error: {err}"),
            (None, Some(code)) => code.to_string(),
            (None, None) => "-".to_string(),
        };
        let redelivery = if d.redelivery { " (redelivery)" } else { "" };
        println!(
            "{:>6}  {}  {:<16} {:>5}ms  {}{}",
            d.id,
            d.event_id,
            d.event_type.as_str(),
            d.duration_ms,
            outcome,
            redelivery
        );
    }
    Ok(())
}

async fn cmd_redeliver(handle: SurrealHandle, webhook_id: i64, event_id: Uuid) -> Result<()> {
    let handle = Arc::new(handle);
    let dispatcher = HookDispatcher::new(handle.clone(), handle.clone(), handle);
    let delivery = dispatcher
        .redeliver(webhook_id, event_id)
        .await
        .context("Redelivery failed")?;
    match delivery.error {
        Some(err) => println!("Delivery {} failed: {err}", delivery.id),
        None => println!(
            "Delivery {} answered {}",
            delivery.id,
            delivery.response_code.unwrap_or_default()
        ),
    }
    Ok(())
}
