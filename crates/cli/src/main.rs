use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use podseed_core::config::{self, Settings};
use podseed_core::run_log::{self, RunKind};
use podseed_core::{
    APP_NAME, CheckpointObserver, CheckpointStore, Collaborators, HttpContentUploader, Identity,
    ProgressSink, UploadOptions, WalkDirLister, discover_accounts, run_upload,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "podseed")]
#[command(about = "Seed pod servers from a local directory tree, resumably", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the accounts a seed root maps to.
    Discover {
        #[arg(long)]
        root: PathBuf,
        /// Account endpoint template; `{index}` and `{name}` are substituted.
        #[arg(long)]
        template: Option<String>,
    },
    /// Upload every account directory into its pod.
    Upload(UploadArgs),
    Checkpoint {
        #[command(subcommand)]
        cmd: CheckpointCmd,
    },
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
}

#[derive(Args)]
struct UploadArgs {
    #[arg(long)]
    root: PathBuf,

    #[arg(long)]
    template: Option<String>,

    /// Checkpoint file; defaults to the configured path below the data dir.
    #[arg(long, conflicts_with = "no_checkpoint")]
    checkpoint: Option<PathBuf>,

    #[arg(long)]
    no_checkpoint: bool,

    /// Maximum uploads in flight per server.
    #[arg(long)]
    parallel: Option<usize>,

    #[arg(long)]
    acl: bool,

    #[arg(long)]
    acr: bool,
}

#[derive(Subcommand)]
enum CheckpointCmd {
    Stats {
        #[arg(long)]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Set,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

struct NdjsonProgressSink {
    run_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: podseed_core::UploadProgress) {
        let line = serde_json::json!({
            "type": "task.progress",
            "runId": self.run_id,
            "phase": p.phase,
            "identitiesTotal": p.identities_total,
            "identitiesScanned": p.identities_scanned,
            "filesTotal": p.files_total,
            "filesDone": p.files_done,
            "filesSkipped": p.files_skipped,
            "filesFailed": p.files_failed,
            "checkpointEntries": p.checkpoint_entries,
        });
        println!("{line}");
    }
}

impl CheckpointObserver for NdjsonProgressSink {
    fn on_threshold_flush(&self, total_entries: usize) {
        let line = serde_json::json!({
            "type": "checkpoint.flush",
            "runId": self.run_id,
            "entries": total_entries,
        });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let stderr_layer = (!cli.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });
    run_log::init_run_logging_with(stderr_layer);

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("PODSEED_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("PODSEED_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    match cli.cmd {
        Command::Discover { root, template } => {
            discover_run(&config_dir, &data_dir, root, template, cli.json)
        }
        Command::Upload(args) => {
            upload_run(&config_dir, &data_dir, args, cli.json, cli.events).await
        }
        Command::Checkpoint { cmd } => match cmd {
            CheckpointCmd::Stats { path } => checkpoint_stats(&path, cli.json).await,
        },
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
            SettingsCmd::Set => settings_set(&config_dir, cli.json),
        },
    }
}

fn discover_run(
    config_dir: &Path,
    data_dir: &Path,
    root: PathBuf,
    template: Option<String>,
    json: bool,
) -> Result<(), CliError> {
    let settings = load_settings(config_dir)?;
    let template = template.unwrap_or(settings.account_template);

    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let _run_log = start_run_log(RunKind::Discover, &run_id, data_dir);

    let accounts = discover_accounts(&root, &template).map_err(map_core_err)?;
    tracing::info!(
        event = "run.finish",
        kind = "discover",
        run_id = %run_id,
        accounts = accounts.len(),
        "run.finish"
    );

    if json {
        println!("{}", serde_json::json!({ "accounts": accounts }));
    } else {
        for a in &accounts {
            println!(
                "{}\t{}\t{}\t{}",
                a.index,
                a.name,
                a.account_endpoint,
                a.source_dir.display()
            );
        }
    }
    Ok(())
}

async fn upload_run(
    config_dir: &Path,
    data_dir: &Path,
    args: UploadArgs,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let mut settings = load_settings(config_dir)?;
    if let Some(template) = args.template {
        settings.account_template = template;
    }
    if let Some(parallel) = args.parallel {
        settings.max_parallel_per_origin = parallel;
    }
    settings.metadata.acl |= args.acl;
    settings.metadata.acr |= args.acr;
    config::validate_settings(&settings).map_err(map_core_err)?;

    let identities: Vec<Identity> = discover_accounts(&args.root, &settings.account_template)
        .and_then(|accounts| {
            accounts
                .into_iter()
                .map(|a| a.into_identity())
                .collect::<podseed_core::Result<Vec<_>>>()
        })
        .map_err(map_core_err)?;

    let auth = settings.credential_cache();
    let uploader = HttpContentUploader::new();
    let attacher = settings.metadata_attacher(config_dir).map_err(map_core_err)?;
    let lister = WalkDirLister::new();
    let upload_config = settings.upload_config();

    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let run_log = start_run_log(RunKind::Upload, &run_id, data_dir);

    let sink = Arc::new(NdjsonProgressSink {
        run_id: run_id.clone(),
    });

    let checkpoint = if args.no_checkpoint {
        None
    } else {
        let path = args
            .checkpoint
            .unwrap_or_else(|| settings.checkpoint_file(data_dir));
        let mut store = CheckpointStore::open_fs(path).await.map_err(map_core_err)?;
        if events {
            store = store.with_observer(sink.clone());
        }
        Some(store)
    };

    let checkpoint_path = checkpoint
        .as_ref()
        .map(|c| c.path().display().to_string())
        .unwrap_or_default();
    let log_path = run_log
        .as_ref()
        .map(|g| g.path().display().to_string())
        .unwrap_or_default();
    tracing::info!(
        event = "run.start",
        kind = "upload",
        run_id = %run_id,
        root = %args.root.display(),
        identities = identities.len(),
        max_parallel_per_origin = upload_config.max_parallel_per_origin,
        checkpoint = %checkpoint_path,
        log_path = %log_path,
        "run.start"
    );

    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "runId": run_id,
                "kind": "upload",
                "state": "running"
            })
        );
    }

    let started = Instant::now();
    let progress: Option<&dyn ProgressSink> = if events { Some(sink.as_ref()) } else { None };
    let res = run_upload(
        Collaborators {
            auth: &auth,
            uploader: &uploader,
            attacher: &attacher,
            lister: &lister,
        },
        &identities,
        &upload_config,
        UploadOptions {
            checkpoint: checkpoint.as_ref(),
            progress,
        },
    )
    .await;
    let duration_seconds = started.elapsed().as_secs_f64();

    let summary = match res {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!(
                event = "run.finish",
                kind = "upload",
                run_id = %run_id,
                status = "failed",
                duration_seconds,
                error = %e,
                "run.finish"
            );
            if events {
                println!(
                    "{}",
                    serde_json::json!({
                        "type": "task.state",
                        "runId": run_id,
                        "kind": "upload",
                        "state": "failed"
                    })
                );
            }
            return Err(map_core_err(e));
        }
    };

    tracing::info!(
        event = "run.finish",
        kind = "upload",
        run_id = %run_id,
        status = "succeeded",
        duration_seconds,
        uploaded = summary.uploaded,
        skipped = summary.skipped,
        "run.finish"
    );

    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "runId": run_id,
                "kind": "upload",
                "state": "succeeded",
                "summary": summary,
            })
        );
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::to_string(&summary)
                .map_err(|e| CliError::new("internal", e.to_string()))?
        );
    } else {
        println!(
            "identities={} servers={} uploaded={} skipped={} failed={}",
            summary.identities, summary.origins, summary.uploaded, summary.skipped, summary.failed
        );
        if let Some(entries) = summary.checkpoint_entries {
            println!("checkpointEntries={entries}");
        }
    }
    Ok(())
}

async fn checkpoint_stats(path: &Path, json: bool) -> Result<(), CliError> {
    if !path.exists() && !podseed_core::checkpoint::backup_path(path).exists() {
        return Err(CliError::new(
            "checkpoint.missing",
            format!("no checkpoint at {}", path.display()),
        ));
    }
    let store = CheckpointStore::open_fs(path).await.map_err(map_core_err)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "path": path.display().to_string(), "entries": store.len() })
        );
    } else {
        println!("entries={}", store.len());
    }
    Ok(())
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        let text = config::to_toml(&settings).map_err(map_core_err)?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings = config::parse_settings(&input)
        .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    config::save_settings(config_dir, &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

fn start_run_log(kind: RunKind, run_id: &str, data_dir: &Path) -> Option<run_log::RunLogGuard> {
    match run_log::start_run_log(kind, run_id, data_dir) {
        Ok(guard) => Some(guard),
        Err(e) => {
            tracing::warn!(
                event = "run_log.unavailable",
                kind = kind.as_str(),
                error = %e,
                "run_log.unavailable"
            );
            None
        }
    }
}

fn default_config_dir() -> PathBuf {
    if let Ok(v) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(v).join(APP_NAME);
    }
    home_dir().join(".config").join(APP_NAME)
}

fn default_data_dir() -> PathBuf {
    if let Ok(v) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(v).join(APP_NAME);
    }
    home_dir().join(".local").join("share").join(APP_NAME)
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

fn load_settings(config_dir: &Path) -> Result<Settings, CliError> {
    config::load_settings(config_dir).map_err(map_core_err)
}

fn map_core_err(e: podseed_core::Error) -> CliError {
    use podseed_core::Error;

    match e {
        Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        Error::Discovery { message } => CliError::new("discovery.failed", message),
        Error::Session { account, message } => {
            CliError::retryable("session.failed", message)
                .with_details(serde_json::json!({ "account": account }))
        }
        Error::CheckpointIo { op, path, source } => {
            CliError::retryable("checkpoint.io_failed", source.to_string()).with_details(
                serde_json::json!({ "op": op, "path": path.display().to_string() }),
            )
        }
        Error::Serialization { path, message } => CliError::new("checkpoint.corrupt", message)
            .with_details(serde_json::json!({ "path": path.display().to_string() })),
        Error::Upload { resource, message } => CliError::retryable("upload.failed", message)
            .with_details(serde_json::json!({ "resource": resource })),
        Error::Metadata {
            flavor,
            resource,
            message,
        } => CliError::retryable("metadata.failed", message)
            .with_details(serde_json::json!({ "flavor": flavor, "resource": resource })),
        Error::TasksFailed { failed, total } => CliError::retryable(
            "upload.incomplete",
            format!("{failed} of {total} upload tasks failed; rerun to resume"),
        )
        .with_details(serde_json::json!({ "failed": failed, "total": total })),
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}"
            .to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}
