//! Operator CLI for the nightly build mirror.

mod api_client;

use anyhow::{Context, Result};
use api_client::{ApiClient, BuildSummary, PollOptions, StatisticsResponse, UploadOutcome};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use mirror_core::config::AppConfig;
use mirror_pipeline::{
    Ingestor, LocalStore, NoActiveJobs, RetentionManager, SignaturePolicy, SweepReport,
    export_promoted, import_files, load_trusted_key,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

#[derive(Parser)]
#[command(name = "mirrorctl")]
#[command(about = "Operator CLI for the nightly build mirror")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct StoreArgs {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "MIRROR_CONFIG",
        default_value = "config/mirror.toml"
    )]
    config: String,
}

#[derive(Args, Clone)]
struct ApiArgs {
    /// Portal base URL
    #[arg(long, env = "MIRROR_SERVER", default_value = DEFAULT_SERVER)]
    server: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch manifests and ingest new builds into the local store
    Sweep {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Remove local copies beyond the newest N per device and version
    Prune {
        /// Number of builds to keep (defaults to the configured value)
        #[arg(long)]
        retain: Option<u32>,
        /// Report what would be removed without deleting anything
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Add artifact files to the local store
    Import {
        /// Artifact files to import
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Import without detached signatures, recording builds as unverified
        #[arg(long, default_value_t = false)]
        no_verify: bool,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Move builds that are already promoted out of the local store
    Export {
        /// Destination directory
        dir: PathBuf,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// List builds known to the portal
    Builds {
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Show portal statistics
    Stats {
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Request promotion of a build to remote storage
    Upload {
        /// Build ID
        id: i64,
        /// Wait until the upload finishes
        #[arg(long, default_value_t = false)]
        wait: bool,
        /// Seconds between progress polls
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,
        /// Give up waiting after this many polls
        #[arg(long, default_value_t = 900)]
        max_polls: u32,
        #[command(flatten)]
        api: ApiArgs,
    },
    /// List uploads that are queued or in progress
    Uploads {
        #[command(flatten)]
        api: ApiArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let Cli { command } = Cli::parse();

    match command {
        Commands::Sweep { store } => handle_sweep(&store).await,
        Commands::Prune {
            retain,
            dry_run,
            store,
        } => handle_prune(retain, dry_run, &store).await,
        Commands::Import {
            files,
            no_verify,
            store,
        } => handle_import(&files, no_verify, &store).await,
        Commands::Export { dir, store } => handle_export(&dir, &store).await,
        Commands::Builds { api } => {
            let client = ApiClient::new(&api.server)?;
            render_builds(&client.list_builds().await?);
            Ok(())
        }
        Commands::Stats { api } => {
            let client = ApiClient::new(&api.server)?;
            render_stats(&client.statistics().await?);
            Ok(())
        }
        Commands::Upload {
            id,
            wait,
            interval_secs,
            max_polls,
            api,
        } => {
            let options = PollOptions {
                interval: Duration::from_secs(interval_secs.max(1)),
                max_polls,
            };
            handle_upload(id, wait.then_some(options), &api).await
        }
        Commands::Uploads { api } => {
            let client = ApiClient::new(&api.server)?;
            let active = client.active_uploads().await?;
            if active.is_empty() {
                println!("No uploads in progress.");
            } else {
                for id in active {
                    println!("{id}");
                }
            }
            Ok(())
        }
    }
}

fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        figment = figment.merge(Toml::file(path));
    }
    let config: AppConfig = figment
        .merge(Env::prefixed("MIRROR_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    Ok(config)
}

async fn open_local(config: &AppConfig) -> Result<Arc<LocalStore>> {
    let metadata = mirror_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    let local = LocalStore::open(&config.local.path, metadata)
        .await
        .with_context(|| {
            format!(
                "failed to open local store at {}",
                config.local.path.display()
            )
        })?;
    Ok(Arc::new(local))
}

async fn handle_sweep(store: &StoreArgs) -> Result<()> {
    let config = load_config(&store.config)?;
    let local = open_local(&config).await?;
    let signatures =
        load_trusted_key(&config.upstream).context("failed to load trusted signing key")?;
    // Offline: no server is running, so no upload can be in flight.
    let ingestor = Ingestor::new(&config, local, signatures, Arc::new(NoActiveJobs))
        .context("failed to initialize ingest pipeline")?;

    let cancel = CancellationToken::new();
    let guard = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            guard.cancel();
        }
    });

    let report = ingestor.sweep(&cancel).await?;
    render_sweep(&report);
    Ok(())
}

async fn handle_prune(retain: Option<u32>, dry_run: bool, store: &StoreArgs) -> Result<()> {
    let config = load_config(&store.config)?;
    let local = open_local(&config).await?;
    let retention = RetentionManager::new(local, Arc::new(NoActiveJobs));
    let report = retention
        .prune(retain.or(config.retention.retain), dry_run || config.retention.dry_run)
        .await?;
    for id in &report.pruned {
        println!("  {id}");
    }
    println!("{report}");
    Ok(())
}

async fn handle_import(files: &[PathBuf], no_verify: bool, store: &StoreArgs) -> Result<()> {
    let config = load_config(&store.config)?;
    let local = open_local(&config).await?;
    let verifier = if no_verify {
        tracing::warn!("Signature checks disabled; imported builds are recorded as unverified");
        None
    } else {
        Some(load_trusted_key(&config.upstream).context(
            "failed to load trusted signing key (pass --no-verify to import unsigned files)",
        )?)
    };
    let policy = match verifier.as_deref() {
        Some(verifier) => SignaturePolicy::Required(verifier),
        None => SignaturePolicy::Disabled,
    };

    let report = import_files(&local, policy, files).await;
    for row in &report.imported {
        println!(
            "Imported {} ({}, id {})",
            row.filename,
            format_bytes(row.size.max(0) as u64),
            row.id
        );
    }
    for (path, reason) in &report.skipped {
        println!("Skipped {}: {}", path.display(), reason);
    }
    println!(
        "{} imported, {} skipped",
        report.imported.len(),
        report.skipped.len()
    );
    Ok(())
}

async fn handle_export(dir: &Path, store: &StoreArgs) -> Result<()> {
    let config = load_config(&store.config)?;
    let local = open_local(&config).await?;
    let report = export_promoted(&local, dir).await?;
    for dest in &report.moved {
        println!("Moved {}", dest.display());
    }
    for (id, reason) in &report.failed {
        println!("Failed to move build {id}: {reason}");
    }
    println!("{} moved, {} failed", report.moved.len(), report.failed.len());
    if !report.failed.is_empty() {
        anyhow::bail!("{} builds could not be exported", report.failed.len());
    }
    Ok(())
}

async fn handle_upload(id: i64, wait: Option<PollOptions>, api: &ApiArgs) -> Result<()> {
    let client = ApiClient::new(&api.server)?;
    let accepted = client.request_upload(id).await?;
    if accepted.queued {
        println!("Upload of build {} queued", accepted.id);
    } else {
        println!("Upload of build {} already in progress", accepted.id);
    }

    let Some(options) = wait else {
        return Ok(());
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            guard.cancel();
        }
    });

    let outcome = client
        .wait_for_upload(id, options, &cancel, |p| {
            let percent = if p.size > 0 {
                p.progress as f64 * 100.0 / p.size as f64
            } else {
                0.0
            };
            println!(
                "  {} / {} ({:.1}%)",
                format_bytes(p.progress),
                format_bytes(p.size),
                percent
            );
        })
        .await?;

    match outcome {
        UploadOutcome::Promoted(url) => {
            println!("Build {id} promoted: {url}");
            Ok(())
        }
        UploadOutcome::StillLocal => anyhow::bail!("upload of build {id} ended without a remote copy"),
        UploadOutcome::Failed(message) => anyhow::bail!("upload of build {id} failed: {message}"),
        UploadOutcome::TimedOut => anyhow::bail!(
            "upload of build {id} still running after {} polls",
            options.max_polls
        ),
        UploadOutcome::Cancelled => {
            println!("Stopped waiting; the upload continues on the server.");
            Ok(())
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

fn render_sweep(report: &SweepReport) {
    println!("Sweep finished:");
    println!("  Devices: {}", report.devices);
    if !report.failed_devices.is_empty() {
        println!("  Failed devices: {}", report.failed_devices.join(", "));
    }
    println!("  Ingested: {}", report.ingested);
    println!("  Skipped: {}", report.skipped);
    println!("  Malformed entries: {}", report.malformed);
    println!("  Hash mismatches: {}", report.hash_mismatch);
    println!("  Invalid signatures: {}", report.signature_invalid);
    println!("  Other failures: {}", report.failed);
    match &report.prune {
        Some(prune) => println!("{prune}"),
        None => println!("Prune skipped: sweep was cancelled"),
    }
}

fn render_builds(builds: &[BuildSummary]) {
    if builds.is_empty() {
        println!("No builds found.");
        return;
    }
    println!(
        "{:<8} {:<12} {:<12} {:<10} FILENAME",
        "ID", "DEVICE", "SIZE", "WHERE"
    );
    for build in builds {
        let location = match (&build.url, &build.path) {
            (Some(_), _) => "remote",
            (None, Some(_)) => "local",
            (None, None) => "-",
        };
        println!(
            "{:<8} {:<12} {:<12} {:<10} {}",
            build.id,
            build.device,
            format_bytes(build.filesize.max(0) as u64),
            location,
            build.filename
        );
    }
}

fn render_stats(stats: &StatisticsResponse) {
    println!("Mirror Statistics:");
    println!("  Builds known: {}", stats.build_count_known);
    println!("  Builds stored: {}", stats.build_count_stored);
    println!(
        "  Stored size: {}",
        format_bytes(stats.build_size_stored.max(0) as u64)
    );
    println!("  Devices: {}", stats.device_count);
    println!("  Device versions: {}", stats.device_version_count);
    match stats.build_size_average {
        Some(avg) => println!("  Average build size: {}", format_bytes(avg as u64)),
        None => println!("  Average build size: -"),
    }
}
