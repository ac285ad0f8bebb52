//! storeconverge -- drive buckets, objects, permissions and service accounts
//! to the state declared in a manifest.
//!
//! `apply` converges every manifest entry and records what it observed in
//! the state file; `destroy` deletes what the state file records, or only
//! the entries a given manifest names.
//! SIGINT/SIGTERM raise the cancellation flag: the resource in flight stops
//! after its current remote call and the state file is still written.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use storeconverge::config::{self, Config, LoggingConfig};
use storeconverge::manifest::{self, Manifest, Report, State};
use storeconverge::resources::{self, ReconcileContext};
use storeconverge::retry::CancelFlag;
use storeconverge::Clients;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "storeconverge",
    version,
    about = "Converge object-storage resources to a declared state"
)]
struct Cli {
    /// Path to the YAML configuration file.  Without one, defaults and
    /// `STORECONVERGE_*` environment variables are used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the JSON state file.
    #[arg(short, long, default_value = "storeconverge.state.json")]
    state: PathBuf,

    /// Print Prometheus metrics to stdout when done.
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Converge every resource in the manifest.
    Apply {
        /// Path to the YAML manifest.
        manifest: PathBuf,
    },
    /// Delete resources recorded in the state file.
    Destroy {
        /// Only delete the resources this manifest names.
        manifest: Option<PathBuf>,
    },
    /// Print an existing bucket as JSON.
    LookupBucket {
        name: String,
    },
    /// Print an existing object as JSON.
    LookupObject {
        bucket: String,
        key: String,
        #[arg(long)]
        version_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => {
            let mut config = Config::default();
            config::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
            config
        }
    };
    init_tracing(&config.logging);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path.display());
    }

    if config.observability.metrics && storeconverge::metrics::init_metrics().is_some() {
        storeconverge::metrics::describe_metrics();
    }

    let clients = Clients::from_config(&config).await?;
    if clients.storage.is_none() {
        warn!("object-storage credentials not configured; bucket and object resources will fail");
    }
    if clients.account.is_none() {
        warn!("account API credentials not configured; permission and service account resources will fail");
    }
    let ctx = ReconcileContext::new(clients, &config.retry);
    tokio::spawn(cancel_on_signal(ctx.cancel.clone()));

    let result = run(&cli, &ctx).await;

    if cli.print_metrics {
        if let Some(text) = storeconverge::metrics::render() {
            print!("{text}");
        }
    }
    result
}

async fn run(cli: &Cli, ctx: &ReconcileContext) -> anyhow::Result<()> {
    match &cli.command {
        Command::Apply { manifest: path } => {
            let manifest = Manifest::load(path)?;
            let mut state = State::load(&cli.state)?;
            let report = manifest::apply(ctx, &manifest, &mut state).await;
            state.save(&cli.state)?;
            summarize("apply", &report)
        }
        Command::Destroy { manifest: path } => {
            let only = path.as_ref().map(Manifest::load).transpose()?;
            let mut state = State::load(&cli.state)?;
            let report = manifest::destroy(ctx, &mut state, only.as_ref()).await;
            state.save(&cli.state)?;
            summarize("destroy", &report)
        }
        Command::LookupBucket { name } => {
            let bucket = resources::bucket::lookup(ctx, name).await?;
            println!("{}", serde_json::to_string_pretty(&bucket)?);
            Ok(())
        }
        Command::LookupObject {
            bucket,
            key,
            version_id,
        } => {
            let object = resources::object::lookup(ctx, bucket, key, version_id.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&object)?);
            Ok(())
        }
    }
}

fn summarize(command: &str, report: &Report) -> anyhow::Result<()> {
    info!(
        converged = report.converged,
        deleted = report.deleted,
        failed = report.failures.len(),
        "{command} finished"
    );
    for failure in &report.failures {
        eprintln!("error: {}: {}", failure.id, failure.error);
    }
    if !report.is_success() {
        anyhow::bail!("{command}: {} resource(s) failed", report.failures.len());
    }
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then raise the cancellation flag.
async fn cancel_on_signal(cancel: CancelFlag) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, cancelling");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, cancelling");
        },
    }
    cancel.cancel();
}
