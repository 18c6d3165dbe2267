use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use elastic_syncer::{EsClient, Side, SyncConfig, SyncProgress, Syncer, TimeWindow};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "elastic-sync")]
#[command(about = "Copy Elasticsearch indices from one cluster to another")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Copy every document of the matching indices to the destination cluster
    Sync(SyncArgs),
}

#[derive(clap::Args, Debug)]
struct SyncArgs {
    /// TOML config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Index name or pattern to copy
    #[arg(long)]
    index: Option<String>,

    /// Only copy documents newer than this (e.g. 30d, 12h, 45m)
    #[arg(long, value_parser = parse_since, conflicts_with = "from")]
    since: Option<Duration>,

    /// Lower bound on `timestamp` (RFC 3339)
    #[arg(long)]
    from: Option<DateTime<Utc>>,

    /// Upper bound on `timestamp` (RFC 3339)
    #[arg(long)]
    to: Option<DateTime<Utc>>,

    /// Maximum documents copied per index, 0 = all
    #[arg(long)]
    limit: Option<usize>,

    /// Documents fetched per page
    #[arg(long)]
    page_size: Option<usize>,

    /// Source cluster URL
    #[arg(long, env = "SYNC_FROM_ADDRESS")]
    from_address: Option<String>,

    #[arg(long, env = "SYNC_FROM_USERNAME")]
    from_username: Option<String>,

    #[arg(long, env = "SYNC_FROM_PASSWORD", hide_env_values = true)]
    from_password: Option<String>,

    /// Log source request bodies
    #[arg(long)]
    log_from_requests: bool,

    /// Log source response bodies
    #[arg(long)]
    log_from_responses: bool,

    /// Destination cluster URL
    #[arg(long, env = "SYNC_TO_ADDRESS")]
    to_address: Option<String>,

    #[arg(long, env = "SYNC_TO_USERNAME")]
    to_username: Option<String>,

    #[arg(long, env = "SYNC_TO_PASSWORD", hide_env_values = true)]
    to_password: Option<String>,

    /// Log destination request bodies
    #[arg(long)]
    log_to_requests: bool,

    /// Log destination response bodies
    #[arg(long)]
    log_to_responses: bool,

    /// Do not draw a progress spinner
    #[arg(long)]
    no_progress: bool,
}

impl SyncArgs {
    fn into_config(self) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => SyncConfig::default(),
        };

        if let Some(index) = self.index {
            config.index = index;
        }
        if let Some(since) = self.since {
            config.window = TimeWindow::since(since);
        }
        if self.from.is_some() {
            config.window.from = self.from;
        }
        if self.to.is_some() {
            config.window.to = self.to;
        }
        if let Some(limit) = self.limit {
            config.limit = limit;
        }
        if let Some(page_size) = self.page_size {
            config.reader.page_size = page_size;
        }

        let source = &mut config.source;
        if let Some(address) = self.from_address {
            source.address = address;
        }
        if self.from_username.is_some() {
            source.username = self.from_username;
        }
        if self.from_password.is_some() {
            source.password = self.from_password;
        }
        source.log_requests |= self.log_from_requests;
        source.log_responses |= self.log_from_responses;

        let destination = &mut config.destination;
        if let Some(address) = self.to_address {
            destination.address = address;
        }
        if self.to_username.is_some() {
            destination.username = self.to_username;
        }
        if self.to_password.is_some() {
            destination.password = self.to_password;
        }
        destination.log_requests |= self.log_to_requests;
        destination.log_responses |= self.log_to_responses;

        Ok(config)
    }
}

/// `30d`, `12h`, `45m`, `90s`, `2w`; a bare number is seconds
fn parse_since(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", value))?;

    let seconds = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        other => return Err(format!("unknown duration unit '{}' in '{}'", other, value)),
    };
    amount
        .checked_mul(seconds)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is too large", value))
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,elastic_syncer=debug".into()),
    );
    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_sync(args: SyncArgs) -> Result<()> {
    let no_progress = args.no_progress;
    let config = args.into_config()?;
    config.validate()?;

    let source = Arc::new(EsClient::new(&config.source, Side::Source)?);
    let destination = Arc::new(EsClient::new(&config.destination, Side::Destination)?);
    tracing::info!(
        source = %source.base_url(),
        destination = %destination.base_url(),
        index = %config.index,
        "Connecting"
    );

    let progress = Arc::new(if no_progress {
        SyncProgress::hidden()
    } else {
        SyncProgress::spinner()
    });

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping sync");
                cancel.cancel();
            }
        }
    });

    let syncer = Syncer::new(config, source, destination).with_progress(progress);
    let report = syncer.sync(cancel).await?;

    for index in &report.indices {
        tracing::info!(
            index = %index.index,
            strategy = %index.strategy,
            created = index.created,
            documents = index.documents_read,
            "Index copied"
        );
    }
    if report.documents_failed > 0 {
        tracing::warn!(failed = report.documents_failed, "Some documents were not written");
    }
    if report.cancelled {
        tracing::warn!("Sync was interrupted before completion");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync(args) => run_sync(args).await,
    }
}
