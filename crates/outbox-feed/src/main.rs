//! Outbox feed command-line client.
//!
//! Resolves who a user follows and where those authors write, plans a small
//! covering set of relays, fetches recent events from them and prints each
//! event as one JSON line on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Last 24 hours of notes and reposts from everyone npub1... follows
//! outbox-feed --user npub1...
//!
//! # Stream results as relays answer, with health-aware relay ranking
//! outbox-feed --user <hex> --stream --adaptive
//!
//! # Persist relay lists between runs and expose Prometheus metrics
//! outbox-feed --user npub1... --cache-db ./data/outbox-cache.db --metrics-port 9090
//! ```
//!
//! Every engine setting can also be given through `OUTBOX_*` environment
//! variables; command-line flags win.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nostr::{JsonUtil, Kind, Timestamp};
use outbox_core::metrics::{init_metrics, start_metrics_server};
use outbox_core::parse_public_key;
use outbox_feed::config::parse_relay_csv;
use outbox_feed::{
    FeedFilter, FeedResult, MemorySnapshotStore, NostrFetcher, OutboxConfig, OutboxFeed,
    SnapshotStore, SqliteSnapshotStore,
};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

/// Outbox-model Nostr feed fetcher.
#[derive(Parser, Debug)]
#[command(name = "outbox-feed")]
#[command(about = "Fetch a Nostr feed from the relays each followed author writes to")]
#[command(version)]
struct Args {
    /// User whose follows make up the feed (npub or hex)
    #[arg(long)]
    user: String,

    /// Event kinds to fetch (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "1,6")]
    kinds: Vec<u16>,

    /// Only fetch events from the last N hours
    #[arg(long, default_value = "24")]
    since_hours: u64,

    /// Maximum events requested per relay
    #[arg(long)]
    limit: Option<usize>,

    /// Print events per relay as they arrive
    #[arg(long)]
    stream: bool,

    /// Rank relays by coverage and health instead of coverage alone
    #[arg(long)]
    adaptive: bool,

    /// Relays for authors without a relay list (comma-separated)
    #[arg(long, value_delimiter = ',')]
    fallback_relays: Option<Vec<String>>,

    /// Relays never to query (comma-separated)
    #[arg(long, value_delimiter = ',')]
    blocked_relays: Option<Vec<String>>,

    /// Relays queried for follow and relay lists (comma-separated)
    #[arg(long, value_delimiter = ',')]
    bootstrap_relays: Option<Vec<String>>,

    /// Accept loopback and private-network relay URLs
    #[arg(long)]
    allow_local_relays: bool,

    /// Maximum relays in the query plan
    #[arg(long)]
    max_relays: Option<usize>,

    /// Global fetch budget in milliseconds
    #[arg(long)]
    global_timeout_ms: Option<u64>,

    /// SQLite file for the relay list snapshot (in-memory if unset)
    #[arg(long)]
    cache_db: Option<PathBuf>,

    /// Discard cached and persisted relay lists before fetching
    #[arg(long)]
    clear_cache: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "0")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("outbox_feed=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let user = parse_public_key(&args.user).context("Invalid --user")?;
    let config = build_config(&args)?;

    tracing::info!("Configuration:");
    tracing::info!("  User: {}", user);
    tracing::info!("  Bootstrap relays: {}", config.bootstrap_relays.len());
    tracing::info!("  Fallback relays: {}", config.fallback_relays.len());
    tracing::info!("  Blocked relays: {}", config.blocked_relays.len());
    tracing::info!("  Max relays: {}", config.max_relays);
    tracing::info!("  Adaptive: {}", config.adaptive);

    let store: Arc<dyn SnapshotStore> = match &config.cache_db_path {
        Some(path) => {
            tracing::info!("  Cache: {}", path.display());
            Arc::new(
                SqliteSnapshotStore::open(path)
                    .with_context(|| format!("Failed to open cache at {}", path.display()))?,
            )
        }
        None => Arc::new(MemorySnapshotStore::new()),
    };

    let fetcher = Arc::new(NostrFetcher::default());
    let feed = OutboxFeed::new(config, Arc::clone(&fetcher), store);
    if args.clear_cache {
        tracing::info!("Clearing relay list cache");
        feed.relay_lists().clear();
    }

    let since = Timestamp::from(
        Timestamp::now()
            .as_u64()
            .saturating_sub(args.since_hours * 3600),
    );
    let mut template = FeedFilter::new()
        .kinds(args.kinds.iter().copied().map(Kind::from))
        .since(since);
    if let Some(limit) = args.limit {
        template = template.limit(limit);
    }

    if args.stream {
        run_stream(&feed, &user, template).await?;
    } else {
        run_once(&feed, &user, template).await;
    }

    fetcher.client().disconnect().await;
    Ok(())
}

fn build_config(args: &Args) -> Result<OutboxConfig> {
    let mut config = OutboxConfig::from_env().context("Invalid OUTBOX_* configuration")?;

    if args.allow_local_relays {
        config.allow_local_relays = true;
    }
    let opts = config.normalize_options();
    if let Some(relays) = &args.bootstrap_relays {
        config.bootstrap_relays =
            parse_relay_csv(&relays.join(","), &opts).context("Invalid --bootstrap-relays")?;
    }
    if let Some(relays) = &args.fallback_relays {
        config.fallback_relays =
            parse_relay_csv(&relays.join(","), &opts).context("Invalid --fallback-relays")?;
    }
    if let Some(relays) = &args.blocked_relays {
        config.blocked_relays =
            parse_relay_csv(&relays.join(","), &opts).context("Invalid --blocked-relays")?;
    }
    if let Some(max_relays) = args.max_relays {
        config.max_relays = max_relays;
    }
    if let Some(ms) = args.global_timeout_ms {
        config.global_timeout = Duration::from_millis(ms);
    }
    if args.adaptive {
        config.adaptive = true;
    }
    if args.cache_db.is_some() {
        config.cache_db_path = args.cache_db.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_once(feed: &OutboxFeed<NostrFetcher>, user: &nostr::PublicKey, template: FeedFilter) {
    let outcome = match feed.fetch_feed(user, template).await {
        FeedResult::Current(outcome) => outcome,
        FeedResult::Superseded { generation } => {
            tracing::warn!(generation, "Fetch was superseded");
            return;
        }
    };

    for event in &outcome.events {
        println!("{}", event.as_json());
    }

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("FEED COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Events:           {}", outcome.events.len());
    tracing::info!("Relays queried:   {}", outcome.queried_relays.len());
    tracing::info!("Relays failed:    {}", outcome.failed_relays.len());
    tracing::info!("Relays skipped:   {}", outcome.skipped_relays.len());
    tracing::info!("Stopped early:    {}", outcome.stopped_early);
    tracing::info!(
        "Timing:           planning {} ms, fetch {} ms, total {} ms",
        outcome.timing.planning_ms,
        outcome.timing.fetch_ms,
        outcome.timing.total_ms
    );
}

async fn run_stream(
    feed: &OutboxFeed<NostrFetcher>,
    user: &nostr::PublicKey,
    template: FeedFilter,
) -> Result<()> {
    let (tx, rx) = oneshot::channel();

    let handle = feed
        .stream_feed(
            user,
            template,
            |chunk| {
                tracing::debug!(
                    relay = %chunk.relay,
                    events = chunk.events.len(),
                    complete = chunk.complete,
                    "chunk"
                );
                for event in &chunk.events {
                    println!("{}", event.as_json());
                }
            },
            move |summary| {
                let _ = tx.send(summary);
            },
        )
        .await;

    let summary = rx.await.context("Stream ended without a summary")?;
    if let Some(handle) = handle {
        handle.await.context("Stream task failed")?;
    }

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("STREAM COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Events:           {}", summary.total_events);
    tracing::info!("Relays queried:   {}", summary.queried_relays.len());
    tracing::info!("Relays failed:    {}", summary.failed_relays.len());
    tracing::info!("Relays skipped:   {}", summary.skipped_relays.len());
    tracing::info!("Stopped early:    {}", summary.stopped_early);
    tracing::info!("Fetch time:       {} ms", summary.fetch_ms);

    Ok(())
}
