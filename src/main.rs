use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use clipcast::config::Config;
use clipcast::engine::{DriverConfig, EngineDriver, QueueProcessor, ScheduleOrchestrator};
use clipcast::health::HealthMonitor;
use clipcast::models::{AuthStatus, Channel, Destination, Schedule};
use clipcast::notifications::NotificationManager;
use clipcast::publish::{PlanInfo, ScriptedPublisher, StaticSourceFeed, StaticSubscriptions};
use clipcast::quota::QuotaTracker;
use clipcast::rotation::RotationSelector;
use clipcast::storage::Store;
use clipcast::timing::{suggest_times, OutcomeHistory};

#[derive(Parser)]
#[command(
    name = "clipcast",
    version,
    about = "Multi-channel publish scheduling and rotation engine",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine drivers
    Run {
        /// Use simulated collaborators (publisher, feed, billing) against an
        /// in-memory store; for local development of the engine itself
        #[arg(long)]
        simulate: bool,
    },

    /// Show queue statistics and channel health
    Status,

    /// Print ranked posting-time suggestions
    Suggest {
        /// Channel whose outcome history seeds the scorer; heuristics only
        /// when omitted
        #[arg(long)]
        channel: Option<Uuid>,

        /// Timezone for bucketing history (IANA name)
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },

    /// Cancel all queued entries for a source account
    Cancel {
        /// Source account whose queued entries are dropped
        account: Uuid,
    },

    /// Requeue a terminally failed entry
    Retry {
        /// Queue entry to retry
        entry: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;
    if let Err(e) = clipcast::metrics::init_metrics() {
        tracing::warn!("metrics initialization failed: {e}");
    }

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Commands::Run { simulate } => run(config, simulate).await,
        Commands::Status => status(config),
        Commands::Suggest { channel, timezone } => suggest(config, channel, &timezone),
        Commands::Cancel { account } => cancel(config, account),
        Commands::Retry { entry } => retry(config, entry),
    }
}

async fn run(config: Config, simulate: bool) -> Result<()> {
    if !simulate {
        anyhow::bail!(
            "no destination platform integration is wired into this binary; \
             embed the engine as a library, or pass --simulate to exercise it \
             against simulated collaborators"
        );
    }

    tracing::info!("starting engine in simulation mode");
    let store = Store::memory();
    let feed = Arc::new(StaticSourceFeed::default());
    let subs = Arc::new(StaticSubscriptions::new());
    seed_demo_data(&store, &feed, &subs)?;

    let mut notifier = NotificationManager::new();
    if let Some(endpoint) = &config.notifications.webhook_url {
        let timeout = std::time::Duration::from_secs(
            config.notifications.webhook_timeout_secs.unwrap_or(10),
        );
        let url = url::Url::parse(endpoint)
            .map_err(|e| anyhow::anyhow!("invalid webhook URL '{endpoint}': {e}"))?;
        notifier.add_channel(Arc::new(clipcast::notifications::WebhookChannel::new(
            url, timeout,
        )?));
        tracing::info!(endpoint = %endpoint, "webhook notifications enabled");
    }
    let notifier = Arc::new(notifier);
    let quota = Arc::new(QuotaTracker::new(store.quota.clone(), subs.clone()));
    let health = Arc::new(HealthMonitor::new(
        store.health.clone(),
        config.health_config(),
    ));
    let selector = Arc::new(RotationSelector::new(
        store.channels.clone(),
        store.pools.clone(),
        quota.clone(),
        health.clone(),
    ));
    let orchestrator = Arc::new(ScheduleOrchestrator::new(
        store.clone(),
        selector,
        feed.clone(),
        subs.clone(),
        notifier.clone(),
        config.orchestrator(),
    ));
    let processor = Arc::new(QueueProcessor::new(
        store.clone(),
        Arc::new(ScriptedPublisher::always_ok()),
        feed,
        quota,
        health,
        notifier,
        config.processor(),
    ));

    let driver = EngineDriver::new(
        orchestrator,
        processor,
        DriverConfig {
            orchestrator_interval_secs: 5,
            processor_interval_secs: 5,
        },
    );
    let mut events = driver.subscribe();
    let (orchestrator_loop, processor_loop) = driver.start().await;

    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!(?event, "driver tick");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    driver.stop().await;
    let _ = orchestrator_loop.await;
    let _ = processor_loop.await;
    reporter.abort();

    let stats = store.queue.stats()?;
    println!(
        "queued: {}  processing: {}  published: {}  failed: {}",
        stats.queued, stats.processing, stats.published, stats.failed
    );
    Ok(())
}

/// One connected channel, one schedule posting every few minutes, ten clips
fn seed_demo_data(
    store: &Store,
    feed: &StaticSourceFeed,
    subs: &StaticSubscriptions,
) -> Result<()> {
    let account = Uuid::new_v4();
    subs.set(account, PlanInfo::limited(20));

    let mut channel = Channel::new(account, "demo channel");
    channel.auth_status = AuthStatus::Connected;
    store.channels.insert(&channel)?;

    let mut schedule = Schedule::new(account, Destination::Channel(channel.id), chrono_tz::UTC);
    let now = chrono::Utc::now();
    for offset in [1i64, 3, 5] {
        let t = (now + chrono::Duration::minutes(offset)).format("%H:%M").to_string();
        schedule.add_publish_time(&t).map_err(anyhow::Error::msg)?;
    }
    store.schedules.insert(&schedule)?;

    for i in 0..10 {
        feed.push(StaticSourceFeed::item(account, &format!("demo-clip-{i}")));
    }
    tracing::info!(channel = %channel.id, schedule = %schedule.id, "demo data seeded");
    Ok(())
}

fn status(config: Config) -> Result<()> {
    let store = Store::sqlite(&config.database.sqlite_path)?;
    let stats = store.queue.stats()?;

    println!("Queue");
    println!("  queued:     {}", stats.queued);
    println!("  processing: {}", stats.processing);
    println!("  published:  {}", stats.published);
    println!("  failed:     {}", stats.failed);

    let records = store.health.list()?;
    if !records.is_empty() {
        println!("\nChannel health");
        for record in records {
            let rate = record
                .success_rate()
                .map(|r| format!("{:.0}%", r * 100.0))
                .unwrap_or_else(|| "n/a".into());
            println!(
                "  {}  circuit={}  rate={}  streak={}",
                record.channel_id,
                record.circuit_state,
                rate,
                record.consecutive_failures
            );
        }
    }
    Ok(())
}

fn suggest(config: Config, channel: Option<Uuid>, timezone: &str) -> Result<()> {
    let tz: chrono_tz::Tz = timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid timezone '{timezone}': {e}"))?;

    let history = match channel {
        Some(channel_id) => {
            let store = Store::sqlite(&config.database.sqlite_path)?;
            let samples = store.queue.outcome_samples(channel_id)?;
            OutcomeHistory::from_samples(&samples, tz)
        }
        None => OutcomeHistory::empty(),
    };

    println!("{:<8} {:<9} {:<7} {:<11} reason", "hour", "day", "score", "confidence");
    for suggestion in suggest_times(&history) {
        println!(
            "{:02}:00    {:<9} {:<7} {:<11} {}",
            suggestion.hour,
            suggestion.day_type,
            suggestion.score,
            suggestion.confidence.as_str(),
            suggestion.reason
        );
    }
    Ok(())
}

fn cancel(config: Config, account: Uuid) -> Result<()> {
    let store = Store::sqlite(&config.database.sqlite_path)?;
    let schedule_ids: Vec<Uuid> = store
        .schedules
        .list_for_source_account(account)?
        .into_iter()
        .map(|s| s.id)
        .collect();
    let cancelled = store.queue.cancel_queued(&schedule_ids)?;
    println!("cancelled {cancelled} queued entries for account {account}");
    Ok(())
}

fn retry(config: Config, entry: Uuid) -> Result<()> {
    let store = Store::sqlite(&config.database.sqlite_path)?;
    if store.queue.requeue_failed(entry, chrono::Utc::now())? {
        println!("entry {entry} requeued");
    } else {
        anyhow::bail!("entry {entry} is not in a failed state");
    }
    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
    Ok(())
}
