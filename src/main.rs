//! Tracklight - client-side activity capture daemon
//!
//! Captures screenshots and video sessions, tracks input activity and
//! idle time, samples system resources, and ships everything to remote
//! object storage with a local cache and retention cleanup.

mod aggregate;
mod capture;
mod config;
mod db;
mod janitor;
mod metrics;
mod monitor;
mod notify;
mod realtime;
mod sampler;
mod storage;
mod upload;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aggregate::MetricsAggregator;
use capture::{CaptureScheduler, CommandFrameSource};
use config::{CaptureConfig, ServiceConfig};
use db::Store;
use janitor::StorageJanitor;
use monitor::EventMonitor;
use notify::LogNotifier;
use realtime::{RealtimeChannel, WireMessage, WsConnector};
use sampler::SystemSampler;
use storage::{CacheQuotaProbe, HttpObjectStore, LocalCache};
use upload::UploadPipeline;

const SYSTEM_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("tracklight=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServiceConfig::load();
    let user_id = std::env::var("TRACKLIGHT_USER_ID").unwrap_or_else(|_| "default".to_string());
    tracing::info!("Starting Tracklight for user {}...", user_id);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database and storage
    let store = Store::new(&cfg.db_path)?;
    let stats = store.get_stats()?;
    tracing::info!(
        "Database initialized ({} screenshots, {} recordings, {} samples)",
        stats.screenshot_count,
        stats.recording_count,
        stats.activity_sample_count
    );

    let cache = LocalCache::open(&cfg.cache_dir)?;
    let remote = Arc::new(HttpObjectStore::new(&cfg.storage_url, &cfg.storage_bucket));
    let quota = Arc::new(CacheQuotaProbe::new(cache.clone()));
    let notifier = Arc::new(LogNotifier);
    let capture_config = Arc::new(Mutex::new(CaptureConfig::default()));

    // Activity monitoring and the realtime link
    let monitor = EventMonitor::new(capture_config.lock().unwrap().clone());
    let channel = RealtimeChannel::new(&cfg.ws_url, Arc::new(WsConnector));
    monitor.attach_channel(channel.clone());
    {
        let monitor = monitor.clone();
        channel.on_message(move |msg| {
            if let WireMessage::ActivityUpdate { data, .. } = msg {
                monitor.merge_remote(data);
            }
        });
    }
    channel.on_status(|connected| {
        tracing::info!("Realtime link {}", if connected { "up" } else { "down" });
    });
    if let Err(e) = channel.connect(&user_id).await {
        tracing::warn!("Realtime connection unavailable: {}", e);
    } else {
        channel.start_monitoring();
    }

    // Capture and upload
    let pipeline = UploadPipeline::new(
        remote.clone(),
        cache.clone(),
        store.clone(),
        notifier.clone(),
        capture_config.clone(),
    );
    let frames = Arc::new(CommandFrameSource::new(cfg.capture_cmd.clone()));
    let scheduler = CaptureScheduler::new(
        &user_id,
        monitor.clone(),
        pipeline,
        frames,
        quota.clone(),
        notifier.clone(),
        store.clone(),
        capture_config.clone(),
    );
    scheduler.start_capture();

    // Background services
    let sampler = SystemSampler::new(store.clone(), &user_id, SYSTEM_SAMPLE_INTERVAL);
    sampler.start();

    let janitor = StorageJanitor::new(
        &user_id,
        store.clone(),
        remote,
        cache,
        quota,
        notifier,
        capture_config,
    );
    janitor.start();

    // Run until interrupted, then flush what is in flight.
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    channel.stop_monitoring();
    scheduler.stop_capture();
    sampler.stop().await;
    janitor.stop().await;

    let aggregator = MetricsAggregator::new(store);
    let now = metrics::now_ms();
    match aggregator.summarize_range(&user_id, now - 24 * 60 * 60 * 1000, now) {
        Ok(summary) => tracing::info!(
            "Last 24h: {} samples, {} ms active, {} ms idle",
            summary.activity.sample_count,
            summary.activity.total_active_time,
            summary.activity.idle_time
        ),
        Err(e) => tracing::warn!("Could not summarize session history: {}", e),
    }

    Ok(())
}
