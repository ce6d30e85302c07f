//! Periodic screenshot capture and video session management.
//!
//! The scheduler runs a screenshot loop on `screenshot_interval`,
//! gated per tick by the idle policy and the storage quota. Frame
//! acquisition sits behind [`FrameSource`] so hosts plug in their own
//! capture mechanism; the default shells out to a configured command.

mod recorder;

pub use recorder::{RecorderState, VideoRecorder};

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{CaptureConfig, ConfigError, ConfigPatch};
use crate::db::Store;
use crate::monitor::EventMonitor;
use crate::notify::Notifier;
use crate::storage::{Artifact, ArtifactKind, QuotaProbe};
use crate::upload::UploadPipeline;

/// Capture error types.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no frame source configured")]
    SourceUnavailable,
    #[error("frame capture failed: {0}")]
    Frame(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces one encoded frame per call.
pub trait FrameSource: Send + Sync + 'static {
    fn capture_frame(&self, quality: f64) -> Result<Vec<u8>, CaptureError>;
}

/// Frame source that runs an external capture command.
///
/// The command receives the compression quality as its last argument
/// and must write the encoded frame to stdout.
pub struct CommandFrameSource {
    cmd: Option<String>,
}

impl CommandFrameSource {
    pub fn new(cmd: Option<String>) -> Self {
        Self { cmd }
    }
}

impl FrameSource for CommandFrameSource {
    fn capture_frame(&self, quality: f64) -> Result<Vec<u8>, CaptureError> {
        let cmd = self.cmd.as_deref().ok_or(CaptureError::SourceUnavailable)?;
        let mut parts = cmd.split_whitespace();
        let program = parts.next().ok_or(CaptureError::SourceUnavailable)?;
        let output = Command::new(program)
            .args(parts)
            .arg(format!("{:.2}", quality))
            .output()?;
        if !output.status.success() {
            return Err(CaptureError::Frame(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(output.stdout)
    }
}

#[derive(Clone)]
pub struct CaptureScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    user_id: String,
    monitor: EventMonitor,
    pipeline: UploadPipeline,
    frames: Arc<dyn FrameSource>,
    quota: Arc<dyn QuotaProbe>,
    notifier: Arc<dyn Notifier>,
    db: Store,
    config: Arc<Mutex<CaptureConfig>>,
    recorder: VideoRecorder,
    capturing: AtomicBool,
    storage_full_reported: AtomicBool,
    stop: Mutex<Option<tokio::sync::broadcast::Sender<()>>>,
    video_timer: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: &str,
        monitor: EventMonitor,
        pipeline: UploadPipeline,
        frames: Arc<dyn FrameSource>,
        quota: Arc<dyn QuotaProbe>,
        notifier: Arc<dyn Notifier>,
        db: Store,
        config: Arc<Mutex<CaptureConfig>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                user_id: user_id.to_string(),
                monitor,
                pipeline,
                frames,
                quota,
                notifier,
                db,
                config,
                recorder: VideoRecorder::new(),
                capturing: AtomicBool::new(false),
                storage_full_reported: AtomicBool::new(false),
                stop: Mutex::new(None),
                video_timer: Mutex::new(None),
            }),
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.capturing.load(Ordering::SeqCst)
    }

    /// Start the screenshot loop. No-op if already running.
    pub fn start_capture(&self) {
        if self.inner.capturing.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        *self.inner.stop.lock().unwrap() = Some(tx);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            // Spread ticks so co-located instances do not capture in
            // lockstep. The receiver was created before this task, so a
            // stop arriving during the jitter sleep is not lost.
            let jitter = rand::thread_rng().gen_range(0..1000);
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            let period = inner.config.lock().unwrap().screenshot_interval();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        inner.run_tick().await;
                    }
                }
            }
        });
        tracing::info!("Capture: screenshot loop started");
    }

    /// Stop the loop, clear timers and flush any live recording.
    pub fn stop_capture(&self) {
        if let Some(tx) = self.inner.stop.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.inner.capturing.store(false, Ordering::SeqCst);

        if let Some(timer) = self.inner.video_timer.lock().unwrap().take() {
            timer.abort();
        }
        if let Some(artifact) = self.inner.recorder.stop() {
            let pipeline = self.inner.pipeline.clone();
            tokio::spawn(async move {
                let _ = pipeline.upload(artifact).await;
            });
        }
        tracing::info!("Capture: stopped");
    }

    /// Apply a validated config patch, restarting the loop if live.
    pub fn set_config(&self, patch: &ConfigPatch) -> Result<CaptureConfig, ConfigError> {
        let merged = self.inner.config.lock().unwrap().merge(patch)?;

        let was_capturing = self.is_capturing();
        if was_capturing {
            self.stop_capture();
        }
        *self.inner.config.lock().unwrap() = merged.clone();
        self.inner.monitor.set_config(merged.clone());
        if was_capturing {
            self.start_capture();
        }
        Ok(merged)
    }

    pub fn config(&self) -> CaptureConfig {
        self.inner.config.lock().unwrap().clone()
    }

    // --- Video sessions ---

    /// Begin a video session with the hard duration timeout armed.
    pub fn start_video(&self) -> bool {
        if !self.inner.recorder.start(&self.inner.user_id) {
            return false;
        }
        let max = self.inner.config.lock().unwrap().max_video_duration();
        let inner = self.inner.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(max).await;
            tracing::info!("Capture: video hit max duration, stopping");
            inner.flush_video().await;
        });
        *self.inner.video_timer.lock().unwrap() = Some(timer);
        true
    }

    /// End the session and upload what was buffered.
    pub fn stop_video(&self) -> bool {
        let was_live = self.inner.recorder.state() != RecorderState::Idle;
        if let Some(timer) = self.inner.video_timer.lock().unwrap().take() {
            timer.abort();
        }
        if let Some(artifact) = self.inner.recorder.stop() {
            let pipeline = self.inner.pipeline.clone();
            tokio::spawn(async move {
                let _ = pipeline.upload(artifact).await;
            });
        }
        was_live
    }

    pub fn pause_video(&self) -> bool {
        self.inner.recorder.pause()
    }

    pub fn resume_video(&self) -> bool {
        self.inner.recorder.resume()
    }

    pub fn push_video_chunk(&self, bytes: Vec<u8>) -> bool {
        self.inner.recorder.push_chunk(bytes)
    }

    pub fn recorder_state(&self) -> RecorderState {
        self.inner.recorder.state()
    }
}

impl Inner {
    async fn run_tick(&self) {
        let cfg = self.config.lock().unwrap().clone();

        // Usage sync happens every tick regardless of capture policy.
        let snapshot = self.monitor.snapshot();
        if let Err(e) = self.db.upsert_app_usage(&self.user_id, &snapshot) {
            tracing::error!("Capture: usage sync failed: {}", e);
        }

        if !cfg.capture_on_idle && self.monitor.is_idle() {
            tracing::debug!("Capture: skipping tick, user idle");
            return;
        }
        if self.storage_full(&cfg) {
            return;
        }

        let frames = self.frames.clone();
        let quality = cfg.compression_quality;
        let result = tokio::task::spawn_blocking(move || frames.capture_frame(quality)).await;
        match result {
            Ok(Ok(bytes)) => {
                let artifact = Artifact::new(&self.user_id, ArtifactKind::Screenshot, bytes);
                let _ = self.pipeline.upload(artifact).await;
            }
            Ok(Err(e)) => {
                tracing::warn!("Capture: frame acquisition failed: {}", e);
                if cfg.notify_on_capture_error {
                    self.notifier.notify("Capture failed", &e.to_string());
                }
            }
            Err(e) => tracing::error!("Capture: frame task panicked: {}", e),
        }
    }

    /// Quota gate. A missing probe reading allows capture.
    fn storage_full(&self, cfg: &CaptureConfig) -> bool {
        let estimate = match self.quota.estimate() {
            Some(e) => e,
            None => return false,
        };
        if estimate.usage >= cfg.max_storage_size {
            if !self.storage_full_reported.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    "Capture: storage quota reached ({} bytes), captures paused",
                    estimate.usage
                );
                if cfg.notify_on_storage_full {
                    self.notifier
                        .notify("Storage full", "Captures paused until space is reclaimed");
                }
            }
            return true;
        }
        self.storage_full_reported.store(false, Ordering::SeqCst);
        false
    }

    async fn flush_video(&self) {
        if let Some(artifact) = self.recorder.stop() {
            let _ = self.pipeline.upload(artifact).await;
        }
    }
}
