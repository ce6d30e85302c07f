//! Quota-gated retention purge.
//!
//! Runs on `cleanup_interval` and only does work while the quota probe
//! reports usage at or above `max_storage_size`; a probe that cannot
//! answer skips the pass entirely. Everything older than
//! `max_local_storage_age` is purged: remote artifacts with their
//! metadata rows, activity and system sample history, and stale local
//! cache files. Each category is cleaned independently so one failure
//! never blocks the others.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use crate::config::CaptureConfig;
use crate::db::Store;
use crate::notify::Notifier;
use crate::storage::{ArtifactKind, LocalCache, ObjectStore, QuotaProbe};

pub struct StorageJanitor {
    user_id: String,
    db: Store,
    remote: Arc<dyn ObjectStore>,
    cache: LocalCache,
    quota: Arc<dyn QuotaProbe>,
    notifier: Arc<dyn Notifier>,
    config: Arc<StdMutex<CaptureConfig>>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl StorageJanitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: &str,
        db: Store,
        remote: Arc<dyn ObjectStore>,
        cache: LocalCache,
        quota: Arc<dyn QuotaProbe>,
        notifier: Arc<dyn Notifier>,
        config: Arc<StdMutex<CaptureConfig>>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            db,
            remote,
            cache,
            quota,
            notifier,
            config,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the cleanup background task.
    pub fn start(&self) {
        let ctx = CleanupContext {
            user_id: self.user_id.clone(),
            db: self.db.clone(),
            remote: self.remote.clone(),
            cache: self.cache.clone(),
            quota: self.quota.clone(),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
        };
        let stop = self.stop.clone();
        let period = self.config.lock().unwrap().cleanup_interval();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        ctx.run_pass().await;
                    }
                }
            }
        });
    }

    /// Stop the cleanup task.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }

    /// Run one pass immediately, outside the schedule.
    pub async fn run_once(&self) {
        let ctx = CleanupContext {
            user_id: self.user_id.clone(),
            db: self.db.clone(),
            remote: self.remote.clone(),
            cache: self.cache.clone(),
            quota: self.quota.clone(),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
        };
        ctx.run_pass().await;
    }
}

struct CleanupContext {
    user_id: String,
    db: Store,
    remote: Arc<dyn ObjectStore>,
    cache: LocalCache,
    quota: Arc<dyn QuotaProbe>,
    notifier: Arc<dyn Notifier>,
    config: Arc<StdMutex<CaptureConfig>>,
}

impl CleanupContext {
    async fn run_pass(&self) {
        let cfg = self.config.lock().unwrap().clone();

        let estimate = match self.quota.estimate() {
            Some(e) => e,
            None => {
                tracing::debug!("Janitor: no quota estimate, skipping pass");
                return;
            }
        };
        if estimate.usage < cfg.max_storage_size {
            tracing::debug!(
                "Janitor: usage {} below quota {}, nothing to do",
                estimate.usage,
                cfg.max_storage_size
            );
            return;
        }

        let cutoff = Utc::now() - ChronoDuration::milliseconds(cfg.max_local_storage_age as i64);
        let cutoff_ms = cutoff.timestamp_millis();
        tracing::info!("Janitor: purging data older than {}", cutoff);

        for kind in [ArtifactKind::Screenshot, ArtifactKind::Video] {
            if let Err(e) = self.purge_artifacts(kind, cutoff).await {
                self.report(&cfg, &format!("{} cleanup failed: {}", kind.as_str(), e));
            }
            if let Err(e) = self.reconcile_remote(kind, cutoff).await {
                self.report(
                    &cfg,
                    &format!("{} reconciliation failed: {}", kind.as_str(), e),
                );
            }
        }

        if let Err(e) = self.db.delete_activity_samples_before(&self.user_id, cutoff_ms) {
            self.report(&cfg, &format!("activity log cleanup failed: {}", e));
        }
        if let Err(e) = self.db.delete_system_samples_before(&self.user_id, cutoff_ms) {
            self.report(&cfg, &format!("system log cleanup failed: {}", e));
        }
        match self.cache.purge_older_than(cutoff) {
            Ok(n) if n > 0 => tracing::info!("Janitor: removed {} stale cache files", n),
            Ok(_) => {}
            Err(e) => self.report(&cfg, &format!("cache cleanup failed: {}", e)),
        }
    }

    async fn purge_artifacts(
        &self,
        kind: ArtifactKind,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let rows = self.db.list_artifacts_before(kind, &self.user_id, cutoff)?;
        if rows.is_empty() {
            return Ok(());
        }

        let paths: Vec<String> = rows.iter().map(|r| r.object_path.clone()).collect();
        // Remote removal first; metadata rows survive a failure so the
        // next pass retries them.
        self.remote.remove(paths).await?;
        for row in &rows {
            self.db.delete_artifact(kind, row.id)?;
        }
        tracing::info!("Janitor: purged {} old {}(s)", rows.len(), kind.as_str());
        Ok(())
    }

    /// Remove expired remote objects that have no metadata row.
    ///
    /// An upload whose metadata insert failed leaves an orphan the
    /// row-driven purge can never find; this sweep catches it once it
    /// ages past the cutoff. Objects whose age cannot be determined
    /// are left alone.
    async fn reconcile_remote(
        &self,
        kind: ArtifactKind,
        cutoff: DateTime<Utc>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let prefix = format!("{}/{}/", self.user_id, kind.as_str());
        let objects = self.remote.list(prefix).await?;
        if objects.is_empty() {
            return Ok(());
        }

        let known: HashSet<String> = self
            .db
            .list_artifacts_before(kind, &self.user_id, Utc::now() + ChronoDuration::days(1))?
            .into_iter()
            .map(|r| r.object_path)
            .collect();

        let mut orphans = Vec::new();
        for obj in objects {
            if known.contains(&obj.path) {
                continue;
            }
            let age = obj.timestamp.or_else(|| parse_path_timestamp(&obj.path));
            if matches!(age, Some(t) if t < cutoff) {
                orphans.push(obj.path);
            }
        }
        if orphans.is_empty() {
            return Ok(());
        }

        let n = orphans.len();
        self.remote.remove(orphans).await?;
        tracing::info!("Janitor: removed {} orphaned remote {}(s)", n, kind.as_str());
        Ok(())
    }

    fn report(&self, cfg: &CaptureConfig, body: &str) {
        tracing::error!("Janitor: {}", body);
        if cfg.notify_on_storage_error {
            self.notifier.notify("Storage cleanup failed", body);
        }
    }
}

/// Object paths end in an RFC 3339 capture timestamp.
fn parse_path_timestamp(path: &str) -> Option<DateTime<Utc>> {
    let tail = path.rsplit('/').next()?;
    DateTime::parse_from_rfc3339(tail)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testutil::CollectingNotifier;
    use crate::storage::testutil::{FixedQuotaProbe, MemoryObjectStore};
    use crate::storage::StorageEstimate;
    use chrono::TimeZone;
    use tempfile::{tempdir, NamedTempFile};

    struct Fixture {
        janitor: StorageJanitor,
        remote: Arc<MemoryObjectStore>,
        db: Store,
        _tmp: (tempfile::TempDir, NamedTempFile),
    }

    fn fixture(quota: Option<StorageEstimate>) -> Fixture {
        let dir = tempdir().unwrap();
        let dbfile = NamedTempFile::new().unwrap();
        let remote = MemoryObjectStore::new();
        let db = Store::new(dbfile.path()).unwrap();
        let janitor = StorageJanitor::new(
            "u1",
            db.clone(),
            remote.clone(),
            LocalCache::open(dir.path()).unwrap(),
            Arc::new(FixedQuotaProbe(quota)),
            CollectingNotifier::new(),
            Arc::new(StdMutex::new(CaptureConfig::default())),
        );
        Fixture {
            janitor,
            remote,
            db,
            _tmp: (dir, dbfile),
        }
    }

    fn over_quota() -> Option<StorageEstimate> {
        Some(StorageEstimate {
            usage: 600 * 1024 * 1024,
            quota: None,
        })
    }

    async fn seed_old_screenshot(fx: &Fixture) {
        // Well past the 7 day retention age.
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let path = "u1/screenshot/2020-01-01T00:00:00.000Z".to_string();
        fx.remote
            .put(path.clone(), vec![1, 2, 3], "image/jpeg")
            .await
            .unwrap();
        fx.db
            .add_artifact(ArtifactKind::Screenshot, "u1", old, &path, 3)
            .unwrap();
    }

    #[tokio::test]
    async fn test_purges_expired_artifacts_when_over_quota() {
        let fx = fixture(over_quota());
        seed_old_screenshot(&fx).await;

        let mut m = crate::metrics::ActivityMetrics::new(1000);
        m.mouse_movements = 1;
        fx.db.add_activity_sample("u1", &m).unwrap();

        fx.janitor.run_once().await;

        assert_eq!(fx.remote.object_count(), 0);
        let far_future = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap();
        assert!(fx
            .db
            .list_artifacts_before(ArtifactKind::Screenshot, "u1", far_future)
            .unwrap()
            .is_empty());
        // Sample history from epoch-millis 1000 is ancient too.
        assert!(fx.db.get_activity_samples("u1", 0, i64::MAX).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skips_when_under_quota() {
        let fx = fixture(Some(StorageEstimate {
            usage: 10,
            quota: None,
        }));
        seed_old_screenshot(&fx).await;

        fx.janitor.run_once().await;

        assert_eq!(fx.remote.object_count(), 1);
    }

    #[tokio::test]
    async fn test_skips_when_probe_unavailable() {
        let fx = fixture(None);
        seed_old_screenshot(&fx).await;

        fx.janitor.run_once().await;

        assert_eq!(fx.remote.object_count(), 1);
    }

    #[tokio::test]
    async fn test_reconciles_orphaned_remote_objects() {
        let fx = fixture(over_quota());
        // Uploaded long ago, but the metadata insert never happened.
        fx.remote
            .put(
                "u1/screenshot/2020-01-01T00:00:00.000Z".to_string(),
                vec![1],
                "image/jpeg",
            )
            .await
            .unwrap();
        // A fresh orphan is inside the retention window and survives.
        let fresh = format!(
            "u1/screenshot/{}",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        );
        fx.remote
            .put(fresh.clone(), vec![2], "image/jpeg")
            .await
            .unwrap();

        fx.janitor.run_once().await;

        let left = fx.remote.list("u1/".to_string()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].path, fresh);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_objects_of_unknown_age() {
        let fx = fixture(over_quota());
        fx.remote
            .put("u1/screenshot/not-a-timestamp".to_string(), vec![1], "image/jpeg")
            .await
            .unwrap();

        fx.janitor.run_once().await;

        assert_eq!(fx.remote.object_count(), 1);
    }

    #[tokio::test]
    async fn test_fresh_artifacts_survive_purge() {
        let fx = fixture(over_quota());
        let path = "u1/screenshot/now".to_string();
        fx.remote
            .put(path.clone(), vec![1], "image/jpeg")
            .await
            .unwrap();
        fx.db
            .add_artifact(ArtifactKind::Screenshot, "u1", Utc::now(), &path, 1)
            .unwrap();

        fx.janitor.run_once().await;

        assert_eq!(fx.remote.object_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_passes_run_and_stop() {
        let fx = fixture(over_quota());
        seed_old_screenshot(&fx).await;

        fx.janitor.start();
        // Default cleanup interval is one hour; the first tick fires
        // right away.
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        fx.janitor.stop().await;

        assert_eq!(fx.remote.object_count(), 0);
    }
}
