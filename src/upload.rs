//! Artifact upload pipeline with bounded background retry.
//!
//! Every artifact lands in the local cache before its first remote
//! attempt, so a crash mid-upload never loses data. The caller sees
//! only the first attempt's result; failures hand the artifact to a
//! detached task that retries on a fixed delay with a counter scoped
//! to that one artifact. On success the metadata row is written and
//! the cache entry removed; on exhaustion the cache entry stays for
//! the janitor to age out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::CaptureConfig;
use crate::db::Store;
use crate::notify::Notifier;
use crate::storage::{Artifact, LocalCache, ObjectStore, StorageError};

const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct UploadPipeline {
    inner: Arc<Inner>,
}

struct Inner {
    remote: Arc<dyn ObjectStore>,
    cache: LocalCache,
    db: Store,
    notifier: Arc<dyn Notifier>,
    config: Arc<Mutex<CaptureConfig>>,
}

impl UploadPipeline {
    pub fn new(
        remote: Arc<dyn ObjectStore>,
        cache: LocalCache,
        db: Store,
        notifier: Arc<dyn Notifier>,
        config: Arc<Mutex<CaptureConfig>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                remote,
                cache,
                db,
                notifier,
                config,
            }),
        }
    }

    /// Upload an artifact, returning the first attempt's outcome.
    ///
    /// An `Err` here does not mean the artifact is lost: retries
    /// continue in the background and the payload stays cached until
    /// one succeeds or the budget runs out.
    pub async fn upload(&self, artifact: Artifact) -> Result<String, StorageError> {
        let key = artifact.cache_key();
        if let Err(e) = self.inner.cache.put(&key, &artifact.payload) {
            // Degraded but not fatal; the remote attempt proceeds.
            tracing::error!("Upload: failed to cache {}: {}", key, e);
        }

        match self.inner.try_put(&artifact).await {
            Ok(reference) => {
                self.inner.finish_success(&artifact, &reference);
                Ok(reference)
            }
            Err(e) => {
                tracing::warn!("Upload: first attempt for {} failed: {}", key, e);
                self.inner.clone().spawn_retries(artifact);
                Err(e)
            }
        }
    }
}

impl Inner {
    async fn try_put(&self, artifact: &Artifact) -> Result<String, StorageError> {
        self.remote
            .put(
                artifact.object_path(),
                artifact.payload.clone(),
                artifact.kind.mime(),
            )
            .await
    }

    fn finish_success(&self, artifact: &Artifact, reference: &str) {
        if let Err(e) = self.db.add_artifact(
            artifact.kind,
            &artifact.owner_id,
            artifact.captured_at,
            reference,
            artifact.payload.len() as i64,
        ) {
            tracing::error!("Upload: failed to record {} metadata: {}", reference, e);
        }
        if let Err(e) = self.cache.remove(&artifact.cache_key()) {
            tracing::error!("Upload: failed to evict cache entry: {}", e);
        }
        tracing::debug!("Upload: stored {}", reference);
    }

    fn spawn_retries(self: Arc<Self>, artifact: Artifact) {
        let (max_retries, notify) = {
            let cfg = self.config.lock().unwrap();
            (cfg.max_retries, cfg.notify_on_upload_error)
        };

        tokio::spawn(async move {
            let key = artifact.cache_key();
            for attempt in 1..=max_retries {
                tokio::time::sleep(RETRY_DELAY).await;
                match self.try_put(&artifact).await {
                    Ok(reference) => {
                        tracing::info!("Upload: retry {} succeeded for {}", attempt, key);
                        self.finish_success(&artifact, &reference);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Upload: retry {}/{} for {} failed: {}",
                            attempt,
                            max_retries,
                            key,
                            e
                        );
                    }
                }
            }
            tracing::error!("Upload: giving up on {} after {} retries", key, max_retries);
            if notify {
                self.notifier.notify(
                    "Upload failed",
                    &format!("{} could not be uploaded and remains cached locally", key),
                );
            }
        });
    }
}
