//! Database model types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Metadata row for a remotely persisted artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRow {
    pub id: i64,
    pub user_id: String,
    pub captured_at: DateTime<Utc>,
    /// Remote object path, `{owner}/{kind}/{timestamp}`.
    pub object_path: String,
    pub size_bytes: i64,
}

/// Storage statistics for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub total_bytes: i64,
    pub screenshot_count: i64,
    pub recording_count: i64,
    pub activity_sample_count: i64,
}
