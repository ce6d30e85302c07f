//! Metric history filtering, summarizing and export.
//!
//! Export rows pair activity and system slices positionally, which
//! assumes both histories were sampled on the same cadence; rows with
//! no system counterpart are zero-filled rather than dropped.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{DbError, Store};
use crate::metrics::{ActivityMetrics, SystemMetrics};

pub const CSV_HEADER: &str = "Timestamp,Mouse Movements,Keyboard Events,Scroll Events,\
Network Requests,Total Active Time,Idle Time,CPU Usage,Memory Usage,Memory Total,Memory Free";

/// One exportable slice of metric history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportData {
    pub activity_metrics: Vec<ActivityMetrics>,
    pub system_metrics: Vec<SystemMetrics>,
    pub timestamp: String,
    pub user_id: String,
}

/// Aggregate of a filtered slice.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub activity: ActivitySummary,
    /// `None` when the system slice was empty.
    pub system: Option<SystemSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub sample_count: usize,
    pub mouse_movements: u64,
    pub keyboard_events: u64,
    pub scroll_events: u64,
    pub network_requests: u64,
    pub total_active_time: u64,
    pub idle_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSummary {
    pub cpu_mean: f64,
    pub cpu_max: f64,
    pub cpu_min: f64,
    pub memory_mean: f64,
    pub memory_max: u64,
    pub memory_min: u64,
}

/// Keep samples whose timestamps fall inside `[start_ms, end_ms]`.
///
/// Activity filters on `lastActive`, system on `timestamp`; the two
/// slices are filtered independently.
pub fn filter_by_range(
    activity: &[ActivityMetrics],
    system: &[SystemMetrics],
    start_ms: i64,
    end_ms: i64,
) -> (Vec<ActivityMetrics>, Vec<SystemMetrics>) {
    let activity = activity
        .iter()
        .filter(|m| m.last_active >= start_ms && m.last_active <= end_ms)
        .cloned()
        .collect();
    let system = system
        .iter()
        .filter(|s| s.timestamp >= start_ms && s.timestamp <= end_ms)
        .cloned()
        .collect();
    (activity, system)
}

/// Summarize a filtered slice.
pub fn summarize(activity: &[ActivityMetrics], system: &[SystemMetrics]) -> Summary {
    let activity_summary = ActivitySummary {
        sample_count: activity.len(),
        mouse_movements: activity.iter().map(|m| m.mouse_movements).sum(),
        keyboard_events: activity.iter().map(|m| m.keyboard_events).sum(),
        scroll_events: activity.iter().map(|m| m.scroll_events).sum(),
        network_requests: activity.iter().map(|m| m.network_requests).sum(),
        total_active_time: activity.iter().map(|m| m.total_active_time).sum(),
        idle_time: activity.iter().map(|m| m.idle_time).sum(),
    };

    let system_summary = if system.is_empty() {
        None
    } else {
        let n = system.len() as f64;
        let cpu: Vec<f64> = system.iter().map(|s| s.cpu_usage).collect();
        let mem: Vec<u64> = system.iter().map(|s| s.memory_usage).collect();
        Some(SystemSummary {
            cpu_mean: cpu.iter().sum::<f64>() / n,
            cpu_max: cpu.iter().cloned().fold(f64::MIN, f64::max),
            cpu_min: cpu.iter().cloned().fold(f64::MAX, f64::min),
            memory_mean: mem.iter().sum::<u64>() as f64 / n,
            memory_max: mem.iter().copied().max().unwrap_or(0),
            memory_min: mem.iter().copied().min().unwrap_or(0),
        })
    };

    Summary {
        activity: activity_summary,
        system: system_summary,
    }
}

/// Render the export as CSV, one row per activity sample.
pub fn export_csv(data: &ExportData) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for (i, m) in data.activity_metrics.iter().enumerate() {
        let (cpu, used, total, free) = match data.system_metrics.get(i) {
            Some(s) => (s.cpu_usage, s.memory_usage, s.memory_total, s.memory_free),
            None => (0.0, 0, 0, 0),
        };
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            iso_millis(m.last_active),
            m.mouse_movements,
            m.keyboard_events,
            m.scroll_events,
            m.network_requests,
            m.total_active_time,
            m.idle_time,
            cpu,
            used,
            total,
            free,
        ));
    }
    out
}

/// Render the export as pretty-printed JSON.
pub fn export_json(data: &ExportData) -> String {
    // ExportData contains nothing unserializable.
    serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string())
}

fn iso_millis(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Export surface backed by the metadata store.
pub struct MetricsAggregator {
    store: Store,
}

impl MetricsAggregator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Pull a user's history for `[start_ms, end_ms]` into one envelope.
    pub fn export_data(
        &self,
        user_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<ExportData, DbError> {
        let activity = self.store.get_activity_samples(user_id, start_ms, end_ms)?;
        let system = self.store.get_system_samples(user_id, start_ms, end_ms)?;
        Ok(ExportData {
            activity_metrics: activity,
            system_metrics: system,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            user_id: user_id.to_string(),
        })
    }

    pub fn export_range_csv(
        &self,
        user_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<String, DbError> {
        Ok(export_csv(&self.export_data(user_id, start_ms, end_ms)?))
    }

    pub fn export_range_json(
        &self,
        user_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<String, DbError> {
        Ok(export_json(&self.export_data(user_id, start_ms, end_ms)?))
    }

    pub fn summarize_range(
        &self,
        user_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Summary, DbError> {
        let data = self.export_data(user_id, start_ms, end_ms)?;
        Ok(summarize(&data.activity_metrics, &data.system_metrics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn activity_at(t: i64) -> ActivityMetrics {
        let mut m = ActivityMetrics::new(t);
        m.mouse_movements = 2;
        m.keyboard_events = 1;
        m.total_active_time = 500;
        m.idle_time = 100;
        m
    }

    fn system_at(t: i64, cpu: f64) -> SystemMetrics {
        SystemMetrics {
            cpu_usage: cpu,
            memory_usage: 1000 + t as u64,
            memory_total: 4000,
            memory_free: 3000,
            timestamp: t,
        }
    }

    fn export_with(n_activity: usize, n_system: usize) -> ExportData {
        ExportData {
            activity_metrics: (0..n_activity).map(|i| activity_at(i as i64 * 1000)).collect(),
            system_metrics: (0..n_system)
                .map(|i| system_at(i as i64 * 1000, 10.0 + i as f64))
                .collect(),
            timestamp: "2024-03-01T10:00:00.000Z".to_string(),
            user_id: "u1".to_string(),
        }
    }

    #[test]
    fn test_filter_bounds_are_inclusive() {
        let activity: Vec<_> = [999, 1000, 2000, 2001].iter().map(|&t| activity_at(t)).collect();
        let system: Vec<_> = [999, 1000, 2000, 2001]
            .iter()
            .map(|&t| system_at(t, 5.0))
            .collect();

        let (a, s) = filter_by_range(&activity, &system, 1000, 2000);
        assert_eq!(a.len(), 2);
        assert_eq!(s.len(), 2);
        assert_eq!(a[0].last_active, 1000);
        assert_eq!(s[1].timestamp, 2000);
    }

    #[test]
    fn test_summarize_sums_activity_and_spans_system() {
        let activity: Vec<_> = (0..3).map(|i| activity_at(i * 1000)).collect();
        let system = vec![system_at(0, 10.0), system_at(1000, 30.0)];

        let summary = summarize(&activity, &system);
        assert_eq!(summary.activity.sample_count, 3);
        assert_eq!(summary.activity.mouse_movements, 6);
        assert_eq!(summary.activity.total_active_time, 1500);

        let system = summary.system.unwrap();
        assert_eq!(system.cpu_mean, 20.0);
        assert_eq!(system.cpu_max, 30.0);
        assert_eq!(system.cpu_min, 10.0);
        assert_eq!(system.memory_max, 2000);
    }

    #[test]
    fn test_summarize_empty_system_slice_is_none() {
        let activity = vec![activity_at(0)];
        let summary = summarize(&activity, &[]);
        assert!(summary.system.is_none());
        assert_eq!(summary.activity.sample_count, 1);
    }

    #[test]
    fn test_csv_header_and_line_count() {
        let data = export_with(3, 3);
        let csv = export_csv(&data);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[0].split(',').count(), 11);
        assert_eq!(lines[1].split(',').count(), 11);
        assert!(lines[1].starts_with("1970-01-01T00:00:00.000Z,2,1,"));
    }

    #[test]
    fn test_csv_zero_fills_missing_system_rows() {
        let data = export_with(2, 1);
        let csv = export_csv(&data);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        // The second row has no system sample.
        assert!(lines[2].ends_with(",0,0,0,0"));
        assert!(!lines[1].ends_with(",0,0,0,0"));
    }

    #[test]
    fn test_json_export_round_trips() {
        let data = export_with(2, 2);
        let json = export_json(&data);
        assert!(json.contains("\"activityMetrics\""));
        assert!(json.contains("\"userId\": \"u1\""));

        let parsed: ExportData = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, data);
    }

    #[test]
    fn test_aggregator_pulls_from_store() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        for t in [1000, 2000, 9000] {
            store.add_activity_sample("u1", &activity_at(t)).unwrap();
        }
        store.add_system_sample("u1", &system_at(1000, 42.0)).unwrap();

        let agg = MetricsAggregator::new(store);
        let data = agg.export_data("u1", 0, 5000).unwrap();
        assert_eq!(data.activity_metrics.len(), 2);
        assert_eq!(data.system_metrics.len(), 1);

        let summary = agg.summarize_range("u1", 0, 5000).unwrap();
        assert_eq!(summary.system.unwrap().cpu_mean, 42.0);

        let csv = agg.export_range_csv("u1", 0, 5000).unwrap();
        assert_eq!(csv.lines().count(), 3);
    }
}
