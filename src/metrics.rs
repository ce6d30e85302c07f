//! Activity and system metric types plus the pure activity reducer.
//!
//! `ActivityMetrics` is an immutable snapshot; every qualifying input
//! signal produces a new snapshot via [`apply_signal`]. Serialized field
//! names are camelCase so exports and wire frames match the dashboard.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Accumulated input-activity counters for one user session.
///
/// Counters and the two duration sums only ever grow; they reset on
/// process restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMetrics {
    pub mouse_movements: u64,
    pub keyboard_events: u64,
    pub scroll_events: u64,
    pub network_requests: u64,
    /// Milliseconds since epoch of the most recent qualifying input.
    pub last_active: i64,
    /// Cumulative active time in milliseconds.
    pub total_active_time: u64,
    /// Cumulative idle time in milliseconds.
    pub idle_time: u64,
}

impl ActivityMetrics {
    /// Fresh accumulator anchored at `now_ms`.
    pub fn new(now_ms: i64) -> Self {
        Self {
            mouse_movements: 0,
            keyboard_events: 0,
            scroll_events: 0,
            network_requests: 0,
            last_active: now_ms,
            total_active_time: 0,
            idle_time: 0,
        }
    }

    /// Fold a companion-process update into this snapshot.
    ///
    /// Both sides are monotonic accumulators, so each field takes the
    /// larger value rather than summing (summing would double-count).
    pub fn merged_with(&self, remote: &ActivityMetrics) -> ActivityMetrics {
        ActivityMetrics {
            mouse_movements: self.mouse_movements.max(remote.mouse_movements),
            keyboard_events: self.keyboard_events.max(remote.keyboard_events),
            scroll_events: self.scroll_events.max(remote.scroll_events),
            network_requests: self.network_requests.max(remote.network_requests),
            last_active: self.last_active.max(remote.last_active),
            total_active_time: self.total_active_time.max(remote.total_active_time),
            idle_time: self.idle_time.max(remote.idle_time),
        }
    }
}

impl Default for ActivityMetrics {
    fn default() -> Self {
        Self::new(now_ms())
    }
}

/// One point-in-time system sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu_usage: f64,
    pub memory_usage: u64,
    pub memory_total: u64,
    pub memory_free: u64,
    /// Milliseconds since epoch.
    pub timestamp: i64,
}

/// A raw input signal observed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSignal {
    PointerMove,
    KeyDown,
    Scroll,
    NetworkRequest,
    VisibilityChange { hidden: bool },
    FocusChange { focused: bool },
    ConnectivityChange { online: bool },
}

/// Result of applying one signal to a snapshot.
#[derive(Debug, Clone)]
pub struct SignalOutcome {
    pub metrics: ActivityMetrics,
    pub is_idle: bool,
    /// True only on the event that crossed the idle threshold.
    pub became_idle: bool,
}

/// Apply one qualifying signal at `now_ms` to `prev`.
///
/// The gap since the previous event is attributed to exactly one bucket:
/// idle when it reaches `idle_threshold_ms`, active otherwise. After a
/// sequence of events t1..tN, `total_active_time + idle_time` equals
/// `tN - t1` exactly.
pub fn apply_signal(
    prev: &ActivityMetrics,
    was_idle: bool,
    signal: InputSignal,
    now_ms: i64,
    idle_threshold_ms: u64,
) -> SignalOutcome {
    let mut next = prev.clone();

    match signal {
        InputSignal::PointerMove => next.mouse_movements += 1,
        InputSignal::KeyDown => next.keyboard_events += 1,
        InputSignal::Scroll => next.scroll_events += 1,
        InputSignal::NetworkRequest => next.network_requests += 1,
        InputSignal::VisibilityChange { .. }
        | InputSignal::FocusChange { .. }
        | InputSignal::ConnectivityChange { .. } => {}
    }

    // Clock skew guard: never attribute a negative gap.
    let delta = (now_ms - prev.last_active).max(0) as u64;
    let is_idle = delta >= idle_threshold_ms;

    if is_idle {
        next.idle_time += delta;
    } else {
        next.total_active_time += delta;
    }
    next.last_active = now_ms;

    SignalOutcome {
        metrics: next,
        is_idle,
        became_idle: is_idle && !was_idle,
    }
}

/// Current wall clock in milliseconds since epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: u64 = 5000;

    fn seq(start: i64, times: &[(i64, InputSignal)]) -> (ActivityMetrics, bool) {
        let mut metrics = ActivityMetrics::new(start);
        let mut idle = false;
        for &(t, sig) in times {
            let out = apply_signal(&metrics, idle, sig, t, THRESHOLD);
            metrics = out.metrics;
            idle = out.is_idle;
        }
        (metrics, idle)
    }

    #[test]
    fn test_active_then_idle_scenario() {
        // Events at t=0 (mouse), t=2000 (key), t=9000 (scroll).
        let (m, idle) = seq(
            0,
            &[
                (0, InputSignal::PointerMove),
                (2000, InputSignal::KeyDown),
                (9000, InputSignal::Scroll),
            ],
        );
        assert_eq!(m.total_active_time, 2000);
        assert_eq!(m.idle_time, 7000);
        assert!(idle);
        assert_eq!(m.mouse_movements, 1);
        assert_eq!(m.keyboard_events, 1);
        assert_eq!(m.scroll_events, 1);
    }

    #[test]
    fn test_exact_accounting_invariant() {
        let times: Vec<(i64, InputSignal)> = [0, 100, 6000, 6100, 20000, 20050, 31000]
            .iter()
            .map(|&t| (t, InputSignal::PointerMove))
            .collect();
        let (m, _) = seq(0, &times);
        // Sum of both buckets equals the full span, no gaps or overlap.
        assert_eq!(m.total_active_time + m.idle_time, 31000);
    }

    #[test]
    fn test_consecutive_idle_gaps_all_counted() {
        let (m, idle) = seq(
            0,
            &[
                (6000, InputSignal::KeyDown),
                (12000, InputSignal::KeyDown),
            ],
        );
        assert_eq!(m.idle_time, 12000);
        assert_eq!(m.total_active_time, 0);
        assert!(idle);
    }

    #[test]
    fn test_became_idle_fires_once() {
        let m = ActivityMetrics::new(0);
        let out = apply_signal(&m, false, InputSignal::KeyDown, 6000, THRESHOLD);
        assert!(out.became_idle);
        let out2 = apply_signal(&out.metrics, out.is_idle, InputSignal::KeyDown, 12000, THRESHOLD);
        assert!(!out2.became_idle);
        assert!(out2.is_idle);
    }

    #[test]
    fn test_activity_clears_idle() {
        let m = ActivityMetrics::new(0);
        let out = apply_signal(&m, true, InputSignal::PointerMove, 1000, THRESHOLD);
        assert!(!out.is_idle);
        assert_eq!(out.metrics.total_active_time, 1000);
    }

    #[test]
    fn test_negative_gap_clamped() {
        let m = ActivityMetrics::new(5000);
        let out = apply_signal(&m, false, InputSignal::Scroll, 4000, THRESHOLD);
        assert_eq!(out.metrics.total_active_time, 0);
        assert_eq!(out.metrics.idle_time, 0);
        assert_eq!(out.metrics.last_active, 4000);
    }

    #[test]
    fn test_visibility_counts_as_activity_not_counter() {
        let m = ActivityMetrics::new(0);
        let out = apply_signal(
            &m,
            false,
            InputSignal::VisibilityChange { hidden: false },
            1000,
            THRESHOLD,
        );
        assert_eq!(out.metrics.mouse_movements, 0);
        assert_eq!(out.metrics.total_active_time, 1000);
        assert_eq!(out.metrics.last_active, 1000);
    }

    #[test]
    fn test_merge_takes_monotonic_max() {
        let mut local = ActivityMetrics::new(1000);
        local.mouse_movements = 10;
        local.total_active_time = 4000;

        let mut remote = ActivityMetrics::new(2000);
        remote.mouse_movements = 7;
        remote.keyboard_events = 3;
        remote.total_active_time = 6000;

        let merged = local.merged_with(&remote);
        assert_eq!(merged.mouse_movements, 10);
        assert_eq!(merged.keyboard_events, 3);
        assert_eq!(merged.total_active_time, 6000);
        assert_eq!(merged.last_active, 2000);
    }

    #[test]
    fn test_camel_case_serialization() {
        let m = ActivityMetrics::new(42);
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"mouseMovements\""));
        assert!(json.contains("\"lastActive\":42"));
        assert!(json.contains("\"totalActiveTime\""));
    }
}
