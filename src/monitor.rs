//! Input activity monitoring and idle accounting.
//!
//! The monitor owns the current [`ActivityMetrics`] snapshot and applies
//! input signals through the pure reducer in [`crate::metrics`]. Hosts
//! feed it through [`EventMonitor::spawn_listener`] or directly via
//! `record`; HTTP clients count their own requests through a
//! [`RequestHook`].

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CaptureConfig;
use crate::metrics::{apply_signal, now_ms, ActivityMetrics, InputSignal};
use crate::realtime::RealtimeChannel;

struct MonitorState {
    metrics: ActivityMetrics,
    is_idle: bool,
    config: CaptureConfig,
}

/// Tracks input activity for one user session.
#[derive(Clone)]
pub struct EventMonitor {
    state: Arc<Mutex<MonitorState>>,
    channel: Arc<Mutex<Option<RealtimeChannel>>>,
}

impl EventMonitor {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(MonitorState {
                metrics: ActivityMetrics::new(now_ms()),
                is_idle: false,
                config,
            })),
            channel: Arc::new(Mutex::new(None)),
        }
    }

    /// Attach the realtime handle used for best-effort activity pushes.
    ///
    /// Set after construction because the channel's inbound handler
    /// needs the monitor first.
    pub fn attach_channel(&self, channel: RealtimeChannel) {
        *self.channel.lock().unwrap() = Some(channel);
    }

    /// Record a signal observed now.
    pub fn record(&self, signal: InputSignal) {
        self.record_at(signal, now_ms());
    }

    /// Record a signal with an explicit timestamp.
    ///
    /// Signals whose monitoring toggle is off are dropped without
    /// touching the accumulator.
    pub fn record_at(&self, signal: InputSignal, at_ms: i64) {
        let (metrics, became_idle) = {
            let mut st = self.state.lock().unwrap();
            if !signal_enabled(&st.config, signal) {
                return;
            }
            let out = apply_signal(
                &st.metrics,
                st.is_idle,
                signal,
                at_ms,
                st.config.idle_threshold,
            );
            st.metrics = out.metrics.clone();
            st.is_idle = out.is_idle;
            (out.metrics, out.became_idle)
        };

        if became_idle {
            tracing::debug!("Monitor: idle threshold crossed at {}", at_ms);
        }

        // Best effort; a closed channel drops the frame.
        if let Some(channel) = self.channel.lock().unwrap().as_ref() {
            channel.notify_activity(&metrics);
        }
    }

    /// Drive the monitor from a host input stream.
    pub fn spawn_listener(&self, mut signals: mpsc::Receiver<InputSignal>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                monitor.record(signal);
            }
            tracing::debug!("Monitor: input stream closed");
        })
    }

    /// Fold a companion-process snapshot into the local one.
    pub fn merge_remote(&self, remote: &ActivityMetrics) {
        let mut st = self.state.lock().unwrap();
        st.metrics = st.metrics.merged_with(remote);
    }

    pub fn snapshot(&self) -> ActivityMetrics {
        self.state.lock().unwrap().metrics.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().unwrap().is_idle
    }

    /// Replace the runtime configuration, keeping the accumulator.
    pub fn set_config(&self, config: CaptureConfig) {
        self.state.lock().unwrap().config = config;
    }

    /// Hook for HTTP-client middleware to count outbound requests.
    pub fn request_hook(&self) -> RequestHook {
        RequestHook {
            monitor: self.clone(),
        }
    }
}

fn signal_enabled(config: &CaptureConfig, signal: InputSignal) -> bool {
    match signal {
        InputSignal::PointerMove => config.monitor_mouse_movement,
        InputSignal::KeyDown => config.monitor_keyboard_activity,
        InputSignal::Scroll => config.monitor_scroll_activity,
        InputSignal::NetworkRequest => config.monitor_network_activity,
        InputSignal::VisibilityChange { .. } => {
            config.monitor_tab_visibility && config.capture_on_visibility_change
        }
        InputSignal::FocusChange { focused } => {
            if focused {
                config.capture_on_focus
            } else {
                config.capture_on_blur
            }
        }
        InputSignal::ConnectivityChange { .. } => {
            config.monitor_network_activity && config.capture_on_network_change
        }
    }
}

/// Cloneable handle that counts one network request per call.
#[derive(Clone)]
pub struct RequestHook {
    monitor: EventMonitor,
}

impl RequestHook {
    pub fn observe(&self) {
        self.monitor.record(InputSignal::NetworkRequest);
    }
}
