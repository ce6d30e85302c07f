//! Periodic system resource sampling.
//!
//! Samples CPU and memory through `sysinfo` on a fixed interval,
//! appending each sample to the database history and a small in-memory
//! ring for `latest()` readers. The first CPU reading after startup is
//! zero until a second refresh establishes a delta.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sysinfo::System;
use tokio::sync::Mutex;

use crate::db::Store;
use crate::metrics::{now_ms, SystemMetrics};

const RING_CAPACITY: usize = 60;

/// Background collector of [`SystemMetrics`] history.
pub struct SystemSampler {
    store: Store,
    user_id: String,
    interval: Duration,
    ring: Arc<StdMutex<VecDeque<SystemMetrics>>>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl SystemSampler {
    pub fn new(store: Store, user_id: &str, interval: Duration) -> Self {
        Self {
            store,
            user_id: user_id.to_string(),
            interval,
            ring: Arc::new(StdMutex::new(VecDeque::with_capacity(RING_CAPACITY))),
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the sampling background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let user_id = self.user_id.clone();
        let ring = self.ring.clone();
        let stop = self.stop.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut sys = System::new();

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let sample = take_sample(&mut sys);
                        push_sample(&ring, sample.clone());
                        if let Err(e) = store.add_system_sample(&user_id, &sample) {
                            tracing::error!("SystemSampler: failed to persist sample: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Stop the sampling task.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }

    /// Most recent sample, if any have been taken.
    pub fn latest(&self) -> Option<SystemMetrics> {
        self.ring.lock().unwrap().back().cloned()
    }

    /// Recent samples, oldest first.
    pub fn recent(&self) -> Vec<SystemMetrics> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }
}

fn take_sample(sys: &mut System) -> SystemMetrics {
    sys.refresh_memory();
    sys.refresh_cpu();
    SystemMetrics {
        cpu_usage: sys.global_cpu_info().cpu_usage() as f64,
        memory_usage: sys.used_memory(),
        memory_total: sys.total_memory(),
        memory_free: sys.available_memory(),
        timestamp: now_ms(),
    }
}

fn push_sample(ring: &Arc<StdMutex<VecDeque<SystemMetrics>>>, sample: SystemMetrics) {
    let mut ring = ring.lock().unwrap();
    if ring.len() == RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(sample);
}
