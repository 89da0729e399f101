//! Thread-safe metrics collection
//!
//! Atomic counters for the sampling loop, the network link and the broker
//! session, plus a bounded window of iteration durations for percentiles.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of iteration durations kept for percentile calculation
const ITERATION_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

pub struct MetricsCollector {
    // Sampling loop
    iterations: AtomicU64,
    samples_read: AtomicU64,
    read_failures: AtomicU64,
    readings_published: AtomicU64,
    publish_failures: AtomicU64,
    iteration_times: Mutex<VecDeque<u64>>, // in microseconds

    // Network link
    link_connected: AtomicBool,
    link_connect_attempts: AtomicU64,
    link_failures: AtomicU64,

    // Broker session
    session_connected: AtomicBool,
    session_connects: AtomicU64,
    session_disconnects: AtomicU64,
    session_errors: AtomicU64,
    messages_received: AtomicU64,
    session_start_time: AtomicU64,

    // Lifecycle
    agent_state: Mutex<String>,
    state_transitions: AtomicU64,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            iterations: AtomicU64::new(0),
            samples_read: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            readings_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            iteration_times: Mutex::new(VecDeque::with_capacity(ITERATION_WINDOW)),
            link_connected: AtomicBool::new(false),
            link_connect_attempts: AtomicU64::new(0),
            link_failures: AtomicU64::new(0),
            session_connected: AtomicBool::new(false),
            session_connects: AtomicU64::new(0),
            session_disconnects: AtomicU64::new(0),
            session_errors: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            session_start_time: AtomicU64::new(0),
            agent_state: Mutex::new("initializing".to_string()),
            state_transitions: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Sampling metrics
    pub fn iteration_completed(&self, duration: Duration) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut times) = self.iteration_times.lock() {
            if times.len() == ITERATION_WINDOW {
                times.pop_front();
            }
            times.push_back(duration.as_micros() as u64);
        }
    }

    pub fn sample_read(&self) {
        self.samples_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample_read_failed(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reading_published(&self) {
        self.readings_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reading_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Link metrics
    pub fn link_connect_attempt(&self) {
        self.link_connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_up(&self) {
        self.link_connected.store(true, Ordering::Relaxed);
    }

    pub fn link_down(&self) {
        self.link_connected.store(false, Ordering::Relaxed);
    }

    pub fn link_failed(&self) {
        self.link_failures.fetch_add(1, Ordering::Relaxed);
        self.link_connected.store(false, Ordering::Relaxed);
    }

    // Session metrics
    pub fn session_connected(&self) {
        self.session_connects.fetch_add(1, Ordering::Relaxed);
        self.session_connected.store(true, Ordering::Relaxed);
        self.session_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn session_disconnected(&self) {
        self.session_disconnects.fetch_add(1, Ordering::Relaxed);
        self.session_connected.store(false, Ordering::Relaxed);
        self.session_start_time.store(0, Ordering::Relaxed);
    }

    pub fn session_error(&self) {
        self.session_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_agent_state(&self, state: &str) {
        if let Ok(mut current_state) = self.agent_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.iterations,
            &self.samples_read,
            &self.read_failures,
            &self.readings_published,
            &self.publish_failures,
            &self.link_connect_attempts,
            &self.link_failures,
            &self.session_connects,
            &self.session_disconnects,
            &self.session_errors,
            &self.messages_received,
            &self.session_start_time,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.link_connected.store(false, Ordering::Relaxed);
        self.session_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.iteration_times.lock() {
            times.clear();
        }
        if let Ok(mut state) = self.agent_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Average and percentiles of recent iteration durations in milliseconds
    fn iteration_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.iteration_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted: Vec<u64> = times.iter().copied().collect();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;

        (
            avg / 1000.0,
            percentile(&sorted, 50.0) / 1000.0,
            percentile(&sorted, 99.0) / 1000.0,
        )
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_iteration_ms, iteration_p50_ms, iteration_p99_ms) =
            self.iteration_time_statistics();

        let session_connected = self.session_connected.load(Ordering::Relaxed);
        let session_start = self.session_start_time.load(Ordering::Relaxed);
        let connection_duration_seconds = if session_connected && session_start > 0 {
            now.saturating_sub(session_start)
        } else {
            0
        };

        MetricsSnapshot {
            sampling: SamplingMetrics {
                iterations: self.iterations.load(Ordering::Relaxed),
                samples_read: self.samples_read.load(Ordering::Relaxed),
                read_failures: self.read_failures.load(Ordering::Relaxed),
                readings_published: self.readings_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                avg_iteration_ms,
                iteration_p50_ms,
                iteration_p99_ms,
            },
            link: LinkMetrics {
                connected: self.link_connected.load(Ordering::Relaxed),
                connect_attempts: self.link_connect_attempts.load(Ordering::Relaxed),
                failures: self.link_failures.load(Ordering::Relaxed),
            },
            session: SessionMetrics {
                connected: session_connected,
                connects: self.session_connects.load(Ordering::Relaxed),
                disconnects: self.session_disconnects.load(Ordering::Relaxed),
                errors: self.session_errors.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                connection_duration_seconds,
            },
            lifecycle: LifecycleMetrics {
                current_state: self
                    .agent_state
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            },
            timestamp: chrono::Utc::now(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub sampling: SamplingMetrics,
    pub link: LinkMetrics,
    pub session: SessionMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct SamplingMetrics {
    pub iterations: u64,
    pub samples_read: u64,
    pub read_failures: u64,
    pub readings_published: u64,
    pub publish_failures: u64,
    pub avg_iteration_ms: f64,
    pub iteration_p50_ms: f64,
    pub iteration_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct LinkMetrics {
    pub connected: bool,
    pub connect_attempts: u64,
    pub failures: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionMetrics {
    pub connected: bool,
    pub connects: u64,
    pub disconnects: u64,
    pub errors: u64,
    pub messages_received: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub state_transitions: u64,
    pub uptime_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;

    lower + (upper - lower) * index.fract()
}
