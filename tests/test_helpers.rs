//! Test helpers and utilities for integration tests

use std::time::Duration;
use telemetry_agent::config::AgentConfig;
use tokio::sync::watch;

/// Reference configuration with timings shortened for tests
#[allow(dead_code)]
pub fn test_config() -> AgentConfig {
    let mut config = AgentConfig::reference();
    config.agent.id = "test-agent".to_string();
    config.link.ssid = "bench-ap".to_string();
    config.link.startup_timeout_secs = 5;
    config.mqtt.connect_timeout_secs = 1;
    config.sampling.interval_ms = 20;
    config.sampling.stats_every = 0;
    config
}

/// Flip the shutdown flag after `delay`
#[allow(dead_code)]
pub fn shutdown_after(delay: Duration) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(true);
    });
    rx
}
