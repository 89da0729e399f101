//! Link manager behavior against scripted and host drivers
//!
//! Covers the retry budget, the single startup outcome and reconnection
//! after a drop while connected.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::Ordering;
use std::time::Duration;
use telemetry_agent::link::{
    ConnectivityState, Credentials, HostLinkDriver, LinkError, LinkEvent, LinkManager, LinkOutcome,
};
use telemetry_agent::testing::mocks::ScriptedLinkDriver;
use tokio::net::TcpListener;

fn credentials() -> Credentials {
    Credentials::new("bench-ap", "hunter22")
}

#[tokio::test]
async fn test_first_attempt_success() {
    let driver = ScriptedLinkDriver::succeeding_after(0);
    let connects = driver.connect_counter();
    let mut manager = LinkManager::new(driver);

    let outcome = manager
        .connect(&credentials(), 3, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        LinkOutcome::ConnectivityAchieved {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 4, 2))
        }
    );
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    let status = manager.status();
    assert_eq!(status.state, ConnectivityState::Connected);
    assert_eq!(status.retries, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_success_within_retry_budget_resets_counter() {
    let driver = ScriptedLinkDriver::succeeding_after(2);
    let connects = driver.connect_counter();
    let mut manager = LinkManager::new(driver);

    let outcome = manager
        .connect(&credentials(), 3, Duration::from_secs(2))
        .await
        .unwrap();

    assert!(matches!(outcome, LinkOutcome::ConnectivityAchieved { .. }));
    assert_eq!(connects.load(Ordering::SeqCst), 3);
    assert_eq!(manager.status().retries, 0);
    assert_eq!(manager.status().connect_attempts, 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_budget_fails_after_max_plus_one_attempts() {
    let driver = ScriptedLinkDriver::always_failing(10);
    let connects = driver.connect_counter();
    let mut manager = LinkManager::new(driver);

    let outcome = manager
        .connect(&credentials(), 3, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(outcome, LinkOutcome::ConnectivityFailed { retries: 3 });
    assert_eq!(connects.load(Ordering::SeqCst), 4);
    assert_eq!(manager.status().state, ConnectivityState::Failed);

    // Failed is terminal: late notifications change nothing
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 4);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_zero_retries_fails_on_first_drop() {
    let driver = ScriptedLinkDriver::always_failing(1);
    let connects = driver.connect_counter();
    let mut manager = LinkManager::new(driver);

    let outcome = manager
        .connect(&credentials(), 0, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(outcome, LinkOutcome::ConnectivityFailed { retries: 0 });
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_rejected_connect_calls_consume_the_budget() {
    let driver = ScriptedLinkDriver::new(Vec::new()).rejecting_connect();
    let connects = driver.connect_counter();
    let mut manager = LinkManager::new(driver);

    let outcome = manager
        .connect(&credentials(), 2, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(outcome, LinkOutcome::ConnectivityFailed { retries: 2 });
    assert_eq!(connects.load(Ordering::SeqCst), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_startup_times_out_without_notifications() {
    let mut manager = LinkManager::new(ScriptedLinkDriver::silent());

    let result = manager
        .connect(&credentials(), 3, Duration::from_millis(100))
        .await;

    assert!(matches!(result, Err(LinkError::StartupTimedOut(_))));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_driver_start_failure_is_reported() {
    let mut manager = LinkManager::new(ScriptedLinkDriver::new(Vec::new()).rejecting_start());

    let result = manager
        .connect(&credentials(), 3, Duration::from_secs(1))
        .await;

    assert!(matches!(result, Err(LinkError::DriverStart(_))));
}

#[tokio::test]
async fn test_drop_while_connected_reconnects_with_fresh_budget() {
    // Connect, drop, then reconnect on the first retry
    let driver = ScriptedLinkDriver::new(vec![
        LinkEvent::AddressAcquired {
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
        },
        LinkEvent::AddressAcquired {
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8)),
        },
    ]);
    let connects = driver.connect_counter();
    let injector = driver.injector();
    let mut manager = LinkManager::new(driver);
    let mut status_rx = manager.subscribe();

    manager
        .connect(&credentials(), 1, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    // The drop is reported by the environment, not by a connect attempt
    assert!(injector.inject(LinkEvent::StationDisconnected {
        reason: "beacon_timeout".to_string(),
    }));

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            status_rx.changed().await.unwrap();
            let status = status_rx.borrow().clone();
            if status.address == Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8))) {
                assert_eq!(status.state, ConnectivityState::Connected);
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(connects.load(Ordering::SeqCst), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_the_driver() {
    let driver = ScriptedLinkDriver::succeeding_after(0);
    let stopped = driver.stopped_flag();
    let mut manager = LinkManager::new(driver);

    manager
        .connect(&credentials(), 3, Duration::from_secs(2))
        .await
        .unwrap();
    manager.shutdown().await;

    assert!(stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_host_driver_reaches_listening_broker() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((_socket, _)) = listener.accept().await {}
    });

    let driver = HostLinkDriver::new("127.0.0.1", port, Duration::from_millis(500));
    let mut manager = LinkManager::new(driver);

    let outcome = manager
        .connect(&credentials(), 3, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        LinkOutcome::ConnectivityAchieved {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn test_host_driver_gives_up_on_closed_port() {
    // Bind then drop to get a port with nothing listening
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let driver = HostLinkDriver::new("127.0.0.1", port, Duration::from_millis(200))
        .with_settle_delay(Duration::from_millis(10));
    let mut manager = LinkManager::new(driver);

    let outcome = manager
        .connect(&credentials(), 2, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(outcome, LinkOutcome::ConnectivityFailed { retries: 2 });
    assert_eq!(manager.status().connect_attempts, 3);
    manager.shutdown().await;
}
