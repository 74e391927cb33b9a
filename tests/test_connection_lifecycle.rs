//! Connection lifecycle tests against the mock transport
//!
//! Covers connect, disconnect, cancellation, failure, loss and shutdown as
//! observed through state, observer callbacks and transport calls.


use broker_link::config::DeliveryGuarantee;
use broker_link::manager::{ConnectionManager, ConnectionState, LinkEvent, SubscriptionRequest};
use broker_link::ManagerError;
use broker_link::testing::{MockConnector, TransportCall};
use std::time::Duration;
use test_helpers::*;

#[tokio::test]
async fn test_connect_reaches_connected_with_subscriptions() {
    let connector = MockConnector::new();
    let (mut manager, observer) = manager_with_observer(test_settings(&["sensor/a"]), &connector);

    assert!(!manager.start(), "auto_connect is off");
    assert_eq!(manager.state(), ConnectionState::Idle);

    assert!(manager.connect());
    assert_eq!(manager.state(), ConnectionState::Connecting);
    tick_until_state(&mut manager, ConnectionState::Connected).await;

    assert_eq!(manager.subscriptions().topics(), ["sensor/a".to_string()]);
    assert_eq!(observer.count("connecting"), 1);
    assert_eq!(observer.count("connection_succeeded"), 1);
    assert_eq!(observer.count("connection_failed"), 0);

    let calls = connector.calls();
    assert_eq!(
        calls[0],
        TransportCall::Construct {
            address: "localhost".to_string(),
            port: 1883,
            encrypted: false,
        }
    );
    match &calls[1] {
        TransportCall::Connect {
            client_id,
            username,
            password,
        } => {
            assert!(uuid::Uuid::parse_str(client_id).is_ok());
            assert_eq!(*username, None);
            assert_eq!(*password, None);
        }
        other => panic!("Expected Connect, got {other:?}"),
    }
    assert_eq!(
        calls[2],
        TransportCall::Subscribe(vec![SubscriptionRequest::new(
            "sensor/a",
            DeliveryGuarantee::ExactlyOnce
        )])
    );
}

#[tokio::test]
async fn test_start_connects_when_auto_connect_enabled() {
    let connector = MockConnector::new();
    let mut settings = test_settings(&[]);
    settings.auto_connect = true;
    let (mut manager, observer) = manager_with_observer(settings, &connector);

    assert!(manager.start());
    tick_until_state(&mut manager, ConnectionState::Connected).await;
    assert_eq!(observer.count("connection_succeeded"), 1);
}

#[tokio::test]
async fn test_connect_is_noop_while_connecting_or_connected() {
    let connector = MockConnector::new().with_handshake_delay(Duration::from_millis(40));
    let (mut manager, observer) = manager_with_observer(test_settings(&["sensor/a"]), &connector);

    assert!(manager.connect());
    assert!(!manager.connect());
    assert!(!manager.connect());
    tick_until_state(&mut manager, ConnectionState::Connected).await;

    assert!(!manager.connect());
    for _ in 0..5 {
        manager.tick();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(connector.connect_count(), 1);
    assert_eq!(observer.count("connecting"), 1);
    assert_eq!(observer.count("connection_succeeded"), 1);
    assert_eq!(manager.stats().connect_attempts, 1);
}

#[tokio::test]
async fn test_construction_failure_fails_attempt_without_handshake() {
    let connector = MockConnector::new().failing_construction("no route to host");
    let (mut manager, observer) = manager_with_observer(test_settings(&["sensor/a"]), &connector);

    manager.connect();
    tick_until_state(&mut manager, ConnectionState::Failed).await;

    assert_eq!(connector.connect_count(), 0);
    assert_eq!(observer.count("connection_failed"), 1);
    assert_eq!(observer.count("connection_succeeded"), 0);
    match observer.events().last() {
        Some(LinkEvent::ConnectionFailed(reason)) => {
            assert!(reason.contains("Transport construction failed"), "{reason}");
            assert!(reason.contains("no route to host"), "{reason}");
        }
        other => panic!("Expected ConnectionFailed, got {other:?}"),
    }
    assert!(manager.stats().last_error.is_some());
    assert!(manager.subscriptions().is_empty());
}

#[tokio::test]
async fn test_handshake_failure_fails_attempt() {
    let connector = MockConnector::new().failing_handshake("bad credentials");
    let (mut manager, observer) = manager_with_observer(test_settings(&["sensor/a"]), &connector);

    manager.connect();
    tick_until_state(&mut manager, ConnectionState::Failed).await;

    match observer.events().last() {
        Some(LinkEvent::ConnectionFailed(reason)) => {
            assert!(reason.contains("Handshake failed"), "{reason}");
        }
        other => panic!("Expected ConnectionFailed, got {other:?}"),
    }
    assert_eq!(
        connector.count_calls(|call| matches!(call, TransportCall::Subscribe(_))),
        0
    );
}

#[tokio::test]
async fn test_handshake_timeout_fails_attempt() {
    let connector = MockConnector::new().with_handshake_delay(Duration::from_millis(500));
    let mut settings = test_settings(&[]);
    settings.connect_timeout_ms = 20;
    let (mut manager, observer) = manager_with_observer(settings, &connector);

    manager.connect();
    tick_until_state(&mut manager, ConnectionState::Failed).await;

    match observer.events().last() {
        Some(LinkEvent::ConnectionFailed(reason)) => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("Expected ConnectionFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_client_not_connected_after_handshake_fails_attempt() {
    let connector = MockConnector::new().reporting_not_connected();
    let (mut manager, observer) = manager_with_observer(test_settings(&[]), &connector);

    manager.connect();
    tick_until_state(&mut manager, ConnectionState::Failed).await;
    assert_eq!(observer.count("connection_failed"), 1);
}

#[tokio::test]
async fn test_retry_after_failure_is_embedder_driven() {
    let connector = MockConnector::new().failing_handshake("refused");
    let (mut manager, observer) = manager_with_observer(test_settings(&[]), &connector);

    manager.connect();
    tick_until_state(&mut manager, ConnectionState::Failed).await;

    // No automatic retry
    for _ in 0..5 {
        manager.tick();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(connector.connect_count(), 1);

    assert!(manager.connect());
    tick_until_state(&mut manager, ConnectionState::Failed).await;
    assert_eq!(connector.connect_count(), 2);
    assert_eq!(observer.count("connection_failed"), 2);
    assert_eq!(manager.stats().connect_attempts, 2);
}

#[tokio::test]
async fn test_subscribe_failure_keeps_connection() {
    let connector = MockConnector::new().failing_subscribe("queue full");
    let (mut manager, observer) = manager_with_observer(test_settings(&["sensor/a"]), &connector);

    manager.connect();
    tick_until_state(&mut manager, ConnectionState::Connected).await;

    assert!(manager.subscriptions().is_empty());
    assert_eq!(observer.count("connection_succeeded"), 1);
}

#[tokio::test]
async fn test_credentials_reach_handshake() {
    let connector = MockConnector::new();
    let mut settings = test_settings(&[]);
    settings.username = Some("viewer".to_string());
    settings.password = Some("secret".to_string());
    let (mut manager, _observer) = manager_with_observer(settings, &connector);

    manager.connect();
    tick_until_state(&mut manager, ConnectionState::Connected).await;

    assert!(connector.calls().iter().any(|call| matches!(
        call,
        TransportCall::Connect { username: Some(u), password: Some(p), .. }
            if u == "viewer" && p == "secret"
    )));
}

#[tokio::test]
async fn test_blank_username_means_anonymous() {
    let connector = MockConnector::new();
    let mut settings = test_settings(&[]);
    settings.username = Some("   ".to_string());
    settings.password = Some("ignored".to_string());
    let (mut manager, _observer) = manager_with_observer(settings, &connector);

    manager.connect();
    tick_until_state(&mut manager, ConnectionState::Connected).await;

    assert!(connector.calls().iter().any(|call| matches!(
        call,
        TransportCall::Connect { username: None, password: None, .. }
    )));
}

#[tokio::test]
async fn test_disconnect_unsubscribes_before_closing() {
    let (mut manager, connector, observer) = connected_manager(&["sensor/a", "sensor/b"]).await;
    connector.clear_calls();

    assert!(manager.disconnect());
    assert_eq!(manager.state(), ConnectionState::Disconnecting);
    assert!(manager.subscriptions().is_empty());
    tick_until_state(&mut manager, ConnectionState::Disconnected).await;

    assert_eq!(
        connector.calls(),
        vec![
            TransportCall::Unsubscribe(vec!["sensor/a".to_string(), "sensor/b".to_string()]),
            TransportCall::Disconnect,
        ]
    );
    assert_eq!(observer.count("disconnected"), 1);
    assert_eq!(observer.count("connection_lost"), 0);
}

#[tokio::test]
async fn test_disconnect_without_topics_only_closes() {
    let (mut manager, connector, _observer) = connected_manager(&[]).await;
    connector.clear_calls();

    manager.disconnect();
    tick_until_state(&mut manager, ConnectionState::Disconnected).await;
    assert_eq!(connector.calls(), vec![TransportCall::Disconnect]);
}

#[tokio::test]
async fn test_disconnect_is_noop_when_idle_or_disconnected() {
    let connector = MockConnector::new();
    let (mut manager, observer) = manager_with_observer(test_settings(&[]), &connector);

    assert!(!manager.disconnect());
    assert_eq!(manager.state(), ConnectionState::Idle);
    assert!(observer.events().is_empty());
    assert!(connector.calls().is_empty());
}

#[tokio::test]
async fn test_controlled_close_is_not_reported_as_loss() {
    let (mut manager, connector, observer) = connected_manager(&["sensor/a"]).await;

    manager.disconnect();
    // The transport reports its own closure while the disconnect is in flight
    connector.simulate_connection_closed();
    tick_until_state(&mut manager, ConnectionState::Disconnected).await;

    for _ in 0..3 {
        manager.tick();
    }
    assert_eq!(observer.count("connection_lost"), 0);
    assert_eq!(observer.count("disconnected"), 1);
}

#[tokio::test]
async fn test_unsolicited_closure_reports_single_loss_on_tick() {
    let (mut manager, connector, observer) = connected_manager(&["sensor/a"]).await;
    connector.clear_calls();

    connector.simulate_connection_closed();
    connector.simulate_connection_closed();

    // Nothing is reported until the consumer ticks
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(observer.count("connection_lost"), 0);

    let report = manager.tick();
    assert!(report.connection_lost);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(observer.count("connection_lost"), 1);

    for _ in 0..5 {
        assert!(!manager.tick().connection_lost);
    }
    assert_eq!(observer.count("connection_lost"), 1);
    assert_eq!(observer.count("disconnected"), 0);
    assert_eq!(manager.stats().connection_losses, 1);
    assert!(manager.subscriptions().is_empty());
    assert!(
        connector.calls().is_empty(),
        "a lost session is dropped without unsubscribing"
    );
}

#[tokio::test]
async fn test_closure_right_after_handshake_is_reported_as_loss() {
    let connector = MockConnector::new().closing_after_handshake();
    let (mut manager, observer) = manager_with_observer(test_settings(&["sensor/a"]), &connector);

    assert!(manager.connect());
    let settled = tick_until(&mut manager, |_| observer.count("connection_lost") > 0).await;
    assert!(settled, "loss was never reported, state {}", manager.state());

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(observer.count("connection_succeeded"), 1);
    assert_eq!(observer.count("connection_lost"), 1);
    assert_eq!(manager.stats().connection_losses, 1);

    // The manager is not stuck and can connect again
    assert!(manager.connect());
    assert_eq!(manager.state(), ConnectionState::Connecting);
}

#[tokio::test]
async fn test_closure_from_network_thread() {
    let (mut manager, connector, observer) = connected_manager(&[]).await;

    let network = connector.clone();
    std::thread::spawn(move || {
        network.simulate_connection_closed();
    })
    .join()
    .unwrap();

    manager.tick();
    assert_eq!(observer.count("connection_lost"), 1);
}

#[tokio::test]
async fn test_reconnect_after_loss() {
    let (mut manager, connector, observer) = connected_manager(&["sensor/a"]).await;
    connector.simulate_connection_closed();
    manager.tick();
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    assert!(manager.connect());
    tick_until_state(&mut manager, ConnectionState::Connected).await;

    assert_eq!(connector.connect_count(), 2);
    assert_eq!(observer.count("connection_succeeded"), 2);
    assert_eq!(manager.subscriptions().topics(), ["sensor/a".to_string()]);

    // The new session's loss is reported again
    connector.simulate_connection_closed();
    manager.tick();
    assert_eq!(observer.count("connection_lost"), 2);
}

#[tokio::test]
async fn test_disconnect_during_handshake_cancels_attempt() {
    let connector = MockConnector::new().with_handshake_delay(Duration::from_millis(500));
    let (mut manager, observer) = manager_with_observer(test_settings(&["sensor/a"]), &connector);

    manager.connect();
    let in_handshake = tick_until(&mut manager, |_| connector.connect_count() == 1).await;
    assert!(in_handshake);

    assert!(manager.disconnect());
    assert_eq!(manager.state(), ConnectionState::Disconnecting);
    tick_until_state(&mut manager, ConnectionState::Disconnected).await;

    assert_eq!(observer.count("disconnected"), 1);
    assert_eq!(observer.count("connection_succeeded"), 0);
    assert_eq!(observer.count("connection_failed"), 0);
    assert_eq!(
        connector.count_calls(|call| matches!(call, TransportCall::Subscribe(_))),
        0
    );
}

#[tokio::test]
async fn test_disconnect_during_startup_delay_skips_construction() {
    let connector = MockConnector::new();
    let mut settings = test_settings(&[]);
    settings.connect_delay_ms = 200;
    let (mut manager, observer) = manager_with_observer(settings, &connector);

    manager.connect();
    manager.disconnect();
    tick_until_state(&mut manager, ConnectionState::Disconnected).await;

    assert!(connector.calls().is_empty());
    assert_eq!(observer.count("disconnected"), 1);
}

#[tokio::test]
async fn test_shutdown_closes_connected_session_immediately() {
    let (mut manager, connector, observer) = connected_manager(&["sensor/a"]).await;
    connector.clear_calls();

    manager.shutdown();

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        connector.calls(),
        vec![
            TransportCall::Unsubscribe(vec!["sensor/a".to_string()]),
            TransportCall::Disconnect,
        ]
    );
    assert_eq!(observer.count("disconnected"), 1);
}

#[tokio::test]
async fn test_shutdown_from_idle_is_silent() {
    let connector = MockConnector::new();
    let (mut manager, observer) = manager_with_observer(test_settings(&[]), &connector);

    manager.shutdown();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(observer.events().is_empty());
}

#[tokio::test]
async fn test_shutdown_while_connecting_discards_late_result() {
    let connector = MockConnector::new().with_handshake_delay(Duration::from_millis(50));
    let (mut manager, observer) = manager_with_observer(test_settings(&["sensor/a"]), &connector);

    manager.connect();
    manager.shutdown();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(observer.count("disconnected"), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    for _ in 0..3 {
        manager.tick();
    }
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(observer.count("connection_succeeded"), 0);
    assert_eq!(observer.count("disconnected"), 1);
}

#[tokio::test]
async fn test_broker_url_in_code_built_settings_selects_endpoint() {
    let connector = MockConnector::new();
    let mut settings = test_settings(&[]);
    settings.broker_url = Some("mqtts://secure.example.com:8884".to_string());
    let (mut manager, _observer) = manager_with_observer(settings, &connector);

    assert_eq!(manager.settings().address, "secure.example.com");
    manager.connect();
    tick_until_state(&mut manager, ConnectionState::Connected).await;

    assert_eq!(
        connector.calls()[0],
        TransportCall::Construct {
            address: "secure.example.com".to_string(),
            port: 8884,
            encrypted: true,
        }
    );
}

#[tokio::test]
async fn test_invalid_broker_url_rejected_at_construction() {
    let mut settings = test_settings(&[]);
    settings.broker_url = Some("http://example.com".to_string());

    let result = ConnectionManager::new(settings, MockConnector::new());
    assert!(matches!(result, Err(ManagerError::Config { .. })));
}
