//! Connection Lifecycle Integration Tests
//!
//! Session open/close, binding invalidation on disconnect, resubscription on
//! a fresh session, protocol pings and request failure modes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use common::{MockExchange, next_event, silent_responder};
use exchange_stream_client::{
    ClientConfig, ConnectError, CorrelationError, ErrorKind, PingError, StreamClient, StreamEvent,
    Subscription, SubscriptionKey,
};

fn client_for(server: &MockExchange) -> StreamClient {
    StreamClient::new(ClientConfig::new(server.url.clone()), None)
}

#[tokio::test]
async fn server_close_reports_lost_subscriptions() {
    let server = MockExchange::start().await;
    let client = client_for(&server);
    let mut events = client.take_events().unwrap();
    let cancel = CancellationToken::new();

    client.connect(&cancel).await.unwrap();
    let keys = [
        SubscriptionKey::ticker("BTCUSD"),
        SubscriptionKey::book("ETHUSD", "P0"),
    ];
    for key in &keys {
        client.subscribe(key.clone(), &cancel).await.unwrap();
    }

    server.close();

    let StreamEvent::Disconnected { lost, .. } = next_event(&mut events).await else {
        panic!("expected disconnect event");
    };
    let lost: HashSet<_> = lost.into_iter().collect();
    assert_eq!(lost, keys.iter().cloned().collect());
    assert!(!client.is_connected());
    assert!(client.subscriptions().is_empty());
}

#[tokio::test]
async fn reconnect_and_resubscribe_lost_keys() {
    let server = MockExchange::start().await;
    let client = client_for(&server);
    let mut events = client.take_events().unwrap();
    let cancel = CancellationToken::new();

    let first_session = assert_ok!(client.connect(&cancel).await);
    let key = SubscriptionKey::trades("BTCUSD");
    let Subscription::Bound(old_id) = client.subscribe(key.clone(), &cancel).await.unwrap() else {
        panic!("expected binding");
    };

    server.close();
    let StreamEvent::Disconnected { lost, .. } = next_event(&mut events).await else {
        panic!("expected disconnect event");
    };

    let second_session = assert_ok!(client.connect(&cancel).await);
    assert_ne!(first_session, second_session);

    assert_eq!(lost, vec![key.clone()]);
    let Subscription::Bound(new_id) = client.subscribe(key.clone(), &cancel).await.unwrap() else {
        panic!("expected binding");
    };
    assert_ne!(new_id, old_id);
    assert_eq!(client.subscriptions(), vec![key.clone()]);
    assert_eq!(client.resolve(&new_id), Some(key));
    assert_eq!(client.resolve(&old_id), None);
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let server = MockExchange::start().await;
    let client = client_for(&server);
    let cancel = CancellationToken::new();

    client.connect(&cancel).await.unwrap();
    assert_eq!(
        client.connect(&cancel).await,
        Err(ConnectError::AlreadyConnected)
    );
}

#[tokio::test]
async fn explicit_disconnect_emits_event() {
    let server = MockExchange::start().await;
    let client = client_for(&server);
    let mut events = client.take_events().unwrap();
    let cancel = CancellationToken::new();

    client.connect(&cancel).await.unwrap();
    client
        .subscribe(SubscriptionKey::ticker("BTCUSD"), &cancel)
        .await
        .unwrap();
    client.disconnect().await;

    let StreamEvent::Disconnected { lost, .. } = next_event(&mut events).await else {
        panic!("expected disconnect event");
    };
    assert_eq!(lost, vec![SubscriptionKey::ticker("BTCUSD")]);

    // Idempotent.
    client.disconnect().await;
}

#[tokio::test]
async fn ping_round_trip() {
    let mut server = MockExchange::start().await;
    let client = client_for(&server);
    let cancel = CancellationToken::new();

    client.connect(&cancel).await.unwrap();
    let rtt = assert_ok!(client.ping(&cancel).await);
    assert!(rtt < Duration::from_secs(2));

    let request = server.next_request_for("ping").await;
    assert!(request["cid"].as_u64().is_some());
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let server = MockExchange::with_responder(silent_responder()).await;
    let config = ClientConfig {
        request_timeout: Duration::from_millis(200),
        ..ClientConfig::new(server.url.clone())
    };
    let client = StreamClient::new(config, None);
    let cancel = CancellationToken::new();
    client.connect(&cancel).await.unwrap();

    let error = client.ping(&cancel).await.unwrap_err();
    assert!(matches!(
        error,
        PingError::Correlation(CorrelationError::Timeout(_))
    ));
    assert_eq!(error.kind(), ErrorKind::Timeout);

    // The lock is released, so the next request runs.
    let again = client.ping(&cancel).await;
    assert!(matches!(
        again,
        Err(PingError::Correlation(CorrelationError::Timeout(_)))
    ));
}

#[tokio::test]
async fn disconnect_fails_outstanding_request() {
    let server = MockExchange::with_responder(silent_responder()).await;
    let client = Arc::new(client_for(&server));
    let cancel = CancellationToken::new();
    client.connect(&cancel).await.unwrap();

    let pinger = {
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        tokio::spawn(async move { client.ping(&cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    server.close();

    let result = tokio::time::timeout(Duration::from_secs(2), pinger)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        result,
        Err(PingError::Correlation(CorrelationError::ConnectionLost))
    );
}

#[tokio::test]
async fn cancelled_request_returns_promptly() {
    let server = MockExchange::with_responder(silent_responder()).await;
    let client = client_for(&server);
    client.connect(&CancellationToken::new()).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = client.ping(&cancel).await;
    assert_eq!(
        result,
        Err(PingError::Correlation(CorrelationError::Cancelled))
    );
    assert!(client.is_connected());
}
