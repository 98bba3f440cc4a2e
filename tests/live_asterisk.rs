//! Integration tests against a live Asterisk instance.
//!
//! These tests require AMI on 127.0.0.1:5038 with a manager user `admin`
//! whose secret is `amp111`, or the target given in `AMI_TARGET`.
//! Run with: cargo test --test live_asterisk -- --ignored

use ami_statsd::{AmiAction, AmiClient, AmiError, AmiEventType, ClientOptions, ConnectionStatus};
use std::time::Duration;
use tokio::time::timeout;

const DEFAULT_TARGET: &str = "admin:amp111@127.0.0.1:5038";

async fn connect() -> AmiClient {
    let target = std::env::var("AMI_TARGET").unwrap_or_else(|_| DEFAULT_TARGET.to_string());
    let options = ClientOptions {
        action_timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    let client = AmiClient::new(
        target
            .parse()
            .expect("invalid AMI_TARGET"),
        options,
    );
    client
        .connect([("Events", "call,command,system")])
        .await
        .expect("failed to connect to Asterisk");
    client
}

#[tokio::test]
#[ignore]
async fn live_login_and_ping() {
    let client = connect().await;
    assert!(client.is_connected());

    let runner = client.clone();
    let run = tokio::spawn(async move { runner.run().await });

    let pong = client
        .submit(AmiAction::ping())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(pong.param("Ping"), Some("Pong"));

    client
        .close()
        .await;
    let result = run
        .await
        .unwrap();
    assert!(matches!(result, Err(AmiError::ConnectionClosed)));
}

#[tokio::test]
#[ignore]
async fn live_core_status() {
    let client = connect().await;
    let runner = client.clone();
    let run = tokio::spawn(async move { runner.run().await });

    let status = client
        .submit(AmiAction::new("CoreStatus"))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(status
        .param("CoreCurrentCalls")
        .is_some());

    client
        .close()
        .await;
    let _ = run.await;
}

#[tokio::test]
#[ignore]
async fn live_unknown_action_is_error_response() {
    let client = connect().await;
    let runner = client.clone();
    let run = tokio::spawn(async move { runner.run().await });

    let response = client
        .submit(AmiAction::new("NoSuchActionHere"))
        .await
        .unwrap();
    assert!(response.is_error());
    assert!(matches!(
        response.into_result(),
        Err(AmiError::ActionFailed { .. })
    ));

    client
        .close()
        .await;
    let _ = run.await;
}

#[tokio::test]
#[ignore]
async fn live_reload_event_stream() {
    let client = connect().await;
    let mut events = client.events();
    let runner = client.clone();
    let run = tokio::spawn(async move { runner.run().await });

    client
        .submit(AmiAction::new("Reload").param("Module", "manager"))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Some(Ok(event)) if event.event_type() == Some(AmiEventType::Reload) => {
                    return Some(event)
                }
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await
    .expect("timeout waiting for Reload event");
    assert!(event.is_some());

    client
        .close()
        .await;
    let _ = run.await;
    assert!(matches!(client.status(), ConnectionStatus::Disconnected(_)));
}
