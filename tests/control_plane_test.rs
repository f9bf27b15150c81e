mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;

use common::{client_with_host, connected_client, eventually, test_config, RecordingHost, TestClient};
use rabbit_rpc::rabbitmq::{ControlCommand, ControlPlaneHost, FrontDoorClient, MemoryBroker};
use rabbit_rpc::BrokerClient;

#[tokio::test]
async fn clearcache_without_key_clears_every_instance() {
    let broker = MemoryBroker::new();
    let (a, host_a) = connected_client(&broker).await;
    let (_b, host_b) = connected_client(&broker).await;

    a.broadcast(&ControlCommand::ClearCache { key: None }).await.unwrap();

    assert!(eventually(|| host_a.cleared() == 1 && host_b.cleared() == 1).await);
    assert!(host_a.deleted().is_empty());
    assert!(host_b.deleted().is_empty());
}

#[tokio::test]
async fn clearcache_with_key_evicts_only_that_key() {
    let broker = MemoryBroker::new();
    let (a, host_a) = connected_client(&broker).await;
    let (_b, host_b) = connected_client(&broker).await;

    a.broadcast(&ControlCommand::ClearCache {
        key: Some("users:123".into()),
    })
    .await
    .unwrap();

    assert!(eventually(|| host_a.deleted().len() == 1 && host_b.deleted().len() == 1).await);
    assert_eq!(host_b.deleted(), vec!["users:123".to_string()]);
    assert_eq!(host_a.cleared(), 0);
}

#[tokio::test]
async fn housekeeping_question_is_answered_by_whoever_knows() {
    let broker = MemoryBroker::new();
    let (_a, host_a) = connected_client(&broker).await;
    let (b, host_b) = connected_client(&broker).await;
    let last_run = Utc.with_ymd_and_hms(2024, 5, 1, 3, 30, 0).unwrap();
    host_a.set_last_housekeeping(last_run);

    b.broadcast(&ControlCommand::Housekeeping { last_run: None })
        .await
        .unwrap();

    assert!(eventually(|| *host_b.last_housekeeping.lock().unwrap() == Some(last_run)).await);
}

#[tokio::test]
async fn unknown_commands_do_not_stop_the_consumer() {
    let broker = MemoryBroker::new();
    let (client, host) = connected_client(&broker).await;

    client
        .broadcast(&ControlCommand::Unknown("reboot".into()))
        .await
        .unwrap();
    client
        .broadcast(&ControlCommand::ClearCache { key: None })
        .await
        .unwrap();

    assert!(eventually(|| host.cleared() == 1).await);
}

#[tokio::test]
async fn front_door_clients_can_be_notified_and_killed() {
    let broker = MemoryBroker::new();
    let (client, host) = connected_client(&broker).await;
    let first = TestClient::new("c1");
    let second = TestClient::new("c2");
    host.clients
        .lock()
        .unwrap()
        .extend([first.clone() as Arc<dyn FrontDoorClient>, second.clone() as Arc<dyn FrontDoorClient>]);

    client
        .broadcast(&ControlCommand::KillWebsocketClient { id: "c2".into() })
        .await
        .unwrap();
    assert!(eventually(|| second.is_closed()).await);
    assert!(!first.is_closed());

    let message = json!({"command": "notifywebsocketclients", "text": "maintenance"});
    client
        .broadcast(&ControlCommand::NotifyWebsocketClients {
            message: message.clone(),
        })
        .await
        .unwrap();
    assert!(eventually(|| first.notified.lock().unwrap().len() == 1).await);
    assert_eq!(first.notified.lock().unwrap()[0], message);
}

#[tokio::test]
async fn shutdown_exits_zero_when_orderly() {
    let broker = MemoryBroker::new();
    let (client, host) = connected_client(&broker).await;

    client.dispatch_control(ControlCommand::Shutdown).await;

    assert_eq!(host.exits(), vec![0]);
}

#[tokio::test]
async fn failed_shutdown_exits_404_and_the_fallback_fires() {
    let broker = MemoryBroker::new();
    let host = Arc::new(RecordingHost::failing_shutdown());
    let client = client_with_host(&broker, host.clone());
    client.connect().await.unwrap();

    client.dispatch_control(ControlCommand::Shutdown).await;
    assert_eq!(host.exits(), vec![404]);

    assert!(eventually(|| host.exits().len() == 2).await);
    assert_eq!(host.exits()[1], 0);
}

#[tokio::test]
async fn log_exchange_marks_readiness() {
    let broker = MemoryBroker::new();
    let host = Arc::new(RecordingHost::default());
    let client = client_with_host(&broker, host);
    assert!(!client.is_log_broadcast_ready());

    client.connect().await.unwrap();
    assert!(client.is_log_broadcast_ready());
    assert!(broker.exchange_exists("openflow_logs"));

    client.shutdown().await;
    assert!(!client.is_log_broadcast_ready());
}

#[tokio::test]
async fn disabled_broadcast_is_a_silent_no_op() {
    let broker = MemoryBroker::new();
    let host = Arc::new(RecordingHost::default());
    let mut config = test_config();
    config.enable_control_broadcast = false;
    let client = BrokerClient::with_host(config, Arc::new(broker.clone()), host.clone());
    client.connect().await.unwrap();

    client
        .broadcast(&ControlCommand::ClearCache { key: None })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.cleared(), 0);
}
