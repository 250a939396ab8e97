//! Crash handling: silent restart with buffer replay, crash-storm cutoff.

use serde_json::json;
use tsunagi::ServiceClient;
use tsunagi::client::{ClientNotification, ExecuteConfig};
use tsunagi::error::ClientError;

mod helpers;
use helpers::{FakeSpawner, next_notification, single_process_config, wait_until};

#[tokio::test]
async fn isolated_crash_restarts_and_replays_buffers() {
    let spawner = FakeSpawner::new(true);
    let (client, mut notifications) =
        ServiceClient::new(single_process_config(), spawner.clone());
    client.start().unwrap();
    assert!(matches!(
        next_notification(&mut notifications).await,
        ClientNotification::Started { .. }
    ));

    client.configure(json!({"hostInfo": "test"})).unwrap();
    client
        .open_document(json!({"file": "/tmp/a.ts", "fileContent": "let a;"}))
        .unwrap();
    client
        .open_document(json!({"file": "/tmp/b.ts", "fileContent": "let b;"}))
        .unwrap();

    spawner.handle(0).crash(134);
    wait_until(|| spawner.spawn_count() == 2, "replacement process").await;

    assert!(matches!(
        next_notification(&mut notifications).await,
        ClientNotification::Exited { restarting: true }
    ));
    assert!(matches!(
        next_notification(&mut notifications).await,
        ClientNotification::Started { .. }
    ));

    // The replacement sees the pre-crash view: configure, then both buffers.
    let replacement = spawner.handle(1);
    replacement.wait_for_command("configure").await;
    replacement.wait_for_command("open").await;
    let opened: Vec<String> = replacement
        .requests()
        .iter()
        .filter(|r| r.command == "open")
        .map(|r| r.arguments["file"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(opened, vec!["/tmp/a.ts", "/tmp/b.ts"]);
}

#[tokio::test]
async fn requests_pending_at_crash_time_fail_and_later_ones_succeed() {
    let spawner = FakeSpawner::new(false);
    let (client, _notifications) =
        ServiceClient::new(single_process_config(), spawner.clone());
    client.start().unwrap();

    let pending = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .execute("quickinfo", json!({}), ExecuteConfig::default())
                .await
        }
    });
    spawner.handle(0).wait_for_command("quickinfo").await;

    spawner.handle(0).crash(1);
    assert!(matches!(
        pending.await.unwrap(),
        Err(ClientError::Server(_))
    ));

    wait_until(|| spawner.spawn_count() == 2, "replacement process").await;
    let followup = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .execute("quickinfo", json!({}), ExecuteConfig::default())
                .await
        }
    });
    let replacement = spawner.handle(1);
    let request = replacement.wait_for_command("quickinfo").await;
    replacement.respond_success(request.seq, "quickinfo", json!({"kind": "var"}));
    assert!(followup.await.unwrap().is_ok());
}

#[tokio::test]
async fn crash_storm_permanently_fails_the_service() {
    let spawner = FakeSpawner::new(true);
    let (client, mut notifications) =
        ServiceClient::new(single_process_config(), spawner.clone());
    client.start().unwrap();

    // Five rapid crashes still restart; the sixth crosses the threshold.
    for crashes in 1..=5 {
        spawner.handle(crashes - 1).crash(1);
        wait_until(
            || spawner.spawn_count() == crashes + 1,
            "replacement after crash",
        )
        .await;
    }
    spawner.handle(5).crash(1);

    wait_until(
        || {
            matches!(
                notifications.try_recv(),
                Ok(ClientNotification::PermanentlyFailed)
            )
        },
        "permanent failure notification",
    )
    .await;
    assert_eq!(spawner.spawn_count(), 6);

    let result = client
        .execute("quickinfo", json!({}), ExecuteConfig::default())
        .await;
    assert!(matches!(result, Err(ClientError::PermanentlyFailed { .. })));

    // A planned restart resets the crash tracking.
    client.restart().unwrap();
    assert_eq!(spawner.spawn_count(), 7);
    assert!(client.is_running());
}
