mod support;

use std::time::Duration;

use serde_json::json;

use support::{start_hub, Client, TestResult};
use synctabs_companion::model::{BrowserId, PendingTab, DEFAULT_TAB_TITLE, MAX_URL_LEN};
use synctabs_companion::pending::MAX_PENDING_PER_BROWSER;
use synctabs_companion::protocol::{DeliveryStatus, ServerMessage};
use synctabs_companion::websocket::{MAX_MESSAGE_BYTES, RATE_LIMIT_MAX_MESSAGES};

fn is_error(message: &ServerMessage, expected: &str) -> bool {
    matches!(message, ServerMessage::Error { message } if message == expected)
}

#[test_timeout::tokio_timeout_test(30)]
async fn two_browsers_share_tabs_and_relay_sends() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (hub, addr) = start_hub(dir.path()).await;

    let (mut a, state) = Client::register(addr, "browser-a", "Chrome").await;
    assert_eq!(state, ServerMessage::FullState { browsers: Default::default() });

    let (mut b, state) = Client::register(addr, "browser-b", "Firefox").await;
    match state {
        ServerMessage::FullState { browsers } => {
            assert_eq!(browsers.len(), 1);
            assert_eq!(browsers["browser-a"].browser_name, "Chrome");
        }
        other => panic!("unexpected {other:?}"),
    }
    match a.recv().await {
        ServerMessage::Presence {
            browser_id,
            browser_name,
            online,
            ..
        } => {
            assert_eq!(browser_id.as_str(), "browser-b");
            assert_eq!(browser_name, "Firefox");
            assert!(online);
        }
        other => panic!("unexpected {other:?}"),
    }

    let long_url = format!("https://example.com/{}", "x".repeat(3000));
    a.send(json!({
        "type": "tabs-update",
        "tabs": [
            {"id": 1, "url": "https://one.test", "title": "One", "windowId": 1, "active": true},
            {"id": 2, "url": "https://two.test", "title": ""},
            {"id": 3, "url": long_url, "title": "Long", "lastAccessed": 1700000000000.0}
        ]
    }))
    .await;
    match b.recv().await {
        ServerMessage::BrowserTabsUpdated {
            browser_id,
            browser_name,
            tabs,
            online,
            ..
        } => {
            assert_eq!(browser_id.as_str(), "browser-a");
            assert_eq!(browser_name, "Chrome");
            assert!(online);
            assert_eq!(tabs.len(), 3);
            assert_eq!(tabs[1].title, DEFAULT_TAB_TITLE);
            assert!(tabs[1].last_accessed > 0.0);
            assert_eq!(tabs[2].url.chars().count(), MAX_URL_LEN);
            assert_eq!(tabs[2].url, long_url[..MAX_URL_LEN]);
        }
        other => panic!("unexpected {other:?}"),
    }

    a.send(json!({
        "type": "send-tab",
        "targetBrowserId": "browser-b",
        "tab": {"url": "https://shared.test", "title": "Shared"}
    }))
    .await;
    assert_eq!(
        a.recv().await,
        ServerMessage::SendTabAck {
            status: DeliveryStatus::Delivered,
            target_browser_id: BrowserId::parse("browser-b").unwrap(),
        }
    );
    match b.recv().await {
        ServerMessage::PendingTabs { tabs } => {
            assert_eq!(tabs.len(), 1);
            assert_eq!(tabs[0].url, "https://shared.test");
            assert_eq!(tabs[0].sender_browser_id, "browser-a");
            assert_eq!(tabs[0].sender_browser_name, "Chrome");
        }
        other => panic!("unexpected {other:?}"),
    }

    b.close().await;
    match a.recv().await {
        ServerMessage::Presence {
            browser_id, online, ..
        } => {
            assert_eq!(browser_id.as_str(), "browser-b");
            assert!(!online);
        }
        other => panic!("unexpected {other:?}"),
    }

    a.send(json!({
        "type": "send-tab",
        "targetBrowserId": "browser-b",
        "tab": {"url": "https://later.test", "title": "Later"}
    }))
    .await;
    assert_eq!(
        a.recv().await,
        ServerMessage::SendTabAck {
            status: DeliveryStatus::Queued,
            target_browser_id: BrowserId::parse("browser-b").unwrap(),
        }
    );
    assert_eq!(hub.pending().queued_for("browser-b"), 1);

    let (mut b, _) = Client::register(addr, "browser-b", "Firefox").await;
    match b.recv().await {
        ServerMessage::PendingTabs { tabs } => {
            assert_eq!(tabs.len(), 1);
            assert_eq!(tabs[0].url, "https://later.test");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(hub.pending().queued_for("browser-b"), 0);

    hub.shutdown().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test(30)]
async fn fifty_first_message_is_rate_limited() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (hub, addr) = start_hub(dir.path()).await;
    let (mut client, _) = Client::register(addr, "busy", "Chrome").await;

    for _ in 1..RATE_LIMIT_MAX_MESSAGES {
        client.send(json!({"type": "request-state"})).await;
    }
    client
        .send(json!({"type": "tabs-update", "tabs": [{"url": "https://sneaky.test"}]}))
        .await;

    let reply = client
        .recv_until(|message| !matches!(message, ServerMessage::FullState { .. }))
        .await;
    assert!(is_error(&reply, "Rate limited"), "got {reply:?}");
    assert!(hub.state().get("busy").unwrap().tabs.is_empty());

    hub.shutdown().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test(30)]
async fn oversized_message_is_refused_without_closing() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (hub, addr) = start_hub(dir.path()).await;
    let (mut client, _) = Client::register(addr, "big", "Chrome").await;

    client.send_raw("x".repeat(MAX_MESSAGE_BYTES + 1)).await;
    assert!(is_error(&client.recv().await, "Message too large"));

    client.send(json!({"type": "request-state"})).await;
    assert!(matches!(client.recv().await, ServerMessage::FullState { .. }));

    hub.shutdown().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test(30)]
async fn invalid_requests_get_specific_errors() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (hub, addr) = start_hub(dir.path()).await;

    let mut anonymous = Client::connect(addr).await;
    anonymous
        .send(json!({"type": "register", "browserId": "null", "browserName": "Chrome"}))
        .await;
    assert!(is_error(&anonymous.recv().await, "Invalid browserId"));
    anonymous
        .send(json!({"type": "register", "browserId": "b-1", "browserName": ""}))
        .await;
    assert!(is_error(&anonymous.recv().await, "Missing browserName"));
    anonymous
        .send(json!({"type": "register", "browserId": "b-1", "browserName": null}))
        .await;
    assert!(is_error(&anonymous.recv().await, "Missing browserName"));

    // Unidentified connections are ignored for everything but register.
    anonymous.send(json!({"type": "request-state"})).await;
    anonymous.send_raw("not json".into()).await;
    anonymous.send(json!({"type": "ping"})).await;
    assert!(anonymous.try_recv(Duration::from_millis(300)).await.is_none());

    let (mut client, _) = Client::register(addr, "sender", "Chrome").await;
    client
        .send(json!({"type": "send-tab", "targetBrowserId": "x", "tab": {"url": ""}}))
        .await;
    assert!(is_error(&client.recv().await, "Invalid send-tab payload"));
    client
        .send(json!({"type": "send-tab", "targetBrowserId": "undefined", "tab": {"url": "https://a.test"}}))
        .await;
    assert!(is_error(&client.recv().await, "Invalid targetBrowserId"));
    client
        .send(json!({"type": "send-tab", "targetBrowserId": "x", "tab": {"url": "javascript:alert(1)"}}))
        .await;
    assert!(is_error(&client.recv().await, "Invalid URL"));

    hub.shutdown().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test(30)]
async fn full_queue_is_reported_to_the_sender() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (hub, addr) = start_hub(dir.path()).await;
    let offline = BrowserId::parse("offline").unwrap();
    let sender = BrowserId::parse("seed").unwrap();
    for n in 0..MAX_PENDING_PER_BROWSER {
        let tab = PendingTab::new(&format!("https://example.com/{n}"), "", "", &sender, "Seed");
        hub.pending().enqueue(&offline, tab)?;
    }

    let (mut client, _) = Client::register(addr, "sender", "Chrome").await;
    client
        .send(json!({
            "type": "send-tab",
            "targetBrowserId": "offline",
            "tab": {"url": "https://example.com/overflow"}
        }))
        .await;
    assert!(is_error(
        &client.recv().await,
        "Pending queue full for browser offline"
    ));
    assert_eq!(hub.pending().queued_for("offline"), MAX_PENDING_PER_BROWSER);

    hub.shutdown().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test(30)]
async fn newer_connection_takes_over_an_identity() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (hub, addr) = start_hub(dir.path()).await;
    let (mut watcher, _) = Client::register(addr, "watcher", "Edge").await;

    let (mut first, _) = Client::register(addr, "shared", "Chrome").await;
    watcher.recv().await;
    let (_second, _) = Client::register(addr, "shared", "Chrome").await;
    watcher.recv().await;

    // The replaced connection is closed by the hub.
    assert!(first.try_recv(Duration::from_secs(2)).await.is_none());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(hub.connected_count(), 2);
    assert!(hub.state().get("shared").unwrap().online);
    assert!(watcher.try_recv(Duration::from_millis(300)).await.is_none());

    hub.shutdown().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test(30)]
async fn switching_identity_releases_the_old_one() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (hub, addr) = start_hub(dir.path()).await;
    let (mut watcher, _) = Client::register(addr, "watcher", "Edge").await;
    let (mut client, _) = Client::register(addr, "old-id", "Chrome").await;
    watcher.recv().await;

    client
        .send(json!({"type": "register", "browserId": "new-id", "browserName": "Chrome"}))
        .await;
    assert!(matches!(client.recv().await, ServerMessage::FullState { .. }));

    match watcher.recv().await {
        ServerMessage::Presence {
            browser_id, online, ..
        } => {
            assert_eq!(browser_id.as_str(), "old-id");
            assert!(!online);
        }
        other => panic!("unexpected {other:?}"),
    }
    match watcher.recv().await {
        ServerMessage::Presence {
            browser_id, online, ..
        } => {
            assert_eq!(browser_id.as_str(), "new-id");
            assert!(online);
        }
        other => panic!("unexpected {other:?}"),
    }

    assert!(hub.registry().get("old-id").is_none());
    assert!(hub.registry().get("new-id").is_some());
    assert_eq!(hub.connected_count(), 2);
    assert!(!hub.state().get("old-id").unwrap().online);

    hub.shutdown().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test(30)]
async fn unidentified_disconnect_changes_nothing() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (hub, addr) = start_hub(dir.path()).await;
    let (mut watcher, _) = Client::register(addr, "watcher", "Edge").await;

    let mut anonymous = Client::connect(addr).await;
    anonymous
        .send(json!({"type": "register", "browserId": null, "browserName": "Chrome"}))
        .await;
    assert!(is_error(&anonymous.recv().await, "Invalid browserId"));
    anonymous.close().await;

    assert!(watcher.try_recv(Duration::from_millis(500)).await.is_none());
    assert_eq!(hub.connected_count(), 1);
    assert_eq!(hub.state().len(), 1);
    assert!(hub.state().get("watcher").unwrap().online);

    hub.shutdown().await;
    Ok(())
}
