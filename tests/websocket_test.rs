// Integration tests for the push transport

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use realtime_hub::config::ServerConfig;
use realtime_hub::core::dispatcher::{NotificationHub, SharedHub};
use realtime_hub::core::event::{Event, Identity};
use realtime_hub::handlers::routes;

fn config(trust_identity_header: bool) -> ServerConfig {
    ServerConfig {
        trust_identity_header,
        ..ServerConfig::default()
    }
}

async fn recv_json(client: &mut warp::test::WsClient) -> Value {
    let message = tokio::time::timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket closed");
    serde_json::from_str(message.to_str().expect("expected a text frame")).unwrap()
}

async fn open(hub: &SharedHub, path: &str, identity: Option<&str>) -> warp::test::WsClient {
    let api = routes(hub.clone(), None, &config(true));
    let mut builder = warp::test::ws().path(path);
    if let Some(identity) = identity {
        builder = builder.header("x-authenticated-user-id", identity);
    }
    builder.handshake(api).await.expect("handshake")
}

#[tokio::test]
async fn test_welcome_and_ping() {
    let hub: SharedHub = Arc::new(NotificationHub::new());
    let mut client = open(&hub, "/ws/connect/client-1", None).await;

    let welcome = recv_json(&mut client).await;
    assert_eq!(welcome["type"], "connection");
    assert_eq!(welcome["client_id"], "client-1");
    assert_eq!(welcome["authenticated"], false);

    client.send_text(r#"{"type": "ping", "timestamp": 1234}"#).await;
    let pong = recv_json(&mut client).await;
    assert_eq!(pong, json!({"type": "pong", "timestamp": 1234}));
}

#[tokio::test]
async fn test_subscribe_then_receive_publish() {
    let hub: SharedHub = Arc::new(NotificationHub::new());
    let mut client = open(&hub, "/ws/connect/reader", None).await;
    recv_json(&mut client).await;

    client
        .send_text(r#"{"type": "subscribe", "channel": "general"}"#)
        .await;
    let subscribed = recv_json(&mut client).await;
    assert_eq!(subscribed["type"], "subscribed");
    assert_eq!(subscribed["channel"], "general");

    let event = Event::envelope("message", "msg", Some("general"), json!({"content": "hello"}));
    assert_eq!(hub.publish_to_channel("general", &event).unwrap(), 1);
    let received = recv_json(&mut client).await;
    assert_eq!(&received, event.as_value());

    client
        .send_text(r#"{"type": "unsubscribe", "channel": "general"}"#)
        .await;
    assert_eq!(recv_json(&mut client).await["type"], "unsubscribed");
    assert_eq!(hub.publish_to_channel("general", &event).unwrap(), 0);
}

#[tokio::test]
async fn test_bad_frames_get_error_replies() {
    let hub: SharedHub = Arc::new(NotificationHub::new());
    let mut client = open(&hub, "/ws/connect/sloppy", None).await;
    recv_json(&mut client).await;

    let cases = [
        ("this is not json", "Invalid JSON format"),
        (r#"{"type": "dance"}"#, "Unknown message type: dance"),
        (r#"{"channel": "general"}"#, "Unknown message type: null"),
        (r#"{"type": "subscribe"}"#, "Invalid subscribe message"),
        (r#"{"type": "join_room", "room_id": ""}"#, "Invalid join_room message"),
        (
            r#"{"type": "broadcast", "channel": "general", "content": "hi"}"#,
            "Authentication required for broadcasting",
        ),
        (
            r#"{"type": "private_message", "target_user_id": 2, "content": "hi"}"#,
            "Authentication required for private messages",
        ),
    ];

    for (frame, expected) in cases {
        client.send_text(frame).await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["type"], "error", "frame: {}", frame);
        assert_eq!(reply["message"], expected, "frame: {}", frame);
    }

    // Still connected after all of that
    assert!(hub.is_connected("sloppy").unwrap());
}

#[tokio::test]
async fn test_private_message_between_identities() {
    let hub: SharedHub = Arc::new(NotificationHub::new());
    let mut alice = open(&hub, "/ws/connect/alice", Some("1")).await;
    let mut bob = open(&hub, "/ws/connect/bob", Some("2")).await;
    assert_eq!(recv_json(&mut alice).await["authenticated"], true);
    recv_json(&mut bob).await;

    alice
        .send_text(r#"{"type": "private_message", "target_user_id": 2, "content": "hey"}"#)
        .await;
    assert_eq!(recv_json(&mut alice).await["type"], "message_sent");

    let delivered = recv_json(&mut bob).await;
    assert_eq!(delivered["type"], "private_message");
    assert_eq!(delivered["from_user_id"], 1);
    assert_eq!(delivered["content"], "hey");

    alice
        .send_text(r#"{"type": "private_message", "target_user_id": 99, "content": "hey"}"#)
        .await;
    let reply = recv_json(&mut alice).await;
    assert_eq!(reply["message"], "Target user not connected");
}

#[tokio::test]
async fn test_room_messages_reach_members() {
    let hub: SharedHub = Arc::new(NotificationHub::new());
    let mut speaker = open(&hub, "/ws/connect/speaker", Some("1")).await;
    let mut listener = open(&hub, "/ws/connect/listener", None).await;
    recv_json(&mut speaker).await;
    recv_json(&mut listener).await;

    for client in [&mut speaker, &mut listener] {
        client
            .send_text(r#"{"type": "join_room", "room_id": "lesson-3"}"#)
            .await;
        assert_eq!(recv_json(client).await["type"], "joined_room");
    }

    speaker
        .send_text(r#"{"type": "room_message", "room_id": "lesson-3", "content": "page 12"}"#)
        .await;
    for client in [&mut speaker, &mut listener] {
        let message = recv_json(client).await;
        assert_eq!(message["type"], "room_message");
        assert_eq!(message["user_id"], 1);
        assert_eq!(message["content"], "page 12");
    }
}

#[tokio::test]
async fn test_identity_header_ignored_unless_trusted() {
    let hub: SharedHub = Arc::new(NotificationHub::new());
    let api = routes(hub.clone(), None, &config(false));
    let mut client = warp::test::ws()
        .path("/ws/connect/spoofer")
        .header("x-authenticated-user-id", "1")
        .handshake(api)
        .await
        .expect("handshake");

    assert_eq!(recv_json(&mut client).await["authenticated"], false);
    assert!(!hub.notify(Identity(1), &Event::new(json!({"type": "nudge"}))).unwrap());
}

#[tokio::test]
async fn test_reconnect_closes_previous_socket() {
    let hub: SharedHub = Arc::new(NotificationHub::new());
    let mut first = open(&hub, "/ws/connect/same", Some("5")).await;
    recv_json(&mut first).await;

    let mut second = open(&hub, "/ws/connect/same", Some("5")).await;
    recv_json(&mut second).await;

    match tokio::time::timeout(Duration::from_secs(2), first.recv()).await {
        Ok(Ok(message)) => assert!(message.is_close()),
        Ok(Err(_)) => {}
        Err(_) => panic!("previous socket was not closed"),
    }

    // The replacement is fully functional
    second.send_text(r#"{"type": "ping"}"#).await;
    assert_eq!(recv_json(&mut second).await["type"], "pong");
    assert_eq!(hub.connection_stats().unwrap().push.total_connections, 1);
}

#[tokio::test]
async fn test_disconnect_cleans_up_over_tcp() {
    let hub: SharedHub = Arc::new(NotificationHub::new());
    let api = routes(hub.clone(), None, &config(true));
    let (addr, server) = warp::serve(api).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let mut request = format!("ws://{}/ws/connect/tcp-client", addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("x-authenticated-user-id", "11".parse().unwrap());
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let welcome = match socket.next().await {
        Some(Ok(TungsteniteMessage::Text(text))) => serde_json::from_str::<Value>(&text).unwrap(),
        other => panic!("expected welcome frame, got {:?}", other),
    };
    assert_eq!(welcome["client_id"], "tcp-client");
    assert_eq!(welcome["authenticated"], true);

    socket
        .send(TungsteniteMessage::Text(
            r#"{"type": "subscribe", "channel": "general"}"#.to_string(),
        ))
        .await
        .unwrap();
    let _subscribed = socket.next().await;
    assert_eq!(hub.list_channels().unwrap().len(), 1);

    socket.close(None).await.unwrap();
    drop(socket);

    // Cleanup runs when the read loop ends
    let mut cleaned = false;
    for _ in 0..50 {
        if !hub.is_connected("tcp-client").unwrap() {
            cleaned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cleaned);
    assert!(hub.list_channels().unwrap().is_empty());
    assert!(!hub.notify(Identity(11), &Event::new(json!({"type": "nudge"}))).unwrap());
}

#[tokio::test]
async fn test_poll_namespace_ids_are_refused() {
    let hub: SharedHub = Arc::new(NotificationHub::new());
    let poll = hub.connect_poll(None, &["general".to_string()]).unwrap();
    let api = routes(hub.clone(), None, &config(true));

    let res = warp::test::request()
        .path(&format!("/ws/connect/{}", poll))
        .header("connection", "upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .reply(&api)
        .await;
    assert_eq!(res.status(), warp::http::StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(body["error"], "INVALID_CLIENT_ID");

    // The poll client keeps its mailbox and subscriptions
    let event = Event::envelope("message", "msg", Some("general"), json!({"content": "still here"}));
    assert_eq!(hub.publish_to_channel("general", &event).unwrap(), 1);
    assert_eq!(hub.drain(&poll).unwrap().len(), 1);
}

#[tokio::test]
async fn test_quiet_client_answering_pings_survives_reaper() {
    let hub: SharedHub = Arc::new(NotificationHub::new());
    let config = ServerConfig {
        ping_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let api = routes(hub.clone(), None, &config);
    let (addr, server) = warp::serve(api).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/connect/quiet", addr))
        .await
        .unwrap();
    let (_write, mut read) = socket.split();

    // Reading is enough for the client library to answer pings
    let pings = tokio::spawn(async move {
        let mut pings = 0;
        while let Some(Ok(message)) = read.next().await {
            if message.is_ping() {
                pings += 1;
            }
        }
        pings
    });

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(hub.reap_idle(Duration::from_millis(200)).unwrap(), 0);
    assert!(hub.is_connected("quiet").unwrap());

    // A much tighter timeout still catches it between pings
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(hub.reap_idle(Duration::ZERO).unwrap(), 1);
    assert!(pings.await.unwrap() >= 3);
}
