//! Connection manager tests against an in-process websocket server.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use bazar_core::config::CoreConfig;
use bazar_core::connection::{ConnectionManager, ConnectionState};
use bazar_core::error::ChatError;
use bazar_core::wire::{ClientFrame, ServerEvent};

fn test_config(url: &str) -> CoreConfig {
    CoreConfig {
        socket_url: url.to_string(),
        backoff: vec![
            Duration::from_millis(0),
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(300),
        ],
        invoke_wait: Duration::from_secs(2),
        ..CoreConfig::default()
    }
}

async fn ws_server() -> (String, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (url, listener)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> ClientFrame {
    loop {
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Ping(p) => {
                let _ = ws.send(WsMessage::Pong(p)).await;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn connect_fails_fast_without_credential() {
    let cfg = test_config("ws://127.0.0.1:1");
    let err = ConnectionManager::connect(&cfg, "").unwrap_err();
    assert!(matches!(err, ChatError::Auth(_)));
}

#[tokio::test]
async fn join_room_sends_join_frame() {
    let (url, listener) = ws_server().await;
    let conn = ConnectionManager::connect(&test_config(&url), "token").unwrap();
    let mut server = accept(&listener).await;

    conn.wait_for_connected(Duration::from_secs(2)).await.unwrap();
    conn.join_room("c1").await.unwrap();

    match next_frame(&mut server).await {
        ClientFrame::Join { conversation_id } => assert_eq!(conversation_id, "c1"),
        other => panic!("expected join, got {:?}", other),
    }
}

#[tokio::test]
async fn server_events_reach_subscribers() {
    let (url, listener) = ws_server().await;
    let conn = ConnectionManager::connect(&test_config(&url), "token").unwrap();
    let mut events = conn.subscribe();
    let mut server = accept(&listener).await;

    conn.wait_for_connected(Duration::from_secs(2)).await.unwrap();

    let push = serde_json::json!({
        "event": "seen",
        "conversationId": "c1",
        "seenBy": "u2",
        "upTo": 1234
    });
    server
        .send(WsMessage::Text(push.to_string()))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        ServerEvent::Seen { seen_by, up_to, .. } => {
            assert_eq!(seen_by, "u2");
            assert_eq!(up_to, 1234);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn invoke_queued_while_disconnected_flushes_fifo_on_connect() {
    let (url, listener) = ws_server().await;
    // Hold the listener but delay accepting, so the first dial fails.
    drop(listener);

    let cfg = test_config(&url);
    let conn = ConnectionManager::connect(&cfg, "token").unwrap();

    // Queue two invokes while the manager is still retrying.
    let invoke_a = conn.invoke(ClientFrame::MarkRead {
        conversation_id: "c1".into(),
        viewer_id: "me".into(),
    });
    let invoke_b = conn.invoke(ClientFrame::Recall {
        conversation_id: "c1".into(),
        message_id: "m1".into(),
    });

    // Re-bind the same port inside the backoff window.
    let addr = url.trim_start_matches("ws://").to_string();
    let rebind = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let listener = TcpListener::bind(&addr).await.unwrap();
        let mut server = accept(&listener).await;
        let a = next_frame(&mut server).await;
        let b = next_frame(&mut server).await;
        (a, b)
    });

    let (res_a, res_b) = tokio::join!(invoke_a, invoke_b);
    res_a.unwrap();
    res_b.unwrap();

    let (a, b) = rebind.await.unwrap();
    assert!(matches!(a, ClientFrame::MarkRead { .. }));
    assert!(matches!(b, ClientFrame::Recall { .. }));
}

#[tokio::test]
async fn timed_out_invoke_is_never_sent_after_reconnect() {
    let (url, listener) = ws_server().await;
    // First dial fails; the queued invoke times out during the backoff
    // delay, then the server comes back before the second dial.
    drop(listener);

    let cfg = CoreConfig {
        socket_url: url.clone(),
        backoff: vec![Duration::from_millis(0), Duration::from_millis(300)],
        invoke_wait: Duration::from_millis(100),
        ..CoreConfig::default()
    };
    let conn = ConnectionManager::connect(&cfg, "token").unwrap();

    let addr = url.trim_start_matches("ws://").to_string();
    let rebind = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let listener = TcpListener::bind(&addr).await.unwrap();
        let mut server = accept(&listener).await;
        next_frame(&mut server).await
    });

    let err = conn
        .invoke(ClientFrame::Recall {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotConnected));

    conn.wait_for_connected(Duration::from_secs(2)).await.unwrap();
    conn.join_room("c1").await.unwrap();

    // The rejected recall was dropped from the queue; the first frame
    // the reconnected server sees is the join.
    match rebind.await.unwrap() {
        ClientFrame::Join { conversation_id } => assert_eq!(conversation_id, "c1"),
        other => panic!("expected join, got {:?}", other),
    }
}

#[tokio::test]
async fn exhausted_backoff_surfaces_terminal_disconnect() {
    // Nothing listens here and the schedule is short.
    let cfg = CoreConfig {
        socket_url: "ws://127.0.0.1:9".to_string(),
        backoff: vec![Duration::from_millis(0), Duration::from_millis(20)],
        invoke_wait: Duration::from_secs(2),
        ..CoreConfig::default()
    };
    let conn = ConnectionManager::connect(&cfg, "token").unwrap();

    let err = conn
        .wait_for_connected(Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotConnected));
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    // Invokes reject instead of hanging forever.
    let err = conn
        .invoke(ClientFrame::MarkRead {
            conversation_id: "c1".into(),
            viewer_id: "me".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotConnected));
}

#[tokio::test]
async fn reconnect_rejoins_rooms_before_signaling_connected() {
    let (url, listener) = ws_server().await;
    let conn = ConnectionManager::connect(&test_config(&url), "token").unwrap();
    let mut server = accept(&listener).await;

    conn.wait_for_connected(Duration::from_secs(2)).await.unwrap();
    conn.join_room("c1").await.unwrap();
    assert!(matches!(
        next_frame(&mut server).await,
        ClientFrame::Join { .. }
    ));

    // Drop the connection; the client reconnects on the 0s first step.
    drop(server);

    let mut server2 = accept(&listener).await;
    match next_frame(&mut server2).await {
        ClientFrame::Join { conversation_id } => assert_eq!(conversation_id, "c1"),
        other => panic!("expected re-join, got {:?}", other),
    }

    conn.wait_for_connected(Duration::from_secs(2)).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
}
