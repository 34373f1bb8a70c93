use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use umi_bridge::{app, AppState, Config, ConnectionRegistry};
use umi_types::SessionState;
use umi_voice::{LiveKitConfig, LoopbackConnector};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct Bridge {
    addr: SocketAddr,
    state: AppState,
    registry: ConnectionRegistry,
    connector: LoopbackConnector,
}

async fn spawn_bridge(connector: LoopbackConnector) -> Bridge {
    spawn_bridge_with(connector, |_| {}).await
}

async fn spawn_bridge_with(
    connector: LoopbackConnector,
    configure: impl FnOnce(&mut Config),
) -> Bridge {
    let mut config = Config::default();
    config.livekit = LiveKitConfig::new("ws://loopback", "devkey", "secret");
    configure(&mut config);
    let state = AppState::new(config, Arc::new(connector.clone()));
    let registry = state.registry.clone();

    let app = app(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    Bridge {
        addr,
        state,
        registry,
        connector,
    }
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/", addr))
        .await
        .expect("failed to connect");
    ws
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("failed to send control message");
}

async fn next_frame(ws: &mut Ws) -> Message {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for the bridge")
            .expect("connection ended")
            .expect("websocket error");
        match msg {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn recv_json(ws: &mut Ws) -> Value {
    match next_frame(ws).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).expect("invalid json"),
        other => panic!("expected a control message, got {:?}", other),
    }
}

async fn recv_binary(ws: &mut Ws) -> Vec<u8> {
    match next_frame(ws).await {
        Message::Binary(bytes) => bytes.to_vec(),
        other => panic!("expected binary audio, got {:?}", other),
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn frame_bytes(value: i16, samples: usize) -> Vec<u8> {
    std::iter::repeat(value.to_le_bytes())
        .take(samples)
        .flatten()
        .collect()
}

#[tokio::test]
async fn test_full_session_scenario() {
    let bridge = spawn_bridge(LoopbackConnector::new()).await;
    let mut ws = connect(bridge.addr).await;

    send_json(&mut ws, json!({"type": "device_info", "device_id": "umi-1234"})).await;
    assert_eq!(recv_json(&mut ws).await, json!({"type": "ready"}));

    send_json(&mut ws, json!({"type": "start_session", "session_id": "abc"})).await;
    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "session_started", "session_id": "abc"})
    );

    // 960 bytes = 480 samples = 30 ms at 16 kHz mono
    for i in 0..100 {
        ws.send(Message::Binary(frame_bytes(i, 480).into()))
            .await
            .unwrap();
    }

    send_json(&mut ws, json!({"type": "end_session"})).await;
    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "session_ended", "session_id": "abc", "frames_sent": 100})
    );

    let room = bridge.connector.room("umi-abc").expect("room was opened");
    assert_eq!(room.identity(), "device-umi-1234");
    assert_eq!(room.captured_frames(), 100);
    assert!(!room.is_connected());
    assert_eq!(bridge.connector.open_rooms(), 0);
}

#[tokio::test]
async fn test_health_over_http_is_served_alongside_ws() {
    let bridge = spawn_bridge(LoopbackConnector::new()).await;
    let _ws = connect(bridge.addr).await;
    wait_until("registration", || bridge.registry.len() == 1).await;

    let mut stream = TcpStream::connect(bridge.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""connections":1"#));
}

#[tokio::test]
async fn test_disconnect_mid_session_cleans_up() {
    let bridge = spawn_bridge(LoopbackConnector::new()).await;
    let mut ws = connect(bridge.addr).await;

    send_json(&mut ws, json!({"type": "start_session", "session_id": "gone"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "session_started");
    assert_eq!(bridge.registry.active_sessions(), 1);

    for _ in 0..5 {
        ws.send(Message::Binary(frame_bytes(1, 480).into()))
            .await
            .unwrap();
    }
    drop(ws);

    let room = bridge.connector.room("umi-gone").unwrap();
    wait_until("cleanup", || {
        bridge.registry.is_empty() && !room.is_connected()
    })
    .await;
    assert_eq!(room.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_malformed_control_message_is_not_fatal() {
    let bridge = spawn_bridge(LoopbackConnector::new()).await;
    let mut ws = connect(bridge.addr).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("malformed"));

    send_json(&mut ws, json!({"type": "reboot"})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("unsupported"));

    send_json(&mut ws, json!({"type": "device_info"})).await;
    assert_eq!(recv_json(&mut ws).await, json!({"type": "ready"}));
}

#[tokio::test]
async fn test_audio_outside_session_is_dropped() {
    let bridge = spawn_bridge(LoopbackConnector::new()).await;
    let mut ws = connect(bridge.addr).await;

    ws.send(Message::Binary(frame_bytes(9, 480).into()))
        .await
        .unwrap();

    send_json(&mut ws, json!({"type": "start_session", "session_id": "late"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "session_started");
    send_json(&mut ws, json!({"type": "end_session"})).await;
    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "session_ended", "session_id": "late", "frames_sent": 0})
    );

    // Audio after the session ended never reaches a room either.
    ws.send(Message::Binary(frame_bytes(9, 480).into()))
        .await
        .unwrap();
    send_json(&mut ws, json!({"type": "end_session"})).await;
    send_json(&mut ws, json!({"type": "device_info"})).await;
    assert_eq!(recv_json(&mut ws).await, json!({"type": "ready"}));

    assert_eq!(bridge.connector.room("umi-late").unwrap().captured_frames(), 0);
}

#[tokio::test]
async fn test_double_start_is_rejected() {
    let bridge = spawn_bridge(LoopbackConnector::new()).await;
    let mut ws = connect(bridge.addr).await;

    send_json(&mut ws, json!({"type": "start_session", "session_id": "one"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "session_started");

    send_json(&mut ws, json!({"type": "start_session", "session_id": "two"})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("active"));
    assert!(bridge.connector.room("umi-two").is_none());
    assert_eq!(bridge.connector.connect_count(), 1);

    send_json(&mut ws, json!({"type": "end_session"})).await;
    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "session_ended", "session_id": "one", "frames_sent": 0})
    );
}

#[tokio::test]
async fn test_stale_end_session_is_ignored() {
    let bridge = spawn_bridge(LoopbackConnector::new()).await;
    let mut ws = connect(bridge.addr).await;

    send_json(&mut ws, json!({"type": "start_session", "session_id": "current"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "session_started");

    send_json(&mut ws, json!({"type": "end_session", "session_id": "previous"})).await;
    ws.send(Message::Binary(frame_bytes(3, 480).into()))
        .await
        .unwrap();
    send_json(&mut ws, json!({"type": "end_session", "session_id": "current"})).await;

    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "session_ended", "session_id": "current", "frames_sent": 1})
    );
}

#[tokio::test]
async fn test_connect_failure_reports_session_failed() {
    let bridge = spawn_bridge(LoopbackConnector::new()).await;
    bridge.connector.fail_connect(true);
    let mut ws = connect(bridge.addr).await;

    send_json(&mut ws, json!({"type": "start_session", "session_id": "nope"})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "session_failed");
    assert_eq!(reply["session_id"], "nope");
    assert!(reply["reason"].as_str().unwrap().contains("connect"));

    let entry = bridge.registry.snapshot().pop().unwrap();
    assert_eq!(entry.state, SessionState::Idle);
    assert!(entry.session_id.is_none());

    // The device can retry once the room service is back.
    bridge.connector.fail_connect(false);
    send_json(&mut ws, json!({"type": "start_session", "session_id": "nope"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "session_started");
    assert_eq!(bridge.connector.connect_count(), 2);
}

#[tokio::test]
async fn test_echo_room_plays_device_audio_back() {
    let bridge = spawn_bridge(LoopbackConnector::echo()).await;
    let mut ws = connect(bridge.addr).await;

    send_json(&mut ws, json!({"type": "start_session", "session_id": "echo"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "session_started");

    let pcm = frame_bytes(1234, 480);
    ws.send(Message::Binary(pcm.clone().into())).await.unwrap();

    assert_eq!(recv_json(&mut ws).await, json!({"type": "agent_speaking_start"}));
    assert_eq!(recv_binary(&mut ws).await, pcm);

    send_json(&mut ws, json!({"type": "end_session"})).await;
    assert_eq!(recv_json(&mut ws).await, json!({"type": "agent_speaking_end"}));
    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "session_ended", "session_id": "echo", "frames_sent": 1})
    );
}

#[tokio::test]
async fn test_room_closed_by_server_ends_session() {
    let bridge = spawn_bridge(LoopbackConnector::new()).await;
    let mut ws = connect(bridge.addr).await;

    send_json(&mut ws, json!({"type": "start_session", "session_id": "kicked"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "session_started");

    bridge
        .connector
        .room("umi-kicked")
        .unwrap()
        .close_from_server("room deleted");

    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "session_ended", "session_id": "kicked", "frames_sent": 0})
    );

    // The connection stays open for the next session.
    send_json(&mut ws, json!({"type": "start_session", "session_id": "again"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "session_started");
}

#[tokio::test]
async fn test_reconnecting_device_evicts_previous_connection() {
    let bridge = spawn_bridge(LoopbackConnector::new()).await;

    let mut first = connect(bridge.addr).await;
    send_json(&mut first, json!({"type": "device_info", "device_id": "umi-9"})).await;
    assert_eq!(recv_json(&mut first).await["type"], "ready");
    send_json(&mut first, json!({"type": "start_session", "session_id": "s1"})).await;
    assert_eq!(recv_json(&mut first).await["type"], "session_started");

    let mut second = connect(bridge.addr).await;
    send_json(&mut second, json!({"type": "device_info", "device_id": "umi-9"})).await;
    assert_eq!(recv_json(&mut second).await["type"], "ready");

    assert_eq!(
        recv_json(&mut first).await,
        json!({"type": "session_ended", "session_id": "s1", "frames_sent": 0})
    );
    match next_frame(&mut first).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close frame, got {:?}", other),
    }

    wait_until("eviction cleanup", || bridge.registry.len() == 1).await;
    let remaining: Vec<_> = bridge
        .registry
        .snapshot()
        .into_iter()
        .filter(|entry| entry.device_id.as_deref() == Some("umi-9"))
        .collect();
    assert_eq!(remaining.len(), 1);
    assert!(!bridge.connector.room("umi-s1").unwrap().is_connected());
}

#[tokio::test]
async fn test_concurrent_devices_get_separate_rooms() {
    let bridge = spawn_bridge(LoopbackConnector::new()).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let addr = bridge.addr;
        tasks.push(tokio::spawn(async move {
            let mut ws = connect(addr).await;
            let session_id = format!("dev{}", i);
            send_json(&mut ws, json!({"type": "device_info", "device_id": &session_id})).await;
            assert_eq!(recv_json(&mut ws).await["type"], "ready");
            send_json(&mut ws, json!({"type": "start_session", "session_id": &session_id})).await;
            assert_eq!(recv_json(&mut ws).await["type"], "session_started");
            for _ in 0..=i {
                ws.send(Message::Binary(frame_bytes(i as i16, 480).into()))
                    .await
                    .unwrap();
            }
            send_json(&mut ws, json!({"type": "end_session"})).await;
            let ended = recv_json(&mut ws).await;
            assert_eq!(ended["session_id"], session_id);
            assert_eq!(ended["frames_sent"], i + 1);
        }));
    }
    for task in tasks {
        task.await.expect("device task panicked");
    }

    for i in 0..8u64 {
        let room = bridge.connector.room(&format!("umi-dev{}", i)).unwrap();
        assert_eq!(room.captured_frames(), i + 1);
        assert_eq!(room.identity(), format!("device-dev{}", i));
    }
    assert_eq!(bridge.connector.open_rooms(), 0);
}

#[tokio::test]
async fn test_shutdown_ends_live_sessions_and_closes_devices() {
    let bridge = spawn_bridge(LoopbackConnector::new()).await;
    let mut ws = connect(bridge.addr).await;
    send_json(&mut ws, json!({"type": "start_session", "session_id": "bye"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "session_started");

    let state = bridge.state.clone();
    let drained =
        tokio::spawn(async move { state.drain_connections(Duration::from_secs(10)).await });

    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "session_ended", "session_id": "bye", "frames_sent": 0})
    );
    match next_frame(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1001),
        other => panic!("expected close frame, got {:?}", other),
    }

    assert!(drained.await.unwrap(), "connections should drain");
    let room = bridge.connector.room("umi-bye").unwrap();
    assert!(!room.is_connected());
    assert_eq!(room.disconnect_calls(), 1);
    assert!(bridge.registry.is_empty());
}

/// Opens a WebSocket by hand so nothing answers the bridge's pings.
async fn raw_upgrade(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
              Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    // Byte by byte so no frame data is consumed with the headers.
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "upgrade refused: {}", head);
    stream
}

/// Client text frame with a zero mask key.
fn masked_text(text: &str) -> Vec<u8> {
    assert!(text.len() < 126);
    let mut frame = vec![0x81, 0x80 | text.len() as u8, 0, 0, 0, 0];
    frame.extend_from_slice(text.as_bytes());
    frame
}

/// Splits unmasked server frames into `(opcode, payload)` pairs.
fn server_frames(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut frames = Vec::new();
    while bytes.len() >= 2 {
        let opcode = bytes[0] & 0x0f;
        let (len, header) = match bytes[1] & 0x7f {
            126 => (u16::from_be_bytes([bytes[2], bytes[3]]) as usize, 4),
            127 => (
                u64::from_be_bytes(bytes[2..10].try_into().unwrap()) as usize,
                10,
            ),
            len => (len as usize, 2),
        };
        frames.push((opcode, bytes[header..header + len].to_vec()));
        bytes = &bytes[header + len..];
    }
    frames
}

#[tokio::test]
async fn test_silent_device_is_closed_after_keepalive_timeout() {
    let bridge = spawn_bridge_with(LoopbackConnector::new(), |config| {
        config.server.keepalive_interval_secs = 1;
        config.server.keepalive_timeout_secs = 1;
    })
    .await;
    let mut stream = raw_upgrade(bridge.addr).await;
    stream
        .write_all(&masked_text(r#"{"type":"start_session","session_id":"quiet"}"#))
        .await
        .unwrap();

    // The bridge closes the socket once it gives up on the device.
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut received))
        .await
        .expect("bridge should close a silent device")
        .unwrap();

    let frames = server_frames(&received);
    let texts: Vec<Value> = frames
        .iter()
        .filter(|(opcode, _)| *opcode == 0x1)
        .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
        .collect();
    assert_eq!(
        texts,
        vec![
            json!({"type": "session_started", "session_id": "quiet"}),
            json!({"type": "session_ended", "session_id": "quiet", "frames_sent": 0}),
        ]
    );
    assert!(frames.iter().any(|(opcode, _)| *opcode == 0x9), "expected a keepalive ping");
    let (opcode, payload) = frames.last().unwrap();
    assert_eq!(*opcode, 0x8);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1000);

    wait_until("keepalive cleanup", || bridge.registry.is_empty()).await;
    assert!(!bridge.connector.room("umi-quiet").unwrap().is_connected());
}
