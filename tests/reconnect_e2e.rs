//! End-to-end — dropped links, reconnects and back-off exhaustion against raw
//! websocket servers.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{WebSocketStream, accept_async};
use wsrpc::{
    Arguments, CallContext, Endpoint, MethodRegistry, MethodResult, ReceiverConfig, ReceiverState, ReconnectPolicy,
    RpcReceiver, Status, TransportError, arg,
};

type ServerStream = WebSocketStream<TcpStream>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn sleep(args: Arguments, ctx: CallContext) -> MethodResult {
    let seconds: f64 = arg(&args, "seconds")?;
    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs_f64(seconds)) => Ok(json!(0)),
        () = ctx.cancelled() => Ok(json!(-1)),
    }
}

fn registry() -> MethodRegistry {
    let registry = MethodRegistry::new();
    registry.register("sleep", sleep).expect("register");
    registry
}

fn sleep_command(uuid: &str) -> String {
    json!({"method": "sleep", "arguments": {"seconds": 0.3}, "uuid": uuid}).to_string()
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}/rpc", listener.local_addr().expect("addr"));
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerStream {
    let (tcp, _) = listener.accept().await.expect("accept");
    accept_async(tcp).await.expect("handshake")
}

/// Read until the first text frame.
async fn next_text(ws: &mut ServerStream) -> String {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return text.as_str().to_owned(),
            Some(Ok(_)) => {}
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// Close with code 1000 and wait for the receiver to finish the handshake.
async fn close_normally(mut ws: ServerStream) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Utf8Bytes::from_static("done"),
    };
    ws.send(Message::Close(Some(frame))).await.expect("close");
    while let Some(Ok(_)) = ws.next().await {}
}

fn spawn_receiver(mut receiver: RpcReceiver) -> JoinHandle<(RpcReceiver, Result<(), TransportError>)> {
    tokio::spawn(async move {
        let outcome = receiver.run().await;
        (receiver, outcome)
    })
}

fn policy() -> ReconnectPolicy {
    ReconnectPolicy::new(4, Duration::from_millis(20))
}

#[tokio::test]
async fn duplex_drop_mid_call_still_delivers_status() {
    init_tracing();
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        first.send(Message::text(sleep_command("R"))).await.expect("command");
        drop(first);

        let mut second = accept(&listener).await;
        let text = next_text(&mut second).await;
        close_normally(second).await;
        text
    });

    let config = ReceiverConfig::new(Endpoint::Duplex(url)).with_reconnect(policy());
    let receiver = RpcReceiver::connect(config, registry()).await.expect("connect");
    let run = spawn_receiver(receiver);

    let text = tokio::time::timeout(Duration::from_secs(10), server).await.expect("server").expect("join");
    let status = Status::from_json(&text).expect("status");
    assert!(status.is_ok());
    assert_eq!(status.uuid, "R");
    assert_eq!(status.payload, json!({"method": "sleep", "result": 0}));

    let (receiver, outcome) = tokio::time::timeout(Duration::from_secs(5), run).await.expect("drained").expect("join");
    outcome.expect("normal close ends the run cleanly");
    assert_eq!(receiver.state(), ReceiverState::Closed);
}

#[tokio::test]
async fn split_send_link_drop_reconnects_send_side() {
    init_tracing();
    let (listen_listener, listen_url) = bind().await;
    let (send_listener, send_url) = bind().await;

    let send_server = tokio::spawn(async move {
        let first = accept(&send_listener).await;
        drop(first);

        let mut second = accept(&send_listener).await;
        let text = next_text(&mut second).await;
        close_normally(second).await;
        text
    });
    let listen_server = tokio::spawn(async move {
        let mut ws = accept(&listen_listener).await;
        ws.send(Message::text(sleep_command("Q"))).await.expect("command");
        while let Some(Ok(_)) = ws.next().await {}
    });

    let config = ReceiverConfig::new(Endpoint::Split {
        listen: listen_url,
        send: send_url,
    })
    .with_reconnect(policy());
    let receiver = RpcReceiver::connect(config, registry()).await.expect("connect");
    let run = spawn_receiver(receiver);

    let text = tokio::time::timeout(Duration::from_secs(10), send_server).await.expect("server").expect("join");
    let status: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(status, json!({"status": "ok", "payload": {"method": "sleep", "result": 0}, "uuid": "Q"}));

    let (_, outcome) = tokio::time::timeout(Duration::from_secs(5), run).await.expect("drained").expect("join");
    outcome.expect("normal close ends the run cleanly");
    tokio::time::timeout(Duration::from_secs(5), listen_server)
        .await
        .expect("listen side released")
        .expect("join");
}

#[tokio::test]
async fn abnormal_close_code_triggers_reconnect() {
    init_tracing();
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        first.send(Message::text(sleep_command("A"))).await.expect("command");
        let going_away = CloseFrame {
            code: CloseCode::Away,
            reason: Utf8Bytes::from_static("restarting"),
        };
        first.send(Message::Close(Some(going_away))).await.expect("close");
        drop(first);

        let mut second = accept(&listener).await;
        let text = next_text(&mut second).await;
        close_normally(second).await;
        text
    });

    let config = ReceiverConfig::new(Endpoint::Duplex(url)).with_reconnect(policy());
    let receiver = RpcReceiver::connect(config, registry()).await.expect("connect");
    let run = spawn_receiver(receiver);

    let text = tokio::time::timeout(Duration::from_secs(10), server).await.expect("server").expect("join");
    assert_eq!(Status::from_json(&text).expect("status").uuid, "A");
    let (_, outcome) = tokio::time::timeout(Duration::from_secs(5), run).await.expect("drained").expect("join");
    outcome.expect("clean shutdown");
}

#[tokio::test]
async fn reconnect_exhaustion_ends_the_run_with_an_error() {
    init_tracing();
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let ws = accept(&listener).await;
        drop(ws);
        drop(listener);
    });

    let config = ReceiverConfig::new(Endpoint::Duplex(url)).with_reconnect(ReconnectPolicy::new(3, Duration::from_millis(10)));
    let receiver = RpcReceiver::connect(config, registry()).await.expect("connect");
    server.await.expect("server");
    let run = spawn_receiver(receiver);

    let (receiver, outcome) = tokio::time::timeout(Duration::from_secs(10), run).await.expect("gave up").expect("join");
    let err = outcome.expect_err("reconnect exhausted");
    assert!(matches!(err, TransportError::ReconnectExhausted { attempts: 3, .. }));
    assert_eq!(receiver.state(), ReceiverState::Closed);
}

#[tokio::test]
async fn close_request_interrupts_reconnect_backoff() {
    init_tracing();
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let ws = accept(&listener).await;
        drop(ws);
        drop(listener);
    });

    // Back-off long enough that only the close request can end the run.
    let config = ReceiverConfig::new(Endpoint::Duplex(url)).with_reconnect(ReconnectPolicy::new(6, Duration::from_secs(30)));
    let receiver = RpcReceiver::connect(config, registry()).await.expect("connect");
    server.await.expect("server");
    let handle = receiver.close_handle();
    let run = spawn_receiver(receiver);

    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.close();
    let (receiver, outcome) = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("close honored during back-off")
        .expect("join");
    outcome.expect("close request ends the run cleanly");
    assert_eq!(receiver.state(), ReceiverState::Closed);
}
