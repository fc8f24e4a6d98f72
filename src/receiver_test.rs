use super::*;

use serde_json::json;

fn boxed<F>(fut: F) -> MethodFuture
where
    F: std::future::Future<Output = MethodResult> + Send + 'static,
{
    Box::pin(fut)
}

async fn explode() -> MethodResult {
    tokio::task::yield_now().await;
    panic!("kaboom")
}

// =============================================================================
// settled_status
// =============================================================================

#[test]
fn settled_ok_reports_method_and_result() {
    let status = settled_status("math_add", "U", Ok(json!(3)), false);
    let wire: Value = serde_json::from_str(&status.to_json()).expect("json");
    assert_eq!(wire, json!({"status": "ok", "payload": {"method": "math_add", "result": 3}, "uuid": "U"}));
}

#[test]
fn settled_err_reports_message() {
    let status = settled_status("fail", "U", Err(MethodError::failed("Bad things")), false);
    assert!(status.is_err());
    assert_eq!(status.payload, json!({"method": "fail", "result": "Bad things"}));
    assert_eq!(status.uuid, "U");
}

#[test]
fn canceled_call_reports_sentinel_under_empty_method() {
    let status = settled_status("sleep", "U", Ok(json!(-1)), true);
    assert!(status.is_ok());
    assert_eq!(status.payload, json!({"method": "", "result": -1}));
}

#[test]
fn call_dropped_after_grace_reports_null() {
    let status = settled_status("sleep", "U", Err(MethodError::Canceled), true);
    assert!(status.is_ok());
    assert_eq!(status.payload, json!({"method": "", "result": null}));
}

#[test]
fn canceled_call_that_fails_reports_err_under_empty_method() {
    let status = settled_status("sleep", "U", Err(MethodError::failed("interrupted")), true);
    assert!(status.is_err());
    assert_eq!(status.payload, json!({"method": "", "result": "interrupted"}));
}

// =============================================================================
// salvage_identity
// =============================================================================

#[test]
fn salvage_keeps_uuid_and_method_when_present() {
    let (uuid, method) = salvage_identity(r#"{"method": "math_add", "uuid": "U"}"#);
    assert_eq!(uuid, "U");
    assert_eq!(method, "math_add");
}

#[test]
fn salvage_falls_back_to_fresh_uuid_and_empty_method() {
    let (uuid, method) = salvage_identity("not json at all");
    assert_eq!(uuid.len(), 32);
    assert_eq!(method, "");

    let (uuid, method) = salvage_identity(r#"{"method": 5, "uuid": 6}"#);
    assert_eq!(uuid.len(), 32);
    assert_eq!(method, "");
}

// =============================================================================
// run_guarded
// =============================================================================

#[tokio::test]
async fn guarded_call_returns_method_outcome() {
    let (_signal, ctx) = CallContext::pair("U", "math_add");
    let settled = run_guarded("U".into(), "math_add".into(), boxed(async { Ok(json!(3)) }), ctx, Duration::ZERO).await;
    assert_eq!(settled.uuid, "U");
    assert_eq!(settled.method, "math_add");
    assert_eq!(settled.outcome.expect("ok"), json!(3));
}

#[tokio::test]
async fn guarded_call_maps_panics() {
    let (_signal, ctx) = CallContext::pair("U", "boom");
    let settled = run_guarded("U".into(), "boom".into(), Box::pin(explode()), ctx, Duration::ZERO).await;
    let err = settled.outcome.expect_err("panicked");
    assert_eq!(err.to_string(), "method panicked: kaboom");
}

#[tokio::test(start_paused = true)]
async fn cooperative_method_settles_with_its_sentinel() {
    let (signal, ctx) = CallContext::pair("U", "sleep");
    let observer = ctx.clone();
    let future = boxed(async move {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(60)) => Ok(json!(0)),
            () = observer.cancelled() => Ok(json!(-1)),
        }
    });
    let task = tokio::spawn(run_guarded("U".into(), "sleep".into(), future, ctx, Duration::from_secs(1)));

    tokio::task::yield_now().await;
    signal.cancel();
    let settled = task.await.expect("join");
    assert_eq!(settled.outcome.expect("sentinel"), json!(-1));
}

#[tokio::test(start_paused = true)]
async fn stubborn_method_is_dropped_after_grace() {
    let (signal, ctx) = CallContext::pair("U", "stubborn");
    let future = boxed(async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!("finished"))
    });
    let start = tokio::time::Instant::now();
    let task = tokio::spawn(run_guarded("U".into(), "stubborn".into(), future, ctx, Duration::from_secs(1)));

    tokio::task::yield_now().await;
    signal.cancel();
    let settled = task.await.expect("join");
    assert!(matches!(settled.outcome, Err(MethodError::Canceled)));
    assert!(start.elapsed() < Duration::from_secs(2));
}

// =============================================================================
// misc
// =============================================================================

#[test]
fn state_display_is_lowercase() {
    assert_eq!(ReceiverState::Reconnecting.to_string(), "reconnecting");
    assert_eq!(ReceiverState::Closed.to_string(), "closed");
}

#[tokio::test]
async fn close_handle_wakes_waiter() {
    let (tx, mut rx) = watch::channel(false);
    let handle = CloseHandle { tx: Arc::new(tx) };
    handle.close();
    handle.close();
    tokio::time::timeout(Duration::from_secs(1), close_requested(&mut rx))
        .await
        .expect("close observed");
}

// =============================================================================
// task bookkeeping
// =============================================================================

#[tokio::test]
async fn failed_call_task_clears_its_entry_and_reports() {
    use futures_util::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}/rpc", listener.local_addr().expect("addr"));
    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_owned(),
                Some(Ok(_)) => {}
                other => panic!("expected a status, got {other:?}"),
            }
        }
    });

    let config = ReceiverConfig::new(Endpoint::Duplex(url));
    let mut receiver = RpcReceiver::connect(config, MethodRegistry::new()).await.expect("connect");
    let (signal, _ctx) = CallContext::pair("L", "lost");
    receiver.pending.insert(
        "L".into(),
        Pending {
            method: "lost".into(),
            signal,
            canceled: false,
        },
    );
    let call = receiver.calls.spawn(future::pending::<Settled>());
    receiver.tasks.insert(call.id(), "L".into());
    call.abort();

    let joined = receiver.calls.join_next_with_id().await.expect("task");
    assert!(joined.is_err());
    let flow = receiver.on_settled(joined).await.expect("status sent");
    assert_eq!(flow, Flow::Continue);
    assert_eq!(receiver.in_flight(), 0);
    assert!(receiver.tasks.is_empty());

    let text = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("status arrives")
        .expect("join");
    let status = Status::from_json(&text).expect("status");
    assert!(status.is_err());
    assert_eq!(status.uuid, "L");
    assert_eq!(status.payload["method"], json!("lost"));
    receiver.close().await;
}
