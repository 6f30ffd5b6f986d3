
use std::sync::Arc;

use fixture::*;
use http::Method;
use socketio3::Channel;

#[tokio::test]
async fn handshake_advertises_header_and_namespace() {
    let (svc, _io) = create_server();
    let packet = create_polling_connection(&svc).await;

    assert_eq!(packet.sid.len(), 20);
    assert_eq!(packet.upgrades, ["websocket"]);
    assert_eq!(packet.ping_interval, 30000);
    assert_eq!(packet.ping_timeout, 60000);
}

#[tokio::test]
async fn emit_roundtrip_over_polling() {
    let (svc, io) = create_server();
    io.on("echo", |c: &Arc<Channel>, payload: serde_json::Value| {
        let c = c.clone();
        tokio::spawn(async move {
            c.emit("echo-back", &payload).await.ok();
        });
    });

    let packet = create_polling_connection(&svc).await;
    post_frame(&svc, &packet.sid, r#"42["echo",{"n":1}]"#).await;
    assert_eq!(
        poll_frame(&svc, &packet.sid).await,
        r#"42["echo-back",{"n":1}]"#
    );
}

#[tokio::test]
async fn ack_request_answered_over_polling() {
    let (svc, io) = create_server();
    io.on_ack("add", |_c: &Arc<Channel>, nums: Vec<i64>| {
        nums.iter().sum::<i64>()
    });

    let packet = create_polling_connection(&svc).await;
    post_frame(&svc, &packet.sid, r#"421["add",[1,2,3]]"#).await;
    assert_eq!(poll_frame(&svc, &packet.sid).await, "431[6]");
}

#[tokio::test]
async fn unknown_sid_is_rejected() {
    let (svc, _io) = create_server();
    let (status, body) = send_req_status(
        &svc,
        "transport=polling&sid=doesnotexist".to_owned(),
        Method::GET,
        None,
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body, r#"{"code":"1","message":"Session ID unknown"}"#);
}

#[tokio::test]
async fn unsupported_method_is_rejected() {
    let (svc, _io) = create_server();
    let packet = create_polling_connection(&svc).await;
    let (status, _body) = send_req_status(
        &svc,
        format!("transport=polling&sid={}", packet.sid),
        Method::PUT,
        None,
    )
    .await;
    assert_eq!(status, 405);
}

#[tokio::test]
async fn unknown_transport_is_rejected() {
    let (svc, _io) = create_server();
    let (status, _body) =
        send_req_status(&svc, "transport=carrier-pigeon".to_owned(), Method::GET, None).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn server_close_delivers_terminator_and_forgets_session() {
    let (svc, io) = create_server();
    let packet = create_polling_connection(&svc).await;
    assert_eq!(io.amount_of_sids(), 1);

    io.get_channel(&packet.sid).unwrap().close().await.unwrap();
    assert_eq!(io.amount_of_sids(), 0);

    let body = send_req(
        &svc,
        format!("transport=polling&sid={}", packet.sid),
        Method::GET,
        None,
    )
    .await;
    assert_eq!(body, "1:6");

    // the terminator retired the session entry
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let (status, _body) = send_req_status(
        &svc,
        format!("transport=polling&sid={}", packet.sid),
        Method::GET,
        None,
    )
    .await;
    assert_eq!(status, 400);
}
