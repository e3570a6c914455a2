//! WebSocket upgrade and framing against a tungstenite client.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use httpsys::error::HttpSysError;
use httpsys::http::websocket::accept_key;
use httpsys::http::{BufferType, HttpResponse, ResponseHeader, SendFlags, WebSocket, WebSocketSettings};

mod common;

/// Answer the next request with a 101 and take over the connection.
async fn accept_upgrade(server: &common::TestServer) -> Arc<WebSocket> {
    let request = server.receive().await;
    let key = request
        .headers
        .get_by_name("Sec-WebSocket-Key")
        .expect("upgrade without key")
        .to_string();
    let response = HttpResponse::new(101)
        .with_header(ResponseHeader::Upgrade, "websocket")
        .with_header(ResponseHeader::Connection, "Upgrade")
        .with_unknown_header("Sec-WebSocket-Accept", accept_key(&key));
    server
        .api
        .send_http_response(server.queue, request.request_id, response, SendFlags::OPAQUE, None)
        .await
        .unwrap();
    server
        .api
        .receive_websocket(server.queue, request.request_id, WebSocketSettings::default())
        .unwrap()
}

#[tokio::test]
async fn echo_messages_then_close() {
    let server = common::start_plain(&[("http://+:28330/chat/", 0)]).await;
    let client = tokio::spawn(tokio_tungstenite::connect_async("ws://127.0.0.1:28330/chat/room"));
    let socket = accept_upgrade(&server).await;
    let (mut ws, response) = client.await.unwrap().unwrap();
    assert_eq!(response.status(), 101);

    let echo = {
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            loop {
                let fragment = socket.read_fragment(4096).await?;
                match fragment.buffer_type {
                    BufferType::Close => return Ok::<_, HttpSysError>(fragment.data),
                    kind => socket.write_fragment(kind, &fragment.data).await?,
                }
            }
        })
    };

    ws.send(Message::text("hello")).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::text("hello"));

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::binary(vec![1u8, 2, 3]));

    ws.send(Message::Ping(vec![9u8].into())).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::Pong(vec![9u8].into()));

    ws.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "bye".into(),
    }))
    .await
    .unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(5), echo)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, b"bye");
    assert_eq!(socket.close_status(), Some((1000, "bye".to_string())));

    let reply = ws.next().await.unwrap().unwrap();
    assert!(matches!(reply, Message::Close(Some(frame)) if frame.code == CloseCode::Normal));

    socket.close_transport();
    server.stop().await;
}

#[tokio::test]
async fn long_message_arrives_in_fragments() {
    let server = common::start_plain(&[("http://+:28331/", 0)]).await;
    let client = tokio::spawn(tokio_tungstenite::connect_async("ws://127.0.0.1:28331/"));
    let socket = accept_upgrade(&server).await;
    let (mut ws, _) = client.await.unwrap().unwrap();

    ws.send(Message::binary(b"0123456789".to_vec())).await.unwrap();
    let mut kinds = Vec::new();
    let mut data = Vec::new();
    loop {
        let fragment = socket.read_fragment(4).await.unwrap();
        kinds.push(fragment.buffer_type);
        data.extend(fragment.data);
        if fragment.buffer_type == BufferType::BinaryMessage {
            break;
        }
    }
    assert_eq!(
        kinds,
        [BufferType::BinaryFragment, BufferType::BinaryFragment, BufferType::BinaryMessage]
    );
    assert_eq!(data, b"0123456789");

    socket.write_fragment(BufferType::Utf8Fragment, b"ab").await.unwrap();
    socket.write_fragment(BufferType::Utf8Message, b"cd").await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::text("abcd"));

    socket.send_close(1001, "going away").await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert!(matches!(reply, Message::Close(Some(frame)) if frame.code == CloseCode::Away));
    assert!(matches!(
        socket.write_fragment(BufferType::Utf8Message, b"late").await,
        Err(HttpSysError::InvalidState(_))
    ));

    socket.close_transport();
    server.stop().await;
}

#[tokio::test]
async fn upgrade_requires_an_opaque_response() {
    let server = common::start_plain(&[("http://+:28332/", 0)]).await;
    let client = tokio::spawn(tokio_tungstenite::connect_async("ws://127.0.0.1:28332/"));
    let request = server.receive().await;

    let err = server
        .api
        .receive_websocket(server.queue, request.request_id, WebSocketSettings::default())
        .unwrap_err();
    assert!(matches!(err, HttpSysError::InvalidState(_)));

    server.respond(&request, HttpResponse::new(400)).await;
    assert!(client.await.unwrap().is_err());
    server.stop().await;
}

#[tokio::test]
async fn upgraded_connection_counts_until_the_transport_closes() {
    let server = common::start_plain(&[("http://+:28333/", 0)]).await;
    let client = tokio::spawn(tokio_tungstenite::connect_async("ws://127.0.0.1:28333/"));
    let socket = accept_upgrade(&server).await;
    let (_ws, _) = client.await.unwrap().unwrap();
    let session = server.api.session().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.connection_count(), 1);

    socket.close_transport();
    let released = tokio::time::timeout(Duration::from_secs(5), async {
        while session.connection_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "connection slot was never released");
    server.stop().await;
}
