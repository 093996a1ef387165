//! End-to-end runs of the tokio driver against an in-memory server.

use std::{io, time::Duration};

use futures::{SinkExt, StreamExt, future::BoxFuture};
use nnws::{
    CloseCode, Event, Frame, OpCode, Options, WebSocketError,
    codec::{Decoder, Encoder, Role},
    handshake::accept_key,
    native::{Dialer, WebSocket},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
    sync::mpsc::UnboundedReceiver,
    time::timeout,
};
use tokio_util::codec::{FramedRead, FramedWrite};

struct DuplexDialer(Option<DuplexStream>);

impl Dialer for DuplexDialer {
    type Stream = DuplexStream;

    fn dial(&mut self, _: String, _: u16, _: bool) -> BoxFuture<'static, io::Result<DuplexStream>> {
        let stream = self.0.take();
        Box::pin(async move { stream.ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected)) })
    }
}

struct Server {
    frames: FramedRead<ReadHalf<DuplexStream>, Decoder>,
    sink: FramedWrite<WriteHalf<DuplexStream>, Encoder>,
}

impl Server {
    async fn next_frame(&mut self) -> Option<Frame> {
        match timeout(Duration::from_secs(5), self.frames.next()).await {
            Ok(frame) => frame.transpose().unwrap(),
            Err(_) => panic!("timed out waiting for a client frame"),
        }
    }
}

async fn read_head(stream: &mut DuplexStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn accept(mut stream: DuplexStream) -> Server {
    let request = read_head(&mut stream).await;
    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .unwrap()
        .to_owned();
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key.as_bytes())
    );
    stream.write_all(response.as_bytes()).await.unwrap();

    let (read, write) = tokio::io::split(stream);
    Server {
        frames: FramedRead::new(read, Decoder::new(Role::Server, None)),
        sink: FramedWrite::new(write, Encoder::new(Role::Server)),
    }
}

fn connect(options: Options) -> (WebSocket, UnboundedReceiver<Event>, DuplexStream) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (ws, events) = WebSocket::connect_with(
        "ws://test.local/echo".parse().unwrap(),
        options,
        DuplexDialer(Some(client)),
    )
    .unwrap();
    (ws, events, server)
}

/// Next event that is not a raw frame notification.
async fn next_message(events: &mut UnboundedReceiver<Event>) -> Event {
    loop {
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(Event::Frame(_))) => continue,
            Ok(Some(event)) => return event,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for an event"),
        }
    }
}

#[tokio::test]
async fn test_echo() {
    let (ws, mut events, server) = connect(Options::default());
    let mut server = accept(server).await;

    assert!(matches!(
        next_message(&mut events).await,
        Event::Opened { protocol: None }
    ));

    ws.send_text("ping me").await.unwrap();
    ws.send_binary(vec![1u8, 2, 3]).await.unwrap();

    for _ in 0..2 {
        let frame = server.next_frame().await.unwrap();
        assert!(frame.mask().is_some());
        let reply = Frame::new(true, frame.opcode(), None, frame.into_payload());
        server.sink.send(reply).await.unwrap();
    }

    assert!(matches!(next_message(&mut events).await, Event::Text(t) if t == "ping me"));
    assert!(matches!(
        next_message(&mut events).await,
        Event::Binary(b) if b.as_ref() == [1, 2, 3]
    ));
}

#[tokio::test]
async fn test_ping_is_answered() {
    let (_ws, mut events, server) = connect(Options::default());
    let mut server = accept(server).await;
    next_message(&mut events).await;

    server.sink.send(Frame::ping("hb")).await.unwrap();
    let pong = server.next_frame().await.unwrap();

    assert_eq!(pong.opcode(), OpCode::Pong);
    assert_eq!(pong.payload().as_ref(), b"hb");
}

#[tokio::test]
async fn test_client_close() {
    let (ws, mut events, server) = connect(Options::default());
    let mut server = accept(server).await;
    next_message(&mut events).await;

    ws.close_with_reason(CloseCode::Normal, "done").await.unwrap();

    let close = server.next_frame().await.unwrap();
    assert_eq!(close.opcode(), OpCode::Close);
    assert_eq!(close.close_code(), Some(CloseCode::Normal));
    server
        .sink
        .send(Frame::close(CloseCode::Normal, ""))
        .await
        .unwrap();

    assert!(matches!(
        next_message(&mut events).await,
        Event::Closed { status: CloseCode::Normal, error: None }
    ));
    // write side shut down after the closing handshake
    assert!(server.next_frame().await.is_none());

    assert!(matches!(
        ws.send_text("gone").await,
        Err(WebSocketError::IllegalState { .. })
    ));
}

#[tokio::test]
async fn test_dropping_handle_closes_gracefully() {
    let (ws, mut events, server) = connect(Options::default());
    let mut server = accept(server).await;
    next_message(&mut events).await;

    drop(ws);

    let close = server.next_frame().await.unwrap();
    assert_eq!(close.close_code(), Some(CloseCode::Normal));
    server
        .sink
        .send(Frame::close(CloseCode::Normal, ""))
        .await
        .unwrap();

    assert!(matches!(
        next_message(&mut events).await,
        Event::Closed { status: CloseCode::Normal, .. }
    ));
    // the driver exits and drops the sender
    assert!(timeout(Duration::from_secs(5), events.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_handshake_rejected() {
    let (_ws, mut events, mut server) = connect(Options::default());
    read_head(&mut server).await;
    server
        .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();

    assert!(matches!(
        next_message(&mut events).await,
        Event::OpenFailed(WebSocketError::InvalidStatusCode(403))
    ));
}

#[tokio::test]
async fn test_server_vanishes() {
    let (_ws, mut events, server) = connect(Options::default());
    let server = accept(server).await;
    next_message(&mut events).await;

    drop(server);

    assert!(matches!(
        next_message(&mut events).await,
        Event::Closed { status: CloseCode::AbnormalClosure, error: Some(_) }
    ));
}

#[tokio::test]
async fn test_read_timeout() {
    let (_ws, mut events, server) =
        connect(Options::default().with_read_timeout(Duration::from_millis(100)));
    let _server = accept(server).await;
    next_message(&mut events).await;

    assert!(matches!(
        next_message(&mut events).await,
        Event::Closed {
            status: CloseCode::AbnormalClosure,
            error: Some(WebSocketError::ReadTimeout)
        }
    ));
}

#[tokio::test]
async fn test_reopen() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    struct Twice(Vec<DuplexStream>);
    impl Dialer for Twice {
        type Stream = DuplexStream;
        fn dial(&mut self, _: String, _: u16, _: bool) -> BoxFuture<'static, io::Result<DuplexStream>> {
            let stream = self.0.pop();
            Box::pin(async move { stream.ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected)) })
        }
    }

    let (second_client, second_server) = tokio::io::duplex(64 * 1024);
    let (ws, mut events) = WebSocket::connect_with(
        "ws://test.local/".parse().unwrap(),
        Options::default(),
        Twice(vec![second_client, client]),
    )
    .unwrap();

    let server = accept(server).await;
    next_message(&mut events).await;
    drop(server);
    assert!(matches!(next_message(&mut events).await, Event::Closed { .. }));

    ws.reopen().await.unwrap();
    let mut server = accept(second_server).await;
    assert!(matches!(next_message(&mut events).await, Event::Opened { .. }));

    ws.send_text("again").await.unwrap();
    let frame = server.next_frame().await.unwrap();
    assert_eq!(frame.payload().as_ref(), b"again");
}
