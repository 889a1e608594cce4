mod common;

use std::time::Duration;

use common::{fast_config, recv_within, setup, wait_until, TestMessage};
use rstest::rstest;
use talkbridge::{
    AppError, Connection, ConnectionEvent, DefaultMessages, Endpoint, FrameReader, Status,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time;

async fn local_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[derive(Debug, PartialEq)]
enum Seen {
    SignOn(TestMessage),
    SignOff(Option<TestMessage>),
    Message(TestMessage),
    Error(String),
    LifeCheck,
}

fn record(connection: &Connection<TestMessage>) -> mpsc::UnboundedReceiver<Seen> {
    let (tx, rx) = mpsc::unbounded_channel();
    connection.subscribe(move |_, event| {
        let seen = match event {
            ConnectionEvent::SignOn(m) => Seen::SignOn(m.clone()),
            ConnectionEvent::SignOff(m) => Seen::SignOff(m.cloned()),
            ConnectionEvent::MessageReceived(m) => Seen::Message(m.clone()),
            ConnectionEvent::Error(e) => Seen::Error(e.to_string()),
            ConnectionEvent::LifeCheck => Seen::LifeCheck,
        };
        let _ = tx.send(seen);
    });
    rx
}

#[rstest]
#[tokio::test]
async fn dialed_message_arrives_as_its_exact_bytes(#[from(setup)] _setup: ()) {
    let (listener, port) = local_listener().await;
    let connection: Connection<TestMessage> = Connection::new();
    connection.build_bridge("127.0.0.1", port, false).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    connection.send_message(TestMessage::text("ABCD"));

    let mut received = [0u8; 8];
    time::timeout(Duration::from_secs(5), peer.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received, b"0004ABCD");
    assert_eq!(connection.address(), "127.0.0.1");
    assert_eq!(connection.port(), port);
    assert!(connection.is_connected());
}

#[rstest]
#[tokio::test]
async fn outbound_queue_is_fifo(#[from(setup)] _setup: ()) {
    let (listener, port) = local_listener().await;
    let connection: Connection<TestMessage> = Connection::new();
    // queued before the bridge exists, drained once it does
    connection.send_message(TestMessage::text("m-0"));
    connection.build_bridge("127.0.0.1", port, false).await.unwrap();
    for i in 1..50 {
        connection.send_message(TestMessage::text(&format!("m-{}", i)));
    }

    let (peer, _) = listener.accept().await.unwrap();
    let mut reader = FrameReader::new(peer, None);
    for i in 0..50 {
        let frame = time::timeout(Duration::from_secs(5), reader.read_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&frame.payload[..], format!("m-{}", i).as_bytes());
    }
    wait_until(|| connection.pending_messages() == 0).await;
}

#[rstest]
#[tokio::test]
async fn received_frames_become_messages_and_bad_ones_errors(#[from(setup)] _setup: ()) {
    let (listener, port) = local_listener().await;
    let connection: Connection<TestMessage> = Connection::new();
    let mut events = record(&connection);
    connection.build_bridge("127.0.0.1", port, false).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    peer.write_all(b"0003abczzzz0002!x0002hi").await.unwrap();

    assert_eq!(
        recv_within(&mut events).await,
        Seen::Message(TestMessage::text("abc"))
    );
    match recv_within(&mut events).await {
        Seen::Error(e) => assert!(e.contains("malformed protocol"), "{}", e),
        other => panic!("expected malformed header error, got {:?}", other),
    }
    match recv_within(&mut events).await {
        Seen::Error(e) => assert!(e.contains("corrupt message"), "{}", e),
        other => panic!("expected model error, got {:?}", other),
    }
    assert_eq!(
        recv_within(&mut events).await,
        Seen::Message(TestMessage::text("hi"))
    );
    assert_eq!(connection.status(), Status::Connected);
}

#[rstest]
#[tokio::test]
async fn default_sign_on_goes_first_and_raises_sign_on(#[from(setup)] _setup: ()) {
    let (listener, port) = local_listener().await;
    let connection: Connection<TestMessage> = Connection::new();
    connection.set_default_messages(DefaultMessages::new(
        Some(TestMessage::text("HELLO")),
        None,
        None,
    ));
    let mut events = record(&connection);
    connection.send_message(TestMessage::text("early"));
    connection.build_bridge("127.0.0.1", port, false).await.unwrap();

    let (peer, _) = listener.accept().await.unwrap();
    let mut reader = FrameReader::new(peer, None);
    let first = reader.read_frame().await.unwrap().unwrap();
    let second = reader.read_frame().await.unwrap().unwrap();
    assert_eq!(&first.payload[..], b"HELLO");
    assert_eq!(&second.payload[..], b"early");
    assert_eq!(
        recv_within(&mut events).await,
        Seen::SignOn(TestMessage::text("HELLO"))
    );
}

#[rstest]
#[tokio::test]
async fn disconnect_sends_sign_off_and_closes(#[from(setup)] _setup: ()) {
    let (listener, port) = local_listener().await;
    let connection: Connection<TestMessage> = Connection::with_config(fast_config());
    let mut events = record(&connection);
    connection.build_bridge("127.0.0.1", port, false).await.unwrap();
    let (peer, _) = listener.accept().await.unwrap();

    connection.send_message(TestMessage::text("dropped"));
    connection
        .send_disconnect_message(Some(TestMessage::text("BYE")))
        .await;

    assert_eq!(connection.status(), Status::Disconnected);
    assert_eq!(
        recv_within(&mut events).await,
        Seen::SignOff(Some(TestMessage::text("BYE")))
    );

    // "dropped" may or may not have been written before the queue was cleared,
    // the sign-off is always the last frame before EOF
    let mut reader = FrameReader::new(peer, None);
    let mut payloads = Vec::new();
    while let Some(frame) = time::timeout(Duration::from_secs(5), reader.read_frame())
        .await
        .unwrap()
        .unwrap()
    {
        payloads.push(frame.payload.to_vec());
    }
    assert_eq!(payloads.last().map(Vec::as_slice), Some(&b"BYE"[..]));

    assert!(connection.set_status(Status::Connected).is_err());
    let again = connection.build_bridge("127.0.0.1", port, false).await;
    assert!(matches!(again, Err(AppError::IllegalStateError(_))));
    assert_eq!(connection.status(), Status::Disconnected);
}

#[rstest]
#[tokio::test]
async fn heartbeat_failure_signs_off(#[from(setup)] _setup: ()) {
    let (listener, port) = local_listener().await;
    let connection: Connection<TestMessage> = Connection::with_config(fast_config());
    connection.set_default_messages(DefaultMessages::new(
        None,
        Some(TestMessage::text("BYE")),
        Some(TestMessage::text("PING")),
    ));
    let mut events = record(&connection);
    connection.build_bridge("127.0.0.1", port, true).await.unwrap();
    assert!(connection.heartbeat_enabled());

    // the peer goes away, later heartbeat writes fail
    let (peer, _) = listener.accept().await.unwrap();
    drop(peer);
    drop(listener);

    let signed_off = time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Seen::SignOff(message)) = events.recv().await {
                return message;
            }
        }
    })
    .await
    .expect("no sign-off after heartbeat failure");
    assert_eq!(signed_off, Some(TestMessage::text("BYE")));
    assert_eq!(connection.status(), Status::Disconnected);
}

#[rstest]
#[tokio::test]
async fn heartbeat_is_written_and_reported(#[from(setup)] _setup: ()) {
    let (listener, port) = local_listener().await;
    let connection: Connection<TestMessage> = Connection::with_config(fast_config());
    connection.set_default_messages(DefaultMessages::new(
        None,
        None,
        Some(TestMessage::text("PING")),
    ));
    let (tx, mut life_checks) = mpsc::unbounded_channel();
    connection.on_life_check(move |conn| {
        let _ = tx.send(conn.id());
    });
    connection.build_bridge("127.0.0.1", port, true).await.unwrap();

    let (peer, _) = listener.accept().await.unwrap();
    let mut reader = FrameReader::new(peer, None);
    for _ in 0..2 {
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"PING");
        assert_eq!(recv_within(&mut life_checks).await, connection.id());
    }
}

#[rstest]
#[tokio::test]
async fn bridge_is_built_once(#[from(setup)] _setup: ()) {
    let (_listener, port) = local_listener().await;
    let connection: Connection<TestMessage> = Connection::new();
    connection.build_bridge("127.0.0.1", port, false).await.unwrap();
    let second = connection.build_bridge("127.0.0.1", port, false).await;
    assert!(matches!(second, Err(AppError::IllegalStateError(_))));
    assert!(connection.is_connected());
}

#[rstest]
#[tokio::test]
async fn failed_dial_can_be_retried(#[from(setup)] _setup: ()) {
    let (listener, port) = local_listener().await;
    drop(listener);
    let connection: Connection<TestMessage> = Connection::new();
    let refused = connection.build_bridge("127.0.0.1", port, false).await;
    assert!(matches!(refused, Err(AppError::IoError(_))));
    assert!(!connection.is_connected());

    let (_listener, port) = local_listener().await;
    connection.build_bridge("127.0.0.1", port, false).await.unwrap();
    assert!(connection.is_connected());
}

#[rstest]
#[tokio::test]
async fn half_closed_peer_still_gets_replies(#[from(setup)] _setup: ()) {
    let (listener, port) = local_listener().await;
    let connection: Connection<TestMessage> = Connection::new();
    connection.build_bridge("127.0.0.1", port, false).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    peer.write_all(b"0005query").await.unwrap();
    peer.shutdown().await.unwrap();
    // let the receive task see the EOF before replying
    time::sleep(Duration::from_millis(200)).await;
    connection.send_message(TestMessage::text("reply"));

    let mut reader = FrameReader::new(peer, None);
    let frame = time::timeout(Duration::from_secs(5), reader.read_frame())
        .await
        .expect("reply was never written")
        .unwrap()
        .unwrap();
    assert_eq!(&frame.payload[..], b"reply");
    assert!(connection.is_connected());
    assert_eq!(connection.pending_messages(), 0);
    assert_eq!(connection.status(), Status::Connected);
}

#[rstest]
#[tokio::test]
async fn closed_peer_is_detected_on_write_and_keeps_status(#[from(setup)] _setup: ()) {
    let (listener, port) = local_listener().await;
    let connection: Connection<TestMessage> = Connection::new();
    let mut events = record(&connection);
    connection.build_bridge("127.0.0.1", port, false).await.unwrap();
    let (peer, _) = listener.accept().await.unwrap();
    drop(peer);

    // the first write after the close may still succeed, a later one fails
    wait_until(|| {
        connection.send_message(TestMessage::text("ping"));
        !connection.is_connected()
    })
    .await;
    assert_eq!(connection.status(), Status::Connected);

    let error = time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Seen::Error(e)) = events.recv().await {
                return e;
            }
        }
    })
    .await
    .expect("write failure was not reported");
    assert!(error.contains("io error"), "{}", error);
}
