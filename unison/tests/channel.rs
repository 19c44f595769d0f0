//! End-to-end channel tests: accept loop, handshake validation, payload
//! delivery and rejection behavior.

use std::path::PathBuf;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;

use unison::client::ChannelClient;
use unison::server::{ChannelServer, InstanceEvent};
use unison::ConnectionType;
use unison_protocol::{Handshake, HandshakeCodec};

const DEADLINE: Duration = Duration::from_millis(500);
const CHANNEL: &str = "q0tMGgvbXkSnvTqpZSdBPA";

struct TestChannel {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    events: mpsc::Receiver<InstanceEvent>,
    _server: ChannelServer,
}

fn start_channel(notify_secondaries: bool) -> TestChannel {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("chan.sock");
    let listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();

    let (events_tx, events) = mpsc::channel(16);
    let server =
        ChannelServer::start(listener, CHANNEL.to_string(), notify_secondaries, events_tx)
            .unwrap();

    TestChannel {
        _dir: dir,
        socket,
        events,
        _server: server,
    }
}

async fn next_event(events: &mut mpsc::Receiver<InstanceEvent>) -> InstanceEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn expect_no_event(events: &mut mpsc::Receiver<InstanceEvent>) {
    let result = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(result.is_err(), "unexpected event: {:?}", result);
}

/// Collect MessageReceived payloads from one instance until `expected`
/// bytes arrived, tolerating delivery in several chunks.
async fn collect_payload(
    events: &mut mpsc::Receiver<InstanceEvent>,
    from_instance: u32,
    expected: usize,
) -> Vec<u8> {
    let mut collected = Vec::new();
    while collected.len() < expected {
        match next_event(events).await {
            InstanceEvent::MessageReceived {
                instance_id,
                payload,
            } => {
                assert_eq!(instance_id, from_instance);
                collected.extend_from_slice(&payload);
            }
            other => panic!("expected payload, got {:?}", other),
        }
    }
    collected
}

fn encode_frame(handshake: &Handshake) -> BytesMut {
    let mut codec = HandshakeCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(handshake.clone(), &mut buf).unwrap();
    buf
}

#[tokio::test]
async fn test_secondary_announcement_raises_instance_started() {
    let mut channel = start_channel(true);

    let mut client = ChannelClient::new(CHANNEL, &channel.socket, 1);
    assert!(
        client
            .connect_to_primary(DEADLINE, ConnectionType::SecondaryInstance)
            .await
    );

    assert_eq!(
        next_event(&mut channel.events).await,
        InstanceEvent::InstanceStarted
    );
    expect_no_event(&mut channel.events).await;
}

#[tokio::test]
async fn test_secondary_announcement_suppressed_without_notification() {
    let mut channel = start_channel(false);

    let mut client = ChannelClient::new(CHANNEL, &channel.socket, 1);
    assert!(
        client
            .connect_to_primary(DEADLINE, ConnectionType::SecondaryInstance)
            .await
    );

    expect_no_event(&mut channel.events).await;
}

#[tokio::test]
async fn test_new_instance_always_announced() {
    // Notification flag governs secondaries only
    let mut channel = start_channel(false);

    let mut client = ChannelClient::new(CHANNEL, &channel.socket, 9);
    assert!(
        client
            .connect_to_primary(DEADLINE, ConnectionType::NewInstance)
            .await
    );

    assert_eq!(
        next_event(&mut channel.events).await,
        InstanceEvent::InstanceStarted
    );
}

#[tokio::test]
async fn test_reconnect_delivers_payload_without_announcement() {
    let mut channel = start_channel(true);

    let mut client = ChannelClient::new(CHANNEL, &channel.socket, 2);
    assert!(client.send_payload(b"hello", DEADLINE).await);

    let payload = collect_payload(&mut channel.events, 2, 5).await;
    assert_eq!(payload, b"hello");
    expect_no_event(&mut channel.events).await;
}

#[tokio::test]
async fn test_announce_then_message_flow() {
    let mut channel = start_channel(true);

    let mut client = ChannelClient::new(CHANNEL, &channel.socket, 2);
    assert!(
        client
            .connect_to_primary(DEADLINE, ConnectionType::SecondaryInstance)
            .await
    );
    assert_eq!(
        next_event(&mut channel.events).await,
        InstanceEvent::InstanceStarted
    );

    assert!(client.send_payload(b"hello", DEADLINE).await);
    let payload = collect_payload(&mut channel.events, 2, 5).await;
    assert_eq!(payload, b"hello");

    // The announcement is raised exactly once per connection
    expect_no_event(&mut channel.events).await;
}

#[tokio::test]
async fn test_payload_in_same_chunk_as_handshake() {
    let mut channel = start_channel(true);

    let mut frame = encode_frame(&Handshake::new(CHANNEL, ConnectionType::NewInstance, 5));
    frame.extend_from_slice(b"first bytes");

    let mut stream = tokio::net::UnixStream::connect(&channel.socket).await.unwrap();
    stream.write_all(&frame).await.unwrap();
    stream.flush().await.unwrap();

    assert_eq!(
        next_event(&mut channel.events).await,
        InstanceEvent::InstanceStarted
    );
    let payload = collect_payload(&mut channel.events, 5, 11).await;
    assert_eq!(payload, b"first bytes");
}

#[tokio::test]
async fn test_payload_flushed_on_disconnect() {
    let mut channel = start_channel(true);

    let mut frame = encode_frame(&Handshake::new(CHANNEL, ConnectionType::Reconnect, 3));
    frame.extend_from_slice(b"parting words");

    let mut stream = tokio::net::UnixStream::connect(&channel.socket).await.unwrap();
    stream.write_all(&frame).await.unwrap();
    drop(stream);

    let payload = collect_payload(&mut channel.events, 3, 13).await;
    assert_eq!(payload, b"parting words");
}

#[tokio::test]
async fn test_tampered_checksum_closes_socket_without_events() {
    let mut channel = start_channel(true);

    let mut frame = encode_frame(&Handshake::new(CHANNEL, ConnectionType::NewInstance, 1));
    let last = frame.len() - 1;
    frame[last] ^= 0xff;

    let mut stream = tokio::net::UnixStream::connect(&channel.socket).await.unwrap();
    stream.write_all(&frame).await.unwrap();

    // Server closes its end; our read hits EOF
    let mut buf = [0_u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server did not close the socket")
        .unwrap();
    assert_eq!(n, 0);

    expect_no_event(&mut channel.events).await;
}

#[tokio::test]
async fn test_foreign_channel_name_closes_socket_without_events() {
    let mut channel = start_channel(true);

    let frame = encode_frame(&Handshake::new(
        "someOtherChannelName",
        ConnectionType::NewInstance,
        1,
    ));

    let mut stream = tokio::net::UnixStream::connect(&channel.socket).await.unwrap();
    stream.write_all(&frame).await.unwrap();

    let mut buf = [0_u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server did not close the socket")
        .unwrap();
    assert_eq!(n, 0);

    expect_no_event(&mut channel.events).await;
}

#[tokio::test]
async fn test_oversized_length_prefix_closes_socket() {
    let mut channel = start_channel(true);

    let mut stream = tokio::net::UnixStream::connect(&channel.socket).await.unwrap();
    stream.write_all(&u64::MAX.to_be_bytes()).await.unwrap();

    let mut buf = [0_u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server did not close the socket")
        .unwrap();
    assert_eq!(n, 0);

    expect_no_event(&mut channel.events).await;
}

#[tokio::test]
async fn test_rejected_connection_does_not_disturb_valid_one() {
    let mut channel = start_channel(true);

    // A hostile peer fails its handshake
    let mut bad = encode_frame(&Handshake::new(CHANNEL, ConnectionType::NewInstance, 1));
    bad[9] ^= 0x55;
    let mut hostile = tokio::net::UnixStream::connect(&channel.socket).await.unwrap();
    hostile.write_all(&bad).await.unwrap();

    // A well-behaved secondary still gets through
    let mut client = ChannelClient::new(CHANNEL, &channel.socket, 4);
    assert!(client.send_payload(b"still here", DEADLINE).await);

    let payload = collect_payload(&mut channel.events, 4, 10).await;
    assert_eq!(payload, b"still here");
}
