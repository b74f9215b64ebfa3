use std::io::Cursor;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use buildfarm::config::ProtocolConfig;
use buildfarm::error::{BuildfarmError, ProtocolError};
use buildfarm::protocol::codec::{self, Header};
use buildfarm::protocol::file::{receive_file, receive_file_into, send_file, send_file_from};
use buildfarm::protocol::{Checksum, Messenger, MessageType, HEADER_LEN};

const CHUNK: usize = 16 * 1024;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Sample {
    name: String,
    count: u32,
}

// =============================================================================
// File transfer
// =============================================================================

#[tokio::test]
async fn test_file_round_trip_at_chunk_boundaries() {
    for len in [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, 10 * CHUNK + 7] {
        let data = pattern(len);
        let mut wire = Vec::new();
        let sent = send_file_from(&mut wire, &mut data.as_slice(), len as u64, CHUNK)
            .await
            .unwrap();
        assert_eq!(wire.len(), HEADER_LEN + len + 4, "len {}", len);

        let mut received = Vec::new();
        let bytes = receive_file_into(&mut wire.as_slice(), &mut received, CHUNK)
            .await
            .unwrap();
        assert_eq!(bytes, len as u64);
        assert_eq!(received, data, "len {}", len);

        let mut checksum = Checksum::new();
        checksum.update(&data);
        assert_eq!(sent, checksum.value());
    }
}

#[tokio::test]
async fn test_flipped_byte_is_an_integrity_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("image.sif");
    let dest = dir.path().join("received.sif");
    let data = pattern(3 * CHUNK + 11);
    tokio::fs::write(&source, &data).await.unwrap();

    let mut wire = Vec::new();
    send_file(&mut wire, &source, CHUNK).await.unwrap();
    wire[HEADER_LEN + 2 * CHUNK] ^= 0x40;

    let err = receive_file(&mut wire.as_slice(), &dest, CHUNK)
        .await
        .unwrap_err();
    assert!(matches!(err, BuildfarmError::Integrity { .. }), "{:?}", err);
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_truncated_file_removes_destination() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("partial.img");
    let data = pattern(CHUNK + 5);

    let mut wire = Vec::new();
    send_file_from(&mut wire, &mut data.as_slice(), data.len() as u64, CHUNK)
        .await
        .unwrap();
    wire.truncate(HEADER_LEN + CHUNK);

    let err = receive_file(&mut wire.as_slice(), &dest, CHUNK)
        .await
        .unwrap_err();
    assert!(err.is_connection_fault());
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_file_over_duplex_with_small_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("recipe.def");
    let dest = dir.path().join("copy.def");
    let data = pattern(100_003);
    tokio::fs::write(&source, &data).await.unwrap();

    let (mut a, mut b) = tokio::io::duplex(1024);
    let sender = tokio::spawn(async move { send_file(&mut a, &source, 777).await });
    let bytes = receive_file(&mut b, &dest, 500).await.unwrap();

    assert_eq!(sender.await.unwrap().unwrap(), data.len() as u64);
    assert_eq!(bytes, data.len() as u64);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), data);
}

#[tokio::test]
async fn test_error_frame_instead_of_file() {
    let mut wire = Vec::new();
    codec::send_error(&mut wire, "build failed").await.unwrap();

    let mut sink = Vec::new();
    let err = receive_file_into(&mut wire.as_slice(), &mut sink, CHUNK)
        .await
        .unwrap_err();
    match err {
        BuildfarmError::Protocol(ProtocolError::Remote(msg)) => assert_eq!(msg, "build failed"),
        other => panic!("unexpected error: {:?}", other),
    }
}

// =============================================================================
// Framing
// =============================================================================

#[tokio::test]
async fn test_string_and_record_round_trip() {
    let (a, b) = tokio::io::duplex(4096);
    let mut left = Messenger::new(a, ProtocolConfig::default());
    let mut right = Messenger::new(b, ProtocolConfig::default());

    left.send_string("checkout_builder_request").await.unwrap();
    left.send_string("").await.unwrap();
    left.send_record(&Sample {
        name: "vm-1".to_string(),
        count: 3,
    })
    .await
    .unwrap();

    assert_eq!(right.receive_string().await.unwrap(), "checkout_builder_request");
    assert_eq!(right.receive_string().await.unwrap(), "");
    assert_eq!(
        right.receive_record::<Sample>().await.unwrap(),
        Sample {
            name: "vm-1".to_string(),
            count: 3
        }
    );
}

#[tokio::test]
async fn test_heartbeats_are_skipped() {
    let mut wire = Vec::new();
    codec::send_heartbeat(&mut wire).await.unwrap();
    codec::send_heartbeat(&mut wire).await.unwrap();
    codec::send_string(&mut wire, "line").await.unwrap();
    assert_eq!(wire.len(), 3 * HEADER_LEN + 4);

    let mut messenger = Messenger::new(Cursor::new(wire), ProtocolConfig::default());
    assert_eq!(messenger.receive_string().await.unwrap(), "line");
}

#[tokio::test]
async fn test_type_mismatch() {
    let mut wire = Vec::new();
    codec::send_string(&mut wire, "not a record").await.unwrap();

    let mut messenger = Messenger::new(Cursor::new(wire), ProtocolConfig::default());
    let err = messenger.receive_record::<Sample>().await.unwrap_err();
    assert!(matches!(
        err,
        BuildfarmError::Protocol(ProtocolError::TypeMismatch {
            expected: MessageType::Record,
            actual: MessageType::String,
        })
    ));
}

#[tokio::test]
async fn test_remote_error_surfaces_message() {
    let mut wire = Vec::new();
    codec::send_error(&mut wire, "unknown request 'hello'")
        .await
        .unwrap();

    let mut messenger = Messenger::new(Cursor::new(wire), ProtocolConfig::default());
    match messenger.receive_string().await.unwrap_err() {
        BuildfarmError::Protocol(ProtocolError::Remote(msg)) => {
            assert_eq!(msg, "unknown request 'hello'")
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_oversized_body_rejected_before_reading() {
    let config = ProtocolConfig {
        max_message_size: 16,
        ..ProtocolConfig::default()
    };
    let mut wire = Vec::new();
    codec::send_string(&mut wire, &"x".repeat(17)).await.unwrap();

    let mut messenger = Messenger::new(Cursor::new(wire), config);
    assert!(matches!(
        messenger.receive_string().await.unwrap_err(),
        BuildfarmError::Protocol(ProtocolError::Oversized { size: 17, limit: 16 })
    ));
}

#[tokio::test]
async fn test_unknown_type_tag() {
    let mut header = Header::new(0, MessageType::String).encode();
    header[8] = 9;
    let mut messenger = Messenger::new(Cursor::new(header.to_vec()), ProtocolConfig::default());
    assert!(matches!(
        messenger.receive_string().await.unwrap_err(),
        BuildfarmError::Protocol(ProtocolError::UnknownType(9))
    ));
}

#[tokio::test]
async fn test_peer_closing_mid_frame_is_a_connection_fault() {
    let (mut a, b) = tokio::io::duplex(1024);
    a.write_all(&Header::new(100, MessageType::String).encode())
        .await
        .unwrap();
    a.write_all(b"partial").await.unwrap();
    drop(a);

    let mut messenger = Messenger::new(b, ProtocolConfig::default());
    let err = messenger.receive_string().await.unwrap_err();
    assert!(err.is_connection_fault(), "{:?}", err);
}

#[tokio::test]
async fn test_header_is_nine_bytes_on_the_wire() {
    let (mut a, mut b) = tokio::io::duplex(64);
    codec::send_string(&mut a, "hi").await.unwrap();
    let mut bytes = [0u8; 11];
    b.read_exact(&mut bytes).await.unwrap();
    assert_eq!(&bytes[..9], &[0, 0, 0, 0, 0, 0, 0, 2, 0]);
    assert_eq!(&bytes[9..], b"hi");
}
