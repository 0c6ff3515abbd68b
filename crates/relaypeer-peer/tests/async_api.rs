#![cfg(feature = "async")]

mod common;

use std::io::Cursor;
use std::time::Duration;

use common::{session, session_with_config, wait_until, SharedBuffer};
use relaypeer_peer::{PeerError, SessionConfig};
use relaypeer_relay::MemoryRelay;

#[tokio::test]
async fn add_target_async_binds_both_sides() {
    let relay = MemoryRelay::new();
    let a = session(&relay, "A");
    let b = session(&relay, "B");
    b.messaging().on_target_added(|_| Ok(()));

    a.add_target_async("B").await.expect("B should accept");
    assert!(a.messaging().has_target("B"));
    assert!(b.messaging().has_target("A"));
}

#[tokio::test]
async fn add_target_async_without_handler_is_unavailable() {
    let relay = MemoryRelay::new();
    let a = session(&relay, "A");
    let _b = session(&relay, "B");

    assert!(matches!(
        a.add_target_async("B").await,
        Err(PeerError::TargetUnavailable(_))
    ));
}

#[tokio::test]
async fn client_list_async_matches_blocking() {
    let relay = MemoryRelay::new();
    let a = session(&relay, "A");
    let _b = session(&relay, "B");

    let listed = a.client_list_async().await.expect("relay should answer");
    assert_eq!(listed, a.client_list().expect("relay should answer"));
}

#[tokio::test]
async fn open_stream_async_carries_data() {
    let relay = MemoryRelay::new();
    let config = SessionConfig::default().with_chunk_size(16);
    let a = session_with_config(&relay, "A", config.clone());
    let b = session_with_config(&relay, "B", config);
    let buffer = SharedBuffer::default();
    let sink = buffer.clone();
    b.multiplexer().on_stream_requested(move |duplex| {
        duplex.attach_output(sink.clone());
        Ok(())
    });

    let stream = a
        .multiplexer()
        .open_stream_async("B")
        .await
        .expect("stream should open");
    stream
        .set_input(Cursor::new(vec![7u8; 100]))
        .expect("input should attach");
    assert!(wait_until(|| buffer.len() == 100));
}

#[tokio::test]
async fn async_request_times_out() {
    let relay = MemoryRelay::new();
    let config = SessionConfig::default().with_request_timeout(Some(Duration::from_millis(50)));
    let a = session_with_config(&relay, "A", config);
    let b = session(&relay, "B");
    b.messaging().on_target_added(|_| {
        std::thread::sleep(Duration::from_millis(300));
        Ok(())
    });

    assert!(matches!(
        a.add_target_async("B").await,
        Err(PeerError::Timeout(_))
    ));
    assert!(!a.messaging().has_target("B"));
    std::thread::sleep(Duration::from_millis(400));
    assert!(wait_until(|| !b.messaging().has_target("A")));
}
