//! Verifies the `WaitingConfigure -> Open` transition (spec §4.1, §4.3):
//! a valid `CONFIGURE` frame is answered with exactly one
//! `CONFIRM_CONFIGURE` carrying a 16-byte broadcaster nonce.

use std::sync::Arc;

use broadcast_protocol::{b2s, s2b, MessageDirection};
use broadcast_test_support::{duplex_pair, StubAuthSigner, StubAuthVerifier, StubDeliveryFanout, StubDictionaryProvider, StubFanoutHub};
use broadcaster_session::session::{run_session, Collaborators, Session};
use broadcaster_session::BroadcasterConfig;

fn collaborators() -> Collaborators {
    Collaborators {
        auth_verifier: Arc::new(StubAuthVerifier::allow_all()),
        auth_signer: Arc::new(StubAuthSigner::never_signs()),
        fanout_hub: Arc::new(StubFanoutHub::default()),
        delivery_fanout: Arc::new(StubDeliveryFanout::default()),
        dictionary_provider: Arc::new(StubDictionaryProvider::new()),
    }
}

fn configure_frame(enable_zstd: bool, enable_training: bool) -> broadcast_protocol::Frame {
    let mut frame = broadcast_protocol::Frame::new(s2b::CONFIGURE);
    frame.headers.insert("x-subscriber-nonce", vec![7u8; 32]);
    frame.headers.insert("x-enable-zstd", broadcast_protocol::encode_min_uint(enable_zstd as u64));
    frame.headers.insert("x-enable-training", broadcast_protocol::encode_min_uint(enable_training as u64));
    frame.headers.insert("x-initial-dict", broadcast_protocol::encode_min_uint(0));
    frame
}

#[tokio::test]
async fn configure_is_confirmed_with_broadcaster_nonce() {
    let (mut client_side, session_side) = duplex_pair();
    let session = Session::new(BroadcasterConfig::default(), None);

    let handle = tokio::spawn(run_session(session, session_side, collaborators()));

    let frame = configure_frame(true, false);
    let encoded = broadcast_protocol::encode(&frame, MessageDirection::SubscriberToBroadcaster).unwrap();
    futures_util::SinkExt::send(&mut client_side, encoded).await.unwrap();

    let reply = futures_util::StreamExt::next(&mut client_side).await.unwrap().unwrap();
    let decoded = broadcast_protocol::decode(&reply, MessageDirection::BroadcasterToSubscriber).unwrap();

    assert_eq!(decoded.msg_type, b2s::CONFIRM_CONFIGURE);
    let nonce = decoded.headers.get("x-broadcaster-nonce").expect("broadcaster nonce header");
    assert_eq!(nonce.len(), 16);

    drop(client_side);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
}

#[tokio::test]
async fn training_without_zstd_is_rejected() {
    let (mut client_side, session_side) = duplex_pair();
    let session = Session::new(BroadcasterConfig::default(), None);

    let handle = tokio::spawn(run_session(session, session_side, collaborators()));

    let frame = configure_frame(false, true);
    let encoded = broadcast_protocol::encode(&frame, MessageDirection::SubscriberToBroadcaster).unwrap();
    futures_util::SinkExt::send(&mut client_side, encoded).await.unwrap();

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.unwrap().unwrap();
    assert!(outcome.is_err(), "enable_training without enable_zstd must fail the session");
}

#[tokio::test]
async fn non_configure_first_frame_is_rejected() {
    let (mut client_side, session_side) = duplex_pair();
    let session = Session::new(BroadcasterConfig::default(), None);

    let handle = tokio::spawn(run_session(session, session_side, collaborators()));

    let mut frame = broadcast_protocol::Frame::new(s2b::CONFIRM_RECEIVE);
    frame.headers.insert("x-identifier", b"n-1".to_vec());
    let encoded = broadcast_protocol::encode(&frame, MessageDirection::SubscriberToBroadcaster).unwrap();
    futures_util::SinkExt::send(&mut client_side, encoded).await.unwrap();

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.unwrap().unwrap();
    assert!(outcome.is_err());
}
