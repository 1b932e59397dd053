//! Protocol-violation paths that must terminate the session (spec §7):
//! duplicate `CONFIGURE`, a `NOTIFY` naming an unknown compressor, a
//! `NOTIFY` whose declared hash doesn't match its body, and an
//! unexpected `CONFIRM_RECEIVE`.

use std::sync::Arc;

use broadcast_protocol::s2b;
use broadcast_test_support::{StubAuthSigner, StubAuthVerifier, StubDeliveryFanout, StubDictionaryProvider, StubFanoutHub};
use broadcaster_session::session::{ingress, Collaborators, ExpectedAck, Session, SessionPhase};
use broadcaster_session::BroadcasterConfig;
use sha2::{Digest, Sha512};

fn collaborators() -> Collaborators {
    Collaborators {
        auth_verifier: Arc::new(StubAuthVerifier::allow_all()),
        auth_signer: Arc::new(StubAuthSigner::never_signs()),
        fanout_hub: Arc::new(StubFanoutHub::default()),
        delivery_fanout: Arc::new(StubDeliveryFanout::default()),
        dictionary_provider: Arc::new(StubDictionaryProvider::new()),
    }
}

fn configure_frame() -> broadcast_protocol::Frame {
    let mut frame = broadcast_protocol::Frame::new(s2b::CONFIGURE);
    frame.headers.insert("x-subscriber-nonce", vec![4u8; 32]);
    frame.headers.insert("x-enable-zstd", broadcast_protocol::encode_min_uint(0));
    frame.headers.insert("x-enable-training", broadcast_protocol::encode_min_uint(0));
    frame.headers.insert("x-initial-dict", broadcast_protocol::encode_min_uint(0));
    frame
}

#[tokio::test]
async fn duplicate_configure_in_open_is_rejected() {
    let collaborators = collaborators();
    let mut session = Session::new(BroadcasterConfig::default(), None);
    session.phase = SessionPhase::WaitingConfigure;
    ingress::dispatch(&mut session, &collaborators, configure_frame()).await.unwrap();
    assert_eq!(session.phase, SessionPhase::Open);

    let err = ingress::dispatch(&mut session, &collaborators, configure_frame()).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn notify_with_unknown_compressor_is_rejected() {
    let collaborators = collaborators();
    let mut session = Session::new(BroadcasterConfig::default(), None);
    session.phase = SessionPhase::WaitingConfigure;
    let mut configure = configure_frame();
    configure.headers.insert("x-enable-zstd", broadcast_protocol::encode_min_uint(1));
    ingress::dispatch(&mut session, &collaborators, configure).await.unwrap();

    let body = b"payload".to_vec();
    let sha512: [u8; 64] = Sha512::digest(&body).into();
    let mut notify = broadcast_protocol::Frame::new(s2b::NOTIFY);
    notify.headers.insert("authorization", b"tok".to_vec());
    notify.headers.insert("x-topic", b"room/1".to_vec());
    notify.headers.insert("x-identifier", b"n-1".to_vec());
    notify.headers.insert("x-compressor", broadcast_protocol::encode_min_uint(99));
    notify.headers.insert("x-compressed-length", broadcast_protocol::encode_min_uint(body.len() as u64));
    notify.headers.insert("x-decompressed-length", broadcast_protocol::encode_min_uint(body.len() as u64));
    notify.headers.insert("x-compressed-sha512", sha512.to_vec());
    notify.body = body;

    let err = ingress::dispatch(&mut session, &collaborators, notify).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn notify_with_mismatched_hash_is_rejected() {
    let collaborators = collaborators();
    let mut session = Session::new(BroadcasterConfig::default(), None);
    session.phase = SessionPhase::WaitingConfigure;
    ingress::dispatch(&mut session, &collaborators, configure_frame()).await.unwrap();

    let body = b"payload".to_vec();
    let wrong_sha512 = [0u8; 64];
    let mut notify = broadcast_protocol::Frame::new(s2b::NOTIFY);
    notify.headers.insert("authorization", b"tok".to_vec());
    notify.headers.insert("x-topic", b"room/1".to_vec());
    notify.headers.insert("x-identifier", b"n-1".to_vec());
    notify.headers.insert("x-compressor", broadcast_protocol::encode_min_uint(0));
    notify.headers.insert("x-compressed-length", broadcast_protocol::encode_min_uint(body.len() as u64));
    notify.headers.insert("x-decompressed-length", broadcast_protocol::encode_min_uint(body.len() as u64));
    notify.headers.insert("x-compressed-sha512", wrong_sha512.to_vec());
    notify.body = body;

    let err = ingress::dispatch(&mut session, &collaborators, notify).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn unexpected_confirm_receive_is_rejected() {
    let collaborators = collaborators();
    let mut session = Session::new(BroadcasterConfig::default(), None);
    session.phase = SessionPhase::WaitingConfigure;
    ingress::dispatch(&mut session, &collaborators, configure_frame()).await.unwrap();

    let mut confirm = broadcast_protocol::Frame::new(s2b::CONFIRM_RECEIVE);
    confirm.headers.insert("x-identifier", b"never-sent".to_vec());
    let err = ingress::dispatch(&mut session, &collaborators, confirm).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn matching_confirm_receive_pops_the_expected_ack() {
    let collaborators = collaborators();
    let mut session = Session::new(BroadcasterConfig::default(), None);
    session.phase = SessionPhase::WaitingConfigure;
    ingress::dispatch(&mut session, &collaborators, configure_frame()).await.unwrap();

    session.expecting_acks.push_back(ExpectedAck::ConfirmReceive { identifier: b"n-1".to_vec() });

    let mut confirm = broadcast_protocol::Frame::new(s2b::CONFIRM_RECEIVE);
    confirm.headers.insert("x-identifier", b"n-1".to_vec());
    ingress::dispatch(&mut session, &collaborators, confirm).await.unwrap();
    assert!(session.expecting_acks.is_empty());
}
