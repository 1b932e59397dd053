//! Subscribe, then receive a small fanout-delivered notification (spec
//! §8 scenario 2). Drives the ingress/egress pipelines directly against a
//! `Session` rather than through a transport, so the assertions are about
//! queued frames rather than wire bytes.

use std::sync::Arc;

use broadcast_protocol::{b2s, s2b};
use broadcast_test_support::{StubAuthSigner, StubAuthVerifier, StubDeliveryFanout, StubDictionaryProvider, StubFanoutHub};
use broadcaster_session::session::{egress, ingress, Collaborators, FanoutItem, Session, SessionPhase};
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

async fn configured_session(collaborators: &Collaborators) -> Session {
    let mut session = Session::new(BroadcasterConfig::default(), None);
    session.phase = SessionPhase::WaitingConfigure;

    let mut configure = broadcast_protocol::Frame::new(s2b::CONFIGURE);
    configure.headers.insert("x-subscriber-nonce", vec![1u8; 32]);
    configure.headers.insert("x-enable-zstd", broadcast_protocol::encode_min_uint(0));
    configure.headers.insert("x-enable-training", broadcast_protocol::encode_min_uint(0));
    configure.headers.insert("x-initial-dict", broadcast_protocol::encode_min_uint(0));
    ingress::dispatch(&mut session, collaborators, configure).await.unwrap();
    session.pending_sends.clear();
    session
}

#[tokio::test]
async fn subscribe_then_receive_small_message() {
    let collaborators = collaborators();
    let mut session = configured_session(&collaborators).await;

    let mut subscribe = broadcast_protocol::Frame::new(s2b::SUBSCRIBE_EXACT);
    subscribe.headers.insert("authorization", b"tok".to_vec());
    subscribe.headers.insert("x-topic", b"room/1".to_vec());
    ingress::dispatch(&mut session, &collaborators, subscribe).await.unwrap();

    assert!(session.exact_subscriptions.contains(b"room/1".as_slice()));
    let confirm = session.pending_sends.pop_front().expect("confirm subscribe queued");
    assert_eq!(confirm.msg_type, b2s::CONFIRM_SUBSCRIBE_EXACT);
    assert_eq!(confirm.headers.get("x-topic"), Some(b"room/1".as_slice()));
    assert!(session.pending_sends.is_empty());

    let payload = b"hello".to_vec();
    let sha512: [u8; 64] = Sha512::digest(&payload).into();
    egress::process_fanout_item(
        &mut session,
        &collaborators,
        FanoutItem::Small { topic: b"room/1".to_vec(), sha512, bytes: payload.clone() },
    )
    .await
    .unwrap();

    let sent = session.pending_sends.pop_front().expect("receive_stream queued");
    assert_eq!(sent.msg_type, b2s::RECEIVE_STREAM);
    assert_eq!(sent.body, payload);
    assert_eq!(sent.headers.get("x-topic"), Some(b"room/1".as_slice()));
    assert_eq!(sent.headers.get("x-compressor"), Some(broadcast_protocol::encode_min_uint(0).as_slice()));
    assert_eq!(sent.headers.get("x-compressed-sha512"), Some(sha512.as_slice()));
    assert!(session.pending_sends.is_empty());
    assert_eq!(session.expecting_acks.len(), 1);
}

#[tokio::test]
async fn duplicate_subscribe_is_rejected() {
    let collaborators = collaborators();
    let mut session = configured_session(&collaborators).await;

    let mut subscribe = broadcast_protocol::Frame::new(s2b::SUBSCRIBE_EXACT);
    subscribe.headers.insert("authorization", b"tok".to_vec());
    subscribe.headers.insert("x-topic", b"room/1".to_vec());
    ingress::dispatch(&mut session, &collaborators, subscribe.clone()).await.unwrap();

    let err = ingress::dispatch(&mut session, &collaborators, subscribe).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn unauthorized_subscribe_is_rejected() {
    let collaborators = Collaborators {
        auth_verifier: Arc::new(StubAuthVerifier::deny_all()),
        auth_signer: Arc::new(StubAuthSigner::never_signs()),
        fanout_hub: Arc::new(StubFanoutHub::default()),
        delivery_fanout: Arc::new(StubDeliveryFanout::default()),
        dictionary_provider: Arc::new(StubDictionaryProvider::new()),
    };
    let mut session = configured_session(&collaborators).await;

    let mut subscribe = broadcast_protocol::Frame::new(s2b::SUBSCRIBE_EXACT);
    subscribe.headers.insert("authorization", b"tok".to_vec());
    subscribe.headers.insert("x-topic", b"room/1".to_vec());
    let err = ingress::dispatch(&mut session, &collaborators, subscribe).await;
    assert!(err.is_err());
    assert!(session.exact_subscriptions.is_empty());
}
