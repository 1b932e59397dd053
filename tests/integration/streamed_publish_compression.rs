//! Streamed publish with compression (spec §8 scenario 3): a multi-part
//! `NOTIFY_STREAM` compressed with the standard (no-dictionary) zstd
//! compressor reassembles into one decompressed payload with a matching
//! SHA-512, and the peer is acked with exactly one `CONTINUE_NOTIFY` per
//! non-final part and one `CONFIRM_NOTIFY` at the end.

use std::sync::Arc;

use broadcast_protocol::{b2s, s2b};
use broadcast_test_support::{StubAuthSigner, StubAuthVerifier, StubDeliveryFanout, StubDictionaryProvider, StubFanoutHub};
use broadcaster_session::session::{ingress, promote_ready_compressors, Collaborators, Session, SessionPhase};
use broadcaster_session::BroadcasterConfig;
use sha2::{Digest, Sha512};

fn collaborators() -> (Collaborators, Arc<StubDeliveryFanout>) {
    let delivery = Arc::new(StubDeliveryFanout::default());
    (
        Collaborators {
            auth_verifier: Arc::new(StubAuthVerifier::allow_all()),
            auth_signer: Arc::new(StubAuthSigner::never_signs()),
            fanout_hub: Arc::new(StubFanoutHub::default()),
            delivery_fanout: delivery.clone(),
            dictionary_provider: Arc::new(StubDictionaryProvider::new()),
        },
        delivery,
    )
}

async fn configured_session_with_zstd(collaborators: &Collaborators) -> Session {
    let mut session = Session::new(BroadcasterConfig::default(), None);
    session.phase = SessionPhase::WaitingConfigure;
    let mut configure = broadcast_protocol::Frame::new(s2b::CONFIGURE);
    configure.headers.insert("x-subscriber-nonce", vec![2u8; 32]);
    configure.headers.insert("x-enable-zstd", broadcast_protocol::encode_min_uint(1));
    configure.headers.insert("x-enable-training", broadcast_protocol::encode_min_uint(0));
    configure.headers.insert("x-initial-dict", broadcast_protocol::encode_min_uint(0));
    ingress::dispatch(&mut session, collaborators, configure).await.unwrap();
    // The standard compressor prepares in the background; give its task a
    // chance to run and promote it the same way the Open-state loop would
    // on its first iteration, since this test drives `ingress`/`egress`
    // directly rather than running that loop.
    tokio::task::yield_now().await;
    promote_ready_compressors(&mut session).await.unwrap();
    session.pending_sends.clear();
    session
}

#[tokio::test]
async fn multi_part_compressed_notify_reassembles() {
    let (collaborators, delivery) = collaborators();
    let mut session = configured_session_with_zstd(&collaborators).await;

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let compressed = zstd::stream::encode_all(&payload[..], 3).unwrap();
    let compressed_sha512: [u8; 64] = Sha512::digest(&compressed).into();

    let identifier = b"stream-1".to_vec();
    let mid = compressed.len() / 2;
    let (first_half, second_half) = compressed.split_at(mid);

    let mut part0 = broadcast_protocol::Frame::new(s2b::NOTIFY_STREAM);
    part0.headers.insert("authorization", b"tok".to_vec());
    part0.headers.insert("x-identifier", identifier.clone());
    part0.headers.insert("x-part-id", broadcast_protocol::encode_min_uint(0));
    part0.headers.insert("x-topic", b"uploads".to_vec());
    part0.headers.insert("x-compressor", broadcast_protocol::encode_min_uint(1));
    part0.headers.insert("x-compressed-length", broadcast_protocol::encode_min_uint(compressed.len() as u64));
    part0.headers.insert("x-decompressed-length", broadcast_protocol::encode_min_uint(payload.len() as u64));
    part0.headers.insert("x-compressed-sha512", compressed_sha512.to_vec());
    part0.body = first_half.to_vec();

    ingress::dispatch(&mut session, &collaborators, part0).await.unwrap();
    let continue_notify = session.pending_sends.pop_front().expect("CONTINUE_NOTIFY queued after non-final part");
    assert_eq!(continue_notify.msg_type, b2s::CONTINUE_NOTIFY);
    assert_eq!(continue_notify.headers.get("x-part-id"), Some(broadcast_protocol::encode_min_uint(0).as_slice()));
    assert!(session.incoming_notification.is_some());

    let mut part1 = broadcast_protocol::Frame::new(s2b::NOTIFY_STREAM);
    part1.headers.insert("authorization", b"tok".to_vec());
    part1.headers.insert("x-identifier", identifier.clone());
    part1.headers.insert("x-part-id", broadcast_protocol::encode_min_uint(1));
    part1.body = second_half.to_vec();

    ingress::dispatch(&mut session, &collaborators, part1).await.unwrap();
    assert!(session.incoming_notification.is_none());

    let confirm = session.pending_sends.pop_front().expect("CONFIRM_NOTIFY queued after final part");
    assert_eq!(confirm.msg_type, b2s::CONFIRM_NOTIFY);
    assert_eq!(confirm.headers.get("x-identifier"), Some(identifier.as_slice()));

    let delivered = delivery.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, b"uploads".to_vec());
    assert_eq!(delivered[0].1, payload);
}

#[tokio::test]
async fn out_of_order_part_is_rejected() {
    let (collaborators, _delivery) = collaborators();
    let mut session = configured_session_with_zstd(&collaborators).await;

    let mut part0 = broadcast_protocol::Frame::new(s2b::NOTIFY_STREAM);
    part0.headers.insert("authorization", b"tok".to_vec());
    part0.headers.insert("x-identifier", b"stream-2".to_vec());
    part0.headers.insert("x-part-id", broadcast_protocol::encode_min_uint(0));
    part0.headers.insert("x-topic", b"uploads".to_vec());
    part0.headers.insert("x-compressor", broadcast_protocol::encode_min_uint(0));
    part0.headers.insert("x-compressed-length", broadcast_protocol::encode_min_uint(20));
    part0.headers.insert("x-decompressed-length", broadcast_protocol::encode_min_uint(20));
    part0.headers.insert("x-compressed-sha512", Sha512::digest(b"0123456789abcdefghij").to_vec());
    part0.body = b"0123456789".to_vec();
    ingress::dispatch(&mut session, &collaborators, part0).await.unwrap();

    let mut bad_part = broadcast_protocol::Frame::new(s2b::NOTIFY_STREAM);
    bad_part.headers.insert("authorization", b"tok".to_vec());
    bad_part.headers.insert("x-identifier", b"stream-2".to_vec());
    bad_part.headers.insert("x-part-id", broadcast_protocol::encode_min_uint(2));
    bad_part.body = b"abcdefghij".to_vec();

    let err = ingress::dispatch(&mut session, &collaborators, bad_part).await;
    assert!(err.is_err());
}
