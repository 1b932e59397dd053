//! Dictionary training (spec §8 scenario 4): feeding enough small eligible
//! messages past the low watermark trains and announces a dictionary with
//! the first trained ID, 65 536.

use std::sync::Arc;

use broadcast_protocol::{b2s, s2b};
use broadcast_test_support::{StubAuthSigner, StubAuthVerifier, StubDeliveryFanout, StubDictionaryProvider, StubFanoutHub};
use broadcaster_session::compression::{CompressorSlot, FIRST_TRAINED_ID};
use broadcaster_session::session::{egress, ingress, Collaborators, FanoutItem, Session, SessionPhase};
use broadcaster_session::BroadcasterConfig;
use sha2::{Digest, Sha512};

fn test_config() -> BroadcasterConfig {
    BroadcasterConfig {
        compression_min_size: 32,
        compression_trained_max_size: 16_384,
        compression_training_low_watermark: 100_000,
        compression_training_high_watermark: 10_000_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn low_watermark_trains_and_announces_first_dictionary() {
    let dictionary_provider = Arc::new(StubDictionaryProvider::new());
    let collaborators = Collaborators {
        auth_verifier: Arc::new(StubAuthVerifier::allow_all()),
        auth_signer: Arc::new(StubAuthSigner::never_signs()),
        fanout_hub: Arc::new(StubFanoutHub::default()),
        delivery_fanout: Arc::new(StubDeliveryFanout::default()),
        dictionary_provider: dictionary_provider.clone(),
    };

    let mut session = Session::new(test_config(), None);
    session.phase = SessionPhase::WaitingConfigure;
    let mut configure = broadcast_protocol::Frame::new(s2b::CONFIGURE);
    configure.headers.insert("x-subscriber-nonce", vec![3u8; 32]);
    configure.headers.insert("x-enable-zstd", broadcast_protocol::encode_min_uint(1));
    configure.headers.insert("x-enable-training", broadcast_protocol::encode_min_uint(1));
    configure.headers.insert("x-initial-dict", broadcast_protocol::encode_min_uint(0));
    ingress::dispatch(&mut session, &collaborators, configure).await.unwrap();
    session.pending_sends.clear();

    // 3000 messages averaging 40 bytes = 120 KiB, past the 100_000-byte
    // low watermark (spec §8 scenario 4).
    for i in 0..3_000u32 {
        let payload: Vec<u8> = (0..40).map(|j| ((i + j) % 251) as u8).collect();
        let sha512: [u8; 64] = Sha512::digest(&payload).into();
        egress::process_fanout_item(
            &mut session,
            &collaborators,
            FanoutItem::Small { topic: b"metrics".to_vec(), sha512, bytes: payload },
        )
        .await
        .unwrap();
        // Discard the RECEIVE_STREAM frames this produces; the test only
        // cares about the training side effect.
        session.pending_sends.retain(|p| p.msg_type != b2s::RECEIVE_STREAM);
    }

    assert_eq!(dictionary_provider.trainings_run(), 1);

    let announcement = session
        .pending_sends
        .iter()
        .find(|p| p.msg_type == b2s::ENABLE_ZSTD_CUSTOM)
        .expect("ENABLE_ZSTD_CUSTOM queued after training completes");
    assert_eq!(announcement.headers.get("x-identifier"), Some(broadcast_protocol::encode_min_uint(FIRST_TRAINED_ID).as_slice()));

    match &session.compression.active {
        Some(CompressorSlot::Ready(dict)) => assert_eq!(dict.id, FIRST_TRAINED_ID),
        _ => panic!("expected active compressor slot to hold the trained dictionary"),
    }
}
