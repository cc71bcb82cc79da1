use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use meshvault_core::{build_onion, relay, select_path, FinalEnvelope, NodeIdentity, PeerDirectory, PeerRecord, RelayOutcome};
use meshvault_core::mix::FinalEnvelopeKind;

fn peer_record(identity: &NodeIdentity, addr: &str) -> PeerRecord {
    PeerRecord {
        node_id: identity.node_id(),
        address: addr.parse().unwrap(),
        api_port: addr.parse::<std::net::SocketAddr>().unwrap().port(),
        hostname: "host".to_string(),
        last_seen: 1,
        mix_public_key: identity.mix_public_key(),
    }
}

#[tokio::test]
async fn onion_round_trip_delivers_plaintext_without_intermediate_exposure() {
    let a = NodeIdentity::generate();
    let b = NodeIdentity::generate();
    let c = NodeIdentity::generate();

    let directory = PeerDirectory::new();
    directory.upsert(peer_record(&b, "127.0.0.1:9001"));
    directory.upsert(peer_record(&c, "127.0.0.1:9002"));

    let path = select_path(&directory, &a.node_id(), &c.node_id(), 3).unwrap();
    assert_eq!(path.len(), 2);
    assert_eq!(path[0].node_id, b.node_id());
    assert_eq!(path[1].node_id, c.node_id());

    let envelope = FinalEnvelope {
        kind: FinalEnvelopeKind::Text,
        sender_id: a.node_id(),
        receiver_id: c.node_id(),
        msg_id: "msg-ping".to_string(),
        name: None,
        data_b64: STANDARD.encode(b"ping"),
    };

    let packet = build_onion(&path, &envelope, path.len() as u8).unwrap();

    let at_b = relay(&packet, &b.mix_secret).unwrap();
    let forwarded = match at_b {
        RelayOutcome::Forward { next, packet } => {
            assert_eq!(next, path[1].address);
            packet
        }
        other => panic!("expected forward at B, got {other:?}"),
    };

    let at_c = relay(&forwarded, &c.mix_secret).unwrap();
    match at_c {
        RelayOutcome::Delivered(delivered) => {
            assert_eq!(delivered.msg_id, "msg-ping");
            let plaintext = STANDARD.decode(&delivered.data_b64).unwrap();
            assert_eq!(plaintext, b"ping");
        }
        other => panic!("expected delivery at C, got {other:?}"),
    }

    // B never sees plaintext: relaying at B only yields a Forward packet,
    // whose ciphertext B cannot open with its own relay step above.
}
