use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use meshvault_core::escrow::EscrowClient;
use meshvault_core::replication::seen::SeenSet;
use meshvault_core::{ChainLog, EventSink, MemoryKv, NodeId, PeerDirectory, ReplicationEngine, ReplicationEnvelope, ReplicationError};

fn fresh_engine(dir: &std::path::Path) -> (ReplicationEngine, Arc<ChainLog>) {
    let chain = Arc::new(ChainLog::open(&dir.join("chain.jsonl")).unwrap());
    let directory = Arc::new(PeerDirectory::new());
    let seen = Arc::new(SeenSet::new());
    let cache: Arc<dyn meshvault_core::KvStore> = Arc::new(MemoryKv::new());
    let escrow = EscrowClient::new("http://127.0.0.1:1", None);
    let events = EventSink::new();
    let engine = ReplicationEngine::new(
        NodeId("n1".to_string()),
        chain.clone(),
        directory,
        seen,
        cache,
        dir.join("chunks"),
        dir.join("keys"),
        escrow,
        events,
    );
    (engine, chain)
}

#[tokio::test]
async fn fresh_provision_single_node_replication() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, chain) = fresh_engine(dir.path());

    let outcome = engine.originate("a.txt", b"hello").await.unwrap();
    assert_eq!(outcome.fanout, 0);
    assert_eq!(outcome.store_key, format!("blob-{}-a.txt", outcome.hash_hex));

    let chunk_path = dir.path().join("chunks").join(format!("{}.bin", outcome.hash_hex));
    let cipher_bytes = std::fs::read(&chunk_path).unwrap();
    assert_eq!(hex::encode(Sha256::digest(&cipher_bytes)), outcome.hash_hex);

    let blocks = chain.list().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].prev_hash, "");
    assert_eq!(blocks[0].hash, outcome.hash_hex);
}

#[tokio::test]
async fn loop_suppression_on_preseeded_seen_set() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(ChainLog::open(&dir.path().join("chain.jsonl")).unwrap());
    let directory = Arc::new(PeerDirectory::new());
    let seen = Arc::new(SeenSet::new());
    seen.mark("msg-M");
    let cache: Arc<dyn meshvault_core::KvStore> = Arc::new(MemoryKv::new());
    let escrow = EscrowClient::new("http://127.0.0.1:1", None);
    let events = EventSink::new();
    let engine = ReplicationEngine::new(
        NodeId("n1".to_string()),
        chain.clone(),
        directory,
        seen,
        cache,
        dir.path().join("chunks"),
        dir.path().join("keys"),
        escrow,
        events,
    );

    let cipher_bytes = b"already-seen-bytes".to_vec();
    let hash_hex = hex::encode(Sha256::digest(&cipher_bytes));
    let envelope = ReplicationEnvelope {
        msg_id: "msg-M".to_string(),
        origin_id: NodeId("n2".to_string()),
        name: "dup.bin".to_string(),
        hash_hex,
        prev_hash: chain.tip(),
        cipher_b64: URL_SAFE_NO_PAD.encode(&cipher_bytes),
        created_unix: 0,
        hops: 0,
    };

    let outcome = engine.admit(envelope, NodeId("n2".to_string())).await.unwrap();
    assert_eq!(outcome, meshvault_core::AdmitOutcome::Seen);
    assert!(chain.list().unwrap().is_empty());
    assert!(!dir.path().join("chunks").exists());
}

#[tokio::test]
async fn chain_mismatch_is_rejected_before_any_state_change() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, chain) = fresh_engine(dir.path());

    let cipher_bytes = b"mismatched-tip-bytes".to_vec();
    let hash_hex = hex::encode(Sha256::digest(&cipher_bytes));
    let envelope = ReplicationEnvelope {
        msg_id: "msg-mismatch".to_string(),
        origin_id: NodeId("n2".to_string()),
        name: "m.bin".to_string(),
        hash_hex,
        prev_hash: "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff".to_string(),
        cipher_b64: URL_SAFE_NO_PAD.encode(&cipher_bytes),
        created_unix: 0,
        hops: 0,
    };

    let err = engine.admit(envelope, NodeId("n2".to_string())).await.unwrap_err();
    assert!(matches!(err, ReplicationError::ChainMismatch { .. }));
    assert_eq!(chain.tip(), "");
    assert!(chain.list().unwrap().is_empty());
}
