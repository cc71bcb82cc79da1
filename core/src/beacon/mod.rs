//! Beacon Transport — authenticated UDP-multicast discovery (`spec.md`
//! §4.3, §6). An emitter advertises this node at a fixed interval; a
//! receiver listens on the same group and feeds the [`PeerDirectory`].

pub mod iface;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::identity::NodeId;
use crate::peer::{PeerDirectory, PeerRecord};

const MAGIC: &[u8; 5] = b"MIXB1";
const NONCE_LEN: usize = 24;
const RECV_BUF_BYTES: usize = 1024 * 1024;
const READ_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Beacon {
    #[serde(rename = "type")]
    pub kind: String,
    pub node_id: NodeId,
    pub api_port: u16,
    pub hostname: String,
    pub timestamp: u64,
    pub pub_key_b64: Option<String>,
}

impl Beacon {
    pub fn new(node_id: NodeId, api_port: u16, hostname: String, mix_public_key: [u8; 32]) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            kind: "beacon".to_string(),
            node_id,
            api_port,
            hostname,
            timestamp,
            pub_key_b64: Some(BASE64.encode(mix_public_key)),
        }
    }

    pub fn mix_public_key(&self) -> Option<[u8; 32]> {
        let bytes = BASE64.decode(self.pub_key_b64.as_ref()?).ok()?;
        bytes.try_into().ok()
    }
}

#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("beacon too short")]
    TooShort,
    #[error("bad magic tag")]
    BadMagic,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("malformed beacon payload")]
    BadFormat,
}

#[derive(Debug, Clone)]
pub struct BeaconConfig {
    pub interval: Duration,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub interface_name: Option<String>,
    pub api_port: u16,
    pub hostname: String,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            multicast_group: Ipv4Addr::new(239, 77, 77, 1),
            multicast_port: 7077,
            interface_name: None,
            api_port: 8080,
            hostname: "meshvault-node".to_string(),
        }
    }
}

fn seal_beacon(beacon: &Beacon, beacon_key: &[u8; 32]) -> Result<Vec<u8>, BeaconError> {
    let plaintext = serde_json::to_vec(beacon).map_err(|_| BeaconError::BadFormat)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(beacon_key).map_err(|_| BeaconError::BadFormat)?;
    let nonce = XNonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: &plaintext, aad: &[] })
        .map_err(|_| BeaconError::DecryptionFailed)?;

    let mut out = Vec::with_capacity(5 + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_beacon(datagram: &[u8], beacon_key: &[u8; 32]) -> Result<Beacon, BeaconError> {
    if datagram.len() < 5 + NONCE_LEN {
        return Err(BeaconError::TooShort);
    }
    if &datagram[0..5] != MAGIC {
        return Err(BeaconError::BadMagic);
    }
    let nonce_bytes = &datagram[5..5 + NONCE_LEN];
    let ciphertext = &datagram[5 + NONCE_LEN..];

    let cipher = XChaCha20Poly1305::new_from_slice(beacon_key).map_err(|_| BeaconError::BadFormat)?;
    let nonce = XNonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
        .map_err(|_| BeaconError::DecryptionFailed)?;

    serde_json::from_slice(&plaintext).map_err(|_| BeaconError::BadFormat)
}

fn bind_udp_socket(bind_addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.set_recv_buffer_size(RECV_BUF_BYTES)?;
    socket.bind(&bind_addr.into())?;
    UdpSocket::from_std(socket.into())
}

pub struct BeaconEmitter {
    config: BeaconConfig,
    node_id: NodeId,
    mix_public_key: [u8; 32],
    beacon_key: [u8; 32],
    bind_ip: Ipv4Addr,
}

impl BeaconEmitter {
    pub fn new(
        config: BeaconConfig,
        node_id: NodeId,
        mix_public_key: [u8; 32],
        beacon_key: [u8; 32],
        bind_ip: Ipv4Addr,
    ) -> Self {
        Self {
            config,
            node_id,
            mix_public_key,
            beacon_key,
            bind_ip,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> std::io::Result<()> {
        let socket = bind_udp_socket(SocketAddr::new(IpAddr::V4(self.bind_ip), 0))?;
        socket.set_multicast_ttl_v4(16)?;

        let target = SocketAddr::new(IpAddr::V4(self.config.multicast_group), self.config.multicast_port);
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let beacon = Beacon::new(
                        self.node_id.clone(),
                        self.config.api_port,
                        self.config.hostname.clone(),
                        self.mix_public_key,
                    );
                    match seal_beacon(&beacon, &self.beacon_key) {
                        Ok(datagram) => {
                            if let Err(err) = socket.send_to(&datagram, target).await {
                                tracing::warn!(error = %err, "beacon send failed, will retry next tick");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "beacon seal failed, skipping this tick");
                        }
                    }
                }
            }
        }
    }
}

pub struct BeaconReceiver {
    config: BeaconConfig,
    beacon_key: [u8; 32],
    bind_ip: Ipv4Addr,
}

impl BeaconReceiver {
    pub fn new(config: BeaconConfig, beacon_key: [u8; 32], bind_ip: Ipv4Addr) -> Self {
        Self {
            config,
            beacon_key,
            bind_ip,
        }
    }

    pub async fn run(
        self,
        directory: Arc<PeerDirectory>,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let socket = bind_udp_socket(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.multicast_port,
        ))?;
        socket.join_multicast_v4(self.config.multicast_group, self.bind_ip)?;

        let mut buf = vec![0u8; 65_536];
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let recv = tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)).await;
            let (len, src) = match recv {
                Ok(Ok(pair)) => pair,
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "beacon receive error");
                    continue;
                }
                Err(_) => continue,
            };

            match open_beacon(&buf[..len], &self.beacon_key) {
                Ok(beacon) => {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64;
                    let record = PeerRecord {
                        node_id: beacon.node_id,
                        address: SocketAddr::new(src.ip(), beacon.api_port),
                        api_port: beacon.api_port,
                        hostname: beacon.hostname,
                        last_seen: now,
                        mix_public_key: beacon.mix_public_key().unwrap_or([0u8; 32]),
                    };
                    directory.upsert(record);
                }
                Err(err) => {
                    tracing::trace!(error = %err, src = %src, "dropped non-beacon or unauthenticated datagram");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_beacon() -> Beacon {
        Beacon::new(
            NodeId("aa".repeat(32)),
            8080,
            "host".to_string(),
            [9u8; 32],
        )
    }

    #[test]
    fn seal_then_open_recovers_beacon() {
        let key = [1u8; 32];
        let beacon = sample_beacon();
        let datagram = seal_beacon(&beacon, &key).unwrap();
        let opened = open_beacon(&datagram, &key).unwrap();
        assert_eq!(opened.node_id, beacon.node_id);
        assert_eq!(opened.mix_public_key(), beacon.mix_public_key());
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let beacon = sample_beacon();
        let datagram = seal_beacon(&beacon, &[1u8; 32]).unwrap();
        let result = open_beacon(&datagram, &[2u8; 32]);
        assert!(matches!(result, Err(BeaconError::DecryptionFailed)));
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let key = [1u8; 32];
        let beacon = sample_beacon();
        let mut datagram = seal_beacon(&beacon, &key).unwrap();
        let last = datagram.len() - 1;
        datagram[last] ^= 0xFF;
        let result = open_beacon(&datagram, &key);
        assert!(matches!(result, Err(BeaconError::DecryptionFailed)));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut datagram = vec![0u8; 40];
        datagram[0..5].copy_from_slice(b"NOPE!");
        let result = open_beacon(&datagram, &[0u8; 32]);
        assert!(matches!(result, Err(BeaconError::BadMagic)));
    }

    #[test]
    fn too_short_datagram_is_rejected() {
        let result = open_beacon(&[1, 2, 3], &[0u8; 32]);
        assert!(matches!(result, Err(BeaconError::TooShort)));
    }

    #[test]
    fn pub_key_roundtrips_through_base64() {
        let beacon = sample_beacon();
        assert_eq!(beacon.mix_public_key(), Some([9u8; 32]));
    }
}
