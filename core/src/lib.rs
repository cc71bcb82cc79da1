//! meshvault-core — the library consumed by `meshvault-node` and
//! `meshvault-escrow`. No HTTP surface lives here; the two binaries wire
//! these engines into their own route tables.

pub mod beacon;
pub mod chain;
pub mod command;
pub mod config;
pub mod error;
pub mod escrow;
pub mod events;
pub mod identity;
pub mod mix;
pub mod peer;
pub mod replication;
pub mod store;
pub mod vault;

pub use chain::{ChainBlock, ChainError, ChainLog};
pub use command::{CommandAdmitOutcome, CommandEngine, CommandKind, SyncCommand};
pub use config::NodeConfig;
pub use error::{ConfigError, ErrorClass};
pub use events::{Event, EventSink};
pub use identity::{NodeId, NodeIdentity};
pub use mix::{build_onion, relay, select_path, FinalEnvelope, MixError, OnionPacket, RelayOutcome};
pub use peer::{PeerDirectory, PeerDirectoryError, PeerRecord};
pub use replication::{AdmitOutcome, OriginateOutcome, ReplicationEngine, ReplicationEnvelope, ReplicationError};
pub use store::{KvStore, MemoryKv};
pub use vault::{Vault, VaultError, VaultParams};
