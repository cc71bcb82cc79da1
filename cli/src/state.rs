//! Shared state handed to both HTTP surfaces, grounded in the teacher's
//! `WebContext` (`cli/src/server.rs`) — a single `Arc`-wrapped struct
//! cloned into every warp filter chain via `warp::any().map(move || ...)`.

use std::collections::VecDeque;
use std::sync::Arc;

use meshvault_core::command::{CommandEngine, SyncCommand};
use meshvault_core::{ChainLog, EventSink, KvStore, NodeConfig, NodeIdentity, PeerDirectory, ReplicationEngine};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

const PENDING_COMMAND_CAP: usize = 256;

pub struct AppState {
    pub node_config: NodeConfig,
    pub identity: Arc<NodeIdentity>,
    pub beacon_key: Zeroizing<[u8; 32]>,
    pub file_key: Zeroizing<[u8; 32]>,
    pub directory: Arc<PeerDirectory>,
    pub chain: Arc<ChainLog>,
    pub replication: Arc<ReplicationEngine>,
    pub commands: Arc<CommandEngine>,
    pub cache: Arc<dyn KvStore>,
    pub events: EventSink,
    pub pending_commands: Arc<Mutex<VecDeque<SyncCommand>>>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn push_pending_command(&self, command: SyncCommand) {
        let mut guard = self.pending_commands.lock();
        if guard.len() >= PENDING_COMMAND_CAP {
            guard.pop_front();
        }
        guard.push_back(command);
    }

    pub fn drain_pending_commands(&self) -> Vec<SyncCommand> {
        self.pending_commands.lock().drain(..).collect()
    }

    pub fn peers_snapshot_path(&self) -> std::path::PathBuf {
        self.node_config.base_dir.join("peers.enc")
    }
}
