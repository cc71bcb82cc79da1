//! Sync Command broadcast — encrypt/decrypt fan-out that reuses the
//! replication fabric's duplicate-suppression discipline (`spec.md` §4.7,
//! command broadcast paragraph).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::events::{Event, EventSink};
use crate::identity::NodeId;
use crate::peer::PeerDirectory;
use crate::replication::seen::SeenSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncCommand {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub folder_path: String,
    pub recursive: bool,
    pub origin_node: NodeId,
    pub msg_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAdmitOutcome {
    Seen,
    Accepted,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn fresh_msg_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Broadcasts and admits [`SyncCommand`]s, using its own [`SeenSet`]
/// instance of the same bounded-LRU kind the Replication Engine uses —
/// commands and blob envelopes are suppressed independently since they
/// occupy separate `msg-id` namespaces.
pub struct CommandEngine {
    local_id: NodeId,
    directory: Arc<PeerDirectory>,
    seen: Arc<SeenSet>,
    events: EventSink,
    http: reqwest::Client,
}

impl CommandEngine {
    pub fn new(local_id: NodeId, directory: Arc<PeerDirectory>, seen: Arc<SeenSet>, events: EventSink) -> Self {
        Self {
            local_id,
            directory,
            seen,
            events,
            http: reqwest::Client::new(),
        }
    }

    /// Originate a broadcast command: stamp origin/timestamp/msg-id, mark
    /// seen locally, and fan out to every known peer's `/p2p/command`.
    pub async fn broadcast(&self, kind: CommandKind, folder_path: String, recursive: bool) -> SyncCommand {
        let command = SyncCommand {
            kind,
            folder_path,
            recursive,
            origin_node: self.local_id.clone(),
            msg_id: fresh_msg_id(),
            timestamp: now_unix(),
        };
        self.seen.mark(&command.msg_id);
        self.events.send(Event::CommandBroadcast {
            msg_id: command.msg_id.clone(),
            command: format!("{:?}", command.kind),
        });

        for target in self.directory.fanout_targets(&self.local_id, None) {
            let http = self.http.clone();
            let command = command.clone();
            tokio::spawn(async move {
                let url = format!("http://{}/p2p/command", target.address);
                if let Err(err) = http.post(&url).json(&command).send().await {
                    tracing::warn!(error = %err, peer = %target.node_id, "command fanout failed");
                }
            });
        }

        command
    }

    /// Admit a command received from a peer: duplicate-suppress by
    /// `msg_id`, then forward to every peer except self and the sender.
    /// Invoking registered callbacks is the caller's responsibility (the
    /// HTTP handler subscribes to [`EventSink`] for that).
    pub fn admit(&self, command: SyncCommand, from: &NodeId) -> CommandAdmitOutcome {
        if !self.seen.mark(&command.msg_id) {
            return CommandAdmitOutcome::Seen;
        }

        self.events.send(Event::CommandBroadcast {
            msg_id: command.msg_id.clone(),
            command: format!("{:?}", command.kind),
        });

        for target in self.directory.fanout_targets(&self.local_id, Some(from)) {
            let http = self.http.clone();
            let command = command.clone();
            tokio::spawn(async move {
                let url = format!("http://{}/p2p/command", target.address);
                if let Err(err) = http.post(&url).json(&command).send().await {
                    tracing::warn!(error = %err, peer = %target.node_id, "command forward failed");
                }
            });
        }

        CommandAdmitOutcome::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CommandEngine {
        CommandEngine::new(
            NodeId("aa".repeat(32)),
            Arc::new(PeerDirectory::new()),
            Arc::new(SeenSet::new()),
            EventSink::new(),
        )
    }

    #[tokio::test]
    async fn broadcast_marks_seen_and_stamps_origin() {
        let eng = engine();
        let command = eng.broadcast(CommandKind::Encrypt, "/data".to_string(), true).await;
        assert_eq!(command.origin_node, NodeId("aa".repeat(32)));
        assert!(eng.seen.contains(&command.msg_id));
    }

    #[test]
    fn admit_same_command_twice_is_idempotent() {
        let eng = engine();
        let command = SyncCommand {
            kind: CommandKind::Decrypt,
            folder_path: "/data".to_string(),
            recursive: false,
            origin_node: NodeId("bb".repeat(32)),
            msg_id: "m1".to_string(),
            timestamp: 0,
        };
        let first = eng.admit(command.clone(), &NodeId("cc".repeat(32)));
        assert_eq!(first, CommandAdmitOutcome::Accepted);
        let second = eng.admit(command, &NodeId("cc".repeat(32)));
        assert_eq!(second, CommandAdmitOutcome::Seen);
    }
}
