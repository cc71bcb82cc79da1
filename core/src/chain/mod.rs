//! Chain Log — the per-node append-only hash-linked record of accepted
//! blobs (`spec.md` §4.4).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainBlock {
    pub hash: String,
    pub prev_hash: String,
    pub name: String,
    pub size: u64,
    pub created_unix: u64,
    pub origin_id: NodeId,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt chain log entry")]
    Corrupt,
}

struct ChainLogInner {
    tip: String,
    file: File,
}

/// Genesis tip is the empty string, matching `spec.md` §8 scenario 1.
pub struct ChainLog {
    inner: Mutex<ChainLogInner>,
    path: PathBuf,
}

impl ChainLog {
    /// Open (creating if absent) the line-delimited chain file at `path`,
    /// replaying it to recover the current tip.
    pub fn open(path: &Path) -> Result<Self, ChainError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut tip = String::new();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let block: ChainBlock =
                    serde_json::from_str(&line).map_err(|_| ChainError::Corrupt)?;
                tip = block.hash;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            inner: Mutex::new(ChainLogInner { tip, file }),
            path: path.to_path_buf(),
        })
    }

    pub fn tip(&self) -> String {
        self.inner.lock().tip.clone()
    }

    /// Append a block, advancing the tip. The caller is responsible for
    /// having already checked `block.prev_hash` against `tip()` — the log
    /// itself only enforces serialization, not chain-link validity (per
    /// `spec.md` §4.4: that check belongs to the Replication Engine).
    pub fn append(&self, block: &ChainBlock) -> Result<(), ChainError> {
        let mut line = serde_json::to_string(block).map_err(|_| ChainError::Corrupt)?;
        line.push('\n');

        let mut guard = self.inner.lock();
        guard.file.write_all(line.as_bytes())?;
        guard.file.flush()?;
        guard.tip = block.hash.clone();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All blocks in append order, for the `/chain/list` surface.
    pub fn list(&self) -> Result<Vec<ChainBlock>, ChainError> {
        let _guard = self.inner.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut blocks = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            blocks.push(serde_json::from_str(&line).map_err(|_| ChainError::Corrupt)?);
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn block(hash: &str, prev: &str) -> ChainBlock {
        ChainBlock {
            hash: hash.to_string(),
            prev_hash: prev.to_string(),
            name: "a.txt".to_string(),
            size: 5,
            created_unix: 1_700_000_000,
            origin_id: NodeId("aa".repeat(32)),
        }
    }

    #[test]
    fn fresh_log_has_empty_genesis_tip() {
        let dir = tempdir().unwrap();
        let log = ChainLog::open(&dir.path().join("chain.jsonl")).unwrap();
        assert_eq!(log.tip(), "");
    }

    #[test]
    fn append_advances_tip() {
        let dir = tempdir().unwrap();
        let log = ChainLog::open(&dir.path().join("chain.jsonl")).unwrap();
        log.append(&block("h1", "")).unwrap();
        assert_eq!(log.tip(), "h1");
        log.append(&block("h2", "h1")).unwrap();
        assert_eq!(log.tip(), "h2");
    }

    #[test]
    fn reopen_recovers_tip_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain.jsonl");
        {
            let log = ChainLog::open(&path).unwrap();
            log.append(&block("h1", "")).unwrap();
            log.append(&block("h2", "h1")).unwrap();
        }
        let reopened = ChainLog::open(&path).unwrap();
        assert_eq!(reopened.tip(), "h2");
    }

    #[test]
    fn list_returns_blocks_in_append_order() {
        let dir = tempdir().unwrap();
        let log = ChainLog::open(&dir.path().join("chain.jsonl")).unwrap();
        log.append(&block("h1", "")).unwrap();
        log.append(&block("h2", "h1")).unwrap();
        let blocks = log.list().unwrap();
        assert_eq!(blocks.iter().map(|b| b.hash.as_str()).collect::<Vec<_>>(), vec!["h1", "h2"]);
    }
}
