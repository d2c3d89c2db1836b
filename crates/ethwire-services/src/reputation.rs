//! Peer reputation: which peers have been disabled, and why.
//!
//! Two levels:
//! - Neutral:   no rule, sessions proceed normally
//! - Disabled:  the peer broke protocol policy; inbound sessions from it are
//!              refused and it is never dialed again
//!
//! Capabilities disable peers through `HostHandle::disable`. The listener and
//! the dialer consult the registry before admitting a session.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use ethwire_core::crypto::{short_id, NodeId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reputation {
    #[default]
    Neutral,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationEntry {
    pub level: Reputation,
    pub reason: String,
    /// Unix seconds.
    pub since: u64,
}

/// Registry of disabled peers.
///
/// With a `persist_path`, entries are written to disk on every mutation and
/// reloaded at startup.
pub struct ReputationRegistry {
    entries: Arc<DashMap<NodeId, ReputationEntry>>,
    persist_path: Arc<Option<PathBuf>>,
}

impl Default for ReputationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReputationRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            persist_path: Arc::new(None),
        }
    }

    /// Create a registry backed by `path`, loading whatever is already there.
    pub fn with_persistence(path: PathBuf) -> Self {
        let registry = Self {
            entries: Arc::new(DashMap::new()),
            persist_path: Arc::new(Some(path)),
        };
        registry.load_from_disk();
        registry
    }

    pub fn check(&self, id: &NodeId) -> Reputation {
        self.entries
            .get(id)
            .map(|e| e.value().level)
            .unwrap_or_default()
    }

    pub fn is_disabled(&self, id: &NodeId) -> bool {
        matches!(self.check(id), Reputation::Disabled)
    }

    pub fn reason(&self, id: &NodeId) -> Option<String> {
        self.entries.get(id).map(|e| e.value().reason.clone())
    }

    pub fn disable(&self, id: NodeId, reason: &str) {
        self.entries.insert(
            id,
            ReputationEntry {
                level: Reputation::Disabled,
                reason: reason.to_string(),
                since: unix_now(),
            },
        );
        self.save_to_disk();
        tracing::info!(peer = %short_id(&id), reason, "peer disabled");
    }

    /// Forget any rule for the peer.
    pub fn remove(&self, id: &NodeId) {
        if self.entries.remove(id).is_some() {
            self.save_to_disk();
        }
    }

    pub fn list(&self) -> Vec<(NodeId, ReputationEntry)> {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn disabled_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().level == Reputation::Disabled)
            .count()
    }
}

impl ReputationRegistry {
    /// Best-effort JSON dump; failures are logged.
    fn save_to_disk(&self) {
        let path = match self.persist_path.as_ref() {
            Some(p) => p,
            None => return,
        };
        let snapshot: HashMap<String, ReputationEntry> = self
            .entries
            .iter()
            .map(|entry| (hex::encode(entry.key()), entry.value().clone()))
            .collect();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(error = %e, path = %path.display(), "failed to persist reputation");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize reputation");
            }
        }
    }

    fn load_from_disk(&self) {
        let path = match self.persist_path.as_ref() {
            Some(p) => p,
            None => return,
        };
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read reputation");
                return;
            }
        };
        let map: HashMap<String, ReputationEntry> = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse reputation");
                return;
            }
        };
        let mut loaded = 0usize;
        for (hex_id, entry) in map {
            match hex::decode(&hex_id) {
                Ok(bytes) if bytes.len() == 64 => {
                    self.entries.insert(NodeId::from_slice(&bytes), entry);
                    loaded += 1;
                }
                _ => tracing::warn!(id = %hex_id, "skipping malformed reputation entry"),
            }
        }
        if loaded > 0 {
            tracing::info!(count = loaded, path = %path.display(), "loaded persisted reputation");
        }
    }
}

impl Clone for ReputationRegistry {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            persist_path: self.persist_path.clone(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
