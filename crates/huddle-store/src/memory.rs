//! In-memory storage adapter for tests and local development.
//!
//! Nodes are kept as JSON values, so every read and every snapshot passes
//! through the same tagged-union validation a remote node would.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use huddle_shared::constants::{PUSH_KEY_SUFFIX_LEN, SNAPSHOT_BUFFER};
use huddle_shared::{NodePath, NodeValue};

use crate::adapter::{
    NodeDelta, NodeSubscription, Snapshot, SnapshotOrder, StorageAdapter, SubscribeQuery,
    WriteBatch, WriteOp,
};
use crate::error::{Result, StoreError};

/// In-process implementation of [`StorageAdapter`].
///
/// Plays the role a hosted realtime database plays in production: atomic
/// multi-path batches, push-key allocation, and push-based subscriptions
/// that deliver full snapshots.
#[derive(Clone)]
pub struct MemoryAdapter {
    state: Arc<Mutex<MemoryState>>,
}

struct MemoryState {
    nodes: BTreeMap<NodePath, serde_json::Value>,
    subs: HashMap<u64, SubEntry>,
    next_sub: u64,
    keys: PushKeyState,
}

struct SubEntry {
    root: NodePath,
    query: SubscribeQuery,
    tx: mpsc::Sender<Snapshot>,
}

#[derive(Default)]
struct PushKeyState {
    last_millis: i64,
    seq: u32,
}

impl PushKeyState {
    /// Next `(millis, seq)` pair, strictly greater than every previous one
    /// even when the clock stalls or runs backwards.
    fn tick(&mut self, now_millis: i64) -> (i64, u32) {
        if now_millis > self.last_millis {
            self.last_millis = now_millis;
            self.seq = 0;
        } else {
            self.seq += 1;
            if self.seq > 9999 {
                self.last_millis += 1;
                self.seq = 0;
            }
        }
        (self.last_millis, self.seq)
    }
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                nodes: BTreeMap::new(),
                subs: HashMap::new(),
                next_sub: 0,
                keys: PushKeyState::default(),
            })),
        }
    }

    fn decode(path: &NodePath, value: &serde_json::Value) -> Result<NodeValue> {
        serde_json::from_value(value.clone()).map_err(|e| StoreError::Corrupt {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    fn encode(path: &NodePath, value: &NodeValue) -> Result<serde_json::Value> {
        serde_json::to_value(value).map_err(|e| StoreError::Corrupt {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// Apply one op to the staged tree. Merges onto absent nodes are
    /// skipped; the next projection write recreates the entry.
    fn apply(
        nodes: &mut BTreeMap<NodePath, serde_json::Value>,
        path: &NodePath,
        op: &WriteOp,
    ) -> Result<()> {
        match op {
            WriteOp::Put(value) => {
                nodes.insert(path.clone(), Self::encode(path, value)?);
            }
            WriteOp::PutIndex(entry) => {
                let mut value = Self::encode(path, &NodeValue::IndexEntry(entry.clone()))?;
                if let Some(pinned) = nodes.get(path).and_then(|old| old.get("pinned")) {
                    value["pinned"] = pinned.clone();
                }
                nodes.insert(path.clone(), value);
            }
            WriteOp::Merge(delta) => {
                let Some(existing) = nodes.get_mut(path) else {
                    tracing::warn!(%path, "merge target absent, skipping patch");
                    return Ok(());
                };
                Self::merge_into(path, existing, delta)?;
            }
            WriteOp::Delete => {
                nodes.remove(path);
            }
        }
        Ok(())
    }

    fn merge_into(
        path: &NodePath,
        existing: &mut serde_json::Value,
        delta: &NodeDelta,
    ) -> Result<()> {
        let corrupt = |reason: &str| StoreError::Corrupt {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        let tag = existing
            .get("node")
            .and_then(|t| t.as_str())
            .ok_or_else(|| corrupt("untagged node"))?
            .to_string();
        if tag == "message" {
            return Err(corrupt("messages are immutable"));
        }
        let is_index = tag == "index-entry";
        let obj = existing
            .as_object_mut()
            .ok_or_else(|| corrupt("node is not an object"))?;

        if let Some(snapshot) = &delta.last_message {
            obj.insert(
                "last_message".to_string(),
                serde_json::to_value(snapshot).map_err(|e| corrupt(&e.to_string()))?,
            );
        }
        if let Some(updated_at) = &delta.updated_at {
            obj.insert(
                "updated_at".to_string(),
                serde_json::to_value(updated_at).map_err(|e| corrupt(&e.to_string()))?,
            );
        }
        if is_index {
            if let Some(hidden) = delta.hidden {
                obj.insert("hidden".to_string(), hidden.into());
            }
            if let Some(pinned) = delta.pinned {
                obj.insert("pinned".to_string(), pinned.into());
            }
        }
        Ok(())
    }

    /// Current snapshot of `root`'s direct children, in query order.
    fn snapshot(
        nodes: &BTreeMap<NodePath, serde_json::Value>,
        root: &NodePath,
        query: &SubscribeQuery,
    ) -> Snapshot {
        let mut children: Vec<(String, NodeValue)> = nodes
            .iter()
            .filter_map(|(path, value)| {
                let key = path.child_key(root)?;
                match Self::decode(path, value) {
                    Ok(decoded) => Some((key.to_string(), decoded)),
                    Err(e) => {
                        tracing::warn!(%path, error = %e, "skipping undecodable child");
                        None
                    }
                }
            })
            .collect();

        match query.order {
            SnapshotOrder::Key => {
                children.sort_by(|a, b| a.0.cmp(&b.0));
                if let Some(limit) = query.limit_last {
                    let excess = children.len().saturating_sub(limit);
                    children.drain(..excess);
                }
            }
            SnapshotOrder::UpdatedAtDesc => {
                children.sort_by(|a, b| b.1.updated_at().cmp(&a.1.updated_at()));
                if let Some(limit) = query.limit_last {
                    children.truncate(limit);
                }
            }
        }
        children
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the subscription from the registry when the handle drops.
struct Unregister {
    state: Arc<Mutex<MemoryState>>,
    id: u64,
}

impl Drop for Unregister {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.subs.remove(&self.id);
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn read(&self, path: &NodePath) -> Result<Option<NodeValue>> {
        let state = self.state.lock().expect("adapter state poisoned");
        state
            .nodes
            .get(path)
            .map(|value| Self::decode(path, value))
            .transpose()
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut state = self.state.lock().expect("adapter state poisoned");

        // Stage the whole batch before committing so a rejected op leaves
        // the tree untouched.
        let mut staged = state.nodes.clone();
        for (path, op) in &batch {
            Self::apply(&mut staged, path, op)?;
        }
        state.nodes = staged;

        // Push a fresh snapshot to every subscription whose node gained,
        // lost, or changed a direct child.
        let mut pushes = Vec::new();
        for sub in state.subs.values() {
            if batch.keys().any(|path| path.child_key(&sub.root).is_some()) {
                let snapshot = Self::snapshot(&state.nodes, &sub.root, &sub.query);
                pushes.push((sub.tx.clone(), snapshot));
            }
        }
        drop(state);

        for (tx, snapshot) in pushes {
            if tx.try_send(snapshot).is_err() {
                tracing::debug!("subscriber lagging or gone, dropping push");
            }
        }
        Ok(())
    }

    async fn push_key(&self, _path: &NodePath) -> Result<String> {
        let mut state = self.state.lock().expect("adapter state poisoned");
        let (millis, seq) = state.keys.tick(Utc::now().timestamp_millis());
        let suffix: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(PUSH_KEY_SUFFIX_LEN)
            .collect();
        Ok(format!("{millis:013}{seq:04}{suffix}"))
    }

    async fn subscribe(&self, path: &NodePath, query: SubscribeQuery) -> Result<NodeSubscription> {
        let mut state = self.state.lock().expect("adapter state poisoned");
        let id = state.next_sub;
        state.next_sub += 1;

        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let initial = Self::snapshot(&state.nodes, path, &query);
        let _ = tx.try_send(initial);
        state.subs.insert(
            id,
            SubEntry {
                root: path.clone(),
                query,
                tx,
            },
        );
        drop(state);

        let teardown = Unregister {
            state: self.state.clone(),
            id,
        };
        Ok(NodeSubscription::new(rx, Box::new(teardown)))
    }
}
