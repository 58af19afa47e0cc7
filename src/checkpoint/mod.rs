//! Checkpoint creation and tree-structured timeline navigation.
//!
//! A session's checkpoints form a tree, not a timestamp-ordered list:
//! ordering along any path is defined by the structural parent chain
//! (`parent_id` links), so a fork and its source both keep their place in
//! history even if a later checkpoint on another branch has a newer
//! timestamp. Checkpoint content itself lives in the content-addressed store
//! ([`crate::cas`]); this module owns the tree and the per-session current
//! position within it.

use crate::cas::CasStorage;
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// How aggressively a session auto-creates checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStrategy {
    /// Only explicit, caller-requested checkpoints.
    Manual,
    /// After every user prompt.
    PerPrompt,
    /// After every tool execution.
    PerToolUse,
    /// After tool executions whose name suggests a destructive operation.
    Smart,
}

impl Default for CheckpointStrategy {
    fn default() -> Self {
        CheckpointStrategy::Smart
    }
}

const DESTRUCTIVE_TOOL_MARKERS: &[&str] =
    &["write", "delete", "remove", "edit", "multiedit", "move", "rename"];

/// One node in a session's checkpoint tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointNode {
    pub checkpoint_id: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl CheckpointNode {
    fn add_child(&mut self, child_id: String) {
        if !self.children.contains(&child_id) {
            self.children.push(child_id);
        }
    }
}

/// A session's full checkpoint tree plus its current position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTimeline {
    pub session_id: String,
    pub root_checkpoint_id: Option<String>,
    pub current_checkpoint_id: Option<String>,
    pub nodes: HashMap<String, CheckpointNode>,
    pub auto_checkpoint_enabled: bool,
    pub checkpoint_strategy: CheckpointStrategy,
    pub total_checkpoints: u64,
}

impl SessionTimeline {
    fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            root_checkpoint_id: None,
            current_checkpoint_id: None,
            nodes: HashMap::new(),
            auto_checkpoint_enabled: true,
            checkpoint_strategy: CheckpointStrategy::default(),
            total_checkpoints: 0,
        }
    }

    fn add_checkpoint(&mut self, checkpoint_id: String, parent_id: Option<String>, metadata: Value) {
        let node = CheckpointNode {
            checkpoint_id: checkpoint_id.clone(),
            parent_id: parent_id.clone(),
            children: Vec::new(),
            metadata,
        };
        self.nodes.insert(checkpoint_id.clone(), node);
        self.total_checkpoints += 1;

        if self.root_checkpoint_id.is_none() {
            self.root_checkpoint_id = Some(checkpoint_id.clone());
        }
        if let Some(parent_id) = &parent_id {
            if let Some(parent) = self.nodes.get_mut(parent_id) {
                parent.add_child(checkpoint_id.clone());
            }
        }
        self.current_checkpoint_id = Some(checkpoint_id);
    }

    /// Root-to-node path, following structural `parent_id` links -- never
    /// timestamps.
    pub fn path_to(&self, checkpoint_id: &str) -> Vec<String> {
        if !self.nodes.contains_key(checkpoint_id) {
            return Vec::new();
        }
        let mut path = Vec::new();
        let mut current = Some(checkpoint_id.to_string());
        while let Some(id) = current {
            let next = self.nodes.get(&id).and_then(|n| n.parent_id.clone());
            path.push(id);
            current = next;
        }
        path.reverse();
        path
    }

    fn subtree(&self, checkpoint_id: &str) -> Option<Value> {
        let node = self.nodes.get(checkpoint_id)?;
        let children: Vec<Value> = node
            .children
            .iter()
            .filter_map(|c| self.subtree(c))
            .collect();
        Some(json!({
            "id": checkpoint_id,
            "parent_id": node.parent_id,
            "metadata": node.metadata,
            "children": children,
        }))
    }

    fn common_ancestor(&self, a: &str, b: &str) -> Option<String> {
        let path_a = self.path_to(a);
        let path_b: HashSet<&String> = self.path_to(b).iter().collect::<Vec<_>>().into_iter().collect();
        path_a.into_iter().rev().find(|id| path_b.contains(id))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedCheckpoint {
    pub checkpoint_id: String,
    pub parent_id: Option<String>,
    pub content_hash: String,
    pub size_bytes: u64,
    pub current_checkpoint_id: String,
    pub total_checkpoints: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineView {
    pub session_id: String,
    pub current_checkpoint_id: Option<String>,
    pub root_checkpoint_id: Option<String>,
    pub total_checkpoints: u64,
    pub auto_checkpoint_enabled: bool,
    pub checkpoint_strategy: CheckpointStrategy,
    pub tree: Option<Value>,
    pub current_path: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointComparison {
    pub checkpoint_id1: String,
    pub checkpoint_id2: String,
    pub common_ancestor_id: Option<String>,
    pub content_identical: bool,
    pub size_delta: i64,
}

struct Inner {
    timelines: HashMap<String, SessionTimeline>,
}

/// Owns every active session's checkpoint tree and the content-addressed
/// store checkpoint payloads live in.
pub struct TimelineManager {
    cas: Arc<CasStorage>,
    inner: Mutex<Inner>,
    store: Option<TimelineStore>,
}

impl TimelineManager {
    pub fn new(cas: Arc<CasStorage>) -> Arc<Self> {
        Arc::new(Self {
            cas,
            inner: Mutex::new(Inner { timelines: HashMap::new() }),
            store: None,
        })
    }

    /// Like [`TimelineManager::new`] but persisting every timeline mutation
    /// to `store`, so a session's checkpoint timeline survives a restart.
    pub fn new_with_store(cas: Arc<CasStorage>, store: TimelineStore) -> Arc<Self> {
        Arc::new(Self {
            cas,
            inner: Mutex::new(Inner { timelines: HashMap::new() }),
            store: Some(store),
        })
    }

    fn persist(&self, timeline: &SessionTimeline) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(timeline) {
                tracing::warn!(session = %timeline.session_id, error = %e, "failed to persist checkpoint timeline");
            }
        }
    }

    /// Returns the in-memory timeline for `session_id`, creating one if
    /// necessary -- first trying to recover it from the durable store, and
    /// only falling back to an empty timeline if nothing was persisted.
    pub async fn initialize_timeline(&self, session_id: &str) -> SessionTimeline {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.timelines.get(session_id) {
            return existing.clone();
        }
        let recovered = self.store.as_ref().and_then(|s| match s.load(session_id) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "failed to load checkpoint timeline from store");
                None
            }
        });
        let timeline = recovered.unwrap_or_else(|| SessionTimeline::new(session_id));
        inner.timelines.insert(session_id.to_string(), timeline.clone());
        timeline
    }

    /// Store `content` in the content-addressed store and record a new
    /// checkpoint node. Defaults the parent to the timeline's current
    /// position when `parent_id` is `None`.
    pub async fn create_checkpoint(
        &self,
        session_id: &str,
        name: Option<&str>,
        description: Option<&str>,
        parent_id: Option<String>,
        extra_metadata: Option<Value>,
        content: &[u8],
    ) -> Result<CreatedCheckpoint, CoreError> {
        self.initialize_timeline(session_id).await;

        let mut inner = self.inner.lock().await;
        let timeline = inner.timelines.get_mut(session_id).expect("just initialized");

        let parent_id = parent_id.or_else(|| timeline.current_checkpoint_id.clone());
        if let Some(parent) = &parent_id {
            if !timeline.nodes.contains_key(parent) {
                return Err(CoreError::checkpoint_not_found(parent.clone()));
            }
        }

        let content_hash = self.cas.store(content, None)?;
        let checkpoint_id = ulid::Ulid::new().to_string();
        let now = Utc::now();

        let mut metadata = json!({
            "name": name,
            "description": description,
            "created_at": now.to_rfc3339(),
            "size_bytes": content.len(),
            "content_hash": content_hash,
        });
        if let (Value::Object(meta_map), Some(Value::Object(extra_map))) =
            (&mut metadata, extra_metadata.as_ref())
        {
            for (k, v) in extra_map {
                meta_map.insert(k.clone(), v.clone());
            }
        }

        timeline.add_checkpoint(checkpoint_id.clone(), parent_id.clone(), metadata);
        self.persist(timeline);

        Ok(CreatedCheckpoint {
            checkpoint_id,
            parent_id,
            content_hash,
            size_bytes: content.len() as u64,
            current_checkpoint_id: timeline.current_checkpoint_id.clone().unwrap(),
            total_checkpoints: timeline.total_checkpoints,
        })
    }

    /// Create a new checkpoint branching off `checkpoint_id`.
    pub async fn fork_checkpoint(
        &self,
        session_id: &str,
        checkpoint_id: &str,
        fork_name: Option<&str>,
        content: &[u8],
    ) -> Result<CreatedCheckpoint, CoreError> {
        {
            let inner = self.inner.lock().await;
            let timeline = inner
                .timelines
                .get(session_id)
                .ok_or_else(|| CoreError::session_not_found(session_id))?;
            if !timeline.nodes.contains_key(checkpoint_id) {
                return Err(CoreError::checkpoint_not_found(checkpoint_id));
            }
        }

        let name = fork_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("Fork of {checkpoint_id}"));
        self.create_checkpoint(
            session_id,
            Some(&name),
            Some(&format!("Forked from checkpoint {checkpoint_id}")),
            Some(checkpoint_id.to_string()),
            Some(json!({"fork_source": checkpoint_id})),
            content,
        )
        .await
    }

    /// Fetch a checkpoint's stored content by id.
    pub async fn restore_checkpoint(&self, session_id: &str, checkpoint_id: &str) -> Result<Vec<u8>, CoreError> {
        let hash = {
            let inner = self.inner.lock().await;
            let timeline = inner
                .timelines
                .get(session_id)
                .ok_or_else(|| CoreError::session_not_found(session_id))?;
            let node = timeline
                .nodes
                .get(checkpoint_id)
                .ok_or_else(|| CoreError::checkpoint_not_found(checkpoint_id))?;
            node.metadata
                .get("content_hash")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| CoreError::Internal(format!("checkpoint {checkpoint_id} has no content hash")))?
        };

        self.cas
            .retrieve(&hash)?
            .ok_or_else(|| CoreError::digest_not_found(hash))
    }

    /// Move the timeline's current position to `checkpoint_id` and return
    /// its content plus the path used to reach it.
    pub async fn set_current_checkpoint(&self, session_id: &str, checkpoint_id: &str) -> Result<Vec<String>, CoreError> {
        let mut inner = self.inner.lock().await;
        let timeline = inner
            .timelines
            .get_mut(session_id)
            .ok_or_else(|| CoreError::session_not_found(session_id))?;
        if !timeline.nodes.contains_key(checkpoint_id) {
            return Err(CoreError::checkpoint_not_found(checkpoint_id));
        }
        timeline.current_checkpoint_id = Some(checkpoint_id.to_string());
        self.persist(timeline);
        Ok(timeline.path_to(checkpoint_id))
    }

    pub async fn compare_checkpoints(
        &self,
        session_id: &str,
        checkpoint_id1: &str,
        checkpoint_id2: &str,
    ) -> Result<CheckpointComparison, CoreError> {
        let common_ancestor_id = {
            let inner = self.inner.lock().await;
            let timeline = inner
                .timelines
                .get(session_id)
                .ok_or_else(|| CoreError::session_not_found(session_id))?;
            timeline.common_ancestor(checkpoint_id1, checkpoint_id2)
        };

        let data1 = self.restore_checkpoint(session_id, checkpoint_id1).await?;
        let data2 = self.restore_checkpoint(session_id, checkpoint_id2).await?;

        Ok(CheckpointComparison {
            checkpoint_id1: checkpoint_id1.to_string(),
            checkpoint_id2: checkpoint_id2.to_string(),
            common_ancestor_id,
            content_identical: data1 == data2,
            size_delta: data2.len() as i64 - data1.len() as i64,
        })
    }

    pub async fn get_timeline(&self, session_id: &str) -> Option<TimelineView> {
        let inner = self.inner.lock().await;
        let timeline = inner.timelines.get(session_id)?;
        let tree = timeline
            .root_checkpoint_id
            .as_deref()
            .and_then(|root| timeline.subtree(root));
        let current_path = timeline
            .current_checkpoint_id
            .as_deref()
            .map(|id| timeline.path_to(id))
            .unwrap_or_default();

        Some(TimelineView {
            session_id: timeline.session_id.clone(),
            current_checkpoint_id: timeline.current_checkpoint_id.clone(),
            root_checkpoint_id: timeline.root_checkpoint_id.clone(),
            total_checkpoints: timeline.total_checkpoints,
            auto_checkpoint_enabled: timeline.auto_checkpoint_enabled,
            checkpoint_strategy: timeline.checkpoint_strategy,
            tree,
            current_path,
        })
    }

    pub async fn set_checkpoint_strategy(&self, session_id: &str, strategy: CheckpointStrategy, enabled: bool) {
        self.initialize_timeline(session_id).await;
        let mut inner = self.inner.lock().await;
        let timeline = inner.timelines.get_mut(session_id).expect("just initialized");
        timeline.checkpoint_strategy = strategy;
        timeline.auto_checkpoint_enabled = enabled;
        self.persist(timeline);
    }

    /// Whether an auto-checkpoint should fire for `event_type` under the
    /// session's current strategy. `tool_name` only matters for
    /// [`CheckpointStrategy::Smart`].
    pub async fn should_create_checkpoint(&self, session_id: &str, event_type: &str, tool_name: Option<&str>) -> bool {
        let inner = self.inner.lock().await;
        let Some(timeline) = inner.timelines.get(session_id) else { return false };
        if !timeline.auto_checkpoint_enabled {
            return false;
        }
        match timeline.checkpoint_strategy {
            CheckpointStrategy::Manual => false,
            CheckpointStrategy::PerPrompt => event_type == "prompt_sent",
            CheckpointStrategy::PerToolUse => event_type == "tool_executed",
            CheckpointStrategy::Smart => {
                event_type == "tool_executed"
                    && tool_name
                        .map(|t| {
                            let t = t.to_lowercase();
                            DESTRUCTIVE_TOOL_MARKERS.iter().any(|marker| t.contains(marker))
                        })
                        .unwrap_or(false)
            }
        }
    }

    pub async fn cleanup_timeline(&self, session_id: &str) {
        self.inner.lock().await.timelines.remove(session_id);
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(session_id) {
                tracing::warn!(session = %session_id, error = %e, "failed to delete checkpoint timeline from store");
            }
        }
    }

    pub async fn export_timeline(&self, session_id: &str) -> Option<SessionTimeline> {
        self.inner.lock().await.timelines.get(session_id).cloned()
    }

    pub async fn import_timeline(&self, timeline: SessionTimeline) {
        self.persist(&timeline);
        self.inner.lock().await.timelines.insert(timeline.session_id.clone(), timeline);
    }
}

/// Durable, on-disk backing for [`SessionTimeline`] exports, keyed by
/// session id.
pub struct TimelineStore {
    db: sled::Db,
}

impl TimelineStore {
    pub fn new(path: impl AsRef<std::path::Path>) -> Result<Self, CoreError> {
        let db = sled::open(path).map_err(CoreError::Sled)?;
        Ok(Self { db })
    }

    pub fn save(&self, timeline: &SessionTimeline) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(timeline)?;
        self.db.insert(timeline.session_id.as_bytes(), bytes).map_err(CoreError::Sled)?;
        self.db.flush().map_err(CoreError::Sled)?;
        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Result<Option<SessionTimeline>, CoreError> {
        match self.db.get(session_id.as_bytes()).map_err(CoreError::Sled)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, session_id: &str) -> Result<(), CoreError> {
        self.db.remove(session_id.as_bytes()).map_err(CoreError::Sled)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointCreatedAt(pub Option<DateTime<Utc>>);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::CasStorage;
    use crate::test_utils::temp_dir;

    fn manager() -> (Arc<TimelineManager>, tempfile::TempDir) {
        let dir = temp_dir();
        let cas = Arc::new(CasStorage::new(dir.path(), true, 6, true).unwrap());
        (TimelineManager::new(cas), dir)
    }

    #[tokio::test]
    async fn first_checkpoint_becomes_root_and_current() {
        let (mgr, _dir) = manager();
        let created = mgr
            .create_checkpoint("s1", Some("init"), None, None, None, b"v1")
            .await
            .unwrap();
        let view = mgr.get_timeline("s1").await.unwrap();
        assert_eq!(view.root_checkpoint_id.as_deref(), Some(created.checkpoint_id.as_str()));
        assert_eq!(view.current_checkpoint_id.as_deref(), Some(created.checkpoint_id.as_str()));
        assert_eq!(view.total_checkpoints, 1);
    }

    #[tokio::test]
    async fn path_to_follows_structural_parent_chain() {
        let (mgr, _dir) = manager();
        let c1 = mgr.create_checkpoint("s1", None, None, None, None, b"v1").await.unwrap();
        let c2 = mgr
            .create_checkpoint("s1", None, None, Some(c1.checkpoint_id.clone()), None, b"v2")
            .await
            .unwrap();
        let view = mgr.get_timeline("s1").await.unwrap();
        assert_eq!(view.current_path, vec![c1.checkpoint_id.clone(), c2.checkpoint_id.clone()]);
    }

    #[tokio::test]
    async fn fork_branches_without_disturbing_source() {
        let (mgr, _dir) = manager();
        let c1 = mgr.create_checkpoint("s1", None, None, None, None, b"v1").await.unwrap();
        let fork = mgr
            .fork_checkpoint("s1", &c1.checkpoint_id, Some("branch-a"), b"v1-forked")
            .await
            .unwrap();
        assert_eq!(fork.parent_id.as_deref(), Some(c1.checkpoint_id.as_str()));

        let restored = mgr.restore_checkpoint("s1", &c1.checkpoint_id).await.unwrap();
        assert_eq!(restored, b"v1");
    }

    #[tokio::test]
    async fn common_ancestor_is_the_deepest_shared_node() {
        let (mgr, _dir) = manager();
        let root = mgr.create_checkpoint("s1", None, None, None, None, b"root").await.unwrap();
        let branch_a = mgr
            .create_checkpoint("s1", None, None, Some(root.checkpoint_id.clone()), None, b"a")
            .await
            .unwrap();
        let branch_b = mgr
            .create_checkpoint("s1", None, None, Some(root.checkpoint_id.clone()), None, b"b")
            .await
            .unwrap();

        let cmp = mgr
            .compare_checkpoints("s1", &branch_a.checkpoint_id, &branch_b.checkpoint_id)
            .await
            .unwrap();
        assert_eq!(cmp.common_ancestor_id.as_deref(), Some(root.checkpoint_id.as_str()));
        assert!(!cmp.content_identical);
    }

    #[tokio::test]
    async fn smart_strategy_only_fires_for_destructive_tools() {
        let (mgr, _dir) = manager();
        mgr.set_checkpoint_strategy("s1", CheckpointStrategy::Smart, true).await;
        assert!(
            mgr.should_create_checkpoint("s1", "tool_executed", Some("Write")).await
        );
        assert!(
            !mgr.should_create_checkpoint("s1", "tool_executed", Some("Read")).await
        );
        assert!(!mgr.should_create_checkpoint("s1", "prompt_sent", None).await);
    }

    #[tokio::test]
    async fn manual_strategy_never_auto_fires() {
        let (mgr, _dir) = manager();
        mgr.set_checkpoint_strategy("s1", CheckpointStrategy::Manual, true).await;
        assert!(!mgr.should_create_checkpoint("s1", "tool_executed", Some("Write")).await);
    }

    #[tokio::test]
    async fn export_then_import_round_trips() {
        let (mgr, _dir) = manager();
        mgr.create_checkpoint("s1", None, None, None, None, b"v1").await.unwrap();
        let exported = mgr.export_timeline("s1").await.unwrap();
        mgr.cleanup_timeline("s1").await;
        assert!(mgr.get_timeline("s1").await.is_none());

        mgr.import_timeline(exported).await;
        assert!(mgr.get_timeline("s1").await.is_some());
    }

    #[tokio::test]
    async fn timeline_store_persists_across_instances() {
        let dir = temp_dir();
        let cas = Arc::new(CasStorage::new(dir.path().join("cas"), true, 6, true).unwrap());
        let mgr = TimelineManager::new(cas);
        mgr.create_checkpoint("s1", None, None, None, None, b"v1").await.unwrap();
        let exported = mgr.export_timeline("s1").await.unwrap();

        let store = TimelineStore::new(dir.path().join("timelines")).unwrap();
        store.save(&exported).unwrap();
        drop(store);

        let store2 = TimelineStore::new(dir.path().join("timelines")).unwrap();
        let loaded = store2.load("s1").unwrap().unwrap();
        assert_eq!(loaded.total_checkpoints, 1);
    }

    #[tokio::test]
    async fn manager_with_store_recovers_timeline_after_restart() {
        let dir = temp_dir();
        let cas = Arc::new(CasStorage::new(dir.path().join("cas"), true, 6, true).unwrap());
        let store = TimelineStore::new(dir.path().join("timelines")).unwrap();
        let mgr = TimelineManager::new_with_store(cas.clone(), store);
        let created = mgr.create_checkpoint("s1", None, None, None, None, b"v1").await.unwrap();

        let store2 = TimelineStore::new(dir.path().join("timelines")).unwrap();
        let mgr2 = TimelineManager::new_with_store(cas, store2);
        let view = mgr2.get_timeline("s1").await;
        assert!(view.is_none(), "timeline should not be cached in memory until touched");

        mgr2.initialize_timeline("s1").await;
        let view = mgr2.get_timeline("s1").await.unwrap();
        assert_eq!(view.current_checkpoint_id.as_deref(), Some(created.checkpoint_id.as_str()));
    }
}
