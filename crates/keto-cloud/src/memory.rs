use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use keto_core::{Error, NodeId, NodeTags, Pool, Result};

use crate::provider::TagStore;

/// In-process tag store.
///
/// Each node starts with a copy of its pool's tags. Reads and writes can be
/// made to fail per node.
pub struct MemoryTagStore {
    node_id: NodeId,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    pools: Vec<Pool>,
    nodes: HashMap<NodeId, NodeTags>,
    failing_reads: HashSet<NodeId>,
    failing_writes: HashSet<NodeId>,
    writes: usize,
}

impl MemoryTagStore {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            state: RwLock::new(State::default()),
        }
    }

    /// Store seeded with `pools`; every member node gets its pool's tags.
    pub fn with_pools(node_id: impl Into<NodeId>, pools: Vec<Pool>) -> Self {
        let mut state = State::default();
        for pool in &pools {
            for node in &pool.nodes {
                state
                    .nodes
                    .entry(node.clone())
                    .or_default()
                    .merge(&pool.tags);
            }
        }
        state.pools = pools;
        Self {
            node_id: node_id.into(),
            state: RwLock::new(state),
        }
    }

    /// Store holding just the local node with `tags`, in a pool of its own.
    pub fn single_node(node_id: impl Into<NodeId>, tags: NodeTags) -> Self {
        let node_id = node_id.into();
        let pool = Pool {
            name: "local".into(),
            nodes: vec![node_id.clone()],
            tags: NodeTags::new(),
        };
        let mut state = State {
            pools: vec![pool],
            ..Default::default()
        };
        state.nodes.insert(node_id.clone(), tags);
        Self {
            node_id,
            state: RwLock::new(state),
        }
    }

    pub async fn fail_reads_for(&self, id: &NodeId, fail: bool) {
        let mut state = self.state.write().await;
        if fail {
            state.failing_reads.insert(id.clone());
        } else {
            state.failing_reads.remove(id);
        }
    }

    pub async fn fail_writes_for(&self, id: &NodeId, fail: bool) {
        let mut state = self.state.write().await;
        if fail {
            state.failing_writes.insert(id.clone());
        } else {
            state.failing_writes.remove(id);
        }
    }

    /// Number of successful tag writes so far.
    pub async fn write_count(&self) -> usize {
        self.state.read().await.writes
    }
}

#[async_trait]
impl TagStore for MemoryTagStore {
    async fn node_id(&self) -> Result<NodeId> {
        Ok(self.node_id.clone())
    }

    async fn describe_pools(&self, filter: &NodeTags) -> Result<Vec<Pool>> {
        let state = self.state.read().await;
        Ok(state
            .pools
            .iter()
            .filter(|p| p.matches(filter))
            .cloned()
            .collect())
    }

    async fn node_tags(&self, id: &NodeId) -> Result<NodeTags> {
        let state = self.state.read().await;
        if state.failing_reads.contains(id) {
            return Err(Error::Store(format!("injected read failure for {id}")));
        }
        state
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    async fn set_node_tags(&self, id: &NodeId, tags: &NodeTags) -> Result<()> {
        let mut state = self.state.write().await;
        if state.failing_writes.contains(id) {
            return Err(Error::Store(format!("injected write failure for {id}")));
        }
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        node.merge(tags);
        state.writes += 1;
        Ok(())
    }
}
