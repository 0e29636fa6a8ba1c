use async_trait::async_trait;

use keto_core::{NodeId, NodeTags, Pool, Result};

/// Key/value tags attached to nodes, grouped into discoverable pools.
///
/// Writes to a single node's tags are atomic; nothing is transactional across
/// nodes. Unknown node ids fail with `Error::NotFound`.
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Id of the node this process runs on.
    async fn node_id(&self) -> Result<NodeId>;

    /// Pools whose tags contain every `filter` pair. An empty filter returns all pools.
    async fn describe_pools(&self, filter: &NodeTags) -> Result<Vec<Pool>>;

    /// All tags on a node.
    async fn node_tags(&self, id: &NodeId) -> Result<NodeTags>;

    /// A single tag on a node, `None` when the key is not set.
    async fn node_tag(&self, id: &NodeId, key: &str) -> Result<Option<String>> {
        let tags = self.node_tags(id).await?;
        Ok(tags.get(key).map(str::to_string))
    }

    /// Set (add or overwrite) the given tags on a node, leaving others untouched.
    async fn set_node_tags(&self, id: &NodeId, tags: &NodeTags) -> Result<()>;
}
