use std::sync::Arc;

use keto_core::{Error, NodeId, NodeTags, RegistrationState, Result};

use crate::provider::TagStore;

/// Typed access to a node's registration tag.
///
/// The only place raw tag values are translated to and from
/// [`RegistrationState`]; the reconciler and claimant never see the sentinel.
#[derive(Clone)]
pub struct RegistrationTag {
    store: Arc<dyn TagStore>,
    name: String,
}

impl RegistrationTag {
    pub fn new(store: Arc<dyn TagStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn TagStore> {
        &self.store
    }

    pub async fn read(&self, id: &NodeId) -> Result<RegistrationState> {
        let value = self.store.node_tag(id, &self.name).await?;
        Ok(RegistrationState::from_tag_value(value.as_deref()))
    }

    /// Offer `token` to the node. Refuses to overwrite a tag that is already set,
    /// so a claimed node can never be handed a second token.
    pub async fn offer(&self, id: &NodeId, token: &str) -> Result<()> {
        let current = self.read(id).await?;
        if !current.is_absent() {
            return Err(Error::Store(format!(
                "registration tag {} on {} is already {:?}",
                self.name, id, current
            )));
        }
        self.write(id, &RegistrationState::Offered(token.to_string()))
            .await
    }

    /// Mark the node's token as consumed.
    pub async fn mark_claimed(&self, id: &NodeId) -> Result<()> {
        self.write(id, &RegistrationState::Claimed).await
    }

    async fn write(&self, id: &NodeId, state: &RegistrationState) -> Result<()> {
        let Some(value) = state.tag_value() else {
            return Ok(());
        };
        let mut update = NodeTags::new();
        update.insert(self.name.as_str(), value);
        self.store.set_node_tags(id, &update).await
    }
}
