use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use keto_cloud::{RegistrationTag, TagStore};
use keto_core::config::ClientConfig;
use keto_core::{Error, NodeId, RegistrationState, Result};

/// How a claim attempt ended.
#[derive(Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The token was found and marked consumed; the caller owns it now.
    Claimed(String),
    /// The node's token was consumed by an earlier run.
    AlreadyConsumed,
}

impl std::fmt::Debug for ClaimOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimOutcome::Claimed(_) => f.write_str("Claimed(<token>)"),
            ClaimOutcome::AlreadyConsumed => f.write_str("AlreadyConsumed"),
        }
    }
}

/// Node-side poll loop over the node's own registration tag.
pub struct Claimant {
    config: ClientConfig,
    registration: RegistrationTag,
}

impl Claimant {
    pub fn new(config: ClientConfig, store: Arc<dyn TagStore>) -> Result<Self> {
        config.validate()?;
        let registration = RegistrationTag::new(store, config.tag_name.clone());
        Ok(Self {
            config,
            registration,
        })
    }

    /// Poll immediately and then every interval until a token is claimed, the
    /// token turns out to be consumed already, or the timeout elapses.
    ///
    /// Tag store errors end the loop straight away.
    pub async fn start(&self) -> Result<ClaimOutcome> {
        let node = self.registration.store().node_id().await?;
        let timeout = self.config.effective_timeout();
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        biased;
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(Error::TimedOut(timeout.unwrap_or_default()));
                        }
                        _ = ticker.tick() => {}
                    }
                }
                None => {
                    ticker.tick().await;
                }
            }

            if let Some(outcome) = self.poll(&node).await? {
                return Ok(outcome);
            }
        }
    }

    async fn poll(&self, node: &NodeId) -> Result<Option<ClaimOutcome>> {
        let tag = self.registration.name();
        let state = self.registration.read(node).await.inspect_err(|e| {
            error!(node = %node, error = %e, "Unable to retrieve the node tags");
        })?;

        match state {
            RegistrationState::Absent => {
                debug!(node = %node, tag, "Registration token not yet available");
                Ok(None)
            }
            RegistrationState::Claimed => Ok(Some(ClaimOutcome::AlreadyConsumed)),
            RegistrationState::Offered(token) => {
                info!(node = %node, tag, "Found kubelet registration token");
                self.registration
                    .mark_claimed(node)
                    .await
                    .inspect_err(|e| {
                        error!(node = %node, error = %e, "Unable to update the node tags");
                    })?;
                Ok(Some(ClaimOutcome::Claimed(token)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keto_cloud::memory::MemoryTagStore;
    use keto_core::NodeTags;

    use super::*;

    const TAG: &str = "KubeToken";

    fn config(timeout: Option<Duration>) -> ClientConfig {
        ClientConfig {
            tag_name: TAG.into(),
            interval: Duration::from_secs(1),
            timeout,
            ..Default::default()
        }
    }

    fn store(tags: &[(&str, &str)]) -> Arc<MemoryTagStore> {
        Arc::new(MemoryTagStore::single_node(
            "test-node",
            tags.iter().copied().collect(),
        ))
    }

    async fn tag_of(store: &MemoryTagStore) -> Option<String> {
        store
            .node_tag(&NodeId::from("test-node"), TAG)
            .await
            .unwrap()
    }

    #[test]
    fn test_new_validates_config() {
        let bad = ClientConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(Claimant::new(bad, store(&[])).is_err());
        assert!(Claimant::new(config(None), store(&[])).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_no_token() {
        let store = store(&[("Role", "compute")]);
        let claimant = Claimant::new(config(Some(Duration::from_secs(5))), store).unwrap();

        let start = Instant::now();
        let err = claimant.start().await.unwrap_err();
        assert_eq!(err, Error::TimedOut(Duration::from_secs(5)));
        assert!(start.elapsed() <= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_already_consumed() {
        let store = store(&[(TAG, "Success")]);
        let claimant = Claimant::new(config(Some(Duration::from_secs(5))), store.clone()).unwrap();

        assert_eq!(claimant.start().await.unwrap(), ClaimOutcome::AlreadyConsumed);
        assert_eq!(tag_of(&store).await.as_deref(), Some("Success"));
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_claims_offered_token() {
        let store = store(&[(TAG, "test-token")]);
        let claimant = Claimant::new(config(None), store.clone()).unwrap();

        assert_eq!(
            claimant.start().await.unwrap(),
            ClaimOutcome::Claimed("test-token".into())
        );
        assert_eq!(tag_of(&store).await.as_deref(), Some("Success"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_token_appearing_mid_poll() {
        let store = store(&[]);
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            let update: NodeTags = [(TAG, "abc123.0123456789abcdef")].into_iter().collect();
            writer
                .set_node_tags(&NodeId::from("test-node"), &update)
                .await
                .unwrap();
        });

        let claimant = Claimant::new(config(Some(Duration::from_secs(30))), store.clone()).unwrap();
        let outcome = claimant.start().await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Claimed("abc123.0123456789abcdef".into())
        );
        assert_eq!(tag_of(&store).await.as_deref(), Some("Success"));
        // the offer plus the sentinel
        assert_eq!(store.write_count().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_node_fails_fast() {
        let store = Arc::new(MemoryTagStore::new("ghost"));
        let claimant = Claimant::new(config(None), store).unwrap();
        let err = claimant.start().await.unwrap_err();
        assert_eq!(err, Error::NotFound(NodeId::from("ghost")));
    }

    #[tokio::test]
    async fn test_store_errors_are_surfaced() {
        let store = store(&[(TAG, "test-token")]);
        store.fail_writes_for(&NodeId::from("test-node"), true).await;
        let claimant = Claimant::new(config(None), store.clone()).unwrap();

        assert!(matches!(claimant.start().await, Err(Error::Store(_))));
        assert_eq!(tag_of(&store).await.as_deref(), Some("test-token"));

        store.fail_reads_for(&NodeId::from("test-node"), true).await;
        assert!(matches!(claimant.start().await, Err(Error::Store(_))));
    }

    #[test]
    fn test_outcome_debug_hides_token() {
        let outcome = ClaimOutcome::Claimed("abc123.0123456789abcdef".into());
        assert!(!format!("{:?}", outcome).contains("0123456789abcdef"));
    }
}
