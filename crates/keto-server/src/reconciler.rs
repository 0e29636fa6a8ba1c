use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use keto_cloud::{RegistrationTag, TagStore};
use keto_core::config::ServerConfig;
use keto_core::credential::DEFAULT_USAGES;
use keto_core::time::{expires_in, utc_now};
use keto_core::{Error, NodeId, NodeTags, Pool, Result};

use crate::issuer::CredentialIssuer;

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// UTC timestamp the cycle started at.
    pub started_at: String,
    pub pools_matched: usize,
    /// Distinct nodes across all matched pools.
    pub nodes_seen: usize,
    /// Nodes skipped because their registration tag was already set.
    pub already_tagged: usize,
    pub issued: usize,
    /// One entry per node (or discovery) failure.
    pub errors: Vec<String>,
}

/// Server control loop: finds untagged nodes and hands each a bootstrap token.
pub struct Reconciler {
    filters: NodeTags,
    interval: Duration,
    workers: usize,
    queue_depth: usize,
    issuance: Issuance,
}

/// Per-node work, cloned into every worker task.
#[derive(Clone)]
struct Issuance {
    registration: RegistrationTag,
    issuer: Arc<dyn CredentialIssuer>,
    ttl: Duration,
    namespace: Arc<str>,
    usages: Arc<[String]>,
}

#[derive(Default)]
struct Discovery {
    seen: usize,
    already_tagged: usize,
    errors: Vec<String>,
}

#[derive(Default)]
struct WorkerOutcome {
    issued: usize,
    errors: Vec<String>,
}

impl Reconciler {
    pub fn new(
        config: &ServerConfig,
        store: Arc<dyn TagStore>,
        issuer: Arc<dyn CredentialIssuer>,
    ) -> Result<Self> {
        config.validate()?;
        let usages: Vec<String> = DEFAULT_USAGES.iter().map(|u| u.to_string()).collect();
        Ok(Self {
            filters: config.filters.clone(),
            interval: config.reconcile_interval,
            workers: config.workers,
            queue_depth: config.queue_depth,
            issuance: Issuance {
                registration: RegistrationTag::new(store, config.tag_name.clone()),
                issuer,
                ttl: config.token_ttl,
                namespace: config.token_namespace.as_str().into(),
                usages: usages.into(),
            },
        })
    }

    /// Reconcile immediately, then every interval, until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            filters = %self.filters,
            tag = self.issuance.registration.name(),
            ttl = %humantime::format_duration(self.issuance.ttl),
            interval = %humantime::format_duration(self.interval),
            "Starting the bootstrap token reconciler"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.reconcile_once().await;
                    if report.issued > 0 || !report.errors.is_empty() {
                        info!(
                            pools = report.pools_matched,
                            nodes = report.nodes_seen,
                            issued = report.issued,
                            errors = report.errors.len(),
                            "Reconciliation cycle complete"
                        );
                    } else {
                        debug!(
                            pools = report.pools_matched,
                            nodes = report.nodes_seen,
                            "Reconciliation cycle complete, nothing to do"
                        );
                    }
                }
                _ = &mut shutdown => {
                    info!("Reconciler shutting down");
                    break;
                }
            }
        }
    }

    /// One pass: discover pools, issue tokens for untagged nodes, write tags.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport {
            started_at: utc_now(),
            ..Default::default()
        };

        let store = self.issuance.registration.store();
        let pools = match store.describe_pools(&self.filters).await {
            Ok(pools) => pools,
            Err(e) => {
                error!(error = %e, "Failed to get list of node pools");
                report.errors.push(e.to_string());
                return report;
            }
        };
        report.pools_matched = pools.len();
        debug!(pools = pools.len(), "Found matching node pools");

        let (tx, rx) = mpsc::channel(self.queue_depth);
        let producer = tokio::spawn(discover(
            self.issuance.registration.clone(),
            pools,
            tx,
        ));

        let rx = Arc::new(Mutex::new(rx));
        let mut set = JoinSet::new();
        for _ in 0..self.workers {
            let rx = Arc::clone(&rx);
            let issuance = self.issuance.clone();
            set.spawn(async move { work(issuance, rx).await });
        }

        match producer.await {
            Ok(discovery) => {
                report.nodes_seen = discovery.seen;
                report.already_tagged = discovery.already_tagged;
                report.errors.extend(discovery.errors);
            }
            Err(e) => {
                error!(error = %e, "Node discovery task panicked");
                report.errors.push(format!("node discovery failed: {e}"));
            }
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => {
                    report.issued += outcome.issued;
                    report.errors.extend(outcome.errors);
                }
                Err(e) => {
                    error!(error = %e, "Issuance worker panicked");
                    report.errors.push(format!("issuance worker failed: {e}"));
                }
            }
        }

        report
    }
}

async fn discover(
    registration: RegistrationTag,
    pools: Vec<Pool>,
    tx: mpsc::Sender<NodeId>,
) -> Discovery {
    let mut discovery = Discovery::default();
    let mut seen = HashSet::new();

    'pools: for pool in pools {
        for node in pool.nodes {
            if !seen.insert(node.clone()) {
                continue;
            }
            match registration.read(&node).await {
                Ok(state) if !state.is_absent() => {
                    debug!(node = %node, pool = %pool.name, "Skipping node, token already set");
                    discovery.already_tagged += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(node = %node, pool = %pool.name, error = %e, "Failed to get node tag");
                    discovery.errors.push(e.to_string());
                    continue;
                }
            }
            if tx.send(node).await.is_err() {
                break 'pools;
            }
        }
    }

    discovery.seen = seen.len();
    discovery
}

async fn work(issuance: Issuance, rx: Arc<Mutex<mpsc::Receiver<NodeId>>>) -> WorkerOutcome {
    let mut outcome = WorkerOutcome::default();
    loop {
        let next = rx.lock().await.recv().await;
        let Some(node) = next else {
            break;
        };
        match issuance.handle(&node).await {
            Ok(()) => outcome.issued += 1,
            Err(e) => {
                error!(node = %node, error = %e, "Failed to create registration token");
                outcome.errors.push(e.to_string());
            }
        }
    }
    outcome
}

impl Issuance {
    /// Issue a credential for `node` and offer it through the registration tag,
    /// deleting the credential again if the tag cannot be written.
    async fn handle(&self, node: &NodeId) -> Result<()> {
        let token = self
            .issuer
            .create(node, self.ttl, &self.usages, &self.namespace)
            .await?;
        let token = token.to_string();

        if let Err(e) = self.registration.offer(node, &token).await {
            let compensation = match self.issuer.delete(&token, &self.namespace).await {
                Ok(()) => None,
                Err(delete_err) => Some(delete_err.to_string()),
            };
            return Err(Error::TagWriteFailed {
                node: node.clone(),
                reason: e.to_string(),
                compensation,
            });
        }

        let expires = if self.ttl.is_zero() {
            None
        } else {
            expires_in(self.ttl)
        };
        info!(
            node = %node,
            expires = expires.as_deref().unwrap_or("never"),
            "Generated token for node"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keto_cloud::memory::MemoryTagStore;
    use keto_core::BootstrapToken;
    use keto_core::retry::RetryPolicy;

    use super::*;
    use crate::issuer::BootstrapIssuer;
    use crate::store::MemorySecretStore;

    const TAG: &str = "KubeletToken";
    const NS: &str = "kube-system";

    fn pool(name: &str, nodes: &[&str], tags: &[(&str, &str)]) -> Pool {
        Pool {
            name: name.into(),
            nodes: nodes.iter().map(|n| NodeId::from(*n)).collect(),
            tags: tags.iter().copied().collect(),
        }
    }

    struct Harness {
        tags: Arc<MemoryTagStore>,
        secrets: Arc<MemorySecretStore>,
        reconciler: Reconciler,
    }

    fn harness(pools: Vec<Pool>, filters: &[(&str, &str)]) -> Harness {
        let tags = Arc::new(MemoryTagStore::with_pools("server", pools));
        let secrets = Arc::new(MemorySecretStore::new());
        let issuer = BootstrapIssuer::new(secrets.clone())
            .with_retry(RetryPolicy::new(5, Duration::from_millis(1)));
        let config = ServerConfig {
            filters: filters.iter().copied().collect(),
            workers: 2,
            queue_depth: 2,
            ..Default::default()
        };
        let reconciler = Reconciler::new(&config, tags.clone(), Arc::new(issuer)).unwrap();
        Harness {
            tags,
            secrets,
            reconciler,
        }
    }

    async fn tag_of(store: &MemoryTagStore, node: &str) -> Option<String> {
        store.node_tag(&NodeId::from(node), TAG).await.unwrap()
    }

    #[tokio::test]
    async fn test_issues_one_token_per_untagged_node() {
        let nodes = ["i-1", "i-2", "i-3", "i-4", "i-5"];
        let h = harness(vec![pool("compute", &nodes, &[("Role", "compute")])], &[]);

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.pools_matched, 1);
        assert_eq!(report.nodes_seen, 5);
        assert_eq!(report.issued, 5);
        assert!(report.errors.is_empty());
        assert_eq!(h.secrets.len().await, 5);

        for node in nodes {
            let value = tag_of(&h.tags, node).await.unwrap();
            let token = BootstrapToken::parse(&value).unwrap();
            let stored = h.secrets.records(NS).await;
            assert!(stored.iter().any(|r| r.token_id == token.id()));
        }

        let second = h.reconciler.reconcile_once().await;
        assert_eq!(second.issued, 0);
        assert_eq!(second.already_tagged, 5);
        assert_eq!(h.secrets.len().await, 5);
    }

    #[tokio::test]
    async fn test_only_matching_pools_are_reconciled() {
        let h = harness(
            vec![
                pool("compute", &["c-1", "c-2"], &[("Role", "compute"), ("Env", "dev")]),
                pool("etcd", &["e-1"], &[("Role", "etcd"), ("Env", "dev")]),
            ],
            &[("Role", "compute")],
        );

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.pools_matched, 1);
        assert_eq!(report.issued, 2);
        assert!(tag_of(&h.tags, "c-1").await.is_some());
        assert!(tag_of(&h.tags, "e-1").await.is_none());
    }

    #[tokio::test]
    async fn test_claimed_and_offered_nodes_are_left_alone() {
        let h = harness(vec![pool("compute", &["a", "b", "c"], &[])], &[]);
        let claimed: NodeTags = [(TAG, "Success")].into_iter().collect();
        let offered: NodeTags = [(TAG, "abc123.0123456789abcdef")].into_iter().collect();
        h.tags.set_node_tags(&NodeId::from("a"), &claimed).await.unwrap();
        h.tags.set_node_tags(&NodeId::from("b"), &offered).await.unwrap();

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.already_tagged, 2);
        assert_eq!(report.issued, 1);
        assert_eq!(tag_of(&h.tags, "a").await.as_deref(), Some("Success"));
        assert_eq!(
            tag_of(&h.tags, "b").await.as_deref(),
            Some("abc123.0123456789abcdef")
        );
    }

    #[tokio::test]
    async fn test_node_in_two_pools_issued_once() {
        let h = harness(
            vec![pool("a", &["shared", "x"], &[]), pool("b", &["shared"], &[])],
            &[],
        );
        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.nodes_seen, 2);
        assert_eq!(report.issued, 2);
        assert_eq!(h.secrets.len().await, 2);
    }

    #[tokio::test]
    async fn test_tag_write_failure_deletes_credential() {
        let h = harness(vec![pool("compute", &["bad", "good"], &[])], &[]);
        h.tags.fail_writes_for(&NodeId::from("bad"), true).await;

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.issued, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("bad"));
        assert!(tag_of(&h.tags, "bad").await.is_none());
        assert!(tag_of(&h.tags, "good").await.is_some());
        // only the delivered token remains
        assert_eq!(h.secrets.len().await, 1);
        assert_eq!(h.secrets.delete_calls().await, 1);
    }

    #[tokio::test]
    async fn test_failed_compensation_reports_both_errors() {
        let h = harness(vec![pool("compute", &["bad"], &[])], &[]);
        h.tags.fail_writes_for(&NodeId::from("bad"), true).await;
        h.secrets.fail_deletes(true).await;

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.issued, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("injected write failure"));
        assert!(report.errors[0].contains("orphaned"));
        assert_eq!(h.secrets.len().await, 1);
    }

    #[tokio::test]
    async fn test_issuance_exhaustion_skips_node() {
        let h = harness(vec![pool("compute", &["i-1"], &[])], &[]);
        h.secrets.fail_next_creates(100).await;

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.issued, 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(h.secrets.create_calls().await, 5);
        assert!(tag_of(&h.tags, "i-1").await.is_none());

        // next cycle picks the node up again
        h.secrets.fail_next_creates(0).await;
        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.issued, 1);
    }

    #[tokio::test]
    async fn test_read_failure_does_not_abort_cycle() {
        let h = harness(vec![pool("compute", &["flaky", "ok"], &[])], &[]);
        h.tags.fail_reads_for(&NodeId::from("flaky"), true).await;

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.issued, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(tag_of(&h.tags, "ok").await.is_some());
    }

    #[tokio::test]
    async fn test_more_nodes_than_queue_and_workers() {
        let nodes: Vec<String> = (0..25).map(|i| format!("i-{i}")).collect();
        let refs: Vec<&str> = nodes.iter().map(String::as_str).collect();
        let h = harness(vec![pool("compute", &refs, &[])], &[]);

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.issued, 25);
        assert_eq!(h.tags.write_count().await, 25);
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let config = ServerConfig {
            workers: 0,
            ..Default::default()
        };
        let tags: Arc<dyn TagStore> = Arc::new(MemoryTagStore::new("server"));
        let issuer: Arc<dyn CredentialIssuer> =
            Arc::new(BootstrapIssuer::new(Arc::new(MemorySecretStore::new())));
        assert!(matches!(
            Reconciler::new(&config, tags, issuer),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reconciles_immediately_until_shutdown() {
        let h = harness(vec![pool("compute", &["i-1"], &[])], &[]);
        h.reconciler
            .run(tokio::time::sleep(Duration::from_secs(25)))
            .await;
        assert!(tag_of(&h.tags, "i-1").await.is_some());
        assert_eq!(h.secrets.len().await, 1);
    }
}
