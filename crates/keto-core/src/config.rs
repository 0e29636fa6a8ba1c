use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registration::DEFAULT_TAG_NAME;
use crate::tags::NodeTags;

/// Namespace holding bootstrap token secrets.
pub const DEFAULT_TOKEN_NAMESPACE: &str = "kube-system";
/// Control-plane address written into client kubeconfigs.
pub const DEFAULT_MASTER_API: &str = "https://127.0.0.1:6443";
/// Where the client writes its bootstrap kubeconfig.
pub const DEFAULT_CLIENT_KUBECONFIG: &str = "kubeconfig-bootstrap";
/// Longest accepted token lifetime (ten years).
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Reconciler configuration, loadable from TOML or assembled from CLI flags.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// URL of the control-plane API.
    #[serde(default)]
    pub master_api: Option<String>,
    /// Bearer token for the control-plane API (used together with `master_api`).
    #[serde(default)]
    pub kube_token: Option<String>,
    /// Kubeconfig used when no master/token pair is given.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// Name of the registration tag.
    #[serde(default = "default_tag_name")]
    pub tag_name: String,
    /// Pool tags that must all match for a pool to be reconciled.
    #[serde(default)]
    pub filters: NodeTags,
    /// Namespace the token secrets are created in.
    #[serde(default = "default_token_namespace")]
    pub token_namespace: String,
    /// Lifetime of issued tokens. Zero disables expiry.
    #[serde(default = "default_token_ttl", with = "humantime_serde")]
    pub token_ttl: Duration,
    /// Delay between reconciliation cycles.
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,
    /// Issuance workers per cycle.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the discovery-to-issuance queue.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_tag_name() -> String {
    DEFAULT_TAG_NAME.to_string()
}
fn default_token_namespace() -> String {
    DEFAULT_TOKEN_NAMESPACE.to_string()
}
fn default_token_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_reconcile_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_workers() -> usize {
    4
}
fn default_queue_depth() -> usize {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            master_api: None,
            kube_token: None,
            kubeconfig: None,
            tag_name: default_tag_name(),
            filters: NodeTags::new(),
            token_namespace: default_token_namespace(),
            token_ttl: default_token_ttl(),
            reconcile_interval: default_reconcile_interval(),
            workers: default_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl ServerConfig {
    /// Load server config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigInvalid(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parse server config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| Error::ConfigInvalid(format!("failed to parse server config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tag_name.is_empty() {
            return Err(Error::ConfigInvalid("no tag name specified".into()));
        }
        if self.reconcile_interval.is_zero() {
            return Err(Error::ConfigInvalid("no reconcile interval specified".into()));
        }
        if self.token_namespace.is_empty() {
            return Err(Error::ConfigInvalid("no token namespace specified".into()));
        }
        if self.token_ttl > MAX_TOKEN_TTL {
            return Err(Error::ConfigInvalid(format!(
                "token ttl {} exceeds the maximum of {}",
                humantime::format_duration(self.token_ttl),
                humantime::format_duration(MAX_TOKEN_TTL)
            )));
        }
        if self.workers == 0 || self.queue_depth == 0 {
            return Err(Error::ConfigInvalid(
                "workers and queue depth must be at least 1".into(),
            ));
        }
        if self.kube_token.is_some() && self.master_api.is_none() {
            return Err(Error::ConfigInvalid(
                "a kube token requires the master api url".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("master_api", &self.master_api)
            .field("kube_token", &self.kube_token.as_ref().map(|_| "<redacted>"))
            .field("kubeconfig", &self.kubeconfig)
            .field("tag_name", &self.tag_name)
            .field("filters", &self.filters.to_string())
            .field("token_namespace", &self.token_namespace)
            .field("token_ttl", &self.token_ttl)
            .field("reconcile_interval", &self.reconcile_interval)
            .field("workers", &self.workers)
            .field("queue_depth", &self.queue_depth)
            .finish()
    }
}

/// Claimant configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control-plane URL written into the kubeconfig.
    pub master_api: String,
    /// Output path of the bootstrap kubeconfig.
    pub kubeconfig: PathBuf,
    /// CA bundle; `None` means TLS verification is skipped.
    pub ca_path: Option<PathBuf>,
    /// Name of the registration tag.
    pub tag_name: String,
    /// Poll interval.
    pub interval: Duration,
    /// Overall deadline. `None` or zero polls forever.
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            master_api: DEFAULT_MASTER_API.to_string(),
            kubeconfig: PathBuf::from(DEFAULT_CLIENT_KUBECONFIG),
            ca_path: None,
            tag_name: default_tag_name(),
            interval: Duration::from_secs(5),
            timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::ConfigInvalid("no interval specified".into()));
        }
        if self.tag_name.is_empty() {
            return Err(Error::ConfigInvalid("no tag name specified".into()));
        }
        Ok(())
    }

    /// The deadline to enforce, if any.
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
